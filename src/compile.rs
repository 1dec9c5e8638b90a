//! Validates each function body against the operand-type stack and re-emits
//! it into the internal opcode stream (`isa::Op`), with label fix-ups for
//! branches/calls, a two-pass dependency-closure, and the final flat image
//! layout: function bodies back to back, followed by the indirect-call
//! table.

use std::collections::{BTreeSet, HashSet};

use crate::error::{Checkpoints, ErrorKind, Exc};
use crate::isa::{Op, Sink};
use crate::leb::{LebMode, Reader};
use crate::module::{FuncDecl, Local, ParsedModule};
use crate::types::ValType;

fn validate(msg: impl Into<String>) -> Exc {
    Exc::new(ErrorKind::Validate, msg.into())
}

fn decode(msg: impl Into<String>) -> Exc {
    Exc::new(ErrorKind::Decode, msg.into())
}

/// Resolved label table for the compiled image.
#[derive(Debug, Default, Clone)]
pub struct Labels {
    /// Byte offset in `result` where function `i` begins, `None` if it was
    /// excluded by the dependency closure.
    pub items: Vec<Option<u32>>,
}

#[derive(Debug, Default, Clone)]
pub struct CompiledImage {
    pub result: Vec<u8>,
    pub labels: Labels,
    pub cmpl_table0: Option<u32>,
    pub table_count: u32,
    pub cmpl_data0: u32,
    pub data: Vec<u8>,
}

/// A pending reference to a not-yet-fixed label: the position of its 4-byte
/// placeholder, and which depth-relative block it targets.
struct PendingBreak {
    at: u32,
}

struct BlockFrame {
    is_loop: bool,
    /// Image position branches should land on once resolved. For a loop this
    /// is known immediately (the loop's entry); for a plain block it is
    /// filled in at `end`.
    loop_entry: Option<u32>,
    pending: Vec<PendingBreak>,
    operand_depth_at_entry: usize,
    unreachable: bool,
}

/// Per-function compile-time state threaded through one body's lowering.
struct FuncCx<'a> {
    sink: Sink,
    operand_types: Vec<ValType>,
    blocks: Vec<BlockFrame>,
    total_locals_words: u32,
    arg_words: u32,
    ret_words: u32,
    locals: &'a [Local],
    deps: BTreeSet<u32>,
    calls_indirect: bool,
}

impl<'a> FuncCx<'a> {
    fn depth_words(&self) -> u32 {
        self.operand_types.iter().map(|t| t.words()).sum()
    }

    fn push(&mut self, t: ValType) {
        self.operand_types.push(t);
    }

    fn pop(&mut self) -> Result<ValType, Exc> {
        self.operand_types.pop().ok_or_else(|| validate("operand stack underflow"))
    }

    fn pop_expect(&mut self, t: ValType) -> Result<(), Exc> {
        let got = self.pop()?;
        if got.code() != t.code() {
            return Err(validate(format!("expected {t:?} operand, found {got:?}")));
        }
        Ok(())
    }

    fn current_unreachable(&self) -> bool {
        self.blocks.last().map(|b| b.unreachable).unwrap_or(false)
    }

    fn set_unreachable(&mut self) {
        if let Some(b) = self.blocks.last_mut() {
            b.unreachable = true;
        }
    }

    fn find_target(&mut self, rel_depth: u32) -> Result<usize, Exc> {
        if rel_depth as usize >= self.blocks.len() {
            return Err(validate("branch target depth out of range"));
        }
        Ok(self.blocks.len() - 1 - rel_depth as usize)
    }

    /// Emits the `ret` triple for this function; used both at the outermost
    /// block close and for an explicit `return`/outer-targeting branch.
    fn emit_ret(&mut self) {
        self.sink.op(Op::Ret);
        self.sink.write_uleb(self.ret_words);
        self.sink.write_uleb(self.total_locals_words - self.arg_words);
        self.sink.write_uleb(self.arg_words);
    }

    fn local_offset(&self, local: &Local) -> u32 {
        let depth = self.depth_words();
        if local.pos_words < self.arg_words {
            self.total_locals_words + 1 + depth - local.pos_words
        } else {
            self.total_locals_words + depth - local.pos_words
        }
    }
}

fn align_cap(p: u32) -> Result<u8, Exc> {
    if p > 4 {
        return Err(validate("alignment beyond 16 bytes is not supported"));
    }
    Ok(p as u8)
}

/// Compiles one function body into `cx.sink`, given its already-resolved
/// dependency set is only needed by the caller for inclusion bookkeeping --
/// this pass both records edges (into `cx.deps`) and fully emits code, since
/// by the time this runs the closure has already been computed from a cheap
/// pre-scan (see [`prescan_calls`]).
fn compile_func<'a>(m: &ParsedModule, func: &'a FuncDecl, import_count: u32) -> Result<FuncCx<'a>, Exc> {
    let ty = &m.types[func.type_index as usize];
    let arg_words: u32 = ty.args.iter().map(|t| t.words()).sum();
    let total_locals_words: u32 = func.locals.iter().map(|l| l.words).sum();
    let ret_words: u32 = ty.rets.first().map(|t| t.words()).unwrap_or(0);

    let mut cx = FuncCx {
        sink: Sink::new(),
        operand_types: Vec::new(),
        blocks: Vec::new(),
        total_locals_words,
        arg_words,
        ret_words,
        locals: &func.locals,
        deps: BTreeSet::new(),
        calls_indirect: false,
    };

    let non_arg_local_words = total_locals_words - arg_words;
    if non_arg_local_words > 0 {
        cx.sink.op(Op::Prolog);
        cx.sink.write_uleb(non_arg_local_words);
    }

    cx.blocks.push(BlockFrame {
        is_loop: false,
        loop_entry: None,
        pending: Vec::new(),
        operand_depth_at_entry: 0,
        unreachable: false,
    });

    let mut r = Reader::new(func.body.clone(), LebMode::Standard);
    compile_body(m, &mut cx, &mut r, import_count)?;

    if !cx.blocks.is_empty() {
        return Err(decode("function body missing terminating end"));
    }

    Ok(cx)
}

fn compile_body(m: &ParsedModule, cx: &mut FuncCx, r: &mut Reader, import_count: u32) -> Result<(), Exc> {
    loop {
        if r.is_empty() && cx.blocks.is_empty() {
            break;
        }
        let op = r.read1()?;
        if cx.current_unreachable() && !matches!(op, 0x02 | 0x03 | 0x0B) {
            // Skip operand-stack bookkeeping for dead code, but still scan
            // immediates so the reader stays in sync.
            skip_immediate(op, r)?;
            continue;
        }
        match op {
            0x00 => {
                cx.sink.op(Op::Unreachable);
                cx.set_unreachable();
            }
            0x02 => {
                let bt = r.read1()?;
                if bt != 0x40 {
                    return Err(decode("only void blocks are supported"));
                }
                let inherited = cx.current_unreachable();
                cx.blocks.push(BlockFrame {
                    is_loop: false,
                    loop_entry: None,
                    pending: Vec::new(),
                    operand_depth_at_entry: cx.operand_types.len(),
                    unreachable: inherited,
                });
            }
            0x03 => {
                let bt = r.read1()?;
                if bt != 0x40 {
                    return Err(decode("only void blocks are supported"));
                }
                let entry = cx.sink.pos();
                let inherited = cx.current_unreachable();
                cx.blocks.push(BlockFrame {
                    is_loop: true,
                    loop_entry: Some(entry),
                    pending: Vec::new(),
                    operand_depth_at_entry: cx.operand_types.len(),
                    unreachable: inherited,
                });
            }
            0x0B => {
                let frame = cx.blocks.pop().ok_or_else(|| decode("unmatched end"))?;
                if cx.blocks.is_empty() {
                    // Outermost function block.
                    cx.emit_ret();
                } else {
                    let here = cx.sink.pos();
                    for p in frame.pending {
                        cx.sink.patch(p.at, here);
                    }
                    if !frame.unreachable && cx.operand_types.len() != frame.operand_depth_at_entry {
                        return Err(validate("block exits with an unbalanced operand stack"));
                    }
                    cx.operand_types.truncate(frame.operand_depth_at_entry);
                }
            }
            0x0C | 0x0D => {
                let rel_depth = r.read_u32()?;
                if op == 0x0D {
                    cx.pop_expect(ValType::I32)?;
                }
                let target = cx.find_target(rel_depth)?;
                if target == 0 {
                    if op == 0x0C {
                        cx.emit_ret();
                    } else {
                        // A conditional branch to the function's implicit
                        // outer block is a conditional return; there is no
                        // conditional `ret` opcode, so synthesize one with a
                        // tiny fallthrough trampoline: branch-if into the
                        // `ret` sequence, otherwise jump straight past it.
                        cx.sink.op(Op::BrIf);
                        let to_ret = cx.sink.placeholder();
                        cx.sink.op(Op::Br);
                        let to_after = cx.sink.placeholder();
                        let ret_pos = cx.sink.pos();
                        cx.sink.patch(to_ret, ret_pos);
                        cx.emit_ret();
                        let after_pos = cx.sink.pos();
                        cx.sink.patch(to_after, after_pos);
                    }
                } else {
                    cx.sink.op(if op == 0x0C { Op::Br } else { Op::BrIf });
                    emit_branch_target(cx, target);
                }
                if op == 0x0C {
                    cx.set_unreachable();
                }
            }
            0x0E => {
                let n = r.read_u32()?;
                let mut targets = Vec::with_capacity(n as usize + 1);
                for _ in 0..n {
                    targets.push(r.read_u32()?);
                }
                let default = r.read_u32()?;
                cx.pop_expect(ValType::I32)?;
                let resolved: Vec<usize> = targets
                    .into_iter()
                    .chain(std::iter::once(default))
                    .map(|t| cx.find_target(t))
                    .collect::<Result<_, _>>()?;
                if resolved.iter().any(|&t| t == 0) {
                    // A jump table entry that exits the function directly
                    // (rather than through a regular branch/return) would
                    // need a synthesized return trampoline mid-table; this
                    // engine does not support it.
                    return Err(validate("br_table cannot target the function's outer block"));
                }
                cx.sink.op(Op::BrTable);
                cx.sink.fixed_u32(n);
                for target in resolved {
                    emit_branch_target(cx, target);
                }
                // br_table always diverges.
                cx.set_unreachable();
            }
            0x0F => {
                match cx.ret_words {
                    0 => {}
                    1 => cx.pop_expect(ValType::I32)?,
                    _ => cx.pop_expect(ValType::I64)?,
                }
                cx.emit_ret();
                cx.set_unreachable();
            }
            0x10 => {
                let func_index = r.read_u32()?;
                if func_index < import_count {
                    let imp = &m.import_funcs[func_index as usize];
                    let ty = &m.types[imp.type_index as usize];
                    for a in ty.args.iter().rev() {
                        cx.pop_expect(*a)?;
                    }
                    if let Some(ret) = ty.rets.first() {
                        cx.push(*ret);
                    }
                    cx.sink.op(Op::CallExt);
                    cx.sink.fixed_u32(imp.binding_id.expect("bindings resolved before compile"));
                } else {
                    let internal = func_index - import_count;
                    if internal as usize >= m.funcs.len() {
                        return Err(decode("call target out of range"));
                    }
                    let ty = &m.types[m.funcs[internal as usize].type_index as usize];
                    for a in ty.args.iter().rev() {
                        cx.pop_expect(*a)?;
                    }
                    if let Some(ret) = ty.rets.first() {
                        cx.push(*ret);
                    }
                    cx.deps.insert(internal);
                    cx.sink.op(Op::Call);
                    // Holds the callee's function index for now; `patch_calls`
                    // resolves it to a byte offset once every label is known.
                    cx.sink.fixed_u32(internal);
                }
            }
            0x11 => {
                let type_index = r.read_u32()?;
                let table_index = r.read_u32()?;
                if table_index != 0 {
                    return Err(decode("call_indirect table index must be 0"));
                }
                if type_index as usize >= m.types.len() {
                    return Err(decode("call_indirect type index out of range"));
                }
                cx.pop_expect(ValType::I32)?;
                let ty = &m.types[type_index as usize];
                for a in ty.args.iter().rev() {
                    cx.pop_expect(*a)?;
                }
                if let Some(ret) = ty.rets.first() {
                    cx.push(*ret);
                }
                cx.sink.op(Op::CallIndirect);
                cx.calls_indirect = true;
            }
            0x1A => {
                let t = cx.pop()?;
                cx.sink.op(Op::Drop);
                cx.sink.u8(t.local_tag() as u8);
            }
            0x1B => {
                cx.pop_expect(ValType::I32)?;
                let b = cx.pop()?;
                let a = cx.pop()?;
                if a.code() != b.code() {
                    return Err(validate("select operands must share a type"));
                }
                cx.push(a);
                cx.sink.op(Op::Select);
                cx.sink.u8(a.local_tag() as u8);
            }
            0x20 | 0x21 | 0x22 => {
                let idx = r.read_u32()? as usize;
                let local = *cx.locals.get(idx).ok_or_else(|| decode("local index out of range"))?;
                match op {
                    0x20 => {
                        let offset = cx.local_offset(&local);
                        cx.push(local.vtype);
                        cx.sink.op(Op::LocalGet);
                        cx.sink.fixed_u32((offset << 2) | local.vtype.local_tag());
                    }
                    0x21 => {
                        cx.pop_expect(local.vtype)?;
                        let offset = cx.local_offset(&local);
                        cx.sink.op(Op::LocalSet);
                        cx.sink.fixed_u32((offset << 2) | local.vtype.local_tag());
                    }
                    _ => {
                        cx.pop_expect(local.vtype)?;
                        cx.push(local.vtype);
                        let offset = cx.local_offset(&local);
                        cx.sink.op(Op::LocalTee);
                        cx.sink.fixed_u32((offset << 2) | local.vtype.local_tag());
                    }
                }
            }
            0x23 | 0x24 => {
                let idx = r.read_u32()? as usize;
                let g = m.import_globals.get(idx).ok_or_else(|| decode("global index out of range"))?;
                let binding = g.binding_id.expect("bindings resolved before compile");
                if op == 0x23 {
                    cx.push(g.vtype);
                    cx.sink.op(Op::GlobalGetImp);
                } else {
                    cx.pop_expect(g.vtype)?;
                    cx.sink.op(Op::GlobalSetImp);
                }
                cx.sink.fixed_u32(binding);
            }
            0x28..=0x35 => compile_load(cx, r, op)?,
            0x36 | 0x37 | 0x3A..=0x3E => compile_store(cx, r, op)?,
            0x41 => {
                let v = r.read_i32()?;
                cx.push(ValType::I32);
                cx.sink.op(Op::I32Const);
                cx.sink.fixed_i32(v);
            }
            0x42 => {
                let v = r.read_i64()?;
                cx.push(ValType::I64);
                cx.sink.op(Op::I64Const);
                cx.sink.fixed_i64(v);
            }
            0x45 => {
                cx.pop_expect(ValType::I32)?;
                cx.push(ValType::I32);
                cx.sink.u8(op);
            }
            0x46..=0x4F => {
                cx.pop_expect(ValType::I32)?;
                cx.pop_expect(ValType::I32)?;
                cx.push(ValType::I32);
                cx.sink.u8(op);
            }
            0x50 => {
                cx.pop_expect(ValType::I64)?;
                cx.push(ValType::I32);
                cx.sink.u8(op);
            }
            0x51..=0x5A => {
                cx.pop_expect(ValType::I64)?;
                cx.pop_expect(ValType::I64)?;
                cx.push(ValType::I32);
                cx.sink.u8(op);
            }
            0x67..=0x69 => {
                cx.pop_expect(ValType::I32)?;
                cx.push(ValType::I32);
                cx.sink.u8(op);
            }
            0x6A..=0x78 => {
                cx.pop_expect(ValType::I32)?;
                cx.pop_expect(ValType::I32)?;
                cx.push(ValType::I32);
                cx.sink.u8(op);
            }
            0x79..=0x7B => {
                cx.pop_expect(ValType::I64)?;
                cx.push(ValType::I64);
                cx.sink.u8(op);
            }
            0x7C..=0x8A => {
                cx.pop_expect(ValType::I64)?;
                cx.pop_expect(ValType::I64)?;
                cx.push(ValType::I64);
                cx.sink.u8(op);
            }
            0xA7 => {
                cx.pop_expect(ValType::I64)?;
                cx.push(ValType::I32);
                cx.sink.u8(op);
            }
            0xAC | 0xAD => {
                cx.pop_expect(ValType::I32)?;
                cx.push(ValType::I64);
                cx.sink.u8(op);
            }
            other => return Err(decode(format!("unsupported opcode {other:#04x}"))),
        }
    }
    Ok(())
}

fn emit_branch_target(cx: &mut FuncCx, target: usize) {
    if cx.blocks[target].is_loop {
        let entry = cx.blocks[target].loop_entry.unwrap();
        cx.sink.fixed_u32(entry);
    } else {
        let at = cx.sink.placeholder();
        cx.blocks[target].pending.push(PendingBreak { at });
    }
}

fn skip_immediate(op: u8, r: &mut Reader) -> Result<(), Exc> {
    match op {
        0x02 | 0x03 => {
            r.read1()?;
        }
        0x0C | 0x0D => {
            r.read_u32()?;
        }
        0x0E => {
            let n = r.read_u32()?;
            for _ in 0..n {
                r.read_u32()?;
            }
            r.read_u32()?;
        }
        0x10 | 0x20 | 0x21 | 0x22 | 0x23 | 0x24 => {
            r.read_u32()?;
        }
        0x11 => {
            r.read_u32()?;
            r.read_u32()?;
        }
        0x28..=0x3E => {
            r.read_u32()?;
            r.read_u32()?;
        }
        0x41 => {
            r.read_i32()?;
        }
        0x42 => {
            r.read_i64()?;
        }
        _ => {}
    }
    Ok(())
}

fn compile_load(cx: &mut FuncCx, r: &mut Reader, op: u8) -> Result<(), Exc> {
    let align = align_cap(r.read_u32()?)?;
    let offset = r.read_u32()?;
    cx.pop_expect(ValType::I32)?;
    let result = match op {
        0x28 | 0x2C | 0x2D | 0x2E | 0x2F => ValType::I32,
        _ => ValType::I64,
    };
    cx.push(result);
    cx.sink.u8(op);
    cx.sink.u8(align);
    cx.sink.fixed_u32(offset);
    Ok(())
}

fn compile_store(cx: &mut FuncCx, r: &mut Reader, op: u8) -> Result<(), Exc> {
    let align = align_cap(r.read_u32()?)?;
    let offset = r.read_u32()?;
    let value_type = match op {
        0x36 | 0x3A | 0x3B => ValType::I32,
        _ => ValType::I64,
    };
    cx.pop_expect(value_type)?;
    cx.pop_expect(ValType::I32)?;
    cx.sink.u8(op);
    cx.sink.u8(align);
    cx.sink.fixed_u32(offset);
    Ok(())
}

/// Cheap pre-scan of a raw (un-lowered) function body for `call`/`call_indirect`
/// opcodes, used to build the caller->callee graph before committing to a
/// full validate-and-emit pass on only the reachable subset.
fn prescan_calls(body: &[u8], import_count: u32, internal_func_count: u32) -> Result<(HashSet<u32>, bool), Exc> {
    let mut r = Reader::new(body.to_vec(), LebMode::Standard);
    let mut deps = HashSet::new();
    let mut calls_indirect = false;
    while !r.is_empty() {
        let op = r.read1()?;
        match op {
            0x10 => {
                let idx = r.read_u32()?;
                if idx >= import_count {
                    let internal = idx - import_count;
                    if internal < internal_func_count {
                        deps.insert(internal);
                    }
                }
            }
            0x11 => {
                calls_indirect = true;
                r.read_u32()?;
                r.read_u32()?;
            }
            other => skip_immediate(other, &mut r)?,
        }
    }
    Ok((deps, calls_indirect))
}

/// Compiles a whole parsed module (with bindings already resolved via
/// [`crate::host::resolve_bindings`]) into a flat executable image.
///
/// `entry_points` are the function indices (module-relative, i.e. already
/// offset by `import_funcs.len()`) the host will call directly -- typically
/// every exported function.
pub fn compile_module(m: &ParsedModule, entry_points: &[u32], cps: &mut Checkpoints) -> Result<CompiledImage, Exc> {
    let _g = cps.enter("wasm/compile");
    let import_count = m.import_funcs.len() as u32;
    let n_funcs = m.funcs.len() as u32;

    let mut edges: Vec<HashSet<u32>> = Vec::with_capacity(n_funcs as usize);
    let mut any_indirect = vec![false; n_funcs as usize];
    for f in &m.funcs {
        let (deps, calls_indirect) = prescan_calls(&f.body, import_count, n_funcs)?;
        edges.push(deps);
        any_indirect.push(calls_indirect);
    }

    let mut included = vec![false; n_funcs as usize];
    let mut stack: Vec<u32> = entry_points
        .iter()
        .filter(|&&ep| ep >= import_count)
        .map(|&ep| ep - import_count)
        .filter(|&i| i < n_funcs)
        .collect();
    let mut table_added = false;
    while let Some(i) = stack.pop() {
        if included[i as usize] {
            continue;
        }
        included[i as usize] = true;
        if any_indirect[i as usize] && !table_added {
            table_added = true;
            for &t in &m.table_funcs {
                if t < n_funcs {
                    stack.push(t);
                }
            }
        }
        for &d in &edges[i as usize] {
            if !included[d as usize] {
                stack.push(d);
            }
        }
    }

    let mut sink = Sink::new();
    let mut labels = Labels { items: vec![None; n_funcs as usize] };

    for (i, f) in m.funcs.iter().enumerate() {
        if !included[i] {
            log::debug!("dropping unreached function {i} from image");
            continue;
        }
        let _gf = cps.enter(format!("func={i}"));
        labels.items[i] = Some(sink.pos());
        let fcx = compile_func(m, f, import_count)?;
        let base = sink.pos();
        sink.bytes.extend_from_slice(&fcx.sink.bytes);
        patch_calls(&mut sink, base, &labels)?;
    }

    let mut cmpl_table0 = None;
    if table_added {
        let table_pos = sink.pos();
        cmpl_table0 = Some(table_pos);
        for &t in &m.table_funcs {
            let target = labels.items.get(t as usize).copied().flatten().unwrap_or(0);
            sink.fixed_u32(target);
        }
    }

    Ok(CompiledImage {
        result: sink.bytes,
        labels,
        cmpl_table0,
        table_count: if table_added { m.table_funcs.len() as u32 } else { 0 },
        cmpl_data0: m.data0,
        data: m.data.clone(),
    })
}

/// `call` placeholders were written relative to each function's own local
/// sink; this walks the just-appended bytes to resolve them against the
/// final, whole-image label table. We locate them by re-decoding the
/// function's own opcode stream rather than tracking positions separately,
/// since the opcode widths are all statically known.
fn patch_calls(sink: &mut Sink, base: u32, labels: &Labels) -> Result<(), Exc> {
    let mut i = base as usize;
    let end = sink.bytes.len();
    while i < end {
        let op = Op::from_byte(sink.bytes[i]).ok_or_else(|| decode("internal image corrupt during patch pass"))?;
        i += 1;
        match op {
            Op::Call => {
                let target_func = u32::from_le_bytes(sink.bytes[i..i + 4].try_into().unwrap());
                // The placeholder currently holds the callee's *function
                // index*, written by `compile_func`; resolve it to a byte
                // offset now that every label is known.
                let resolved = labels.items.get(target_func as usize).copied().flatten().unwrap_or(0);
                sink.bytes[i..i + 4].copy_from_slice(&resolved.to_le_bytes());
                i += 4;
            }
            Op::CallExt | Op::GlobalGetImp | Op::GlobalSetImp | Op::Br | Op::BrIf => {
                i += 4;
            }
            Op::BrTable => {
                let n = u32::from_le_bytes(sink.bytes[i..i + 4].try_into().unwrap());
                i += 4 + (n as usize + 1) * 4;
            }
            Op::Prolog => {
                i = skip_uleb(&sink.bytes, i);
            }
            Op::Ret => {
                i = skip_uleb(&sink.bytes, i);
                i = skip_uleb(&sink.bytes, i);
                i = skip_uleb(&sink.bytes, i);
            }
            Op::LocalGet | Op::LocalSet | Op::LocalTee => {
                i += 4;
            }
            Op::Drop | Op::Select => {
                i += 1;
            }
            Op::I32Const => i += 4,
            Op::I64Const => i += 8,
            Op::CallIndirect | Op::Unreachable | Op::End | Op::Block | Op::Loop | Op::Return => {}
            _ if (0x28..=0x3E).contains(&op.byte()) => {
                i += 1 + 4;
            }
            _ => {}
        }
    }
    Ok(())
}

fn skip_uleb(bytes: &[u8], mut i: usize) -> usize {
    loop {
        let b = bytes[i];
        i += 1;
        if b & 0x80 == 0 {
            break;
        }
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Cursor;
    use crate::module::{FuncDecl, FuncType};

    fn leb(mut v: u32, out: &mut Vec<u8>) {
        loop {
            let b = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(b);
                break;
            }
            out.push(b | 0x80);
        }
    }

    fn sleb(mut v: i64, out: &mut Vec<u8>) {
        let mut more = true;
        while more {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0) {
                more = false;
            } else {
                byte |= 0x80;
            }
            out.push(byte);
        }
    }

    #[test]
    fn compiles_constant_return_function() {
        let mut m = ParsedModule::default();
        m.types.push(FuncType { args: vec![], rets: vec![ValType::I32] });
        let mut body = Vec::new();
        body.push(0x41); // i32.const
        sleb(42, &mut body);
        body.push(0x0B); // end
        m.funcs.push(FuncDecl { type_index: 0, locals: vec![], body, name: None });

        let mut cps = Checkpoints::new();
        let img = compile_module(&m, &[0], &mut cps).unwrap();
        assert!(img.labels.items[0].is_some());

        let mut cur = Cursor::new(&img.result, img.labels.items[0].unwrap());
        assert_eq!(cur.read_op().unwrap(), Op::I32Const);
        assert_eq!(cur.read_fixed_i32().unwrap(), 42);
        assert_eq!(cur.read_op().unwrap(), Op::Ret);
        assert_eq!(cur.read_uleb().unwrap(), 1); // ret_words
        assert_eq!(cur.read_uleb().unwrap(), 0); // local_words
        assert_eq!(cur.read_uleb().unwrap(), 0); // arg_words
    }

    #[test]
    fn unreachable_function_is_excluded_from_image() {
        let mut m = ParsedModule::default();
        m.types.push(FuncType { args: vec![], rets: vec![] });
        let mut live = Vec::new();
        live.push(0x0B);
        let mut dead = Vec::new();
        dead.push(0x0B);
        m.funcs.push(FuncDecl { type_index: 0, locals: vec![], body: live, name: None });
        m.funcs.push(FuncDecl { type_index: 0, locals: vec![], body: dead, name: None });

        let mut cps = Checkpoints::new();
        let img = compile_module(&m, &[0], &mut cps).unwrap();
        assert!(img.labels.items[0].is_some());
        assert!(img.labels.items[1].is_none());
    }

    #[test]
    fn call_target_is_patched_to_byte_offset() {
        let mut m = ParsedModule::default();
        m.types.push(FuncType { args: vec![], rets: vec![] });
        let mut caller = Vec::new();
        caller.push(0x10); // call
        leb(1, &mut caller); // callee func index (no imports)
        caller.push(0x0B);
        let mut callee = Vec::new();
        callee.push(0x0B);
        m.funcs.push(FuncDecl { type_index: 0, locals: vec![], body: caller, name: None });
        m.funcs.push(FuncDecl { type_index: 0, locals: vec![], body: callee, name: None });

        let mut cps = Checkpoints::new();
        let img = compile_module(&m, &[0, 1], &mut cps).unwrap();
        let callee_pos = img.labels.items[1].unwrap();

        let mut cur = Cursor::new(&img.result, img.labels.items[0].unwrap());
        assert_eq!(cur.read_op().unwrap(), Op::Call);
        assert_eq!(cur.read_fixed_u32().unwrap(), callee_pos);
    }

    #[test]
    fn br_table_targeting_outer_block_is_rejected() {
        let mut m = ParsedModule::default();
        m.types.push(FuncType { args: vec![], rets: vec![] });
        let mut body = Vec::new();
        body.push(0x41); // i32.const 0 (selector)
        sleb(0, &mut body);
        body.push(0x0E); // br_table
        leb(0, &mut body); // zero extra targets
        leb(0, &mut body); // default -> depth 0 (outer block)
        body.push(0x0B);
        m.funcs.push(FuncDecl { type_index: 0, locals: vec![], body, name: None });

        let mut cps = Checkpoints::new();
        let err = compile_module(&m, &[0], &mut cps).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validate);
    }

    #[test]
    fn conditional_branch_to_outer_block_emits_trampoline() {
        let mut m = ParsedModule::default();
        m.types.push(FuncType { args: vec![ValType::I32], rets: vec![] });
        let mut body = Vec::new();
        body.push(0x20); // local.get 0
        leb(0, &mut body);
        body.push(0x0D); // br_if
        leb(0, &mut body); // depth 0 -> conditional return
        body.push(0x0B);
        m.funcs.push(FuncDecl { type_index: 0, locals: vec![], body, name: None });

        let mut cps = Checkpoints::new();
        let img = compile_module(&m, &[0], &mut cps).unwrap();
        let mut cur = Cursor::new(&img.result, img.labels.items[0].unwrap());
        assert_eq!(cur.read_op().unwrap(), Op::LocalGet);
        cur.read_fixed_u32().unwrap();
        assert_eq!(cur.read_op().unwrap(), Op::BrIf);
        cur.read_fixed_u32().unwrap();
        assert_eq!(cur.read_op().unwrap(), Op::Br);
        cur.read_fixed_u32().unwrap();
        assert_eq!(cur.read_op().unwrap(), Op::Ret);
    }
}
