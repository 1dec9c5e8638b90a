//! The execution engine: a combined operand/alias stack, local and memory
//! access, and the dispatch loop over the flat opcode stream `compile.rs`
//! emits.
//!
//! Grounded in `original_source/core/bvm2.cpp`'s `Processor::RunOnce` and the
//! `Stack`/`AliasStack` layout described in `bvm2.h`: one byte buffer serves
//! both the operand stack (growing from the bottom, tracked by `pos`) and the
//! alias ("native") stack contracts allocate into from the top via
//! `StackAlloc` (tracked by `bytes_current`), so a single bounds check keeps
//! the two from colliding.

use crate::error::{ErrorKind, Exc};
use crate::frame::FarCallStack;
use crate::host::{self, Host, STACK_POINTER_BINDING};
use crate::ids::ContractId;
use crate::isa::{Cursor, Op};
use crate::store::{self, VarKey, VarTag};
use crate::types::{Limits, MemTag, TaggedAddr, ValType};

fn trap(msg: impl Into<String>) -> Exc {
    Exc::new(ErrorKind::Trap, msg.into())
}

fn bounds(msg: impl Into<String>) -> Exc {
    Exc::new(ErrorKind::Bounds, msg.into())
}

fn link(msg: impl Into<String>) -> Exc {
    Exc::new(ErrorKind::Link, msg.into())
}

fn hex_cid(cid: &ContractId) -> String {
    cid.as_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

/// One call into an exported contract method is expected to push exactly one
/// word (the caller-supplied arguments pointer) before the jump; see
/// [`Processor::call_far`].
const PUBKEY_SIZE: usize = 33;

pub enum StepOutcome {
    /// One instruction executed; the transaction is still running.
    Continue,
    /// The far-call stack unwound to empty; nothing left to run.
    Done,
}

fn align16_up(n: u32) -> Option<u32> {
    n.checked_add(0xF).map(|n| n & !0xF)
}

/// Owns the combined stack buffer and the far-call frame stack; everything a
/// running transaction needs beyond the [`Host`] trait's external state.
/// Cap on the non-consensus far-call diagnostic trail, mirroring the
/// original's fixed-size `DebugCallstack` (`original_source/bvm/wasm_interpreter.h`).
/// Purely cosmetic: `FarCallStack`'s own `FAR_CALL_DEPTH` limit (32) is what
/// actually bounds nesting, so this cap is never reached in practice.
const CALL_TRACE_MAX: usize = 256;

pub struct Processor {
    stack: Vec<u8>,
    /// Current operand-stack top, in words.
    pos: u32,
    /// Floor below which the operand stack may never shrink (always 0 here;
    /// kept as a field because `original_source` ties it to the same
    /// invariant checked on every pop).
    pos_min: u32,
    /// Current alias-stack pointer, in bytes, counted down from `stack.len()`.
    bytes_current: u32,
    bytes_max: u32,
    frames: FarCallStack,
    ip: u32,
    cps: crate::error::Checkpoints,
    /// Non-consensus far-call trail, oldest first, used only to annotate
    /// `Exc` on failure; never consulted for control flow.
    call_trace: Vec<String>,
    limits: Limits,
}

impl Processor {
    pub fn new(limits: Limits) -> Self {
        let bytes_max = limits.stack_size;
        Processor {
            stack: vec![0u8; bytes_max as usize],
            pos: 0,
            pos_min: 0,
            bytes_current: bytes_max,
            bytes_max,
            frames: FarCallStack::new(limits),
            ip: 0,
            cps: crate::error::Checkpoints::new(),
            call_trace: Vec::new(),
            limits,
        }
    }

    /// The current far-call trail, most recent call last, for diagnostics
    /// only (e.g. embedding in logs alongside a trap).
    pub fn call_trace(&self) -> &[String] {
        &self.call_trace
    }

    pub fn is_done(&self) -> bool {
        self.frames.is_done()
    }

    pub fn far_call_depth(&self) -> usize {
        self.frames.depth()
    }

    // -- word-level stack primitives -----------------------------------

    fn word_at(&self, idx: u32) -> u32 {
        let at = idx as usize * 4;
        u32::from_le_bytes(self.stack[at..at + 4].try_into().unwrap())
    }

    fn set_word_at(&mut self, idx: u32, v: u32) {
        let at = idx as usize * 4;
        self.stack[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn push_word(&mut self, v: u32) -> Result<(), Exc> {
        if (self.pos as u64 + 1) * 4 > self.bytes_current as u64 {
            return Err(bounds("operand stack collides with the alias-stack region"));
        }
        self.set_word_at(self.pos, v);
        self.pos += 1;
        Ok(())
    }

    fn pop_word(&mut self) -> Result<u32, Exc> {
        if self.pos <= self.pos_min {
            return Err(bounds("operand stack underflow"));
        }
        self.pos -= 1;
        Ok(self.word_at(self.pos))
    }

    fn push_i64(&mut self, v: i64) -> Result<(), Exc> {
        let bits = v as u64;
        self.push_word(bits as u32)?;
        self.push_word((bits >> 32) as u32)?;
        Ok(())
    }

    fn pop_i64(&mut self) -> Result<i64, Exc> {
        let high = self.pop_word()?;
        let low = self.pop_word()?;
        Ok((((high as u64) << 32) | low as u64) as i64)
    }

    fn pop_i32_pair(&mut self) -> Result<(i32, i32), Exc> {
        let b = self.pop_word()? as i32;
        let a = self.pop_word()? as i32;
        Ok((a, b))
    }

    fn pop_u32_pair(&mut self) -> Result<(u32, u32), Exc> {
        let b = self.pop_word()?;
        let a = self.pop_word()?;
        Ok((a, b))
    }

    fn pop_i64_pair(&mut self) -> Result<(i64, i64), Exc> {
        let b = self.pop_i64()?;
        let a = self.pop_i64()?;
        Ok((a, b))
    }

    fn pop_u64_pair(&mut self) -> Result<(u64, u64), Exc> {
        let b = self.pop_i64()? as u64;
        let a = self.pop_i64()? as u64;
        Ok((a, b))
    }

    fn push_bool(&mut self, v: bool) -> Result<(), Exc> {
        self.push_word(v as u32)
    }

    // -- segment access ---------------------------------------------------

    /// Data segment access is bounds-checked against the top far-call
    /// frame's `data0`/`data()`; there is no write path (see module docs on
    /// `MemTag::Data`).
    fn data_read(&self, offset: u32, len: u32) -> Result<Vec<u8>, Exc> {
        let frame = self.frames.top().ok_or_else(|| trap("no active frame"))?;
        let data = frame.data();
        let rel = offset
            .checked_sub(frame.data0())
            .ok_or_else(|| bounds("data address below the segment base"))? as usize;
        let end = rel.checked_add(len as usize).ok_or_else(|| bounds("data access length overflow"))?;
        if end > data.len() {
            return Err(bounds("data access out of range"));
        }
        Ok(data[rel..end].to_vec())
    }

    fn stack_read(&self, offset: u32, len: u32) -> Result<Vec<u8>, Exc> {
        if (offset as u64) < (self.pos as u64) * 4 {
            return Err(bounds("stack read below the live operand-stack top"));
        }
        let start = offset as usize;
        let end = start.checked_add(len as usize).ok_or_else(|| bounds("stack access length overflow"))?;
        if end > self.stack.len() {
            return Err(bounds("stack access out of range"));
        }
        Ok(self.stack[start..end].to_vec())
    }

    fn stack_write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Exc> {
        if (offset as u64) < (self.pos as u64) * 4 {
            return Err(bounds("stack write below the live operand-stack top"));
        }
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or_else(|| bounds("stack access length overflow"))?;
        if end > self.stack.len() {
            return Err(bounds("stack access out of range"));
        }
        self.stack[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn mem_read(&self, addr: TaggedAddr, len: u32) -> Result<Vec<u8>, Exc> {
        match addr.tag() {
            Some(MemTag::Data) => self.data_read(addr.offset(), len),
            Some(MemTag::Global) => Err(bounds("this engine has no backing linear memory")),
            Some(MemTag::Stack) => self.stack_read(addr.offset(), len),
            None => Err(bounds("address has no valid segment tag")),
        }
    }

    fn mem_write(&mut self, addr: TaggedAddr, bytes: &[u8]) -> Result<(), Exc> {
        match addr.tag() {
            Some(MemTag::Stack) => self.stack_write(addr.offset(), bytes),
            Some(MemTag::Data) => Err(bounds("the data segment is read-only in this engine")),
            Some(MemTag::Global) => Err(bounds("this engine has no backing linear memory")),
            None => Err(bounds("address has no valid segment tag")),
        }
    }

    // -- locals -------------------------------------------------------

    fn local_get(&mut self, imm: u32) -> Result<(), Exc> {
        let o = imm >> 2;
        let vt = ValType::from_local_tag(imm & 3).ok_or_else(|| link("bad local type tag"))?;
        let words = vt.words();
        if o < words {
            return Err(bounds("local access overlaps its own write position"));
        }
        let base = self.pos.checked_sub(o).ok_or_else(|| bounds("local offset underflows the stack"))?;
        for i in 0..words {
            let w = self.word_at(base + i);
            self.push_word(w)?;
        }
        Ok(())
    }

    fn local_set(&mut self, imm: u32, keep: bool) -> Result<(), Exc> {
        let o = imm >> 2;
        let vt = ValType::from_local_tag(imm & 3).ok_or_else(|| link("bad local type tag"))?;
        let words = vt.words();
        if o < words {
            return Err(bounds("local access overlaps its own write position"));
        }
        let base = self.pos.checked_sub(o).ok_or_else(|| bounds("local offset underflows the stack"))?;
        let top = self.pos.checked_sub(words).ok_or_else(|| bounds("operand stack underflow"))?;
        for i in 0..words {
            let w = self.word_at(top + i);
            self.set_word_at(base + i, w);
        }
        if !keep {
            self.pos = top;
        }
        Ok(())
    }

    // -- far calls ------------------------------------------------------

    /// Shared by the host-driven initial invocation and the in-contract
    /// `CallFar` host call: validates `args`, pushes a new far-call frame,
    /// then pushes the args pointer and a return address and jumps to the
    /// method's entry point. An exported method's own WASM signature is
    /// `(i32) -> ...`, the one parameter being this pushed args pointer.
    pub fn call_far(
        &mut self,
        host: &mut dyn Host,
        cid: ContractId,
        method: u32,
        args: TaggedAddr,
    ) -> Result<(), Exc> {
        match args.tag() {
            Some(MemTag::Global) => {}
            Some(MemTag::Stack) if args.offset() >= self.bytes_current => {}
            _ => return Err(trap("far-call arguments must be Global- or Stack-above-SP-tagged")),
        }
        let body = host
            .load_contract_body(cid)?
            .ok_or_else(|| Exc::new(ErrorKind::Host, "far-call target contract does not exist"))?;
        let return_ip = self.ip;
        let frame = self.frames.push(cid, body)?;
        let target = frame.header.method_addr(method)?;
        self.push_word(args.0)?;
        self.push_word(return_ip)?;
        self.ip = target;
        if self.call_trace.len() == CALL_TRACE_MAX {
            self.call_trace.remove(0);
        }
        self.call_trace.push(format!("cid={} method={method}", hex_cid(&cid)));
        Ok(())
    }

    fn current_cid(&self) -> Result<ContractId, Exc> {
        Ok(self.frames.top().ok_or_else(|| trap("no active frame"))?.contract_id)
    }

    // -- funds and reference-count bookkeeping ---------------------------
    //
    // Grounded in `original_source/core/bvm2.cpp`'s `ProcessorPlus::HandleAmount*`/
    // `HandleRef*`: both are plain accumulators the processor maintains in the
    // host's variable store via `LoadVar`/`SaveVar`, keyed off the
    // currently-executing contract (`SetVarKey`), not host callbacks.

    /// `FundsLock`/`FundsUnlock`: `contract_id || LockedAmount || asset_id`
    /// holds a 128-bit accumulator; locking adds, unlocking subtracts, and
    /// both trap on over/underflow (`ErrorKind::Host`, matching spec.md's
    /// taxonomy for funds under/overflow).
    fn handle_amount(&mut self, host: &mut dyn Host, asset_id: u32, amount: u64, lock: bool) -> Result<(), Exc> {
        let cid = self.current_cid()?;
        let key = VarKey::locked_amount(cid, asset_id, self.limits).ok_or_else(|| bounds("funds var key exceeds the configured limit"))?;
        let current = u128::from_le_bytes(store::load_fixed_or_zero(host, &key)?);
        let amount = amount as u128;
        let updated = if lock {
            current.checked_add(amount).ok_or_else(|| Exc::new(ErrorKind::Host, "funds lock overflow"))?
        } else {
            current.checked_sub(amount).ok_or_else(|| Exc::new(ErrorKind::Host, "funds unlock underflow"))?
        };
        store::save_nnz(host, &key, &updated.to_le_bytes())
    }

    /// A single 128-bit saturating-checked counter at `key`: increments (or
    /// decrements) by one, trapping on overflow or on releasing a counter
    /// already at zero, and reports whether this call transitioned the
    /// counter across zero (0->1 on increment, 1->0 on decrement).
    fn handle_ref_raw(&mut self, host: &mut dyn Host, key: &VarKey, add: bool) -> Result<bool, Exc> {
        let current = u128::from_le_bytes(store::load_fixed_or_zero(host, key)?);
        let (transitioned, updated) = if add {
            let updated = current.checked_add(1).ok_or_else(|| Exc::new(ErrorKind::Host, "reference count overflow"))?;
            (current == 0, updated)
        } else {
            if current == 0 {
                return Err(Exc::new(ErrorKind::Host, "reference count underflow"));
            }
            let updated = current - 1;
            (updated == 0, updated)
        };
        store::save_nnz(host, key, &updated.to_le_bytes())?;
        Ok(transitioned)
    }

    /// `RefAdd`/`RefRelease`: a per-(contract, other) counter, plus a global
    /// per-`other`-contract counter that only moves when the per-pair one
    /// crosses zero. On the 0->1 transition of an add, also verifies
    /// `other`'s body exists via the zero-tag key, undoing and reporting
    /// failure if not. Otherwise always reports success, exactly like
    /// `HandleRef`'s unconditional `return 1` past the existence check.
    fn handle_ref(&mut self, host: &mut dyn Host, other: ContractId, add: bool) -> Result<bool, Exc> {
        let cid = self.current_cid()?;
        let pair_key = VarKey::refs(cid, other, self.limits).ok_or_else(|| bounds("ref var key exceeds the configured limit"))?;
        let transitioned = self.handle_ref_raw(host, &pair_key, add)?;
        if transitioned {
            if add {
                let exists_key =
                    VarKey::contract_internal(other, &[], self.limits).ok_or_else(|| bounds("ref var key exceeds the configured limit"))?;
                let exists = host.load_var(exists_key.as_bytes(), &mut [])? > 0;
                if !exists {
                    self.handle_ref_raw(host, &pair_key, false)?;
                    return Ok(false);
                }
            }
            let global_key =
                VarKey::new(other, VarTag::Refs, &[], self.limits).ok_or_else(|| bounds("ref var key exceeds the configured limit"))?;
            self.handle_ref_raw(host, &global_key, add)?;
        }
        Ok(true)
    }

    /// Resets the stack and initializes a transaction: writes `args` at the
    /// top of the alias-stack region and returns a `Stack`-tagged address to
    /// it, ready to pass to [`Self::call_far`].
    pub fn init_stack(&mut self, args: &[u8]) -> Result<TaggedAddr, Exc> {
        self.pos = 0;
        self.pos_min = 0;
        let aligned = align16_up(args.len() as u32).ok_or_else(|| bounds("argument buffer too large"))?;
        if aligned > self.bytes_max {
            return Err(bounds("argument buffer larger than the stack"));
        }
        self.bytes_current = self.bytes_max - aligned;
        let start = self.bytes_current as usize;
        self.stack[start..start + args.len()].copy_from_slice(args);
        Ok(TaggedAddr::new(MemTag::Stack, self.bytes_current))
    }

    /// Runs until the far-call stack unwinds to empty, a step budget is
    /// exhausted, or an error occurs.
    pub fn run(&mut self, host: &mut dyn Host, max_steps: u64) -> Result<(), Exc> {
        for _ in 0..max_steps {
            match self.run_once(host)? {
                StepOutcome::Done => return Ok(()),
                StepOutcome::Continue => {}
            }
        }
        Err(trap("step budget exhausted"))
    }

    pub fn run_once(&mut self, host: &mut dyn Host) -> Result<StepOutcome, Exc> {
        let _g = self.cps.enter(format!("wasm/Run, Ip={}", self.ip));
        self.step(host).map_err(|e| {
            let mut exc = self.cps.fail(e.kind, e.message);
            exc.checkpoints.extend(self.call_trace.iter().rev().map(|c| format!("far_call {c}")));
            exc
        })
    }

    fn step(&mut self, host: &mut dyn Host) -> Result<StepOutcome, Exc> {
        if self.frames.is_done() {
            return Ok(StepOutcome::Done);
        }

        struct Decoded {
            op: Op,
            next_ip: u32,
            imm_u32: u32,
            imm_u8: u8,
            imm_i32: i32,
            imm_i64: i64,
            br_table: Vec<u32>,
            ret_triple: (u32, u32, u32),
        }

        let decoded = {
            let frame = self.frames.top().ok_or_else(|| trap("no active frame"))?;
            let code = frame.code();
            let mut cur = Cursor::new(code, self.ip);
            let op = cur.read_op()?;
            let mut d = Decoded {
                op,
                next_ip: 0,
                imm_u32: 0,
                imm_u8: 0,
                imm_i32: 0,
                imm_i64: 0,
                br_table: Vec::new(),
                ret_triple: (0, 0, 0),
            };
            match op {
                Op::Call | Op::CallExt | Op::GlobalGetImp | Op::GlobalSetImp | Op::LocalGet | Op::LocalSet
                | Op::LocalTee | Op::Br | Op::BrIf => {
                    d.imm_u32 = cur.read_fixed_u32()?;
                }
                Op::BrTable => {
                    let n = cur.read_fixed_u32()?;
                    for _ in 0..=n {
                        d.br_table.push(cur.read_fixed_u32()?);
                    }
                }
                Op::Drop | Op::Select => {
                    d.imm_u8 = cur.read_u8()?;
                }
                Op::I32Const => {
                    d.imm_i32 = cur.read_fixed_i32()?;
                }
                Op::I64Const => {
                    d.imm_i64 = cur.read_fixed_i64()?;
                }
                Op::Prolog => {
                    d.imm_u32 = cur.read_uleb()?;
                }
                Op::Ret => {
                    let r = cur.read_uleb()?;
                    let l = cur.read_uleb()?;
                    let a = cur.read_uleb()?;
                    d.ret_triple = (r, l, a);
                }
                _ if (0x28..=0x3E).contains(&op.byte()) => {
                    d.imm_u8 = cur.read_u8()?; // align, unused at runtime
                    d.imm_u32 = cur.read_fixed_u32()?; // offset
                }
                _ => {}
            }
            d.next_ip = cur.ip;
            d
        };
        self.ip = decoded.next_ip;

        match decoded.op {
            Op::Unreachable => return Err(trap("unreachable instruction executed")),

            Op::Prolog => {
                for _ in 0..decoded.imm_u32 {
                    self.push_word(0)?;
                }
            }

            Op::Ret => {
                let (r, l, a) = decoded.ret_triple;
                let args_base = self
                    .pos
                    .checked_sub(a + 1 + l + r)
                    .ok_or_else(|| bounds("ret: stack underflow"))?;
                let ret_vals: Vec<u32> = (0..r).map(|i| self.word_at(self.pos - r + i)).collect();
                let ret_addr = self.word_at(args_base + a);
                for (i, w) in ret_vals.into_iter().enumerate() {
                    self.set_word_at(args_base + i as u32, w);
                }
                self.pos = args_base + r;

                let frame_done = {
                    let frame = self.frames.top_mut().ok_or_else(|| trap("ret with no active frame"))?;
                    if frame.local_depth > 0 {
                        frame.local_depth -= 1;
                        false
                    } else {
                        true
                    }
                };
                if frame_done {
                    self.call_trace.pop();
                    match self.frames.pop_and_reparse()? {
                        None => {
                            self.ip = 0;
                            return Ok(StepOutcome::Done);
                        }
                        Some(_) => self.ip = ret_addr,
                    }
                } else {
                    self.ip = ret_addr;
                }
            }

            Op::Call => {
                let target = decoded.imm_u32;
                self.push_word(decoded.next_ip)?;
                if let Some(frame) = self.frames.top_mut() {
                    frame.local_depth += 1;
                }
                self.ip = target;
            }

            Op::CallIndirect => {
                let idx = self.pop_word()?;
                let frame = self.frames.top().ok_or_else(|| trap("no active frame"))?;
                let target = frame.indirect_target(idx)?;
                self.push_word(decoded.next_ip)?;
                self.frames.top_mut().unwrap().local_depth += 1;
                self.ip = target;
            }

            Op::CallExt => self.dispatch_call_ext(host, decoded.imm_u32)?,

            Op::GlobalGetImp => {
                if decoded.imm_u32 != STACK_POINTER_BINDING {
                    return Err(link("unknown global import binding"));
                }
                self.push_word(TaggedAddr::new(MemTag::Stack, self.bytes_current).0)?;
            }
            Op::GlobalSetImp => {
                if decoded.imm_u32 != STACK_POINTER_BINDING {
                    return Err(link("unknown global import binding"));
                }
                let v = self.pop_word()?;
                let addr = TaggedAddr(v);
                let offset = addr.require_tag(MemTag::Stack, "__stack_pointer write")?;
                if offset % 16 != 0 {
                    return Err(bounds("stack pointer must be 16-byte aligned"));
                }
                if offset < self.pos * 4 || offset > self.bytes_max {
                    return Err(bounds("stack pointer out of range"));
                }
                self.bytes_current = offset;
            }

            Op::Br => self.ip = decoded.imm_u32,
            Op::BrIf => {
                let cond = self.pop_word()?;
                if cond != 0 {
                    self.ip = decoded.imm_u32;
                }
            }
            Op::BrTable => {
                let n = decoded.br_table.len() as u32 - 1;
                let k = self.pop_word()?;
                let idx = if k >= n { n } else { k };
                self.ip = decoded.br_table[idx as usize];
            }

            Op::Drop => {
                let words = ValType::from_local_tag(decoded.imm_u8 as u32)
                    .ok_or_else(|| link("bad drop type tag"))?
                    .words();
                for _ in 0..words {
                    self.pop_word()?;
                }
            }
            Op::Select => {
                let vt = ValType::from_local_tag(decoded.imm_u8 as u32).ok_or_else(|| link("bad select type tag"))?;
                let words = vt.words();
                let cond = self.pop_word()?;
                let b: Vec<u32> = (0..words).map(|_| self.pop_word()).collect::<Result<_, _>>()?;
                let a: Vec<u32> = (0..words).map(|_| self.pop_word()).collect::<Result<_, _>>()?;
                let chosen = if cond != 0 { a } else { b };
                for w in chosen.into_iter().rev() {
                    self.push_word(w)?;
                }
            }

            Op::LocalGet => self.local_get(decoded.imm_u32)?,
            Op::LocalSet => self.local_set(decoded.imm_u32, false)?,
            Op::LocalTee => self.local_set(decoded.imm_u32, true)?,

            Op::I32Load | Op::I32Load8S | Op::I32Load8U | Op::I32Load16S | Op::I32Load16U | Op::I64Load
            | Op::I64Load8S | Op::I64Load8U | Op::I64Load16S | Op::I64Load16U | Op::I64Load32S | Op::I64Load32U => {
                self.exec_load(decoded.op, decoded.imm_u32)?
            }
            Op::I32Store | Op::I32Store8 | Op::I32Store16 | Op::I64Store | Op::I64Store8 | Op::I64Store16
            | Op::I64Store32 => self.exec_store(decoded.op, decoded.imm_u32)?,

            Op::I32Const => self.push_word(decoded.imm_i32 as u32)?,
            Op::I64Const => self.push_i64(decoded.imm_i64)?,

            Op::I32Eqz => {
                let a = self.pop_word()? as i32;
                self.push_bool(a == 0)?;
            }
            Op::I32Eq => {
                let (a, b) = self.pop_i32_pair()?;
                self.push_bool(a == b)?;
            }
            Op::I32Ne => {
                let (a, b) = self.pop_i32_pair()?;
                self.push_bool(a != b)?;
            }
            Op::I32LtS => {
                let (a, b) = self.pop_i32_pair()?;
                self.push_bool(a < b)?;
            }
            Op::I32LtU => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_bool(a < b)?;
            }
            Op::I32GtS => {
                let (a, b) = self.pop_i32_pair()?;
                self.push_bool(a > b)?;
            }
            Op::I32GtU => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_bool(a > b)?;
            }
            Op::I32LeS => {
                let (a, b) = self.pop_i32_pair()?;
                self.push_bool(a <= b)?;
            }
            Op::I32LeU => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_bool(a <= b)?;
            }
            Op::I32GeS => {
                let (a, b) = self.pop_i32_pair()?;
                self.push_bool(a >= b)?;
            }
            Op::I32GeU => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_bool(a >= b)?;
            }

            Op::I64Eqz => {
                let a = self.pop_i64()?;
                self.push_bool(a == 0)?;
            }
            Op::I64Eq => {
                let (a, b) = self.pop_i64_pair()?;
                self.push_bool(a == b)?;
            }
            Op::I64Ne => {
                let (a, b) = self.pop_i64_pair()?;
                self.push_bool(a != b)?;
            }
            Op::I64LtS => {
                let (a, b) = self.pop_i64_pair()?;
                self.push_bool(a < b)?;
            }
            Op::I64LtU => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_bool(a < b)?;
            }
            Op::I64GtS => {
                let (a, b) = self.pop_i64_pair()?;
                self.push_bool(a > b)?;
            }
            Op::I64GtU => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_bool(a > b)?;
            }
            Op::I64LeS => {
                let (a, b) = self.pop_i64_pair()?;
                self.push_bool(a <= b)?;
            }
            Op::I64LeU => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_bool(a <= b)?;
            }
            Op::I64GeS => {
                let (a, b) = self.pop_i64_pair()?;
                self.push_bool(a >= b)?;
            }
            Op::I64GeU => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_bool(a >= b)?;
            }

            Op::I32Clz => {
                let a = self.pop_word()?;
                self.push_word(a.leading_zeros())?;
            }
            Op::I32Ctz => {
                let a = self.pop_word()?;
                self.push_word(a.trailing_zeros())?;
            }
            Op::I32Popcnt => {
                let a = self.pop_word()?;
                self.push_word(a.count_ones())?;
            }
            Op::I32Add => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a.wrapping_add(b))?;
            }
            Op::I32Sub => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a.wrapping_sub(b))?;
            }
            Op::I32Mul => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a.wrapping_mul(b))?;
            }
            Op::I32DivS => {
                let (a, b) = self.pop_i32_pair()?;
                if b == 0 {
                    return Err(trap("division by zero"));
                }
                if a == i32::MIN && b == -1 {
                    return Err(trap("signed division overflow"));
                }
                self.push_word(a.wrapping_div(b) as u32)?;
            }
            Op::I32DivU => {
                let (a, b) = self.pop_u32_pair()?;
                if b == 0 {
                    return Err(trap("division by zero"));
                }
                self.push_word(a / b)?;
            }
            Op::I32RemS => {
                let (a, b) = self.pop_i32_pair()?;
                if b == 0 {
                    return Err(trap("division by zero"));
                }
                self.push_word(a.wrapping_rem(b) as u32)?;
            }
            Op::I32RemU => {
                let (a, b) = self.pop_u32_pair()?;
                if b == 0 {
                    return Err(trap("division by zero"));
                }
                self.push_word(a % b)?;
            }
            Op::I32And => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a & b)?;
            }
            Op::I32Or => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a | b)?;
            }
            Op::I32Xor => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a ^ b)?;
            }
            Op::I32Shl => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a.wrapping_shl(b & 31))?;
            }
            Op::I32ShrS => {
                let (a, b) = self.pop_i32_pair()?;
                self.push_word((a.wrapping_shr(b as u32 & 31)) as u32)?;
            }
            Op::I32ShrU => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a.wrapping_shr(b & 31))?;
            }
            Op::I32Rotl => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a.rotate_left(b & 31))?;
            }
            Op::I32Rotr => {
                let (a, b) = self.pop_u32_pair()?;
                self.push_word(a.rotate_right(b & 31))?;
            }

            Op::I64Clz => {
                let a = self.pop_i64()? as u64;
                self.push_i64(a.leading_zeros() as i64)?;
            }
            Op::I64Ctz => {
                let a = self.pop_i64()? as u64;
                self.push_i64(a.trailing_zeros() as i64)?;
            }
            Op::I64Popcnt => {
                let a = self.pop_i64()? as u64;
                self.push_i64(a.count_ones() as i64)?;
            }
            Op::I64Add => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64(a.wrapping_add(b) as i64)?;
            }
            Op::I64Sub => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64(a.wrapping_sub(b) as i64)?;
            }
            Op::I64Mul => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64(a.wrapping_mul(b) as i64)?;
            }
            Op::I64DivS => {
                let (a, b) = self.pop_i64_pair()?;
                if b == 0 {
                    return Err(trap("division by zero"));
                }
                if a == i64::MIN && b == -1 {
                    return Err(trap("signed division overflow"));
                }
                self.push_i64(a.wrapping_div(b))?;
            }
            Op::I64DivU => {
                let (a, b) = self.pop_u64_pair()?;
                if b == 0 {
                    return Err(trap("division by zero"));
                }
                self.push_i64((a / b) as i64)?;
            }
            Op::I64RemS => {
                let (a, b) = self.pop_i64_pair()?;
                if b == 0 {
                    return Err(trap("division by zero"));
                }
                self.push_i64(a.wrapping_rem(b))?;
            }
            Op::I64RemU => {
                let (a, b) = self.pop_u64_pair()?;
                if b == 0 {
                    return Err(trap("division by zero"));
                }
                self.push_i64((a % b) as i64)?;
            }
            Op::I64And => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64((a & b) as i64)?;
            }
            Op::I64Or => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64((a | b) as i64)?;
            }
            Op::I64Xor => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64((a ^ b) as i64)?;
            }
            Op::I64Shl => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64(a.wrapping_shl(b as u32 & 63) as i64)?;
            }
            Op::I64ShrS => {
                let (a, b) = self.pop_i64_pair()?;
                self.push_i64(a.wrapping_shr(b as u32 & 63))?;
            }
            Op::I64ShrU => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64(a.wrapping_shr(b as u32 & 63) as i64)?;
            }
            Op::I64Rotl => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64(a.rotate_left(b as u32 & 63) as i64)?;
            }
            Op::I64Rotr => {
                let (a, b) = self.pop_u64_pair()?;
                self.push_i64(a.rotate_right(b as u32 & 63) as i64)?;
            }

            Op::I32WrapI64 => {
                let a = self.pop_i64()?;
                self.push_word(a as u32)?;
            }
            Op::I64ExtendI32S => {
                let a = self.pop_word()? as i32;
                self.push_i64(a as i64)?;
            }
            Op::I64ExtendI32U => {
                let a = self.pop_word()?;
                self.push_i64(a as i64)?;
            }

            Op::Block | Op::Loop | Op::End | Op::Return => {
                return Err(bounds("structural opcode encountered in the compiled image"));
            }
        }

        Ok(StepOutcome::Continue)
    }

    fn exec_load(&mut self, op: Op, offset: u32) -> Result<(), Exc> {
        let base = self.pop_word()?;
        let addr = TaggedAddr(base.wrapping_add(offset));
        let (len, sign_extend, to_i64): (u32, bool, bool) = match op {
            Op::I32Load => (4, false, false),
            Op::I32Load8S => (1, true, false),
            Op::I32Load8U => (1, false, false),
            Op::I32Load16S => (2, true, false),
            Op::I32Load16U => (2, false, false),
            Op::I64Load => (8, false, true),
            Op::I64Load8S => (1, true, true),
            Op::I64Load8U => (1, false, true),
            Op::I64Load16S => (2, true, true),
            Op::I64Load16U => (2, false, true),
            Op::I64Load32S => (4, true, true),
            Op::I64Load32U => (4, false, true),
            _ => unreachable!(),
        };
        let bytes = self.mem_read(addr, len)?;
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(&bytes);
        let raw = u64::from_le_bytes(buf);
        if to_i64 {
            let v = if sign_extend {
                sign_extend_to_i64(raw, len)
            } else {
                raw as i64
            };
            self.push_i64(v)?;
        } else {
            let v = if sign_extend {
                sign_extend_to_i64(raw, len) as i32 as u32
            } else {
                raw as u32
            };
            self.push_word(v)?;
        }
        Ok(())
    }

    fn exec_store(&mut self, op: Op, offset: u32) -> Result<(), Exc> {
        let (len, from_i64): (u32, bool) = match op {
            Op::I32Store => (4, false),
            Op::I32Store8 => (1, false),
            Op::I32Store16 => (2, false),
            Op::I64Store => (8, true),
            Op::I64Store8 => (1, true),
            Op::I64Store16 => (2, true),
            Op::I64Store32 => (4, true),
            _ => unreachable!(),
        };
        let raw: u64 = if from_i64 { self.pop_i64()? as u64 } else { self.pop_word()? as u64 };
        let base = self.pop_word()?;
        let addr = TaggedAddr(base.wrapping_add(offset));
        let bytes = raw.to_le_bytes();
        self.mem_write(addr, &bytes[..len as usize])
    }

    fn dispatch_call_ext(&mut self, host: &mut dyn Host, binding_id: u32) -> Result<(), Exc> {
        host::by_id(binding_id).ok_or_else(|| link(format!("unknown call_ext binding {binding_id:#x}")))?;
        match binding_id {
            0x10 => {
                // memcpy(dst, src, n) -> dst
                let n = self.pop_word()?;
                let src = TaggedAddr(self.pop_word()?);
                let dst = TaggedAddr(self.pop_word()?);
                let src_bytes = self.mem_read(src, n)?;
                self.mem_write(dst, &src_bytes)?;
                self.push_word(dst.0)?;
            }
            0x11 => {
                // memset(dst, val, n) -> dst
                let n = self.pop_word()?;
                let val = self.pop_word()? as u8;
                let dst = TaggedAddr(self.pop_word()?);
                let bytes = vec![val; n as usize];
                self.mem_write(dst, &bytes)?;
                self.push_word(dst.0)?;
            }
            0x12 => {
                // memcmp(a, b, n) -> -1/0/1
                let n = self.pop_word()?;
                let b = TaggedAddr(self.pop_word()?);
                let a = TaggedAddr(self.pop_word()?);
                let ab = self.mem_read(a, n)?;
                let bb = self.mem_read(b, n)?;
                let cmp = match ab.cmp(&bb) {
                    std::cmp::Ordering::Less => -1i32,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                };
                self.push_word(cmp as u32)?;
            }
            0x13 => {
                // memis0(p, n) -> bool
                let n = self.pop_word()?;
                let p = TaggedAddr(self.pop_word()?);
                let bytes = self.mem_read(p, n)?;
                self.push_bool(bytes.iter().all(|&b| b == 0))?;
            }
            0x18 => {
                // StackAlloc(n) -> Stack-tagged address
                let n = self.pop_word()?;
                let aligned = align16_up(n).ok_or_else(|| bounds("StackAlloc size overflow"))?;
                let new_current = self
                    .bytes_current
                    .checked_sub(aligned)
                    .ok_or_else(|| bounds("StackAlloc exhausted the alias stack"))?;
                if new_current < self.pos * 4 {
                    return Err(bounds("StackAlloc collides with the operand stack"));
                }
                self.bytes_current = new_current;
                self.push_word(TaggedAddr::new(MemTag::Stack, new_current).0)?;
            }
            0x19 => {
                // StackFree(n)
                let n = self.pop_word()?;
                let aligned = align16_up(n).ok_or_else(|| bounds("StackFree size overflow"))?;
                let new_current = self
                    .bytes_current
                    .checked_add(aligned)
                    .ok_or_else(|| bounds("StackFree overflow"))?;
                if new_current > self.bytes_max {
                    return Err(bounds("StackFree freed more than was allocated"));
                }
                self.bytes_current = new_current;
            }
            0x20 => {
                // LoadVar(pk, nk, pv, nv) -> actual length
                let nv = self.pop_word()?;
                let pv = TaggedAddr(self.pop_word()?);
                let nk = self.pop_word()?;
                let pk = TaggedAddr(self.pop_word()?);
                let key = self.mem_read(pk, nk)?;
                let mut out = vec![0u8; nv as usize];
                let actual = host.load_var(&key, &mut out)?;
                self.mem_write(pv, &out)?;
                self.push_word(actual)?;
            }
            0x21 => {
                // SaveVar(pk, nk, pv, nv)
                let nv = self.pop_word()?;
                let pv = TaggedAddr(self.pop_word()?);
                let nk = self.pop_word()?;
                let pk = TaggedAddr(self.pop_word()?);
                let key = self.mem_read(pk, nk)?;
                let value = self.mem_read(pv, nv)?;
                host.save_var(&key, &value)?;
            }
            0x23 => {
                // CallFar(cid_ptr, method, args)
                let args = TaggedAddr(self.pop_word()?);
                let method = self.pop_word()?;
                let cid_ptr = TaggedAddr(self.pop_word()?);
                let cid_bytes = self.mem_read(cid_ptr, 32)?;
                let cid = ContractId::from_bytes(&cid_bytes).expect("mem_read(.., 32) always yields 32 bytes");
                self.call_far(host, cid, method, args)?;
            }
            0x28 => return Err(Exc::new(ErrorKind::Host, "contract called Halt")),
            0x29 => {
                // AddSig(pubkey_ptr)
                let ptr = TaggedAddr(self.pop_word()?);
                let pubkey = self.mem_read(ptr, PUBKEY_SIZE as u32)?;
                host.add_sig(&pubkey)?;
            }
            0x30 => {
                let amount = self.pop_i64()? as u64;
                let asset_id = self.pop_word()?;
                self.handle_amount(host, asset_id, amount, true)?;
            }
            0x31 => {
                let amount = self.pop_i64()? as u64;
                let asset_id = self.pop_word()?;
                self.handle_amount(host, asset_id, amount, false)?;
            }
            0x32 => {
                let ptr = TaggedAddr(self.pop_word()?);
                let cid_bytes = self.mem_read(ptr, 32)?;
                let cid = ContractId::from_bytes(&cid_bytes).unwrap();
                let added = self.handle_ref(host, cid, true)?;
                self.push_bool(added)?;
            }
            0x33 => {
                let ptr = TaggedAddr(self.pop_word()?);
                let cid_bytes = self.mem_read(ptr, 32)?;
                let cid = ContractId::from_bytes(&cid_bytes).unwrap();
                let released = self.handle_ref(host, cid, false)?;
                self.push_bool(released)?;
            }
            0x38 => {
                let n_meta = self.pop_word()?;
                let p_meta = TaggedAddr(self.pop_word()?);
                let meta = self.mem_read(p_meta, n_meta)?;
                let id = host.asset_create(&meta)?;
                self.push_word(id)?;
            }
            0x39 => {
                let emit = self.pop_word()? != 0;
                let amount = self.pop_i64()? as u64;
                let asset_id = self.pop_word()?;
                let ok = host.asset_emit(asset_id, amount, emit)?;
                self.push_bool(ok)?;
            }
            0x3A => {
                let asset_id = self.pop_word()?;
                let ok = host.asset_destroy(asset_id)?;
                self.push_bool(ok)?;
            }
            0x40 => {
                let h = host.get_height();
                self.push_i64(h as i64)?;
            }
            other => return Err(link(format!("binding {other:#x} has no runtime dispatch"))),
        }
        Ok(())
    }
}

fn sign_extend_to_i64(raw: u64, len: u32) -> i64 {
    let bits = len * 8;
    let shift = 64 - bits;
    (((raw << shift) as i64) >> shift) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::isa::{Op, Sink};
    use std::collections::HashMap;

    struct FakeHost {
        vars: HashMap<Vec<u8>, Vec<u8>>,
        bodies: HashMap<[u8; 32], Vec<u8>>,
        height: u64,
    }

    impl FakeHost {
        fn new() -> Self {
            FakeHost { vars: HashMap::new(), bodies: HashMap::new(), height: 42 }
        }
    }

    impl Host for FakeHost {
        fn load_var(&mut self, key: &[u8], out: &mut [u8]) -> Result<u32, Exc> {
            match self.vars.get(key) {
                None => Ok(0),
                Some(v) => {
                    let n = v.len().min(out.len());
                    out[..n].copy_from_slice(&v[..n]);
                    Ok(v.len() as u32)
                }
            }
        }
        fn save_var(&mut self, key: &[u8], value: &[u8]) -> Result<(), Exc> {
            if value.is_empty() {
                self.vars.remove(key);
            } else {
                self.vars.insert(key.to_vec(), value.to_vec());
            }
            Ok(())
        }
        fn load_contract_body(&mut self, cid: ContractId) -> Result<Option<Vec<u8>>, Exc> {
            Ok(self.bodies.get(cid.as_bytes()).cloned())
        }
        fn add_sig(&mut self, _pubkey: &[u8]) -> Result<(), Exc> {
            Ok(())
        }
        fn asset_create(&mut self, _meta: &[u8]) -> Result<u32, Exc> {
            Ok(7)
        }
        fn asset_emit(&mut self, _asset_id: u32, _amount: u64, _emit: bool) -> Result<bool, Exc> {
            Ok(true)
        }
        fn asset_destroy(&mut self, _asset_id: u32) -> Result<bool, Exc> {
            Ok(true)
        }
        fn get_height(&mut self) -> u64 {
            self.height
        }
    }

    /// Builds a one-method module body whose method 0 is: `i32.const 7`
    /// followed by a `ret` triple of (1 word ret, 0 locals, 1 arg).
    fn module_returning_const(v: i32) -> Vec<u8> {
        let mut sink = Sink::new();
        sink.op(Op::I32Const);
        sink.fixed_i32(v);
        sink.op(Op::Ret);
        sink.write_uleb(1);
        sink.write_uleb(0);
        sink.write_uleb(1);
        frame::build_body(0x1000, None, 0, &[0], &[], &sink.bytes)
    }

    #[test]
    fn call_far_then_ret_runs_to_completion_and_restores_return_value() {
        let cid = ContractId([9u8; 32]);
        let mut host = FakeHost::new();
        host.bodies.insert(*cid.as_bytes(), module_returning_const(123));

        let mut proc = Processor::new(Limits::default());
        let args = proc.init_stack(&[]).unwrap();
        proc.call_far(&mut host, cid, 0, args).unwrap();

        loop {
            match proc.run_once(&mut host).unwrap() {
                StepOutcome::Done => break,
                StepOutcome::Continue => {}
            }
        }
        assert!(proc.is_done());
    }

    #[test]
    fn call_trace_is_pushed_on_entry_and_popped_on_return() {
        let cid = ContractId([9u8; 32]);
        let mut host = FakeHost::new();
        host.bodies.insert(*cid.as_bytes(), module_returning_const(123));

        let mut proc = Processor::new(Limits::default());
        let args = proc.init_stack(&[]).unwrap();
        proc.call_far(&mut host, cid, 0, args).unwrap();
        assert_eq!(proc.call_trace().len(), 1);
        assert!(proc.call_trace()[0].contains("method=0"));

        while !matches!(proc.run_once(&mut host).unwrap(), StepOutcome::Done) {}
        assert!(proc.call_trace().is_empty());
    }

    #[test]
    fn call_trace_annotates_a_trap_raised_mid_call() {
        let cid = ContractId([4u8; 32]);
        let mut sink = Sink::new();
        sink.op(Op::Unreachable);
        sink.op(Op::Ret);
        sink.write_uleb(0);
        sink.write_uleb(0);
        sink.write_uleb(1);
        let body = frame::build_body(0, None, 0, &[0], &[], &sink.bytes);
        let mut host = FakeHost::new();
        host.bodies.insert(*cid.as_bytes(), body);

        let mut proc = Processor::new(Limits::default());
        let args = proc.init_stack(&[]).unwrap();
        proc.call_far(&mut host, cid, 0, args).unwrap();
        let err = proc.run_once(&mut host).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Trap);
        assert!(err.checkpoints.iter().any(|c| c.starts_with("far_call cid=")));
    }

    #[test]
    fn get_height_binding_pushes_chain_height() {
        let mut sink = Sink::new();
        sink.op(Op::CallExt);
        sink.fixed_u32(0x40);
        sink.op(Op::Ret);
        sink.write_uleb(2);
        sink.write_uleb(0);
        sink.write_uleb(1);
        let body = frame::build_body(0, None, 0, &[0], &[], &sink.bytes);

        let cid = ContractId([1u8; 32]);
        let mut host = FakeHost::new();
        host.height = 555;
        host.bodies.insert(*cid.as_bytes(), body);

        let mut proc = Processor::new(Limits::default());
        let args = proc.init_stack(&[]).unwrap();
        proc.call_far(&mut host, cid, 0, args).unwrap();
        while !matches!(proc.run_once(&mut host).unwrap(), StepOutcome::Done) {}
    }

    #[test]
    fn far_call_rejects_data_tagged_args() {
        let cid = ContractId([2u8; 32]);
        let mut host = FakeHost::new();
        host.bodies.insert(*cid.as_bytes(), module_returning_const(0));

        let mut proc = Processor::new(Limits::default());
        proc.init_stack(&[]).unwrap();
        let bad_args = TaggedAddr::new(MemTag::Data, 0);
        let err = proc.call_far(&mut host, cid, 0, bad_args).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Trap);
    }

    #[test]
    fn division_by_zero_traps() {
        let mut sink = Sink::new();
        sink.op(Op::I32Const);
        sink.fixed_i32(1);
        sink.op(Op::I32Const);
        sink.fixed_i32(0);
        sink.op(Op::I32DivS);
        sink.op(Op::Ret);
        sink.write_uleb(1);
        sink.write_uleb(0);
        sink.write_uleb(1);
        let body = frame::build_body(0, None, 0, &[0], &[], &sink.bytes);

        let cid = ContractId([3u8; 32]);
        let mut host = FakeHost::new();
        host.bodies.insert(*cid.as_bytes(), body);

        let mut proc = Processor::new(Limits::default());
        let args = proc.init_stack(&[]).unwrap();
        proc.call_far(&mut host, cid, 0, args).unwrap();
        let err = loop {
            match proc.run_once(&mut host) {
                Ok(StepOutcome::Done) => panic!("expected a trap before completion"),
                Ok(StepOutcome::Continue) => {}
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind, ErrorKind::Trap);
    }

    fn processor_with_active_frame(cid: ContractId, host: &mut FakeHost) -> Processor {
        host.bodies.insert(*cid.as_bytes(), module_returning_const(0));
        let mut proc = Processor::new(Limits::default());
        let args = proc.init_stack(&[]).unwrap();
        proc.call_far(host, cid, 0, args).unwrap();
        proc
    }

    #[test]
    fn handle_amount_locks_then_unlocks_back_to_zero() {
        let cid = ContractId([5u8; 32]);
        let mut host = FakeHost::new();
        let mut proc = processor_with_active_frame(cid, &mut host);

        proc.handle_amount(&mut host, 1, 100, true).unwrap();
        proc.handle_amount(&mut host, 1, 40, true).unwrap();
        let key = VarKey::locked_amount(cid, 1, Limits::default()).unwrap();
        let current = u128::from_le_bytes(store::load_fixed_or_zero(&mut host, &key).unwrap());
        assert_eq!(current, 140);

        proc.handle_amount(&mut host, 1, 140, false).unwrap();
        let current = u128::from_le_bytes(store::load_fixed_or_zero(&mut host, &key).unwrap());
        assert_eq!(current, 0);
        assert!(!host.vars.contains_key(key.as_bytes()));
    }

    #[test]
    fn handle_amount_unlock_underflow_traps() {
        let cid = ContractId([5u8; 32]);
        let mut host = FakeHost::new();
        let mut proc = processor_with_active_frame(cid, &mut host);

        let err = proc.handle_amount(&mut host, 1, 1, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Host);
    }

    #[test]
    fn handle_ref_add_fails_when_target_body_does_not_exist() {
        let cid = ContractId([5u8; 32]);
        let other = ContractId([6u8; 32]);
        let mut host = FakeHost::new();
        let mut proc = processor_with_active_frame(cid, &mut host);

        let added = proc.handle_ref(&mut host, other, true).unwrap();
        assert!(!added);

        let pair_key = VarKey::refs(cid, other, Limits::default()).unwrap();
        let counter = u128::from_le_bytes(store::load_fixed_or_zero(&mut host, &pair_key).unwrap());
        assert_eq!(counter, 0, "failed existence check must undo the per-pair increment");
    }

    #[test]
    fn handle_ref_add_succeeds_and_repeats_return_true_on_every_call() {
        let cid = ContractId([5u8; 32]);
        let other = ContractId([6u8; 32]);
        let mut host = FakeHost::new();
        let mut proc = processor_with_active_frame(cid, &mut host);

        let exists_key = VarKey::contract_internal(other, &[], Limits::default()).unwrap();
        host.vars.insert(exists_key.as_bytes().to_vec(), vec![1]);

        // 0 -> 1 transition: existence check passes.
        assert!(proc.handle_ref(&mut host, other, true).unwrap());
        // 1 -> 2, not a transition, but still reports success per HandleRef's
        // unconditional return past the existence check.
        assert!(proc.handle_ref(&mut host, other, true).unwrap());

        let global_key = VarKey::new(other, VarTag::Refs, &[], Limits::default()).unwrap();
        let global_count = u128::from_le_bytes(store::load_fixed_or_zero(&mut host, &global_key).unwrap());
        assert_eq!(global_count, 1, "the global counter only moves on the per-pair transition");
    }

    #[test]
    fn handle_ref_release_underflow_traps() {
        let cid = ContractId([5u8; 32]);
        let other = ContractId([6u8; 32]);
        let mut host = FakeHost::new();
        let mut proc = processor_with_active_frame(cid, &mut host);

        let err = proc.handle_ref(&mut host, other, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Host);
    }

    #[test]
    fn handle_ref_release_transition_clears_the_global_counter() {
        let cid = ContractId([5u8; 32]);
        let other = ContractId([6u8; 32]);
        let mut host = FakeHost::new();
        let mut proc = processor_with_active_frame(cid, &mut host);

        let exists_key = VarKey::contract_internal(other, &[], Limits::default()).unwrap();
        host.vars.insert(exists_key.as_bytes().to_vec(), vec![1]);
        proc.handle_ref(&mut host, other, true).unwrap();

        let released = proc.handle_ref(&mut host, other, false).unwrap();
        assert!(released);

        let global_key = VarKey::new(other, VarTag::Refs, &[], Limits::default()).unwrap();
        assert!(!host.vars.contains_key(global_key.as_bytes()));
    }

    #[test]
    fn stack_alloc_and_free_round_trip_the_alias_pointer() {
        let mut sink = Sink::new();
        sink.op(Op::I32Const);
        sink.fixed_i32(64);
        sink.op(Op::CallExt);
        sink.fixed_u32(0x18); // StackAlloc
        sink.op(Op::Drop);
        sink.u8(ValType::I32.local_tag() as u8);
        sink.op(Op::I32Const);
        sink.fixed_i32(64);
        sink.op(Op::CallExt);
        sink.fixed_u32(0x19); // StackFree
        sink.op(Op::Ret);
        sink.write_uleb(0);
        sink.write_uleb(0);
        sink.write_uleb(1);
        let body = frame::build_body(0, None, 0, &[0], &[], &sink.bytes);

        let cid = ContractId([4u8; 32]);
        let mut host = FakeHost::new();
        host.bodies.insert(*cid.as_bytes(), body);

        let mut proc = Processor::new(Limits::default());
        let args = proc.init_stack(&[]).unwrap();
        proc.call_far(&mut host, cid, 0, args).unwrap();
        while !matches!(proc.run_once(&mut host).unwrap(), StepOutcome::Done) {}
        assert_eq!(proc.bytes_current, proc.bytes_max);
    }
}
