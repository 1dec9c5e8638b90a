//! Walks the WASM binary format: the 8-byte preamble, then each section in
//! strictly increasing id order (custom=0 and data-count=12 are exempt),
//! into a [`ParsedModule`] the compiler consumes.
//!
//! Section contents are read directly off the top-level [`Reader`] rather
//! than a sub-reader over a copied slice, so that an `AutoWorkAround` LEB
//! rewrite lands in the module's own backing buffer -- re-parsing that same
//! buffer later must see the fixed-up byte, not a throwaway copy of it.

use crate::error::{Checkpoints, ErrorKind, Exc};
use crate::leb::{LebMode, Reader};
use crate::types::ValType;

#[derive(Debug, Clone)]
pub struct FuncType {
    pub args: Vec<ValType>,
    pub rets: Vec<ValType>,
}

#[derive(Debug, Clone)]
pub struct ImportFunc {
    pub module: String,
    pub name: String,
    pub type_index: u32,
    pub binding_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ImportGlobal {
    pub module: String,
    pub name: String,
    pub vtype: ValType,
    pub mutable: bool,
    pub binding_id: Option<u32>,
}

/// One local slot: its type, word width, and its contiguous word position
/// (arguments first, then declared locals, in declaration order).
#[derive(Debug, Clone, Copy)]
pub struct Local {
    pub vtype: ValType,
    pub words: u32,
    pub pos_words: u32,
}

#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub type_index: u32,
    pub locals: Vec<Local>,
    /// Raw body bytes, immediately after the local-declaration prefix, as
    /// they appeared in the Code section entry for this function.
    pub body: Vec<u8>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub index: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalDecl {
    pub vtype: ValType,
    pub mutable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedModule {
    pub types: Vec<FuncType>,
    pub import_funcs: Vec<ImportFunc>,
    pub import_globals: Vec<ImportGlobal>,
    pub funcs: Vec<FuncDecl>,
    pub table_funcs: Vec<u32>,
    pub globals: Vec<GlobalDecl>,
    pub exports: Vec<Export>,
    pub data0: u32,
    pub data: Vec<u8>,
}

impl ParsedModule {
    pub fn total_func_count(&self) -> u32 {
        self.import_funcs.len() as u32 + self.funcs.len() as u32
    }
}

const SEC_CUSTOM: u32 = 0;
const SEC_TYPE: u32 = 1;
const SEC_IMPORT: u32 = 2;
const SEC_FUNCTION: u32 = 3;
const SEC_TABLE: u32 = 4;
const SEC_GLOBAL: u32 = 6;
const SEC_EXPORT: u32 = 7;
const SEC_ELEMENT: u32 = 9;
const SEC_CODE: u32 = 10;
const SEC_DATA: u32 = 11;
const SEC_DATA_COUNT: u32 = 12;

fn decode(msg: impl Into<String>) -> Exc {
    Exc::new(ErrorKind::Decode, msg.into())
}

/// Reads `i32.const <x>; end` and returns `x`; this is the only initializer
/// expression form this engine accepts, for globals and data/element offsets
/// alike.
fn read_i32_initializer(r: &mut Reader) -> Result<i32, Exc> {
    let op = r.read1()?;
    if op != 0x41 {
        return Err(decode("initializer must be i32.const"));
    }
    let v = r.read_i32()?;
    let end = r.read1()?;
    if end != 0x0B {
        return Err(decode("initializer must end with end_block (0x0B)"));
    }
    Ok(v)
}

fn read_limits(r: &mut Reader) -> Result<(), Exc> {
    let flags = r.read1()?;
    r.read_u32()?; // min
    if flags & 1 != 0 {
        r.read_u32()?; // max
    }
    Ok(())
}

pub fn parse_module(bytes: Vec<u8>, mode: LebMode, cps: &mut Checkpoints) -> Result<(ParsedModule, Reader), Exc> {
    let _g = cps.enter("wasm/parse");
    let mut r = Reader::new(bytes, mode);

    let magic = r.consume(4)?;
    if magic != [0x00, 0x61, 0x73, 0x6D] {
        return Err(cps.fail(ErrorKind::Decode, "bad magic, expected \\0asm"));
    }
    let version = r.read_fixed_u32()?;
    if version != 1 {
        return Err(cps.fail(ErrorKind::Decode, format!("unsupported module version {version}")));
    }

    let mut m = ParsedModule::default();
    let mut func_type_indices: Vec<u32> = Vec::new();
    let mut prev_section: u32 = 0;

    while !r.is_empty() {
        let section_id = r.read1()? as u32;
        let section_len = r.read_u32()?;
        let section_end = r.pos() + section_len as usize;

        if section_id != SEC_CUSTOM && section_id != SEC_DATA_COUNT {
            if section_id <= prev_section {
                return Err(cps.fail(ErrorKind::Decode, format!("section id {section_id} out of order")));
            }
            prev_section = section_id;
        }

        let _gs = cps.enter(format!("section={section_id}"));
        match section_id {
            SEC_CUSTOM => parse_custom(&mut r, &mut m, section_end)?,
            SEC_TYPE => parse_type(&mut r, &mut m)?,
            SEC_IMPORT => parse_import(&mut r, &mut m)?,
            SEC_FUNCTION => parse_function(&mut r, &mut m, &mut func_type_indices)?,
            SEC_TABLE => parse_table(&mut r)?,
            SEC_GLOBAL => parse_global(&mut r, &mut m)?,
            SEC_EXPORT => parse_export(&mut r, &mut m)?,
            SEC_ELEMENT => parse_element(&mut r, &mut m)?,
            SEC_CODE => parse_code(&mut r, &mut m, &func_type_indices)?,
            SEC_DATA => parse_data(&mut r, &mut m)?,
            SEC_DATA_COUNT => {
                r.read_u32()?;
            }
            other => return Err(cps.fail(ErrorKind::Decode, format!("unknown section id {other}"))),
        }

        if r.pos() != section_end {
            return Err(cps.fail(
                ErrorKind::Decode,
                format!("section {section_id} was not consumed exactly"),
            ));
        }
    }

    if func_type_indices.len() != m.funcs.len() {
        return Err(cps.fail(ErrorKind::Decode, "function section/code section count mismatch"));
    }

    log::debug!(
        "parsed module: {} types, {} import funcs, {} funcs, {} exports, data len {}",
        m.types.len(),
        m.import_funcs.len(),
        m.funcs.len(),
        m.exports.len(),
        m.data.len()
    );

    Ok((m, r))
}

fn parse_type(r: &mut Reader, m: &mut ParsedModule) -> Result<(), Exc> {
    let count = r.read_u32()?;
    for _ in 0..count {
        let header = r.read1()?;
        if header != 0x60 {
            return Err(decode("function type header must be 0x60"));
        }
        let n_args = r.read_u32()?;
        let mut args = Vec::with_capacity(n_args as usize);
        for _ in 0..n_args {
            args.push(ValType::from_code(r.read1()?).ok_or_else(|| decode("bad value type code"))?.require_implemented()?);
        }
        let n_rets = r.read_u32()?;
        if n_rets > 1 {
            return Err(decode("function type may have at most one return"));
        }
        let mut rets = Vec::with_capacity(n_rets as usize);
        for _ in 0..n_rets {
            rets.push(ValType::from_code(r.read1()?).ok_or_else(|| decode("bad value type code"))?.require_implemented()?);
        }
        m.types.push(FuncType { args, rets });
    }
    Ok(())
}

fn parse_import(r: &mut Reader, m: &mut ParsedModule) -> Result<(), Exc> {
    let count = r.read_u32()?;
    for _ in 0..count {
        let module = r.read_name()?;
        let name = r.read_name()?;
        if module != "env" {
            return Err(decode(format!("import from unsupported module {module:?}")));
        }
        let kind = r.read1()?;
        match kind {
            0 => {
                let type_index = r.read_u32()?;
                if type_index as usize >= m.types.len() {
                    return Err(decode("import function type index out of range"));
                }
                m.import_funcs.push(ImportFunc { module, name, type_index, binding_id: None });
            }
            1 => {
                let elem_type = r.read1()?;
                if elem_type != 0x70 {
                    return Err(decode("table import element type must be anyfunc"));
                }
                read_limits(r)?;
            }
            2 => {
                read_limits(r)?;
            }
            3 => {
                let vtype = ValType::from_code(r.read1()?).ok_or_else(|| decode("bad global type code"))?.require_implemented()?;
                let mutable = r.read1()? != 0;
                m.import_globals.push(ImportGlobal { module, name, vtype, mutable, binding_id: None });
            }
            other => return Err(decode(format!("unknown import kind {other}"))),
        }
    }
    Ok(())
}

fn parse_function(r: &mut Reader, m: &mut ParsedModule, func_type_indices: &mut Vec<u32>) -> Result<(), Exc> {
    let count = r.read_u32()?;
    for _ in 0..count {
        let ti = r.read_u32()?;
        if ti as usize >= m.types.len() {
            return Err(decode("function type index out of range"));
        }
        func_type_indices.push(ti);
    }
    Ok(())
}

fn parse_table(r: &mut Reader) -> Result<(), Exc> {
    let count = r.read_u32()?;
    for _ in 0..count {
        let elem_type = r.read1()?;
        if elem_type != 0x70 {
            return Err(decode("table element type must be anyfunc"));
        }
        read_limits(r)?;
    }
    Ok(())
}

fn parse_global(r: &mut Reader, m: &mut ParsedModule) -> Result<(), Exc> {
    let count = r.read_u32()?;
    for _ in 0..count {
        let vtype = ValType::from_code(r.read1()?).ok_or_else(|| decode("bad global type code"))?.require_implemented()?;
        let mutable = r.read1()? != 0;
        read_i32_initializer(r)?;
        m.globals.push(GlobalDecl { vtype, mutable });
    }
    Ok(())
}

fn parse_export(r: &mut Reader, m: &mut ParsedModule) -> Result<(), Exc> {
    let count = r.read_u32()?;
    for _ in 0..count {
        let name = r.read_name()?;
        let kind = r.read1()?;
        let index = r.read_u32()?;
        if kind == 0 {
            m.exports.push(Export { name, index });
        } else {
            log::debug!("ignoring non-function export {name:?} (kind {kind})");
        }
    }
    Ok(())
}

fn parse_element(r: &mut Reader, m: &mut ParsedModule) -> Result<(), Exc> {
    let count = r.read_u32()?;
    if count != 1 {
        return Err(decode("exactly one element segment is permitted"));
    }
    let table_index = r.read_u32()?;
    if table_index != 0 {
        return Err(decode("element segment table index must be 0"));
    }
    let offset = read_i32_initializer(r)?;
    if offset != 1 {
        return Err(decode("element segment offset must be 1"));
    }
    let n = r.read_u32()?;
    let import_count = m.import_funcs.len() as u32;
    for _ in 0..n {
        let idx = r.read_u32()?;
        if idx < import_count {
            return Err(decode("element segment cannot reference an imported function"));
        }
        m.table_funcs.push(idx - import_count);
    }
    Ok(())
}

fn parse_code(r: &mut Reader, m: &mut ParsedModule, func_type_indices: &[u32]) -> Result<(), Exc> {
    let count = r.read_u32()?;
    if count as usize != func_type_indices.len() {
        return Err(decode("code section entry count does not match function section"));
    }
    for &type_index in func_type_indices {
        let size = r.read_u32()?;
        let body_start = r.pos();
        let body_end = body_start + size as usize;

        let ty = &m.types[type_index as usize];
        let mut locals = Vec::new();
        let mut pos_words = 0u32;
        for &arg in &ty.args {
            locals.push(Local { vtype: arg, words: arg.words(), pos_words });
            pos_words += arg.words();
        }

        let n_groups = r.read_u32()?;
        for _ in 0..n_groups {
            let n = r.read_u32()?;
            let vtype = ValType::from_code(r.read1()?).ok_or_else(|| decode("bad local type code"))?.require_implemented()?;
            for _ in 0..n {
                locals.push(Local { vtype, words: vtype.words(), pos_words });
                pos_words += vtype.words();
            }
        }

        if r.pos() > body_end {
            return Err(decode("local declarations overran function body size"));
        }
        let body = r.buffer()[r.pos()..body_end].to_vec();
        r.consume(body_end - r.pos())?;

        m.funcs.push(FuncDecl { type_index, locals, body, name: None });
    }
    Ok(())
}

fn parse_data(r: &mut Reader, m: &mut ParsedModule) -> Result<(), Exc> {
    let count = r.read_u32()?;
    for i in 0..count {
        let addr_field = r.read_u32()?;
        let offset = read_i32_initializer(r)? as u32;
        let addr = addr_field.wrapping_add(offset);
        let bytes = r.read_bytes_vec()?;

        if i == 0 {
            m.data0 = addr;
        } else {
            // Sorted, non-overlapping, but gaps between segments are allowed
            // and zero-filled below, matching `CompilerPlus::OnSection_Data`.
            let min_addr = m.data0.wrapping_add(m.data.len() as u32);
            if addr < min_addr {
                return Err(decode("data segments must be sorted and non-overlapping"));
            }
        }

        if !bytes.is_empty() {
            let rel = addr.checked_sub(m.data0).ok_or_else(|| decode("data segment address precedes the data base"))? as usize;
            let end = rel.checked_add(bytes.len()).ok_or_else(|| decode("data segment extends past addressable range"))?;
            if m.data.len() < end {
                m.data.resize(end, 0);
            }
            m.data[rel..end].copy_from_slice(&bytes);
        }
    }
    Ok(())
}

fn parse_custom(r: &mut Reader, m: &mut ParsedModule, section_end: usize) -> Result<(), Exc> {
    let name = r.read_name()?;
    if name != "name" {
        // Unrecognized custom section: skip whatever is left of it verbatim.
        r.consume(section_end - r.pos())?;
        return Ok(());
    }
    let import_count = m.import_funcs.len() as u32;
    while r.pos() < section_end {
        let sub_id = r.read1()?;
        let sub_len = r.read_u32()?;
        let sub_end = r.pos() + sub_len as usize;
        if sub_id == 1 {
            let n = r.read_u32()?;
            for _ in 0..n {
                let idx = r.read_u32()?;
                let nm = r.read_name()?;
                if idx >= import_count {
                    let fi = (idx - import_count) as usize;
                    if let Some(f) = m.funcs.get_mut(fi) {
                        f.name = Some(nm);
                    }
                }
            }
            if r.pos() != sub_end {
                return Err(decode("name subsection was not consumed exactly"));
            }
        } else {
            r.consume(sub_end - r.pos())?;
        }
    }
    Ok(())
}
