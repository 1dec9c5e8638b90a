//! The on-chain module header format and the far-call frame stack.
//!
//! Grounded in `original_source/core/bvm2.cpp`'s `Processor::Header`/
//! `ParseMod`/`CallFar`/`OnRet`: a frame's code is re-derived from its stored
//! body bytes on every return rather than cached as a decoded struct across
//! the callee's execution (see `SPEC_FULL.md` §4.5).
//!
//! Two deliberate departures from the original wire format, both recorded in
//! `DESIGN.md`:
//!
//! - An explicit `data_len` field. The original locates the data slice as
//!   "everything after the header to the end of the buffer", which silently
//!   folds the trailing bytecode into the nominal data blob and under-bounds
//!   `Data`-tagged accesses. Storing the length explicitly lets this engine
//!   bound `Data` segment accesses to the true payload.
//! - Explicit `table0`/`table_count` fields for the indirect-call table. The
//!   original's `Processor::m_prTable0` is a field the host sets once from
//!   the compiler's in-memory state and `ParseMod` never refreshes it on a
//!   far-call return, so a callee with its own indirect table would
//!   silently resolve through the caller's. Reparsing it alongside the
//!   rest of the header avoids that.

use crate::error::{ErrorKind, Exc};
use crate::ids::ContractId;
use crate::types::Limits;

pub const HEADER_VERSION: u32 = 1;
pub const METHODS_MIN: u32 = 2;
pub const METHODS_MAX: u32 = 1 << 28;

fn decode(msg: impl Into<String>) -> Exc {
    Exc::new(ErrorKind::Decode, msg.into())
}

/// A parsed module header: method entry table plus the code/data byte ranges
/// within the frame's raw body.
#[derive(Debug, Clone)]
pub struct ModuleHeader {
    pub num_methods: u32,
    /// Base used for `Data`-tagged address arithmetic: `data[addr - data0]`.
    pub data0: u32,
    /// Byte offset (within the code slice) of the indirect-call table, if
    /// the module has one.
    pub table0: Option<u32>,
    /// Byte offset (within the frame body) of each method's entry point.
    pub method_offsets: Vec<u32>,
    data_start: u32,
    data_len: u32,
    code_start: u32,
}

impl ModuleHeader {
    pub fn method_addr(&self, method: u32) -> Result<u32, Exc> {
        self.method_offsets
            .get(method as usize)
            .copied()
            .ok_or_else(|| decode("method index out of range"))
    }
}

const FIXED_HEADER_LEN: usize = 24;

/// Parses the fixed header prefix of a frame's body bytes: version, method
/// count, data base/length, indirect-table base/count, then the method
/// offset table.
pub fn parse_header(body: &[u8]) -> Result<ModuleHeader, Exc> {
    if body.len() < FIXED_HEADER_LEN {
        return Err(decode("module body too small for header"));
    }
    let version = u32::from_le_bytes(body[0..4].try_into().unwrap());
    if version != HEADER_VERSION {
        return Err(decode("unsupported module header version"));
    }
    let num_methods = u32::from_le_bytes(body[4..8].try_into().unwrap());
    if !(METHODS_MIN..=METHODS_MAX).contains(&num_methods) {
        return Err(decode("method count out of range"));
    }
    let data0 = u32::from_le_bytes(body[8..12].try_into().unwrap());
    let data_len = u32::from_le_bytes(body[12..16].try_into().unwrap());
    let table0_raw = u32::from_le_bytes(body[16..20].try_into().unwrap());
    let table_count = u32::from_le_bytes(body[20..24].try_into().unwrap());

    let offsets_start = FIXED_HEADER_LEN;
    let offsets_len = (num_methods as usize)
        .checked_mul(4)
        .ok_or_else(|| decode("method offset table too large"))?;
    let offsets_end = offsets_start
        .checked_add(offsets_len)
        .ok_or_else(|| decode("header size overflow"))?;
    if offsets_end > body.len() {
        return Err(decode("module body truncated before method offset table"));
    }
    let method_offsets = (0..num_methods as usize)
        .map(|i| {
            let at = offsets_start + i * 4;
            u32::from_le_bytes(body[at..at + 4].try_into().unwrap())
        })
        .collect();

    let data_start = offsets_end as u32;
    let data_end = data_start
        .checked_add(data_len)
        .ok_or_else(|| decode("data length overflow"))?;
    if data_end as usize > body.len() {
        return Err(decode("module body truncated before end of data section"));
    }

    let table0 = if table_count == 0 { None } else { Some(table0_raw) };

    Ok(ModuleHeader {
        num_methods,
        data0,
        table0,
        method_offsets,
        data_start,
        data_len,
        code_start: data_end,
    })
}

/// Serializes a header + data + code image in this engine's on-chain layout.
/// The inverse of [`parse_header`] plus a raw code/data split.
pub fn build_body(
    data0: u32,
    table0: Option<u32>,
    table_count: u32,
    method_offsets: &[u32],
    data: &[u8],
    code: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(FIXED_HEADER_LEN + method_offsets.len() * 4 + data.len() + code.len());
    out.extend_from_slice(&HEADER_VERSION.to_le_bytes());
    out.extend_from_slice(&(method_offsets.len() as u32).to_le_bytes());
    out.extend_from_slice(&data0.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&table0.unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&table_count.to_le_bytes());
    for off in method_offsets {
        out.extend_from_slice(&off.to_le_bytes());
    }
    out.extend_from_slice(data);
    out.extend_from_slice(code);
    out
}

/// One nested contract invocation. `local_depth` counts intra-module
/// (non-far) calls still open within this frame, so a plain `ret` only pops
/// the far-call frame once it unwinds back to the frame's own entry.
pub struct Frame {
    pub contract_id: ContractId,
    pub body: Vec<u8>,
    pub header: ModuleHeader,
    pub local_depth: u32,
}

impl Frame {
    pub fn code(&self) -> &[u8] {
        &self.body[self.header.code_start as usize..]
    }

    pub fn data(&self) -> &[u8] {
        let start = self.header.data_start as usize;
        let end = start + self.header.data_len as usize;
        &self.body[start..end]
    }

    pub fn data0(&self) -> u32 {
        self.header.data0
    }

    /// Resolves a 1-based `call_indirect` index to a byte offset in `code()`.
    pub fn indirect_target(&self, one_based_index: u32) -> Result<u32, Exc> {
        let table0 = self
            .header
            .table0
            .ok_or_else(|| Exc::new(ErrorKind::Trap, "module has no indirect-call table"))?;
        if one_based_index == 0 {
            return Err(Exc::new(ErrorKind::Trap, "indirect call index 0 is reserved"));
        }
        let code = self.code();
        let at = table0 as usize + (one_based_index as usize - 1) * 4;
        if at + 4 > code.len() {
            return Err(Exc::new(ErrorKind::Trap, "indirect call index out of range"));
        }
        Ok(u32::from_le_bytes(code[at..at + 4].try_into().unwrap()))
    }
}

/// Bounded stack of far-call frames (`Limits::far_call_depth`). The top
/// frame's code/data are what the processor currently executes against.
pub struct FarCallStack {
    frames: Vec<Frame>,
    max_depth: u32,
}

impl FarCallStack {
    pub fn new(limits: Limits) -> Self {
        FarCallStack { frames: Vec::new(), max_depth: limits.far_call_depth }
    }

    pub fn is_done(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Pushes a new far-call frame, parsing its header from `body`.
    pub fn push(&mut self, contract_id: ContractId, body: Vec<u8>) -> Result<&Frame, Exc> {
        if self.frames.len() as u32 >= self.max_depth {
            return Err(Exc::new(ErrorKind::Trap, "far-call depth exceeded"));
        }
        let header = parse_header(&body)?;
        log::debug!("far-call push depth={} methods={}", self.frames.len() + 1, header.num_methods);
        self.frames.push(Frame { contract_id, body, header, local_depth: 0 });
        Ok(self.frames.last().unwrap())
    }

    /// Called on a `ret` that unwinds past the current frame's own entry
    /// (`local_depth == 0`): pops the frame, then re-parses the header of
    /// whatever frame is now on top so its code/data slices are current.
    /// Returns `None` once the stack is empty (the transaction is done).
    pub fn pop_and_reparse(&mut self) -> Result<Option<&Frame>, Exc> {
        self.frames.pop();
        match self.frames.last_mut() {
            None => Ok(None),
            Some(f) => {
                f.header = parse_header(&f.body)?;
                Ok(self.frames.last())
            }
        }
    }
}
