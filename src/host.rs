//! The fixed host ABI: the 19 `env.*` symbols a contract may import, their
//! stable binding ids, and the [`Host`] trait an embedder implements for the
//! subset of them that touch state outside the processor (storage, asset
//! registry, signatures, chain height, far-call module lookup).
//!
//! `memcpy`/`memset`/`memcmp`/`memis0`/`StackAlloc`/`StackFree` are part of
//! this table (contracts import them the same way) but are fully determined
//! by VM state, so the processor implements them directly rather than
//! routing them through [`Host`]. `FundsLock`/`FundsUnlock`/`RefAdd`/
//! `RefRelease` are also dispatched inside the processor (`processor::Processor::
//! handle_amount`/`handle_ref`): both are engine-owned bookkeeping built on
//! top of `LoadVar`/`SaveVar`, the same way `original_source/core/bvm2.cpp`'s
//! `ProcessorPlus::HandleAmount*`/`HandleRef*` are plain methods on the
//! processor rather than host callbacks — only `InvokeExt`, `OnGlobalVar`,
//! `LoadVar`/`SaveVar`, `AssetCreate`/`AssetEmit`/`AssetDestroy` and
//! `get_Hdr` are virtual/trait boundaries there.

use crate::error::{ErrorKind, Exc};
use crate::ids::ContractId;
use crate::module::ParsedModule;
use crate::types::ValType;

/// Binding id of the synthetic `__stack_pointer` global import. Not part of
/// the `call_ext` table; `global_get_imp`/`global_set_imp` recognize it and
/// the processor answers it directly from its own alias-stack pointer.
pub const STACK_POINTER_BINDING: u32 = 0x01;

#[derive(Debug, Clone, Copy)]
pub struct HostBinding {
    pub symbol: &'static str,
    pub id: u32,
    pub args: &'static [ValType],
    pub ret: Option<ValType>,
}

macro_rules! binding {
    ($sym:literal, $id:expr, [$($arg:ident),*], $ret:expr) => {
        HostBinding { symbol: $sym, id: $id, args: &[$(ValType::$arg),*], ret: $ret }
    };
}

pub const BINDINGS: &[HostBinding] = &[
    binding!("memcpy", 0x10, [I32, I32, I32], Some(ValType::I32)),
    binding!("memset", 0x11, [I32, I32, I32], Some(ValType::I32)),
    binding!("memcmp", 0x12, [I32, I32, I32], Some(ValType::I32)),
    binding!("memis0", 0x13, [I32, I32], Some(ValType::I32)),
    binding!("StackAlloc", 0x18, [I32], Some(ValType::I32)),
    binding!("StackFree", 0x19, [I32], None),
    binding!("LoadVar", 0x20, [I32, I32, I32, I32], Some(ValType::I32)),
    binding!("SaveVar", 0x21, [I32, I32, I32, I32], None),
    binding!("CallFar", 0x23, [I32, I32, I32], None),
    binding!("Halt", 0x28, [], None),
    binding!("AddSig", 0x29, [I32], None),
    binding!("FundsLock", 0x30, [I32, I64], None),
    binding!("FundsUnlock", 0x31, [I32, I64], None),
    binding!("RefAdd", 0x32, [I32], Some(ValType::I32)),
    binding!("RefRelease", 0x33, [I32], Some(ValType::I32)),
    binding!("AssetCreate", 0x38, [I32, I32], Some(ValType::I32)),
    binding!("AssetEmit", 0x39, [I32, I64, I32], Some(ValType::I32)),
    binding!("AssetDestroy", 0x3A, [I32], Some(ValType::I32)),
    binding!("get_Height", 0x40, [], Some(ValType::I64)),
];

pub fn by_symbol(symbol: &str) -> Option<&'static HostBinding> {
    BINDINGS.iter().find(|b| b.symbol == symbol)
}

pub fn by_id(id: u32) -> Option<&'static HostBinding> {
    BINDINGS.iter().find(|b| b.id == id)
}

fn link(msg: impl Into<String>) -> Exc {
    Exc::new(ErrorKind::Link, msg.into())
}

fn sig_matches(ty: &crate::module::FuncType, b: &HostBinding) -> bool {
    if ty.args.len() != b.args.len() {
        return false;
    }
    if !ty.args.iter().zip(b.args.iter()).all(|(a, b)| valtype_eq(*a, *b)) {
        return false;
    }
    match (ty.rets.first(), b.ret) {
        (None, None) => true,
        (Some(a), Some(b)) => valtype_eq(*a, b),
        _ => false,
    }
}

fn valtype_eq(a: ValType, b: ValType) -> bool {
    a.code() == b.code()
}

/// Resolves every import against the fixed host ABI, rewrites a lone local
/// stack-pointer global into an import, and fails on anything left
/// unresolved. Must run after parsing and before compilation.
pub fn resolve_bindings(m: &mut ParsedModule) -> Result<(), Exc> {
    for imp in m.import_funcs.iter_mut() {
        let ty = &m.types[imp.type_index as usize];
        let binding = by_symbol(&imp.name).ok_or_else(|| link(format!("unresolved import env.{}", imp.name)))?;
        if !sig_matches(ty, binding) {
            return Err(link(format!("import env.{} has a mismatched signature", imp.name)));
        }
        imp.binding_id = Some(binding.id);
    }

    if m.globals.len() > 1 {
        return Err(link("at most one internal global is accepted (the stack pointer)"));
    }

    let has_stack_pointer_import = m.import_globals.iter().any(|g| g.name == "__stack_pointer");

    if !has_stack_pointer_import {
        if let Some(g) = m.globals.first().copied() {
            if g.vtype.code() != ValType::I32.code() || !g.mutable {
                return Err(link("internal global must be an i32 mutable stack pointer"));
            }
            m.import_globals.push(crate::module::ImportGlobal {
                module: "env".to_string(),
                name: "__stack_pointer".to_string(),
                vtype: ValType::I32,
                mutable: true,
                binding_id: None,
            });
        }
    }
    m.globals.clear();

    for g in m.import_globals.iter_mut() {
        if g.name == "__stack_pointer" {
            if g.vtype.code() != ValType::I32.code() || !g.mutable {
                return Err(link("__stack_pointer must be an i32 mutable global"));
            }
            g.binding_id = Some(STACK_POINTER_BINDING);
        } else {
            return Err(link(format!("unresolved global import env.{}", g.name)));
        }
    }

    Ok(())
}

/// Storage, assets, signatures, far-call module lookup and chain height:
/// everything the processor cannot answer from its own state. Mirrors
/// `original_source/core/bvm2.cpp`'s virtual boundary set (`InvokeExt`,
/// `OnGlobalVar`, `LoadVar`/`SaveVar`, `AssetCreate`/`AssetEmit`/
/// `AssetDestroy`, `get_Hdr`) — funds and reference-count bookkeeping are
/// plain processor logic, not part of this trait.
pub trait Host {
    /// Copies the stored value (if any) into `out`, truncating if it is
    /// larger, and returns the *actual* stored length regardless of
    /// truncation.
    fn load_var(&mut self, key: &[u8], out: &mut [u8]) -> Result<u32, Exc>;
    /// `value.is_empty()` deletes the variable.
    fn save_var(&mut self, key: &[u8], value: &[u8]) -> Result<(), Exc>;
    /// Fetches a deployed contract's full compiled body, if it exists.
    fn load_contract_body(&mut self, cid: ContractId) -> Result<Option<Vec<u8>>, Exc>;
    fn add_sig(&mut self, pubkey: &[u8]) -> Result<(), Exc>;
    fn asset_create(&mut self, meta: &[u8]) -> Result<u32, Exc>;
    fn asset_emit(&mut self, asset_id: u32, amount: u64, emit: bool) -> Result<bool, Exc>;
    fn asset_destroy(&mut self, asset_id: u32) -> Result<bool, Exc>;
    fn get_height(&mut self) -> u64;
}
