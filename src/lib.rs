//! A deterministic execution engine for smart contracts delivered as WASM
//! modules: parse the binary format, link a fixed host ABI, lower to a
//! compact internal bytecode, and run it against a sandboxed stack with
//! auditable resource limits.
//!
//! The pipeline mirrors `original_source/core/bvm2.cpp`'s own stages, kept
//! here as separate modules rather than one god object:
//!
//! - [`leb`] / [`module`]: decode the WASM binary format into a
//!   [`module::ParsedModule`].
//! - [`host`]: resolve `env.*` imports against the fixed binding table.
//! - [`compile`]: lower validated function bodies to the internal opcode
//!   stream ([`isa`]), with dependency-closure dead-function elimination.
//! - [`frame`]: serialize the compiled image into the on-chain module body,
//!   and parse it back into a far-call frame.
//! - [`processor`]: execute that body against a combined operand/alias
//!   stack, dispatching host calls through the [`host::Host`] trait.
//! - [`store`]: variable-key conventions the host glue builds on.
//!
//! [`compile_contract`] and [`execute`] wire the whole pipeline together for
//! the two ends an embedder actually calls: turning a WASM binary into a
//! deployable body, and running a method of an already-deployed one.

pub mod compile;
pub mod error;
pub mod frame;
pub mod host;
pub mod ids;
pub mod isa;
pub mod leb;
pub mod module;
pub mod processor;
pub mod store;
pub mod types;

pub use error::{ErrorKind, Exc, Result};
pub use host::Host;
pub use ids::ContractId;
pub use leb::LebMode;
pub use processor::{Processor, StepOutcome};
pub use types::Limits;

use error::Checkpoints;

/// Compiles a WASM binary into this engine's on-chain module body.
///
/// Exported functions must be named `Method_0`, `Method_1`, ... enumerated
/// without gaps from 0 (methods 0/1 are the contract's constructor and
/// destructor by convention, see `frame::METHODS_MIN`); every other export
/// name, or a gap in the numbering, is a link error. `mode` picks the LEB128
/// compatibility mode the embedder's chain fork requires (see
/// [`leb::LebMode`]); new deployments should use
/// [`LebMode::AutoWorkAround`].
pub fn compile_contract(wasm: Vec<u8>, mode: LebMode) -> Result<Vec<u8>> {
    let mut cps = Checkpoints::new();
    let _g = cps.enter("compile_contract");

    let (mut m, _reader) = module::parse_module(wasm, mode, &mut cps)?;
    host::resolve_bindings(&mut m)?;

    let method_table = method_table_from_exports(&m, &mut cps)?;
    let entry_points: Vec<u32> = method_table.iter().map(|&(_, func_index)| func_index).collect();

    let image = compile::compile_module(&m, &entry_points, &mut cps)?;

    let import_count = m.import_funcs.len() as u32;
    let mut method_offsets = Vec::with_capacity(method_table.len());
    for (method, func_index) in &method_table {
        let internal = func_index.checked_sub(import_count).ok_or_else(|| {
            cps.fail(ErrorKind::Link, format!("Method_{method} resolves to an imported function"))
        })?;
        let offset = image
            .labels
            .items
            .get(internal as usize)
            .copied()
            .flatten()
            .ok_or_else(|| cps.fail(ErrorKind::Link, format!("Method_{method} was not reached by compilation")))?;
        method_offsets.push(offset);
    }

    Ok(frame::build_body(
        image.cmpl_data0,
        image.cmpl_table0,
        image.table_count,
        &method_offsets,
        &image.data,
        &image.result,
    ))
}

/// Reads a module's `Method_N` exports into a dense `(method, func_index)`
/// table, sorted by method number, erroring on anything but a gapless
/// numbering starting at 0 with no duplicates.
fn method_table_from_exports(m: &module::ParsedModule, cps: &mut Checkpoints) -> Result<Vec<(u32, u32)>> {
    let mut by_method: std::collections::BTreeMap<u32, u32> = std::collections::BTreeMap::new();
    for export in &m.exports {
        let n: u32 = export
            .name
            .strip_prefix("Method_")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| cps.fail(ErrorKind::Link, format!("export {:?} is not named Method_N", export.name)))?;
        if by_method.insert(n, export.index).is_some() {
            return Err(cps.fail(ErrorKind::Link, format!("duplicate export for method {n}")));
        }
    }
    if (by_method.len() as u32) < frame::METHODS_MIN {
        return Err(cps.fail(
            ErrorKind::Decode,
            format!("module must export at least {} methods", frame::METHODS_MIN),
        ));
    }
    for (i, &k) in by_method.keys().enumerate() {
        if k != i as u32 {
            return Err(cps.fail(ErrorKind::Link, format!("method numbers must enumerate without gaps, missing {i}")));
        }
    }
    Ok(by_method.into_iter().collect())
}

/// Runs one method of an already-deployed contract to completion: loads its
/// body via `host.load_contract_body`, lays out `args` on a fresh processor's
/// alias stack, and steps the far call until it returns or the step budget
/// (`max_steps`) is exhausted.
pub fn execute(
    host: &mut dyn Host,
    limits: Limits,
    contract: ContractId,
    method: u32,
    args: &[u8],
    max_steps: u64,
) -> Result<()> {
    let mut proc = Processor::new(limits);
    let args_addr = proc.init_stack(args)?;
    proc.call_far(host, contract, method, args_addr)?;
    proc.run(host, max_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeHost {
        bodies: HashMap<[u8; 32], Vec<u8>>,
        vars: HashMap<Vec<u8>, Vec<u8>>,
        height: u64,
    }

    impl FakeHost {
        fn new() -> Self {
            FakeHost { bodies: HashMap::new(), vars: HashMap::new(), height: 7 }
        }
    }

    impl Host for FakeHost {
        fn load_var(&mut self, key: &[u8], out: &mut [u8]) -> Result<u32> {
            match self.vars.get(key) {
                None => Ok(0),
                Some(v) => {
                    let n = v.len().min(out.len());
                    out[..n].copy_from_slice(&v[..n]);
                    Ok(v.len() as u32)
                }
            }
        }
        fn save_var(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
            if value.is_empty() {
                self.vars.remove(key);
            } else {
                self.vars.insert(key.to_vec(), value.to_vec());
            }
            Ok(())
        }
        fn load_contract_body(&mut self, cid: ContractId) -> Result<Option<Vec<u8>>> {
            Ok(self.bodies.get(cid.as_bytes()).cloned())
        }
        fn add_sig(&mut self, _pubkey: &[u8]) -> Result<()> {
            Ok(())
        }
        fn asset_create(&mut self, _meta: &[u8]) -> Result<u32> {
            Ok(0)
        }
        fn asset_emit(&mut self, _asset_id: u32, _amount: u64, _emit: bool) -> Result<bool> {
            Ok(true)
        }
        fn asset_destroy(&mut self, _asset_id: u32) -> Result<bool> {
            Ok(true)
        }
        fn get_height(&mut self) -> u64 {
            self.height
        }
    }

    fn leb_u32(mut x: u32) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (x & 0x7f) as u8;
            x >>= 7;
            if x == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out
    }

    fn section(id: u8, contents: &[u8]) -> Vec<u8> {
        let mut out = vec![id];
        out.extend(leb_u32(contents.len() as u32));
        out.extend_from_slice(contents);
        out
    }

    /// A module exporting `Method_0` and `Method_1`, each `() -> i64`
    /// returning the chain height via `call_ext(get_Height)`.
    fn two_method_wasm() -> Vec<u8> {
        let mut m = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

        let mut type_sec = leb_u32(2);
        for _ in 0..2 {
            type_sec.push(0x60);
            type_sec.extend(leb_u32(0));
            type_sec.extend(leb_u32(1));
            type_sec.push(0x7E); // i64
        }
        m.extend(section(1, &type_sec));

        let mut import_sec = leb_u32(1);
        import_sec.extend(leb_u32(3));
        import_sec.extend_from_slice(b"env");
        import_sec.extend(leb_u32(10));
        import_sec.extend_from_slice(b"get_Height");
        import_sec.push(0);
        import_sec.extend(leb_u32(0));
        m.extend(section(2, &import_sec));

        let mut func_sec = leb_u32(2);
        func_sec.extend(leb_u32(1));
        func_sec.extend(leb_u32(1));
        m.extend(section(3, &func_sec));

        let mut export_sec = leb_u32(2);
        for (name, idx) in [("Method_0", 1u32), ("Method_1", 2u32)] {
            export_sec.extend(leb_u32(name.len() as u32));
            export_sec.extend_from_slice(name.as_bytes());
            export_sec.push(0);
            export_sec.extend(leb_u32(idx));
        }
        m.extend(section(7, &export_sec));

        let mut code_sec = leb_u32(2);
        for _ in 0..2 {
            let mut body = leb_u32(0); // no local groups
            body.push(0x10); // call (function index 0 = the import)
            body.extend(leb_u32(0));
            body.push(0x0B); // end
            code_sec.extend(leb_u32(body.len() as u32));
            code_sec.extend(body);
        }
        m.extend(section(10, &code_sec));

        m
    }

    #[test]
    fn compile_contract_assigns_method_offsets_in_export_order() {
        let body = compile_contract(two_method_wasm(), LebMode::Standard).unwrap();
        let hdr = frame::parse_header(&body).unwrap();
        assert_eq!(hdr.num_methods, 2);
        assert_ne!(hdr.method_offsets[0], hdr.method_offsets[1]);
    }

    #[test]
    fn compile_contract_rejects_non_method_export_names() {
        let mut wasm = two_method_wasm();
        let needle = b"Method_1";
        let pos = wasm.windows(needle.len()).position(|w| w == needle).unwrap();
        wasm[pos + 7] = b'x'; // "Method_x"
        let err = compile_contract(wasm, LebMode::Standard).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Link);
    }

    #[test]
    fn execute_runs_a_deployed_contract_method_to_completion() {
        let body = compile_contract(two_method_wasm(), LebMode::Standard).unwrap();
        let cid = ContractId([5u8; 32]);
        let mut host = FakeHost::new();
        host.height = 99;
        host.bodies.insert(*cid.as_bytes(), body);

        execute(&mut host, Limits::default(), cid, 0, &[], 1_000).unwrap();
    }
}
