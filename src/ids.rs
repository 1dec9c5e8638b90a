//! Opaque identifiers shared by the store, far-call protocol and host ABI.

use std::fmt;

/// A contract's content address. Computing one from a module body is out of
/// scope (it depends on excluded crypto primitives); this crate only needs
/// the fixed-size opaque shape so far calls, `RefAdd`/`RefRelease` and
/// variable keys can carry one.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractId(pub [u8; 32]);

impl ContractId {
    pub fn from_bytes(b: &[u8]) -> Option<ContractId> {
        if b.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Some(ContractId(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractId(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}
