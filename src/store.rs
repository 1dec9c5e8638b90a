//! Variable key construction and the fixed-size load/save conveniences the
//! host glue builds on top of the raw `LoadVar`/`SaveVar` ABI.
//!
//! Grounded in `original_source/core/bvm2.h`'s `VarKey`/`Tag` and the
//! `Load_T`/`Save_T`/`LoadFixedOrZero`/`SaveNnz` helpers (lines 44-104):
//! every write a contract makes is prefixed by its contract id and a one-byte
//! tag, and a missing fixed-size variable reads back as all-zero rather than
//! an error.

use crate::ids::ContractId;
use crate::types::Limits;

/// The one-byte namespace prefix following a variable key's contract id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarTag {
    /// The contract body itself; written by the deployment path, never by
    /// contract code.
    Internal = 0,
    LockedAmount = 1,
    Refs = 2,
    OwnedAsset = 3,
}

/// `contract_id || tag || payload`, capped at [`Limits::var_key_size`].
#[derive(Debug, Clone)]
pub struct VarKey(Vec<u8>);

impl VarKey {
    pub fn new(contract_id: ContractId, tag: VarTag, payload: &[u8], limits: Limits) -> Option<VarKey> {
        let total = 32 + 1 + payload.len();
        if total > limits.var_key_size as usize {
            return None;
        }
        let mut key = Vec::with_capacity(total);
        key.extend_from_slice(contract_id.as_bytes());
        key.push(tag as u8);
        key.extend_from_slice(payload);
        Some(VarKey(key))
    }

    /// A contract's own raw key space: `contract_id || Internal || payload`,
    /// the tag a contract's `LoadVar`/`SaveVar` host calls implicitly use.
    pub fn contract_internal(contract_id: ContractId, payload: &[u8], limits: Limits) -> Option<VarKey> {
        Self::new(contract_id, VarTag::Internal, payload, limits)
    }

    pub fn locked_amount(contract_id: ContractId, asset_id: u32, limits: Limits) -> Option<VarKey> {
        Self::new(contract_id, VarTag::LockedAmount, &asset_id.to_le_bytes(), limits)
    }

    pub fn refs(contract_id: ContractId, other: ContractId, limits: Limits) -> Option<VarKey> {
        Self::new(contract_id, VarTag::Refs, other.as_bytes(), limits)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Loads a fixed-size value, treating an absent variable as all-zero rather
/// than an error (`original_source/core/bvm2.h::LoadFixedOrZero`).
pub fn load_fixed_or_zero<const N: usize>(
    host: &mut dyn crate::host::Host,
    key: &VarKey,
) -> Result<[u8; N], crate::error::Exc> {
    let mut out = [0u8; N];
    host.load_var(key.as_bytes(), &mut out)?;
    Ok(out)
}

/// Saves a fixed-size value, deleting the variable instead if it is all-zero
/// (`original_source/core/bvm2.h::SaveNnz`).
pub fn save_nnz(host: &mut dyn crate::host::Host, key: &VarKey, value: &[u8]) -> Result<(), crate::error::Exc> {
    if value.iter().all(|&b| b == 0) {
        host.save_var(key.as_bytes(), &[])
    } else {
        host.save_var(key.as_bytes(), value)
    }
}
