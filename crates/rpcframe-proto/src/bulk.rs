//! Wire shape of a bulk descriptor.
//!
//! The bulk-handle *abstraction* — creation, transfer scheduling, and
//! completion delivery — is out of scope (spec §1); this type is only the
//! opaque, serializable reference to a memory region that a spilled
//! payload's descriptor carries on the wire (spec §4.4 step 4, §6).

use crate::error::RpcError;
use crate::proc::Proc;

/// A serializable reference to a contiguous memory region a peer may pull
/// from via a one-sided transfer. The actual registration key a real NA
/// plugin would embed is represented here as an opaque `u64` tag, since the
/// registration mechanism itself is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkDescriptor {
    /// Opaque region key assigned by the (out-of-scope) memory
    /// registration mechanism.
    pub region_key: u64,
    /// Length of the region, in bytes.
    pub length: u64,
}

impl BulkDescriptor {
    /// Encode this descriptor through `proc`.
    ///
    /// # Errors
    ///
    /// Returns whatever [`Proc::encode_u64`] returns, e.g. `SizeError` in
    /// XDR mode if it cannot fit.
    pub fn encode(&self, proc: &mut Proc<'_>) -> Result<(), RpcError> {
        proc.encode_u64(self.region_key)?;
        proc.encode_u64(self.length)
    }

    /// Decode a descriptor previously written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns whatever [`Proc::decode_u64`] returns.
    pub fn decode(proc: &mut Proc<'_>) -> Result<Self, RpcError> {
        let region_key = proc.decode_u64()?;
        let length = proc.decode_u64()?;
        Ok(Self { region_key, length })
    }

    /// Size in bytes a descriptor occupies on the wire.
    pub const WIRE_SIZE: usize = 16;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcMode;

    #[test]
    fn round_trip() {
        let descriptor = BulkDescriptor { region_key: 0xABCD, length: 4 * 1024 * 1024 };
        let mut buf = [0u8; BulkDescriptor::WIRE_SIZE];
        let mut encoder = Proc::new(ProcMode::Encode, &mut buf, false);
        descriptor.encode(&mut encoder).unwrap();

        let mut decoder = Proc::new(ProcMode::Decode, &mut buf, false);
        let decoded = BulkDescriptor::decode(&mut decoder).unwrap();
        assert_eq!(decoded, descriptor);
    }
}
