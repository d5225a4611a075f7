//! The proc cursor: a minimal, concrete realization of the "serialization
//! engine" the core specification treats as an external collaborator (see
//! SPEC_FULL.md §4.7).
//!
//! A [`Proc`] is bound to a fixed-size region in one of three modes
//! (`Encode`, `Decode`, `Free`) and tracks a running CRC32 over every byte
//! it touches. Encoding past the end of the bound region does not fail:
//! the proc transparently grows an owned spill buffer, mirroring
//! `hg_proc_t`'s auxiliary-buffer behavior in the original source. Callers
//! discover this afterward via [`Proc::took_spill`] and retrieve ownership
//! of the spill via [`Proc::take_spill`].

use crate::error::RpcError;
use crate::header::crc32;

/// Which pass a proc cursor is performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcMode {
    /// Writing a user struct's fields into the bound region (or spill).
    Encode,
    /// Reading a user struct's fields from the bound region (or spill).
    Decode,
    /// Releasing memory a prior `Decode` pass allocated for the user
    /// struct (variable-length arrays, strings). No bytes are moved.
    Free,
}

/// A cursor over a fixed-size region that can grow an auxiliary buffer on
/// overflow. See the module documentation for the overall contract.
pub struct Proc<'a> {
    mode: ProcMode,
    fixed: &'a mut [u8],
    position: usize,
    spill: Option<Vec<u8>>,
    spill_is_mine: bool,
    checksummed: Vec<u8>,
    xdr_mode: bool,
}

impl<'a> Proc<'a> {
    /// Bind a new cursor to `fixed` in `mode`. `xdr_mode` disables spill
    /// growth entirely (spec §4.4: "XDR-style encodings cannot spill").
    #[must_use]
    pub fn new(mode: ProcMode, fixed: &'a mut [u8], xdr_mode: bool) -> Self {
        Self {
            mode,
            fixed,
            position: 0,
            spill: None,
            spill_is_mine: true,
            checksummed: Vec::new(),
            xdr_mode,
        }
    }

    /// Rebind this cursor to a new region and mode, as if freshly
    /// constructed, without losing the running CRC accumulated so far
    /// when `keep_checksum` is set. Mirrors `hg_proc_reset`, including the
    /// "reset over the same region a second time" step the set_struct
    /// spill protocol requires (spec §9: two uses of the same eager
    /// buffer).
    pub fn reset(&mut self, mode: ProcMode, fixed: &'a mut [u8], keep_checksum: bool) {
        self.mode = mode;
        self.fixed = fixed;
        self.position = 0;
        if !self.spill_is_mine {
            // ownership was already transferred to the caller; never carry
            // a stale reference across a reset
            self.spill = None;
            self.spill_is_mine = true;
        } else {
            self.spill = None;
        }
        if !keep_checksum {
            self.checksummed.clear();
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> ProcMode {
        self.mode
    }

    /// Bytes written/read through the fixed region and spill combined.
    #[must_use]
    pub fn size_used(&self) -> usize {
        self.position
    }

    /// Whether an encode pass had to grow a spill buffer.
    #[must_use]
    pub fn took_spill(&self) -> bool {
        self.spill.is_some()
    }

    /// CRC32 accumulated over every byte encoded or decoded so far.
    #[must_use]
    pub fn running_checksum(&self) -> u32 {
        crc32(&self.checksummed)
    }

    /// Take ownership of the spill buffer, if one was grown. After this
    /// call the proc no longer considers itself the owner, matching
    /// `hg_proc_set_extra_buf_is_mine(proc, HG_TRUE)` in the original —
    /// the caller (the framing engine) is now responsible for freeing it.
    pub fn take_spill(&mut self) -> Option<Vec<u8>> {
        self.spill_is_mine = false;
        self.spill.take()
    }

    fn remaining_fixed(&self) -> usize {
        self.fixed.len().saturating_sub(self.position)
    }

    /// Encode `bytes`, growing the spill buffer if the fixed region is
    /// full.
    ///
    /// Once a spill exists, every subsequent byte — not just the part that
    /// overflows the fixed region — is appended to it, never split back
    /// into `self.fixed`: the fixed region is about to be overwritten by a
    /// bulk descriptor in its place (spec §4.4 step 4), so the spill must
    /// carry the complete payload on its own (mirrors
    /// `hg_proc_set_extra_buf`).
    ///
    /// # Errors
    ///
    /// Returns `RpcError::SizeError` if this proc is in XDR mode and the
    /// fixed region cannot hold `bytes` (spill is disallowed in XDR mode).
    pub fn encode_bytes(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        debug_assert_eq!(self.mode, ProcMode::Encode);
        self.checksummed.extend_from_slice(bytes);

        if self.spill.is_some() {
            return self.grow_spill(bytes);
        }

        let fixed_capacity = self.remaining_fixed();
        if bytes.len() <= fixed_capacity {
            let start = self.position;
            self.fixed[start..start + bytes.len()].copy_from_slice(bytes);
            self.position += bytes.len();
            return Ok(());
        }

        if self.xdr_mode {
            return Err(RpcError::SizeError);
        }
        // First overflow: move everything already committed to the fixed
        // region into a fresh spill buffer before appending `bytes` in
        // full, so the spill alone holds the entire payload from byte 0.
        let mut spill = self.fixed[..self.position].to_vec();
        spill.extend_from_slice(bytes);
        self.position += bytes.len();
        self.spill = Some(spill);
        Ok(())
    }

    fn grow_spill(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        if self.xdr_mode {
            return Err(RpcError::SizeError);
        }
        let spill = self.spill.get_or_insert_with(Vec::new);
        spill.extend_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    /// Decode exactly `len` bytes, preferring the fixed region and
    /// falling back to a spill buffer previously attached via
    /// [`Self::attach_decode_spill`].
    ///
    /// # Errors
    ///
    /// Returns `RpcError::SizeError` if fewer than `len` bytes remain.
    pub fn decode_bytes(&mut self, len: usize) -> Result<Vec<u8>, RpcError> {
        debug_assert_eq!(self.mode, ProcMode::Decode);
        let fixed_capacity = self.remaining_fixed();
        let mut out = Vec::with_capacity(len);
        if self.position < self.fixed.len() {
            let take = len.min(fixed_capacity);
            out.extend_from_slice(&self.fixed[self.position..self.position + take]);
            self.position += take;
            let remaining = len - take;
            if remaining > 0 {
                self.decode_from_spill(remaining, &mut out)?;
            }
        } else {
            self.decode_from_spill(len, &mut out)?;
        }
        self.checksummed.extend_from_slice(&out);
        Ok(out)
    }

    fn decode_from_spill(&mut self, len: usize, out: &mut Vec<u8>) -> Result<(), RpcError> {
        let spill = self.spill.as_ref().ok_or(RpcError::SizeError)?;
        let start = self.position - self.fixed.len();
        let end = start.checked_add(len).ok_or(RpcError::SizeError)?;
        let slice = spill.get(start..end).ok_or(RpcError::SizeError)?;
        out.extend_from_slice(slice);
        self.position += len;
        Ok(())
    }

    /// Attach a buffer to decode from once the fixed region is exhausted
    /// (the landing buffer a "more data" bulk pull wrote into).
    pub fn attach_decode_spill(&mut self, spill: Vec<u8>) {
        self.spill = Some(spill);
        self.spill_is_mine = true;
    }

    /// Encode a `u8`.
    ///
    /// # Errors
    ///
    /// See [`Self::encode_bytes`].
    pub fn encode_u8(&mut self, v: u8) -> Result<(), RpcError> {
        self.encode_bytes(&[v])
    }

    /// Encode a `u32` (little-endian).
    ///
    /// # Errors
    ///
    /// See [`Self::encode_bytes`].
    pub fn encode_u32(&mut self, v: u32) -> Result<(), RpcError> {
        self.encode_bytes(&v.to_le_bytes())
    }

    /// Encode a `u64` (little-endian).
    ///
    /// # Errors
    ///
    /// See [`Self::encode_bytes`].
    pub fn encode_u64(&mut self, v: u64) -> Result<(), RpcError> {
        self.encode_bytes(&v.to_le_bytes())
    }

    /// Encode a variable-length byte array as a u32 length prefix
    /// followed by the bytes themselves.
    ///
    /// # Errors
    ///
    /// See [`Self::encode_bytes`].
    pub fn encode_bytes_buf(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        self.encode_u32(u32::try_from(bytes.len()).map_err(|_| RpcError::SizeError)?)?;
        self.encode_bytes(bytes)
    }

    /// Decode a `u8`.
    ///
    /// # Errors
    ///
    /// See [`Self::decode_bytes`].
    pub fn decode_u8(&mut self) -> Result<u8, RpcError> {
        Ok(self.decode_bytes(1)?[0])
    }

    /// Decode a `u32` (little-endian).
    ///
    /// # Errors
    ///
    /// See [`Self::decode_bytes`].
    pub fn decode_u32(&mut self) -> Result<u32, RpcError> {
        let bytes = self.decode_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| RpcError::SizeError)?))
    }

    /// Decode a `u64` (little-endian).
    ///
    /// # Errors
    ///
    /// See [`Self::decode_bytes`].
    pub fn decode_u64(&mut self) -> Result<u64, RpcError> {
        let bytes = self.decode_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| RpcError::SizeError)?))
    }

    /// Decode a length-prefixed variable-length byte array, as written by
    /// [`Self::encode_bytes_buf`].
    ///
    /// # Errors
    ///
    /// See [`Self::decode_bytes`].
    pub fn decode_bytes_buf(&mut self) -> Result<Vec<u8>, RpcError> {
        let len = self.decode_u32()? as usize;
        self.decode_bytes(len)
    }
}
