//! Request/response header codec with zero-copy parsing.
//!
//! Both headers are fixed-size, little-endian, and carry a CRC16 computed
//! over the header bytes with the CRC field itself zeroed. Layout matches
//! `hg_header_request_t`/`hg_header_response_t` field-for-field; the
//! optional bulk descriptor that follows a request header when
//! `HeaderFlags::EXTRA_DATA` is set lives in the payload region, not the
//! header, so the header's own size never changes.

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::RpcError;

bitflags! {
    /// Wire-level request header flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// A bulk descriptor for a spilled payload is encoded at the start
        /// of the payload region.
        const EXTRA_DATA = 0b0000_0001;
    }
}

/// Mercury's packet identifier, fixed for every version of this wire
/// format.
pub const MAGIC: u8 = 0xD7;

/// Current protocol version, packed as major/minor/patch.
pub const PROTOCOL_VERSION: (u8, u8, u16) = (2, 0, 0);

fn pack_version(major: u8, minor: u8, patch: u16) -> u32 {
    (u32::from(major) << 24) | (u32::from(minor) << 16) | u32::from(patch)
}

fn unpack_version(value: u32) -> (u8, u8, u16) {
    let major = ((value >> 24) & 0xFF) as u8;
    let minor = ((value >> 16) & 0xFF) as u8;
    let patch = (value & 0xFFFF) as u16;
    (major, minor, patch)
}

/// Fixed 20-byte request header (little-endian on the wire).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RequestHeader {
    magic: u8,
    version: [u8; 4],
    rpc_id: [u8; 8],
    flags: u8,
    cookie: [u8; 4],
    crc16: [u8; 2],
}

impl RequestHeader {
    /// Size of the serialized request header, excluding the optional bulk
    /// descriptor that follows it in the payload region.
    pub const SIZE: usize = 20;

    /// Build a new request header for `rpc_id`, with `flags` and `cookie`
    /// already decided by the caller (typically the framing engine, which
    /// only learns whether `EXTRA_DATA` applies after encoding the
    /// payload).
    #[must_use]
    pub fn new(rpc_id: u64, flags: HeaderFlags, cookie: u32) -> Self {
        let (major, minor, patch) = PROTOCOL_VERSION;
        Self {
            magic: MAGIC,
            version: pack_version(major, minor, patch).to_le_bytes(),
            rpc_id: rpc_id.to_le_bytes(),
            flags: flags.bits(),
            cookie: cookie.to_le_bytes(),
            crc16: [0; 2],
        }
    }

    /// Encode this header into `buf`, computing and filling in the CRC16.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::SizeError` if `buf` is shorter than
    /// [`Self::SIZE`].
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), RpcError> {
        if buf.len() < Self::SIZE {
            return Err(RpcError::SizeError);
        }
        let mut staged = *self;
        staged.crc16 = [0; 2];
        let crc = crc16(staged.as_bytes());
        staged.crc16 = crc.to_le_bytes();
        buf[..Self::SIZE].copy_from_slice(staged.as_bytes());
        Ok(())
    }

    /// Decode and verify a request header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::SizeError` if `buf` is too short, or
    /// `RpcError::ProtocolError` if the magic byte or version major/minor
    /// mismatch, or `RpcError::ChecksumError` if the CRC16 does not match.
    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        if buf.len() < Self::SIZE {
            return Err(RpcError::SizeError);
        }
        let header =
            Self::ref_from_bytes(&buf[..Self::SIZE]).map_err(|_| RpcError::SizeError)?.to_owned();
        header.verify()?;
        Ok(header)
    }

    /// Re-check magic, version, and CRC16 without re-decoding from bytes.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ProtocolError` on magic/version mismatch or
    /// `RpcError::ChecksumError` on CRC16 mismatch.
    pub fn verify(&self) -> Result<(), RpcError> {
        if self.magic != MAGIC {
            return Err(RpcError::ProtocolError);
        }
        let (major, minor, _patch) = self.version();
        let (local_major, local_minor, _) = PROTOCOL_VERSION;
        if major != local_major || minor != local_minor {
            return Err(RpcError::ProtocolError);
        }
        let mut zeroed = *self;
        zeroed.crc16 = [0; 2];
        let expected = crc16(zeroed.as_bytes());
        if expected.to_le_bytes() != self.crc16 {
            return Err(RpcError::ChecksumError);
        }
        Ok(())
    }

    /// Packet identifier; always [`MAGIC`] for a header that passed
    /// [`Self::verify`].
    #[must_use]
    pub fn magic(&self) -> u8 {
        self.magic
    }

    /// Protocol version, unpacked into (major, minor, patch).
    #[must_use]
    pub fn version(&self) -> (u8, u8, u16) {
        unpack_version(u32::from_le_bytes(self.version))
    }

    /// Registered RPC identifier this request targets.
    #[must_use]
    pub fn rpc_id(&self) -> u64 {
        u64::from_le_bytes(self.rpc_id)
    }

    /// Request-level flags (currently only `EXTRA_DATA`).
    #[must_use]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    /// Transport-opaque correlation token. Round-trips unmodified; the
    /// core does not interpret it beyond carrying it to the response.
    #[must_use]
    pub fn cookie(&self) -> u32 {
        u32::from_le_bytes(self.cookie)
    }

    /// Raw CRC16 as carried on the wire.
    #[must_use]
    pub fn crc16(&self) -> u16 {
        u16::from_le_bytes(self.crc16)
    }

    /// Set the `EXTRA_DATA` bit after discovering the payload spilled.
    /// Does not re-sign the CRC16; call [`Self::encode`] again afterward.
    pub fn set_flags(&mut self, flags: HeaderFlags) {
        self.flags = flags.bits();
    }
}

// Packed structs can't derive Debug/PartialEq (field references would be
// unaligned); implement both manually over the unpacked accessor values.
impl std::fmt::Debug for RequestHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHeader")
            .field("magic", &self.magic())
            .field("version", &self.version())
            .field("rpc_id", &self.rpc_id())
            .field("flags", &self.flags())
            .field("cookie", &self.cookie())
            .field("crc16", &self.crc16())
            .finish()
    }
}

impl PartialEq for RequestHeader {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for RequestHeader {}

/// Fixed 10-byte response header (little-endian on the wire).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResponseHeader {
    flags: u8,
    error: [u8; 2],
    cookie: [u8; 4],
    crc16: [u8; 2],
    padding: u8,
}

impl ResponseHeader {
    /// Size of the serialized response header.
    pub const SIZE: usize = 10;

    /// Build a new response header carrying `error` and the request's
    /// `cookie` (responses correlate to their request by cookie, not by a
    /// repeated rpc id).
    #[must_use]
    pub fn new(error: RpcError, cookie: u32, flags: HeaderFlags) -> Self {
        Self {
            flags: flags.bits(),
            error: error.to_wire().to_le_bytes(),
            cookie: cookie.to_le_bytes(),
            crc16: [0; 2],
            padding: 0,
        }
    }

    /// Encode this header into `buf`, computing and filling in the CRC16.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::SizeError` if `buf` is shorter than
    /// [`Self::SIZE`].
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), RpcError> {
        if buf.len() < Self::SIZE {
            return Err(RpcError::SizeError);
        }
        let mut staged = *self;
        staged.crc16 = [0; 2];
        let crc = crc16(staged.as_bytes());
        staged.crc16 = crc.to_le_bytes();
        buf[..Self::SIZE].copy_from_slice(staged.as_bytes());
        Ok(())
    }

    /// Decode and verify a response header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::SizeError` if `buf` is too short, or
    /// `RpcError::ChecksumError` if the CRC16 does not match.
    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        if buf.len() < Self::SIZE {
            return Err(RpcError::SizeError);
        }
        let header =
            Self::ref_from_bytes(&buf[..Self::SIZE]).map_err(|_| RpcError::SizeError)?.to_owned();
        header.verify()?;
        Ok(header)
    }

    /// Re-check the CRC16 without re-decoding from bytes.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ChecksumError` on mismatch.
    pub fn verify(&self) -> Result<(), RpcError> {
        let mut zeroed = *self;
        zeroed.crc16 = [0; 2];
        let expected = crc16(zeroed.as_bytes());
        if expected.to_le_bytes() != self.crc16 {
            return Err(RpcError::ChecksumError);
        }
        Ok(())
    }

    /// Response-level flags.
    #[must_use]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    /// Server-reported error code for this RPC.
    #[must_use]
    pub fn error(&self) -> RpcError {
        RpcError::from_wire(u16::from_le_bytes(self.error))
    }

    /// Cookie copied from the originating request header.
    #[must_use]
    pub fn cookie(&self) -> u32 {
        u32::from_le_bytes(self.cookie)
    }

    /// Raw CRC16 as carried on the wire.
    #[must_use]
    pub fn crc16(&self) -> u16 {
        u16::from_le_bytes(self.crc16)
    }
}

impl std::fmt::Debug for ResponseHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHeader")
            .field("flags", &self.flags())
            .field("error", &self.error())
            .field("cookie", &self.cookie())
            .field("crc16", &self.crc16())
            .finish()
    }
}

impl PartialEq for ResponseHeader {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ResponseHeader {}

/// This build's protocol version (spec §6 `version() → (major, minor,
/// patch)`), the same triple [`RequestHeader::decode`] checks an incoming
/// header's major/minor against.
#[must_use]
pub fn version() -> (u8, u8, u16) {
    PROTOCOL_VERSION
}

/// CRC16/CCITT-FALSE over `bytes`, matching the wire contract ("16-bit CRC
/// over the remaining header bytes with the CRC field zeroed").
#[must_use]
pub fn crc16(bytes: &[u8]) -> u16 {
    const ALGO: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_3740);
    ALGO.checksum(bytes)
}

/// CRC32/ISO-HDLC over `bytes`, used by the framing engine's payload
/// checksum sub-field (see SPEC_FULL.md §9).
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    const ALGO: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    ALGO.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn version_matches_request_header_default() {
        let (major, minor, patch) = version();
        assert_eq!((major, minor, patch), PROTOCOL_VERSION);
        let header = RequestHeader::new(1, HeaderFlags::empty(), 0);
        assert_eq!(header.version(), version());
    }

    #[test]
    fn request_header_size() {
        assert_eq!(std::mem::size_of::<RequestHeader>(), RequestHeader::SIZE);
        assert_eq!(RequestHeader::SIZE, 20);
    }

    #[test]
    fn response_header_size() {
        assert_eq!(std::mem::size_of::<ResponseHeader>(), ResponseHeader::SIZE);
        assert_eq!(ResponseHeader::SIZE, 10);
    }

    #[test]
    fn request_round_trip() {
        let header = RequestHeader::new(0xDEAD_BEEF_CAFE_BABE, HeaderFlags::EXTRA_DATA, 42);
        let mut buf = [0u8; RequestHeader::SIZE];
        header.encode(&mut buf).unwrap();
        let decoded = RequestHeader::decode(&buf).unwrap();
        assert_eq!(decoded.rpc_id(), 0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(decoded.flags(), HeaderFlags::EXTRA_DATA);
        assert_eq!(decoded.cookie(), 42);
        assert_eq!(decoded.magic(), MAGIC);
    }

    #[test]
    fn response_round_trip() {
        let header = ResponseHeader::new(RpcError::ChecksumError, 7, HeaderFlags::empty());
        let mut buf = [0u8; ResponseHeader::SIZE];
        header.encode(&mut buf).unwrap();
        let decoded = ResponseHeader::decode(&buf).unwrap();
        assert_eq!(decoded.error(), RpcError::ChecksumError);
        assert_eq!(decoded.cookie(), 7);
    }

    #[test]
    fn reject_short_buffer() {
        let buf = [0u8; 4];
        assert_eq!(RequestHeader::decode(&buf), Err(RpcError::SizeError));
        assert_eq!(ResponseHeader::decode(&buf), Err(RpcError::SizeError));
    }

    #[test]
    fn reject_invalid_magic() {
        let header = RequestHeader::new(1, HeaderFlags::empty(), 0);
        let mut buf = [0u8; RequestHeader::SIZE];
        header.encode(&mut buf).unwrap();
        buf[0] = 0x00;
        assert_eq!(RequestHeader::decode(&buf), Err(RpcError::ProtocolError));
    }

    #[test]
    fn reject_unsupported_version() {
        let header = RequestHeader::new(1, HeaderFlags::empty(), 0);
        let mut buf = [0u8; RequestHeader::SIZE];
        header.encode(&mut buf).unwrap();
        buf[1..5].copy_from_slice(&pack_version(99, 0, 0).to_le_bytes());
        assert_eq!(RequestHeader::decode(&buf), Err(RpcError::ProtocolError));
    }

    #[test]
    fn bit_flip_outside_crc_fails_checksum() {
        let header = RequestHeader::new(1, HeaderFlags::empty(), 0);
        let mut buf = [0u8; RequestHeader::SIZE];
        header.encode(&mut buf).unwrap();
        // flip a bit in the rpc_id field, well outside the 2-byte crc16 tail
        buf[5] ^= 0x01;
        assert_eq!(RequestHeader::decode(&buf), Err(RpcError::ChecksumError));
    }

    proptest! {
        #[test]
        fn request_header_round_trip_prop(
            rpc_id in any::<u64>(),
            cookie in any::<u32>(),
            extra in any::<bool>(),
        ) {
            let flags = if extra { HeaderFlags::EXTRA_DATA } else { HeaderFlags::empty() };
            let header = RequestHeader::new(rpc_id, flags, cookie);
            let mut buf = [0u8; RequestHeader::SIZE];
            header.encode(&mut buf).unwrap();
            let decoded = RequestHeader::decode(&buf).unwrap();
            prop_assert_eq!(decoded.rpc_id(), rpc_id);
            prop_assert_eq!(decoded.cookie(), cookie);
            prop_assert_eq!(decoded.flags(), flags);
        }

        #[test]
        fn request_header_single_bit_flip_fails(
            rpc_id in any::<u64>(),
            cookie in any::<u32>(),
            byte_index in 0usize..RequestHeader::SIZE - 2,
            bit in 0u8..8,
        ) {
            let header = RequestHeader::new(rpc_id, HeaderFlags::empty(), cookie);
            let mut buf = [0u8; RequestHeader::SIZE];
            header.encode(&mut buf).unwrap();
            buf[byte_index] ^= 1 << bit;
            prop_assert_ne!(RequestHeader::decode(&buf), Ok(header));
        }
    }
}
