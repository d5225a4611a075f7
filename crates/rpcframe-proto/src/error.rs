//! Wire error taxonomy.
//!
//! `RpcError` plays the same dual role `hg_return_t` plays in the original
//! Mercury source: it is both the `Result` error type used throughout this
//! crate and `rpcframe-core`, and the numeric value carried on the wire in
//! a response header's `error` field.

use thiserror::Error;

/// Errors returned by the header codec, the proc cursor, and the framing
/// engine built on top of them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// The operation completed successfully. Only meaningful as a wire
    /// code; never constructed as a `Result::Err`.
    #[error("success")]
    Success,

    /// The underlying transport reported a failure.
    #[error("transport error")]
    NaError,

    /// An operation did not complete within its deadline.
    #[error("timed out")]
    Timeout,

    /// A caller-supplied argument was invalid (null out-pointer, unknown
    /// operation tag, etc).
    #[error("invalid parameter")]
    InvalidParam,

    /// A buffer was too small, or an XDR-mode encode tried to spill.
    #[error("size error")]
    SizeError,

    /// Allocation failed, most commonly while allocating a spill buffer.
    #[error("out of memory")]
    NomemError,

    /// Header magic/version mismatch, missing codec for the direction, or
    /// a response requested on a registration with responses suppressed.
    #[error("protocol error")]
    ProtocolError,

    /// The registry has no registration for the requested id.
    #[error("no matching registration")]
    NoMatch,

    /// A CRC16 (header) or CRC32 (payload) check failed.
    #[error("checksum mismatch")]
    ChecksumError,

    /// The operation was canceled before completion.
    #[error("canceled")]
    Canceled,

    /// Any other failure not covered by a more specific variant.
    #[error("other error")]
    OtherError,
}

impl RpcError {
    /// Stable textual name for a wire error code, independent of locale or
    /// `Display` formatting changes.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::NaError => "NA_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InvalidParam => "INVALID_PARAM",
            Self::SizeError => "SIZE_ERROR",
            Self::NomemError => "NOMEM_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::NoMatch => "NO_MATCH",
            Self::ChecksumError => "CHECKSUM_ERROR",
            Self::Canceled => "CANCELED",
            Self::OtherError => "OTHER_ERROR",
        }
    }

    /// Numeric wire representation carried in a response header's `error`
    /// field.
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::NaError => 1,
            Self::Timeout => 2,
            Self::InvalidParam => 3,
            Self::SizeError => 4,
            Self::NomemError => 5,
            Self::ProtocolError => 6,
            Self::NoMatch => 7,
            Self::ChecksumError => 8,
            Self::Canceled => 9,
            Self::OtherError => 10,
        }
    }

    /// Parse a wire error code. Unrecognized codes map to `OtherError`
    /// rather than failing, since a future minor version may add codes a
    /// current reader has never seen.
    #[must_use]
    pub fn from_wire(code: u16) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::NaError,
            2 => Self::Timeout,
            3 => Self::InvalidParam,
            4 => Self::SizeError,
            5 => Self::NomemError,
            6 => Self::ProtocolError,
            7 => Self::NoMatch,
            8 => Self::ChecksumError,
            9 => Self::Canceled,
            _ => Self::OtherError,
        }
    }

    /// Whether this error leaves the handle state unchanged and safe to
    /// retry via `reset`, per the error handling design (protocol/header
    /// errors and checksum mismatches are all retryable; transport/timeout
    /// failures are surfaced to the user callback and are the caller's
    /// decision to retry).
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ProtocolError | Self::ChecksumError | Self::InvalidParam | Self::SizeError
        )
    }
}

/// Stable textual name for a wire error code. Equivalent to
/// `RpcError::from_wire(code).as_str()`, provided as a free function to
/// match the public operation named in the external interface list
/// (`error_string(code)`).
#[must_use]
pub fn error_string(code: u16) -> &'static str {
    RpcError::from_wire(code).as_str()
}

/// Convenience alias used throughout this crate and `rpcframe-core`.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let all = [
            RpcError::Success,
            RpcError::NaError,
            RpcError::Timeout,
            RpcError::InvalidParam,
            RpcError::SizeError,
            RpcError::NomemError,
            RpcError::ProtocolError,
            RpcError::NoMatch,
            RpcError::ChecksumError,
            RpcError::Canceled,
            RpcError::OtherError,
        ];
        for err in all {
            assert_eq!(RpcError::from_wire(err.to_wire()), err);
        }
    }

    #[test]
    fn unknown_wire_code_maps_to_other() {
        assert_eq!(RpcError::from_wire(0xFFFF), RpcError::OtherError);
    }

    #[test]
    fn error_string_is_stable() {
        assert_eq!(error_string(0), "SUCCESS");
        assert_eq!(error_string(8), "CHECKSUM_ERROR");
    }
}
