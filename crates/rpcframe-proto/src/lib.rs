//! Wire format for the RPC framing core.
//!
//! This crate owns everything that touches bytes on the wire: the fixed
//! request/response headers ([`header`]), the wire error taxonomy
//! ([`error`]), the bulk descriptor a spilled payload carries
//! ([`bulk`]), and the proc cursor that encodes/decodes a payload while
//! tracking overflow into a spill buffer ([`proc`]).
//!
//! `rpcframe-core` builds the framing engine, registry, and handle state
//! on top of these.

pub mod bulk;
pub mod error;
pub mod header;
pub mod proc;

pub use bulk::BulkDescriptor;
pub use error::{RpcError, error_string};
pub use header::{HeaderFlags, RequestHeader, ResponseHeader, crc16, crc32, version};
pub use proc::{Proc, ProcMode};
