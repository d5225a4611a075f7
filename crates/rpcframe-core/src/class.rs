//! Class/context wiring (C6): the long-lived, transport-parameterized root
//! object ([`Class`]) and the per-progress-scope handle factory
//! ([`crate::context::Context`]) built on top of it.
//!
//! Mirrors `HG_Core_init*`/`HG_Core_class_get_*` in
//! `mercury_core.h`: a class is created once per transport/protocol pair,
//! owns the registry, and answers eager-size queries callers use to plan
//! payload sizes before they ever touch a handle.

use rpcframe_proto::{RequestHeader, ResponseHeader};

use crate::codec::Direction;
use crate::registry::Registry;
use std::sync::Arc;

/// Build-time/runtime toggles a class is parameterized by (spec §6
/// "Environment / build toggles").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassOptions {
    /// Whether [`crate::framing`] computes and verifies a CRC32 over the
    /// payload region (default on).
    pub crc_on_payload: bool,
    /// XDR mode: disables the spill path entirely (default off). Spec §9:
    /// "an implementer must not silently truncate; `SIZE_ERROR` with a log
    /// entry is the contract".
    pub xdr_mode: bool,
    /// Number of receive buffers a listening context pre-posts at creation
    /// (spec §4.6, default 256).
    pub pre_post_count: usize,
}

impl Default for ClassOptions {
    fn default() -> Self {
        Self { crc_on_payload: true, xdr_mode: false, pre_post_count: 256 }
    }
}

/// Caller-supplied identity for a new [`Class`] (spec §6 `init(info,
/// listen)`): what to call it, which wire protocol it speaks, and the
/// transport-provided eager buffer size every handle it mints is sized to.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// Human-readable class name (`HG_Core_class_get_name`).
    pub name: String,
    /// Wire protocol string (`HG_Core_class_get_protocol`), e.g. `"tcp"`.
    pub protocol: String,
    /// Raw eager buffer size the transport hands out per handle, header
    /// included.
    pub eager_size: usize,
}

fn header_wire_size(direction: Direction) -> usize {
    match direction {
        Direction::Input => RequestHeader::SIZE,
        Direction::Output => ResponseHeader::SIZE,
    }
}

fn payload_offset(direction: Direction, options: &ClassOptions) -> usize {
    header_wire_size(direction) + if options.crc_on_payload { 4 } else { 0 }
}

/// The transport-parameterized root object (spec §3 "Class"): owns the RPC
/// registry and the eager-size/protocol metadata every [`crate::context::Context`]
/// built on top of it shares.
pub struct Class {
    info: ClassInfo,
    options: ClassOptions,
    registry: Arc<Registry>,
}

impl Class {
    /// Create a class with default options (spec §6 `init(info, listen)`).
    /// `listen` has no effect at this layer — whether a class's contexts
    /// actually pre-post receives is a per-context decision
    /// ([`crate::context::Context::create`]) driven by whether a listening
    /// transport was supplied, which is out of scope for `Class` itself.
    #[must_use]
    pub fn init(info: ClassInfo) -> Arc<Self> {
        Self::init_opt(info, ClassOptions::default())
    }

    /// Create a class with explicit options (spec §6 `init_opt(info,
    /// listen, options)`).
    #[must_use]
    pub fn init_opt(info: ClassInfo, options: ClassOptions) -> Arc<Self> {
        tracing::info!(name = %info.name, protocol = %info.protocol, "class init");
        Arc::new(Self { info, options, registry: Arc::new(Registry::new()) })
    }

    /// Derive a class's name/protocol from an already-configured transport
    /// tag rather than a caller-supplied [`ClassInfo`] (spec §6
    /// `init_from_transport(transport)`). The NA plugin layer that would
    /// supply a negotiated eager size is out of scope (spec §1), so callers
    /// still provide one explicitly.
    #[must_use]
    pub fn init_from_transport(protocol: impl Into<String>, eager_size: usize) -> Arc<Self> {
        let protocol = protocol.into();
        let info = ClassInfo { name: format!("class-{protocol}"), protocol, eager_size };
        Self::init(info)
    }

    /// Tear the class down: invoke every retained registration's free
    /// callback exactly once (spec §3 "finalize invokes all registered
    /// free-callbacks for user-associated data").
    pub fn finalize(&self) {
        tracing::info!(name = %self.info.name, "class finalize");
        self.registry.finalize();
    }

    /// Best-effort temporary-file scrub (spec §6 `cleanup`). Nothing in
    /// this implementation writes temporary files to disk; retained as a
    /// named no-op so callers that mirror the original API surface have
    /// somewhere to call it, matching `HG_Core_cleanup`'s own
    /// best-effort, never-fails contract.
    pub fn cleanup(&self) {
        tracing::debug!(name = %self.info.name, "class cleanup (no-op: no temp files)");
    }

    /// This class's configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// This class's wire protocol string.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.info.protocol
    }

    /// User-available bytes for an input (request) payload: the raw eager
    /// size minus the request header and (if enabled) the payload checksum
    /// subfield (spec §4.6: "Eager-size queries subtract the header size so
    /// callers plan for user-available bytes").
    #[must_use]
    pub fn input_eager_size(&self) -> usize {
        self.info.eager_size.saturating_sub(payload_offset(Direction::Input, &self.options))
    }

    /// User-available bytes for an output (response) payload.
    #[must_use]
    pub fn output_eager_size(&self) -> usize {
        self.info.eager_size.saturating_sub(payload_offset(Direction::Output, &self.options))
    }

    /// The raw, transport-provided eager buffer size every handle this
    /// class mints is allocated with.
    #[must_use]
    pub fn eager_size(&self) -> usize {
        self.info.eager_size
    }

    /// The options this class was initialized with.
    #[must_use]
    pub fn options(&self) -> &ClassOptions {
        &self.options
    }

    /// The shared registry every handle's rpc id is looked up against.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
