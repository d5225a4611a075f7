//! Per-RPC handle state (C3).
//!
//! A straightforward typed composition replaces the source's void-pointer
//! "private data" blob hung off every handle (spec §9: "arena-like handle
//! memory... no downcasts are needed"). The handle's logical reference
//! count is an explicit `AtomicUsize`, separate from (and always ≤) the
//! `Arc` strong count that keeps the Rust allocation itself alive — the
//! former is the spec's ownership mechanism (spec §5: "the sole ownership
//! mechanism"), the latter is just how a `Clone`-able handle survives
//! being passed across the async callback boundary.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rpcframe_proto::{BulkDescriptor, RequestHeader, ResponseHeader, RpcError};

use crate::codec::Direction;
use crate::registry::Registry;
use crate::transport::Address;

/// An auxiliary buffer created when a direction's payload overflowed the
/// eager region (spec glossary: "Spill / extra buffer").
pub struct ExtraBuffer {
    /// The spilled bytes themselves.
    pub buf: Vec<u8>,
    /// The bulk descriptor a peer would use to pull/has pulled this region.
    pub bulk: BulkDescriptor,
}

/// The handle's lifecycle tag (spec §4.5, simplified state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Just created or reset; nothing encoded yet.
    Fresh,
    /// `set_struct` has run; the eager buffer holds an encoded payload.
    Encoded,
    /// Handed to the transport; forward/respond is outstanding.
    InFlight,
    /// Eager message received with `MORE_DATA` set; bulk pull outstanding.
    ExtraPull,
    /// Bulk pull (if any) completed; input is ready to decode.
    Delivered,
    /// `get_struct` has run; a decoded struct is live and refcounted.
    Decoded,
    /// `free_struct` has run; the handle's single outstanding decode was
    /// released.
    Released,
}

/// Immutable identity of an in-flight or in-service RPC (spec §3: "target
/// address, target id, rpc id (together the 'info')").
#[derive(Clone)]
pub struct HandleInfo {
    /// Peer address this handle targets (origin) or was received from
    /// (target).
    pub addr: Arc<dyn Address>,
    /// 8-bit context id on the target side.
    pub target_id: u8,
    /// Registered RPC identifier.
    pub rpc_id: u64,
}

/// Outcome delivered to a forward/respond user callback (spec §4.5: "a
/// synthesized info record carrying the transport's return code and
/// type").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackInfo {
    /// Whether this fired for a forward (client) or respond (server) op.
    pub direction: Direction,
    /// Final status of the operation.
    pub status: RpcError,
}

type StoredCallback = Box<dyn FnOnce(CallbackInfo) + Send>;

struct MutableState {
    addr: Arc<dyn Address>,
    target_id: u8,
    rpc_id: u64,
    input_buf: Vec<u8>,
    output_buf: Vec<u8>,
    request_header: Option<RequestHeader>,
    response_header: Option<ResponseHeader>,
    extra_input: Option<ExtraBuffer>,
    extra_output: Option<ExtraBuffer>,
    callback: Option<StoredCallback>,
    state: HandleState,
}

/// A reference-counted per-RPC object (spec §3 "Handle", §9 "ref-counted
/// lifetime across async callbacks"). Cheap to clone; clones share the
/// same underlying state and refcount.
#[derive(Clone)]
pub struct Handle {
    registry: Arc<Registry>,
    eager_size: usize,
    refcount: Arc<AtomicUsize>,
    inner: Arc<Mutex<MutableState>>,
}

impl Handle {
    /// Create a new handle targeting `addr`/`rpc_id`, born with refcount 1
    /// (spec §3: "min 1 at birth"), with both eager buffers pre-sized to
    /// `eager_size`.
    #[must_use]
    pub fn create(
        registry: Arc<Registry>,
        eager_size: usize,
        addr: Arc<dyn Address>,
        rpc_id: u64,
    ) -> Self {
        Self {
            registry,
            eager_size,
            refcount: Arc::new(AtomicUsize::new(1)),
            inner: Arc::new(Mutex::new(MutableState {
                addr,
                target_id: 0,
                rpc_id,
                input_buf: vec![0u8; eager_size],
                output_buf: vec![0u8; eager_size],
                request_header: None,
                response_header: None,
                extra_input: None,
                extra_output: None,
                callback: None,
                state: HandleState::Fresh,
            })),
        }
    }

    /// Registry this handle's rpc id is looked up against.
    #[must_use]
    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Eager buffer size (header + user-visible payload) this handle's
    /// buffers were sized to.
    #[must_use]
    pub fn eager_size(&self) -> usize {
        self.eager_size
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandleState {
        self.inner.lock().expect("handle lock poisoned").state
    }

    pub(crate) fn set_state(&self, state: HandleState) {
        self.inner.lock().expect("handle lock poisoned").state = state;
    }

    /// Current logical reference count (spec §8: "refcount at the moment
    /// of destroy equals completed get_structs minus completed
    /// free_structs").
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Atomically increment the reference count (spec §4.3).
    pub fn ref_incr(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the reference count; once it reaches zero, release the
    /// private framing state (extra buffers, header scratch) exactly as
    /// the C original's `hg_private_data` destructor does (spec §4.3).
    ///
    /// Returns the post-decrement count.
    pub fn destroy(&self) -> usize {
        let remaining = self.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let mut inner = self.inner.lock().expect("handle lock poisoned");
            inner.extra_input = None;
            inner.extra_output = None;
            inner.request_header = None;
            inner.response_header = None;
        }
        remaining
    }

    /// Reuse a handle with no outstanding references for a new
    /// target/rpc id (spec §4.3: "reuses a zero-outstanding handle").
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidParam` if the refcount is not exactly 1
    /// (the single reference the creator itself holds).
    pub fn reset(&self, addr: Arc<dyn Address>, rpc_id: u64) -> Result<(), RpcError> {
        if self.refcount.load(Ordering::SeqCst) != 1 {
            return Err(RpcError::InvalidParam);
        }
        let mut inner = self.inner.lock().expect("handle lock poisoned");
        inner.addr = addr;
        inner.rpc_id = rpc_id;
        inner.target_id = 0;
        inner.input_buf = vec![0u8; self.eager_size];
        inner.output_buf = vec![0u8; self.eager_size];
        inner.request_header = None;
        inner.response_header = None;
        inner.extra_input = None;
        inner.extra_output = None;
        inner.callback = None;
        inner.state = HandleState::Fresh;
        Ok(())
    }

    /// This handle's address/target-id/rpc-id triple.
    #[must_use]
    pub fn info(&self) -> HandleInfo {
        let inner = self.inner.lock().expect("handle lock poisoned");
        HandleInfo { addr: inner.addr.clone(), target_id: inner.target_id, rpc_id: inner.rpc_id }
    }

    /// Set the 8-bit target context id (spec §6: `set_target_id`).
    pub fn set_target_id(&self, target_id: u8) {
        self.inner.lock().expect("handle lock poisoned").target_id = target_id;
    }

    /// Stamp the rpc id this (freshly received) handle targets. Used only
    /// by the receive-side wiring once the header has been decoded; a
    /// handle created by a caller that already knows its rpc id never
    /// needs this.
    pub(crate) fn set_rpc_id(&self, rpc_id: u64) {
        self.inner.lock().expect("handle lock poisoned").rpc_id = rpc_id;
    }

    /// Stable identity for this handle's shared state, used by the
    /// in-memory transport mock to correlate a pending completion with
    /// the handle `cancel` was called on. Not meaningful across process
    /// boundaries; a real NA plugin has its own request/op-id scheme.
    #[must_use]
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut MutableStateView<'_>) -> R) -> R {
        let mut guard = self.inner.lock().expect("handle lock poisoned");
        f(&mut MutableStateView(&mut guard))
    }
}

/// A scoped accessor over the handle's mutable state, used by
/// [`crate::framing`] and [`crate::forward_respond`] so those modules
/// never have to know this crate stores the state behind a `Mutex`.
pub(crate) struct MutableStateView<'a>(&'a mut MutableState);

impl MutableStateView<'_> {
    pub fn input_buf(&mut self) -> &mut Vec<u8> {
        &mut self.0.input_buf
    }

    pub fn output_buf(&mut self) -> &mut Vec<u8> {
        &mut self.0.output_buf
    }

    pub fn request_header(&self) -> Option<&RequestHeader> {
        self.0.request_header.as_ref()
    }

    pub fn set_request_header(&mut self, header: RequestHeader) {
        self.0.request_header = Some(header);
    }

    pub fn response_header(&self) -> Option<&ResponseHeader> {
        self.0.response_header.as_ref()
    }

    pub fn set_response_header(&mut self, header: ResponseHeader) {
        self.0.response_header = Some(header);
    }

    pub fn extra(&mut self, direction: Direction) -> &mut Option<ExtraBuffer> {
        match direction {
            Direction::Input => &mut self.0.extra_input,
            Direction::Output => &mut self.0.extra_output,
        }
    }

    pub fn rpc_id(&self) -> u64 {
        self.0.rpc_id
    }

    pub fn addr(&self) -> Arc<dyn Address> {
        self.0.addr.clone()
    }

    pub fn target_id(&self) -> u8 {
        self.0.target_id
    }

    pub fn take_callback(&mut self) -> Option<StoredCallback> {
        self.0.callback.take()
    }

    pub fn set_callback(&mut self, cb: StoredCallback) {
        self.0.callback = Some(cb);
    }

    pub fn state(&self) -> HandleState {
        self.0.state
    }

    pub fn set_state(&mut self, state: HandleState) {
        self.0.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::TestAddress;

    fn handle() -> Handle {
        Handle::create(Arc::new(Registry::new()), 1024, Arc::new(TestAddress::new("peer")), 7)
    }

    #[test]
    fn born_with_refcount_one() {
        let h = handle();
        assert_eq!(h.ref_count(), 1);
        assert_eq!(h.state(), HandleState::Fresh);
    }

    #[test]
    fn ref_incr_and_destroy_balance() {
        let h = handle();
        h.ref_incr();
        assert_eq!(h.ref_count(), 2);
        assert_eq!(h.destroy(), 1);
        assert_eq!(h.destroy(), 0);
    }

    #[test]
    fn reset_requires_single_reference() {
        let h = handle();
        h.ref_incr();
        assert_eq!(h.reset(Arc::new(TestAddress::new("other")), 9), Err(RpcError::InvalidParam));
        h.destroy();
        assert!(h.reset(Arc::new(TestAddress::new("other")), 9).is_ok());
        assert_eq!(h.info().rpc_id, 9);
        assert_eq!(h.state(), HandleState::Fresh);
    }

    #[test]
    fn destroy_to_zero_clears_extra_buffers() {
        let h = handle();
        h.with_inner(|inner| {
            *inner.extra(Direction::Input) =
                Some(ExtraBuffer { buf: vec![1, 2, 3], bulk: BulkDescriptor { region_key: 1, length: 3 } });
        });
        h.destroy();
        h.with_inner(|inner| {
            assert!(inner.extra(Direction::Input).is_none());
        });
    }
}
