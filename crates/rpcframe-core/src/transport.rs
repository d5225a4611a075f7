//! The network abstraction (NA) boundary: the out-of-scope collaborator
//! that actually moves bytes (spec §1: "the NA plugin layer... explicitly
//! OUT of scope"). Expressed as traits so [`crate::framing`] and
//! [`crate::forward_respond`] have something real to drive; a single
//! synchronous, in-process implementation ([`InMemoryTransport`]) is
//! provided to exercise them end to end — it is a test collaborator, not a
//! production transport, which is why there is no `tokio`/`quinn`
//! dependency anywhere in this crate.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rpcframe_proto::{BulkDescriptor, RpcError};

use crate::handle::Handle;

/// An opaque peer address (spec §6: "Address: lookup, free, self, dup,
/// to_string").
pub trait Address: Send + Sync + fmt::Debug {
    /// Human-readable form, e.g. for logging or `HG_Addr_to_string`.
    fn display(&self) -> String;

    /// Narrow, in-crate-only downcast escape hatch so a concrete
    /// [`Transport`] implementation (like [`InMemoryTransport`]) can
    /// recover its own address representation from the trait object a
    /// [`Handle`] carries. The out-of-scope NA layer would instead resolve
    /// addresses through its own plugin-specific registry.
    fn as_any(&self) -> &dyn Any;
}

/// Completion status the transport hands back after an asynchronous send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The operation completed normally.
    Success,
    /// The operation was canceled before completion (spec §5: "user
    /// callback still fires with a CANCELED return").
    Canceled,
    /// The underlying transport reported a failure.
    Failed,
}

impl Completion {
    /// Map a transport completion onto the wire error taxonomy.
    #[must_use]
    pub fn to_rpc_error(self) -> RpcError {
        match self {
            Self::Success => RpcError::Success,
            Self::Canceled => RpcError::Canceled,
            Self::Failed => RpcError::NaError,
        }
    }
}

/// Wire-level request flags the framing engine derives and the transport
/// carries alongside the eager buffer (spec §4.5: "Build the transport
/// flags").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportFlags {
    /// A bulk descriptor for a spilled payload follows the header.
    pub more_data: bool,
    /// The target should not send a response message.
    pub no_response: bool,
}

/// The NA layer's forward/respond/bulk-pull contract (spec §6 "External
/// Interfaces", minus the parts explicitly out of scope: address
/// resolution, memory registration, progress/trigger loops).
pub trait Transport: Send + Sync + 'static {
    /// Hand `handle`'s encoded eager buffer (`payload_size` bytes of it,
    /// starting at byte 0) to the transport for delivery to its target.
    /// `on_complete` is the forward trampoline (spec §4.5); exactly when it
    /// fires is a transport-level decision — see [`InMemoryTransport`]'s
    /// docs for the one this mock makes.
    fn forward(
        &self,
        handle: &Handle,
        payload_size: usize,
        flags: TransportFlags,
        on_complete: Box<dyn FnOnce(Completion) + Send>,
    );

    /// Hand a response eager buffer back to the handle's origin.
    fn respond(
        &self,
        handle: &Handle,
        payload_size: usize,
        flags: TransportFlags,
        on_complete: Box<dyn FnOnce(Completion) + Send>,
    );

    /// Pull `descriptor`'s region from `handle`'s origin into a freshly
    /// allocated, page-aligned local buffer, then invoke `on_complete`
    /// with the result (spec §4.6 "more data" hook, step 3).
    fn bulk_pull(
        &self,
        handle: &Handle,
        descriptor: BulkDescriptor,
        on_complete: Box<dyn FnOnce(Result<Vec<u8>, RpcError>) + Send>,
    );

    /// Ask the transport to cancel any outstanding operation for `handle`
    /// (spec §5 `cancel`).
    fn cancel(&self, handle: &Handle);
}

/// An address naming a participant in the in-memory mock: either a
/// published, listening endpoint (what a client forwards to) or an
/// ephemeral reply token minted per forward so the eventual `respond` can
/// be routed back to the exact origin handle waiting on it (spec §6's
/// `Address::lookup`/`self`/`dup`, narrowed to what the mock needs).
#[derive(Debug, Clone)]
pub enum MockAddress {
    /// A named, listening endpoint (spec `Address::lookup`).
    Named(Arc<str>),
    /// A one-shot reply route minted by [`InMemoryTransport::forward`].
    ReplyToken(u64),
}

impl MockAddress {
    /// Name a published endpoint.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::Named(name.into())
    }
}

impl Address for MockAddress {
    fn display(&self) -> String {
        match self {
            Self::Named(name) => name.to_string(),
            Self::ReplyToken(token) => format!("reply:{token}"),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Invoked by [`InMemoryTransport`] when an eager message arrives for a
/// listening endpoint. Registered by [`crate::context::Context::listen`];
/// does the receive-side work spec §4.6/§4.5 describe (header decode,
/// more-data pull, handler dispatch) since the mock transport itself knows
/// nothing about headers, registries, or handles beyond routing bytes.
pub type Listener = Arc<dyn Fn(Arc<dyn Address>, Vec<u8>) + Send + Sync>;

struct ReplySlot {
    origin: Handle,
    on_complete: Option<Box<dyn FnOnce(Completion) + Send>>,
}

enum PendingOp {
    Forward {
        handle: Handle,
        target: String,
        bytes: Vec<u8>,
        no_response: bool,
        on_complete: Box<dyn FnOnce(Completion) + Send>,
    },
    Respond {
        handle: Handle,
        reply_token: u64,
        bytes: Vec<u8>,
        on_complete: Box<dyn FnOnce(Completion) + Send>,
    },
}

struct Pending {
    handle_id: usize,
    canceled: Arc<AtomicBool>,
    op: PendingOp,
}

#[derive(Default)]
struct InMemoryState {
    listeners: HashMap<String, Listener>,
    replies: HashMap<u64, ReplySlot>,
    queue: VecDeque<Pending>,
}

/// A single-process, synchronous-once-pumped implementation of
/// [`Transport`], used to drive this crate's integration tests end to end
/// without a real network.
///
/// # Delivery model
///
/// `forward`/`respond` only enqueue work; nothing is delivered until
/// [`Self::pump`] is called, which mirrors spec §5's "cooperatively
/// advanced by user-driven progress/trigger calls". This is what makes
/// [`Self::cancel`] meaningful in a single-threaded test: call `cancel`
/// between enqueuing a forward and calling `pump` to exercise spec §8
/// scenario 6.
///
/// # Forward completion timing
///
/// The spec's forward trampoline text describes firing "after the
/// transport signals completion of the outgoing message", which for a
/// no-response RPC is unambiguous (the local send). For a normal RPC,
/// spec §8 scenario 1 ("origin user_cb receives SUCCESS; out struct ==
/// 42") only makes sense if the callback fires once the response is
/// available to decode — so this mock treats "the outgoing message" for a
/// response-expecting RPC as the full request/response exchange: the
/// forward's `on_complete` is held in the reply slot and only invoked once
/// the matching `respond` has delivered its bytes back. A no-response RPC
/// invokes it immediately after dispatch, since no response is ever
/// coming. This resolution is recorded in DESIGN.md.
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<InMemoryState>,
    next_token: AtomicU64,
}

impl InMemoryTransport {
    /// Build an empty transport with no registered listeners.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `name` as a listening endpoint; incoming forwards targeting
    /// `MockAddress::Named(name)` are handed to `listener`.
    pub fn register_listener(&self, name: impl Into<Arc<str>>, listener: Listener) {
        let name: Arc<str> = name.into();
        self.state.lock().expect("transport lock poisoned").listeners.insert(name.to_string(), listener);
    }

    /// Drain and execute every pending operation, including ones enqueued
    /// by handlers invoked during this same call (a server handler calling
    /// `respond` enqueues work that must run before `pump` returns).
    /// Mirrors `progress`/`trigger` (spec §6).
    pub fn pump(&self) {
        loop {
            let next = self.state.lock().expect("transport lock poisoned").queue.pop_front();
            let Some(pending) = next else { break };
            self.run(pending);
        }
    }

    fn run(&self, pending: Pending) {
        let canceled = pending.canceled.load(Ordering::SeqCst);
        match pending.op {
            PendingOp::Forward { handle, target, bytes, no_response, on_complete } => {
                if canceled {
                    on_complete(Completion::Canceled);
                    return;
                }
                let listener = {
                    let state = self.state.lock().expect("transport lock poisoned");
                    state.listeners.get(&target).cloned()
                };
                let Some(listener) = listener else {
                    tracing::warn!(target = %target, "forward to unknown endpoint");
                    on_complete(Completion::Failed);
                    return;
                };
                if no_response {
                    let reply_addr: Arc<dyn Address> = Arc::new(MockAddress::ReplyToken(0));
                    listener(reply_addr, bytes);
                    on_complete(Completion::Success);
                } else {
                    let token = self.next_token.fetch_add(1, Ordering::SeqCst);
                    self.state
                        .lock()
                        .expect("transport lock poisoned")
                        .replies
                        .insert(token, ReplySlot { origin: handle, on_complete: Some(on_complete) });
                    let reply_addr: Arc<dyn Address> = Arc::new(MockAddress::ReplyToken(token));
                    listener(reply_addr, bytes);
                }
            },
            PendingOp::Respond { reply_token, bytes, on_complete, .. } => {
                let slot = self.state.lock().expect("transport lock poisoned").replies.remove(&reply_token);
                if let Some(mut slot) = slot {
                    if !canceled {
                        slot.origin.with_inner(|inner| {
                            let out = inner.output_buf();
                            let len = bytes.len().min(out.len());
                            out[..len].copy_from_slice(&bytes[..len]);
                        });
                    }
                    if let Some(forward_cb) = slot.on_complete.take() {
                        forward_cb(if canceled { Completion::Canceled } else { Completion::Success });
                    }
                }
                on_complete(if canceled { Completion::Canceled } else { Completion::Success });
            },
        }
    }
}

impl Transport for InMemoryTransport {
    fn forward(
        &self,
        handle: &Handle,
        payload_size: usize,
        flags: TransportFlags,
        on_complete: Box<dyn FnOnce(Completion) + Send>,
    ) {
        let target = match handle.info().addr.as_any().downcast_ref::<MockAddress>() {
            Some(MockAddress::Named(name)) => name.to_string(),
            _ => {
                on_complete(Completion::Failed);
                return;
            },
        };
        let bytes = handle.with_inner(|inner| inner.input_buf()[..payload_size].to_vec());
        let canceled = Arc::new(AtomicBool::new(false));
        self.state.lock().expect("transport lock poisoned").queue.push_back(Pending {
            handle_id: handle.identity(),
            canceled,
            op: PendingOp::Forward {
                handle: handle.clone(),
                target,
                bytes,
                no_response: flags.no_response,
                on_complete,
            },
        });
    }

    fn respond(
        &self,
        handle: &Handle,
        payload_size: usize,
        _flags: TransportFlags,
        on_complete: Box<dyn FnOnce(Completion) + Send>,
    ) {
        let reply_token = match handle.info().addr.as_any().downcast_ref::<MockAddress>() {
            Some(MockAddress::ReplyToken(token)) => *token,
            _ => {
                on_complete(Completion::Failed);
                return;
            },
        };
        let bytes = handle.with_inner(|inner| inner.output_buf()[..payload_size].to_vec());
        let canceled = Arc::new(AtomicBool::new(false));
        self.state.lock().expect("transport lock poisoned").queue.push_back(Pending {
            handle_id: handle.identity(),
            canceled,
            op: PendingOp::Respond { handle: handle.clone(), reply_token, bytes, on_complete },
        });
    }

    fn bulk_pull(
        &self,
        handle: &Handle,
        descriptor: BulkDescriptor,
        on_complete: Box<dyn FnOnce(Result<Vec<u8>, RpcError>) + Send>,
    ) {
        let reply_token = match handle.info().addr.as_any().downcast_ref::<MockAddress>() {
            Some(MockAddress::ReplyToken(token)) => *token,
            _ => {
                on_complete(Err(RpcError::ProtocolError));
                return;
            },
        };
        let origin = self
            .state
            .lock()
            .expect("transport lock poisoned")
            .replies
            .get(&reply_token)
            .map(|slot| slot.origin.clone());
        let Some(origin) = origin else {
            on_complete(Err(RpcError::ProtocolError));
            return;
        };
        let pulled = origin.with_inner(|inner| {
            inner
                .extra(crate::codec::Direction::Input)
                .as_ref()
                .filter(|extra| extra.bulk.region_key == descriptor.region_key)
                .map(|extra| extra.buf.clone())
        });
        match pulled {
            Some(buf) if buf.len() as u64 == descriptor.length => on_complete(Ok(buf)),
            _ => on_complete(Err(RpcError::ProtocolError)),
        }
    }

    fn cancel(&self, handle: &Handle) {
        let state = self.state.lock().expect("transport lock poisoned");
        for pending in &state.queue {
            if pending.handle_id == handle.identity() {
                pending.canceled.store(true, Ordering::SeqCst);
            }
        }
    }
}


#[cfg(test)]
mod address_tests {
    use super::*;

    #[test]
    fn mock_address_displays_its_name() {
        let addr = MockAddress::new("peer-a");
        assert_eq!(addr.display(), "peer-a");
    }

    #[test]
    fn reply_token_displays_distinctly() {
        let addr = MockAddress::ReplyToken(7);
        assert_eq!(addr.display(), "reply:7");
    }
}
