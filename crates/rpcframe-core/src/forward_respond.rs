//! Forward/Respond controller (C5): client-side `forward`, server-side
//! `respond`, the "more data" bulk-pull hook, and `cancel`.
//!
//! This module owns the handle state-machine transitions spec §4.5 lists
//! (FRESH → ENCODED → IN_FLIGHT → \[EXTRA_PULL\] → DELIVERED); C4
//! ([`crate::framing`]) only ever produces ENCODED/DECODED/RELEASED.

use std::any::Any;

use rpcframe_proto::{BulkDescriptor, HeaderFlags, Proc, ProcMode, RequestHeader, ResponseHeader, RpcError};

use crate::class::ClassOptions;
use crate::codec::Direction;
use crate::env::Environment;
use crate::framing::{self, SetOutcome};
use crate::handle::{CallbackInfo, ExtraBuffer, Handle, HandleState};
use crate::transport::{Completion, Transport, TransportFlags};

fn header_wire_size(direction: Direction) -> usize {
    match direction {
        Direction::Input => RequestHeader::SIZE,
        Direction::Output => ResponseHeader::SIZE,
    }
}

fn payload_offset(direction: Direction, options: &ClassOptions) -> usize {
    header_wire_size(direction) + if options.crc_on_payload { 4 } else { 0 }
}

/// Client-side forward (spec §4.5 `forward`).
///
/// Encodes `value` as the handle's input, derives the transport flags
/// (`MORE_DATA` if the payload spilled, `NO_RESPONSE` if the registration
/// suppresses responses), and hands the eager buffer to `transport`. The
/// forward trampoline clears the input spill and invokes `on_result` once
/// the transport signals completion — for a registration that expects a
/// response, "completion" is the full round trip (see
/// [`crate::transport::InMemoryTransport`]'s docs for why); for a
/// no-response registration it is just the local send.
///
/// # Errors
///
/// Propagates whatever [`framing::set_struct`] returns; on error `value`
/// was never handed to the transport and no callback is stashed.
pub fn forward(
    handle: &Handle,
    transport: &impl Transport,
    value: &dyn Any,
    env: &impl Environment,
    options: &ClassOptions,
    on_result: impl FnOnce(CallbackInfo) + Send + 'static,
) -> Result<(), RpcError> {
    let outcome = framing::set_struct(handle, Direction::Input, value, RpcError::Success, env, options)?;

    handle.with_inner(|inner| inner.set_callback(Box::new(on_result)));

    let no_response = handle
        .registry()
        .lookup(handle.info().rpc_id)
        .is_some_and(|reg| reg.response_suppressed());
    let flags = TransportFlags { more_data: outcome.more_data, no_response };

    handle.set_state(HandleState::InFlight);
    let trampoline_handle = handle.clone();
    transport.forward(
        handle,
        outcome.payload_size,
        flags,
        Box::new(move |completion| forward_trampoline(&trampoline_handle, completion)),
    );
    Ok(())
}

/// Releases the origin's input spill and fires the stashed user callback
/// (spec §4.5 "Forward trampoline").
fn forward_trampoline(handle: &Handle, completion: Completion) {
    handle.with_inner(|inner| {
        *inner.extra(Direction::Input) = None;
    });
    handle.set_state(HandleState::Delivered);
    if let Some(cb) = handle.with_inner(crate::handle::MutableStateView::take_callback) {
        cb(CallbackInfo { direction: Direction::Input, status: completion.to_rpc_error() });
    }
}

/// Server-side respond (spec §4.5 `respond`).
///
/// Encodes `value` (tagged with `status`) as the handle's output and hands
/// it to the transport with the caller's `on_result` passed straight
/// through — no trampoline, per the resolved Open Question in DESIGN.md:
/// the respond path never carries a spill across callbacks in current use.
///
/// # Errors
///
/// `RpcError::ProtocolError` if the registration suppresses responses
/// (spec §8 scenario 4); `RpcError::NoMatch` if the handle's rpc id has no
/// registration; otherwise whatever [`framing::set_struct`] returns.
pub fn respond(
    handle: &Handle,
    transport: &impl Transport,
    value: &dyn Any,
    status: RpcError,
    env: &impl Environment,
    options: &ClassOptions,
    on_result: impl FnOnce(CallbackInfo) + Send + 'static,
) -> Result<(), RpcError> {
    let registration = handle.registry().lookup(handle.info().rpc_id).ok_or(RpcError::NoMatch)?;
    if registration.response_suppressed() {
        return Err(RpcError::ProtocolError);
    }

    let outcome = framing::set_struct(handle, Direction::Output, value, status, env, options)?;
    let flags = TransportFlags { more_data: outcome.more_data, no_response: false };

    handle.set_state(HandleState::InFlight);
    transport.respond(
        handle,
        outcome.payload_size,
        flags,
        Box::new(move |completion| {
            on_result(CallbackInfo { direction: Direction::Output, status: completion.to_rpc_error() });
        }),
    );
    Ok(())
}

/// Ask the transport to cancel any operation outstanding on `handle` (spec
/// §5 `cancel`). The forward/respond trampoline still runs once the
/// transport reports the cancellation, delivering `RpcError::Canceled` to
/// the stashed callback (spec §8 scenario 6).
pub fn cancel(handle: &Handle, transport: &impl Transport) {
    transport.cancel(handle);
}

/// Decode the bulk descriptor embedded in `handle`'s eager payload and
/// initiate the "more data" pull (spec §4.5 "Server 'more data' hook",
/// step 1-3). `done` resumes normal dispatch once the pull lands (or
/// reports why it didn't).
///
/// The paired `more_data_free_cb` from the spec is just
/// [`framing::free_struct`] clearing the direction's extra slot, so it is
/// not separately exposed here.
///
/// # Errors
///
/// Calls `done(Err(_))` (rather than returning a `Result` itself, since the
/// pull is asynchronous) with `RpcError::ProtocolError` if the eager buffer
/// is too small to hold a bulk descriptor, or whatever the descriptor
/// decode returns.
pub fn more_data_pull(
    handle: &Handle,
    direction: Direction,
    transport: &impl Transport,
    options: &ClassOptions,
    done: impl FnOnce(Result<(), RpcError>) + Send + 'static,
) {
    let h = payload_offset(direction, options);
    let descriptor = handle.with_inner(|inner| -> Result<BulkDescriptor, RpcError> {
        let buf = match direction {
            Direction::Input => inner.input_buf(),
            Direction::Output => inner.output_buf(),
        };
        if buf.len() < h + BulkDescriptor::WIRE_SIZE {
            return Err(RpcError::ProtocolError);
        }
        let mut region = buf[h..h + BulkDescriptor::WIRE_SIZE].to_vec();
        let mut proc = Proc::new(ProcMode::Decode, &mut region, options.xdr_mode);
        BulkDescriptor::decode(&mut proc)
    });
    let descriptor = match descriptor {
        Ok(d) => d,
        Err(e) => {
            done(Err(e));
            return;
        },
    };

    handle.set_state(HandleState::ExtraPull);
    let landing_handle = handle.clone();
    transport.bulk_pull(
        handle,
        descriptor,
        Box::new(move |result| match result {
            Ok(buf) => {
                landing_handle.with_inner(|inner| {
                    *inner.extra(direction) = Some(ExtraBuffer { buf, bulk: descriptor });
                });
                landing_handle.set_state(HandleState::Delivered);
                done(Ok(()));
            },
            Err(e) => {
                // Spec §4.5 step 4: "the pull is abandoned and the
                // handle's spill slot stays empty" — framing::get_struct
                // enforces the resulting PROTOCOL_ERROR.
                done(Err(e));
            },
        }),
    );
}

/// Convenience re-export of [`SetOutcome`] so callers of this module don't
/// need to import `framing` directly just to name the forward/respond
/// result type.
pub type ForwardOutcome = SetOutcome;

/// Convenience re-export so callers don't need `rpcframe_proto::HeaderFlags`
/// directly just to inspect whether a raw header they decoded themselves
/// carries the extra-data bit.
pub use rpcframe_proto::HeaderFlags as WireFlags;

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use super::*;
    use crate::codec::test_support::U32Codec;
    use crate::env::DeterministicEnvironment;
    use crate::registry::Registry;
    use crate::transport::tests::TestAddress;
    use crate::transport::{Address, InMemoryTransport, MockAddress};

    fn setup() -> (Arc<Registry>, u64, Arc<InMemoryTransport>) {
        let registry = Arc::new(Registry::new());
        let id = registry.register_name("noop", Some(Arc::new(U32Codec)), Some(Arc::new(U32Codec)), None);
        (registry, id, InMemoryTransport::new())
    }

    #[test]
    fn forward_then_respond_completes_round_trip() {
        let (registry, id, transport) = setup();
        let options = ClassOptions::default();
        let env = DeterministicEnvironment::new(1);

        transport.register_listener(
            "server",
            Arc::new({
                let registry = registry.clone();
                let transport = transport.clone();
                let env = env.clone();
                let options = options.clone();
                move |reply_addr: Arc<dyn Address>, _bytes: Vec<u8>| {
                    let server_handle = Handle::create(registry.clone(), 256, reply_addr, id);
                    let input = framing::get_struct(&server_handle, Direction::Input, &options).unwrap();
                    let value = *input.downcast::<u32>().unwrap();
                    framing::free_struct(&server_handle, Direction::Input, Box::new(value), &options).unwrap();

                    respond(&server_handle, &*transport, &value, RpcError::Success, &env, &options, |_| {})
                        .unwrap();
                }
            }),
        );

        let origin = Handle::create(registry, 256, Arc::new(MockAddress::new("server")), id);
        let status = Arc::new(Mutex::new(None));
        let status_clone = status.clone();

        forward(&origin, &*transport, &42u32, &env, &options, move |info| {
            *status_clone.lock().unwrap() = Some(info.status);
        })
        .unwrap();

        transport.pump();

        assert_eq!(*status.lock().unwrap(), Some(RpcError::Success));
        let output = framing::get_struct(&origin, Direction::Output, &options).unwrap();
        assert_eq!(*output.downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn no_response_rpc_fires_trampoline_after_local_send() {
        let registry = Arc::new(Registry::new());
        let id = registry.register_name("noresp", Some(Arc::new(U32Codec)), None, None);
        registry.disable_response(id, true).unwrap();
        let transport = InMemoryTransport::new();
        let options = ClassOptions::default();
        let env = DeterministicEnvironment::new(1);

        let seen = Arc::new(AtomicUsize::new(0));
        transport.register_listener(
            "server",
            Arc::new({
                let seen = seen.clone();
                move |_addr: Arc<dyn Address>, _bytes: Vec<u8>| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        let origin = Handle::create(registry.clone(), 256, Arc::new(MockAddress::new("server")), id);
        let status = Arc::new(Mutex::new(None));
        let status_clone = status.clone();
        forward(&origin, &*transport, &7u32, &env, &options, move |info| {
            *status_clone.lock().unwrap() = Some(info.status);
        })
        .unwrap();

        transport.pump();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(*status.lock().unwrap(), Some(RpcError::Success));

        // Server attempting respond on a suppressed registration fails.
        let server_handle = Handle::create(registry, 256, Arc::new(MockAddress::ReplyToken(0)), id);
        let err =
            respond(&server_handle, &*transport, &7u32, RpcError::Success, &env, &options, |_| {}).unwrap_err();
        assert_eq!(err, RpcError::ProtocolError);
    }

    #[test]
    fn cancel_before_completion_delivers_canceled() {
        let (registry, id, transport) = setup();
        let options = ClassOptions::default();
        let env = DeterministicEnvironment::new(1);

        transport.register_listener("server", Arc::new(|_addr: Arc<dyn Address>, _bytes: Vec<u8>| {}));

        let origin = Handle::create(registry, 256, Arc::new(MockAddress::new("server")), id);
        let status = Arc::new(Mutex::new(None));
        let status_clone = status.clone();
        forward(&origin, &*transport, &1u32, &env, &options, move |info| {
            *status_clone.lock().unwrap() = Some(info.status);
        })
        .unwrap();

        cancel(&origin, &*transport);
        transport.pump();

        assert_eq!(*status.lock().unwrap(), Some(RpcError::Canceled));
        assert_eq!(origin.ref_count(), 1, "cancel leaves the handle destroyable with no leaked references");
    }
}
