//! RPC framing engine: registry, handle lifetime, and the forward/respond
//! state machines built atop `rpcframe-proto`'s wire format.
//!
//! Module map, matching the component breakdown (C1 lives in
//! `rpcframe-proto`):
//!
//! - [`registry`] — C2, per-class rpc id → registration.
//! - [`handle`] — C3, the reference-counted per-RPC object.
//! - [`framing`] — C4, `get_struct`/`set_struct`/`free_struct`.
//! - [`forward_respond`] — C5, `forward`/`respond`/`cancel`/the "more data"
//!   pull.
//! - [`class`] and [`context`] — C6, the long-lived root object and the
//!   per-progress-scope handle factory built on top of it.
//!
//! [`codec`], [`env`], and [`transport`] are the seams the out-of-scope
//! collaborators (user serialization, entropy, and the network abstraction
//! layer) plug into.

pub mod class;
pub mod codec;
pub mod context;
pub mod env;
pub mod forward_respond;
pub mod framing;
pub mod handle;
pub mod registry;
pub mod transport;

pub use class::{Class, ClassInfo, ClassOptions};
pub use codec::{Codec, Direction};
pub use context::Context;
pub use env::{DeterministicEnvironment, Environment, SystemEnvironment};
pub use forward_respond::{cancel, forward, more_data_pull, respond};
pub use framing::{free_struct, get_struct, set_struct, SetOutcome};
pub use handle::{CallbackInfo, ExtraBuffer, Handle, HandleInfo, HandleState};
pub use registry::{FreeCallback, Handler, RegisterOutcome, Registration, Registry};
pub use transport::{Address, Completion, InMemoryTransport, Listener, Transport, TransportFlags};
