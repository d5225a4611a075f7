//! Per-class mapping from RPC id to registration (C2).
//!
//! Registrations are read on every incoming message and mutated rarely
//! (spec §5: "registrations are rare"), so the registry is a coarse
//! `RwLock` guarding an immutable, `Arc`-shared map, swapped wholesale on
//! every mutation — a read-copy-update discipline rather than a lock-free
//! structure.

#![allow(clippy::expect_used, reason = "RwLock poisoning should cause a panic")]

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rpcframe_proto::RpcError;

use crate::codec::Codec;
use crate::handle::Handle;

/// Invoked by the dispatch path once a target's input is ready (eagerly
/// decodable or pulled through the more-data sub-protocol). Takes the
/// handle so the handler can call `get_input`/`respond` itself.
pub type Handler = Arc<dyn Fn(&Handle) -> Result<(), RpcError> + Send + Sync>;

/// Invoked exactly once, in registration order, when the owning class is
/// finalized (spec §4.2: "the free callbacks of all retained records are
/// invoked exactly once").
pub type FreeCallback = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

/// An immutable-except-for-three-fields registration record (spec §3:
/// "Immutable after registration except for its associated user data
/// pointer, input/output codec function pointers, and the
/// response-suppressed flag").
#[derive(Clone)]
pub struct Registration {
    rpc_id: u64,
    insertion_seq: u64,
    in_codec: Option<Arc<dyn Codec>>,
    out_codec: Option<Arc<dyn Codec>>,
    handler: Option<Handler>,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
    free_cb: Option<FreeCallback>,
    suppress_response: bool,
}

impl Registration {
    /// Registered identifier.
    #[must_use]
    pub fn rpc_id(&self) -> u64 {
        self.rpc_id
    }

    /// Input-direction codec, if one was registered.
    #[must_use]
    pub fn in_codec(&self) -> Option<&Arc<dyn Codec>> {
        self.in_codec.as_ref()
    }

    /// Output-direction codec, if one was registered.
    #[must_use]
    pub fn out_codec(&self) -> Option<&Arc<dyn Codec>> {
        self.out_codec.as_ref()
    }

    /// Server handler to invoke once input is ready.
    #[must_use]
    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    /// Opaque user data attached via [`Registry::register_data`].
    #[must_use]
    pub fn user_data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.user_data.as_ref()
    }

    /// Whether responses are suppressed for this RPC (spec §4.4: "If
    /// OUTPUT and response is suppressed, fail PROTOCOL").
    #[must_use]
    pub fn response_suppressed(&self) -> bool {
        self.suppress_response
    }
}

/// Per-class id → registration map (spec §4.2).
#[derive(Default)]
pub struct Registry {
    table: RwLock<Arc<HashMap<u64, Registration>>>,
    next_seq: std::sync::atomic::AtomicU64,
}

/// Outcome of [`Registry::register`] (spec: "ok | already").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No prior registration existed for this id.
    Fresh,
    /// A registration already existed; its handler/codecs were updated.
    Already,
}

impl Registry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { table: RwLock::new(Arc::new(HashMap::new())), next_seq: 0.into() }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Register (or re-register) `id` with the given codecs and handler.
    ///
    /// Re-registering an already-known id updates only the handler and
    /// codec pointers (spec §4.2); the id, user data, and
    /// response-suppressed flag are left untouched.
    pub fn register(
        &self,
        id: u64,
        in_codec: Option<Arc<dyn Codec>>,
        out_codec: Option<Arc<dyn Codec>>,
        handler: Option<Handler>,
    ) -> RegisterOutcome {
        let mut guard = self.table.write().expect("registry lock poisoned");
        let mut map = (**guard).clone();
        let outcome = if let Some(existing) = map.get_mut(&id) {
            existing.in_codec = in_codec;
            existing.out_codec = out_codec;
            existing.handler = handler;
            RegisterOutcome::Already
        } else {
            map.insert(
                id,
                Registration {
                    rpc_id: id,
                    insertion_seq: self.next_seq(),
                    in_codec,
                    out_codec,
                    handler,
                    user_data: None,
                    free_cb: None,
                    suppress_response: false,
                },
            );
            RegisterOutcome::Fresh
        };
        *guard = Arc::new(map);
        tracing::debug!(rpc_id = id, outcome = ?outcome, "registered rpc");
        outcome
    }

    /// Register (or re-register) by name; the id is derived by hashing
    /// `name` (spec §3: "user-assigned or derived by a string hash of the
    /// function name"). The string-to-id hashing utility proper is an
    /// out-of-scope collaborator (spec §1); [`fnv1a64`] is a concrete,
    /// deterministic stand-in.
    ///
    /// Returns the derived id, whether this was a fresh registration or an
    /// update (spec §8 scenario 5: "second call returns the same id,
    /// updates codecs and handler").
    pub fn register_name(
        &self,
        name: &str,
        in_codec: Option<Arc<dyn Codec>>,
        out_codec: Option<Arc<dyn Codec>>,
        handler: Option<Handler>,
    ) -> u64 {
        let id = fnv1a64(name.as_bytes());
        self.register(id, in_codec, out_codec, handler);
        id
    }

    /// Whether `id` has a registration.
    #[must_use]
    pub fn registered(&self, id: u64) -> bool {
        self.table.read().expect("registry lock poisoned").contains_key(&id)
    }

    /// Fetch a snapshot of the registration for `id`, if any. The returned
    /// `Registration` is a point-in-time clone; later `register`/
    /// `register_data` calls do not retroactively change it.
    #[must_use]
    pub fn lookup(&self, id: u64) -> Option<Registration> {
        self.table.read().expect("registry lock poisoned").get(&id).cloned()
    }

    /// Attach (or replace) opaque user data for `id`.
    ///
    /// If data already exists, its free callback is invoked before the
    /// replacement takes effect (spec §4.2: "replaces the previous data
    /// after invoking its free callback").
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NoMatch` if `id` is not registered.
    pub fn register_data(
        &self,
        id: u64,
        data: Arc<dyn Any + Send + Sync>,
        free_cb: FreeCallback,
    ) -> Result<(), RpcError> {
        let mut guard = self.table.write().expect("registry lock poisoned");
        let mut map = (**guard).clone();
        let Some(reg) = map.get_mut(&id) else {
            return Err(RpcError::NoMatch);
        };
        if let (Some(old_data), Some(old_cb)) = (reg.user_data.take(), reg.free_cb.take()) {
            old_cb(old_data.as_ref());
        }
        reg.user_data = Some(data);
        reg.free_cb = Some(free_cb);
        *guard = Arc::new(map);
        Ok(())
    }

    /// Fetch the opaque user data attached to `id`, if any.
    #[must_use]
    pub fn registered_data(&self, id: u64) -> Option<Arc<dyn Any + Send + Sync>> {
        self.table.read().expect("registry lock poisoned").get(&id)?.user_data.clone()
    }

    /// Toggle whether responses are suppressed for `id`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NoMatch` if `id` is not registered.
    pub fn disable_response(&self, id: u64, disabled: bool) -> Result<(), RpcError> {
        let mut guard = self.table.write().expect("registry lock poisoned");
        let mut map = (**guard).clone();
        let Some(reg) = map.get_mut(&id) else {
            return Err(RpcError::NoMatch);
        };
        reg.suppress_response = disabled;
        *guard = Arc::new(map);
        Ok(())
    }

    /// Invoke every retained free callback exactly once, in registration
    /// order, then drop all registrations (spec §4.2, §7: "Finalize
    /// propagates no errors from user free-callbacks").
    pub fn finalize(&self) {
        let mut guard = self.table.write().expect("registry lock poisoned");
        let mut entries: Vec<&Registration> = guard.values().collect();
        entries.sort_by_key(|reg| reg.insertion_seq);
        for reg in entries {
            if let (Some(data), Some(cb)) = (&reg.user_data, &reg.free_cb) {
                cb(data.as_ref());
            }
        }
        *guard = Arc::new(HashMap::new());
    }
}

/// FNV-1a over 64 bits. A concrete, deterministic stand-in for the
/// out-of-scope string-to-id hashing utility (spec §1, §3) — good enough to
/// make `register_name` collision-free for realistic function-name sets
/// without pulling in a hashing crate for a one-line algorithm.
#[must_use]
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01B3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
