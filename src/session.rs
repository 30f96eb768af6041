//! Session store: id allocation, TTL eviction, and the locking discipline.
//!
//! A session is a long-lived generation context whose expensive state, the
//! runtime's KV cache, is reused across calls. The store maps monotonic ids
//! to sessions and enforces the crate's lock order:
//!
//! ```text
//! registry mutex  →  store mutex  →  session mutex
//! ```
//!
//! Locks are only ever taken downward in that order. All work on a session's
//! context happens while its own mutex is held; the store mutex protects the
//! map alone and is released as soon as the session mutex is acquired.
//!
//! Expiry timestamps live *outside* the session mutex (a relaxed atomic), so
//! the eviction scan inside `create` can read them under the store lock
//! without touching sessions that may be busy decoding.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::registry::ModelEntry;
use crate::runtime::{ContextApi, ContextParams, EvalHook, TokenId};

/// Session identifier. Unique for the life of the process and strictly
/// increasing in creation order.
pub type SessionId = u32;

/// Time source for TTL bookkeeping. Swappable so tests can drive eviction
/// without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The default wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

fn millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Single-slot holder for the per-decode progress closure.
///
/// The runtime's eval hook (installed once, at context creation) fires into
/// this slot; the decode path installs a closure before each runtime decode
/// and the returned guard clears it on every exit path. The slot is only
/// ever non-empty during a call that the session's own mutex-holder
/// initiated, and the installed closure captures nothing but its own
/// counters and the caller's progress callback, never a lock.
#[derive(Default)]
pub struct ProgressSlot {
    hook: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl ProgressSlot {
    /// Install `hook` for the duration of the returned guard.
    pub(crate) fn install(&self, hook: Box<dyn FnMut() + Send>) -> SlotGuard<'_> {
        *self.hook.lock().unwrap() = Some(hook);
        SlotGuard { slot: self }
    }

    /// Fire the installed closure, if any. Called by the runtime's eval
    /// hook on the thread currently driving the context.
    pub fn fire(&self) {
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook();
        }
    }

    fn clear(&self) {
        *self.hook.lock().unwrap() = None;
    }
}

/// Clears the slot when dropped, so no stale closure survives an early
/// return.
pub(crate) struct SlotGuard<'a> {
    slot: &'a ProgressSlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

/// State owned exclusively by one session, protected by its mutex.
pub struct Session {
    /// The runtime inference context (KV cache + sampling scratch).
    pub(crate) context: Box<dyn ContextApi>,
    /// The model this session was created from. Keeps the handle alive even
    /// if the model is unloaded from the registry.
    pub(crate) model: Arc<ModelEntry>,
    /// The token sequence whose KV-cache state is materialized in the
    /// context, in order.
    pub(crate) prompt: Vec<TokenId>,
    /// Length of the prompt installed at creation; `reset` trims back to it
    /// and this prefix never changes afterwards.
    pub(crate) initial_prompt_len: usize,
    /// Slot bridging the runtime eval hook to the caller's progress
    /// callback during one decode call.
    pub(crate) progress: Arc<ProgressSlot>,
}

/// A session plus its lock and expiry bookkeeping.
pub struct SessionHandle {
    id: SessionId,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    /// Expiry as milliseconds since the epoch; 0 until first touched.
    /// Readable without the session mutex.
    expires_at_ms: AtomicU64,
    state: Mutex<Session>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock().unwrap()
    }

    /// Prolong the expiration time by the configured TTL.
    pub(crate) fn touch(&self) {
        if let Some(ttl) = self.ttl {
            let expires = self.clock.now() + ttl;
            self.expires_at_ms.store(millis(expires), Ordering::Relaxed);
        }
    }

    pub(crate) fn is_expired(&self, now: SystemTime) -> bool {
        self.ttl.is_some() && self.expires_at_ms.load(Ordering::Relaxed) < millis(now)
    }
}

/// Process-wide session map with capacity and TTL enforcement.
pub struct SessionStore {
    counter: AtomicU32,
    /// Ordered by id, i.e. by creation order; the eviction scan takes the
    /// first expired entry in this order.
    sessions: Mutex<BTreeMap<SessionId, Arc<SessionHandle>>>,
    ttl: Option<Duration>,
    max_sessions: usize,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    /// `ttl_secs` and `max_sessions` of zero mean disabled and unlimited.
    pub fn new(ttl_secs: u32, max_sessions: u32, clock: Arc<dyn Clock>) -> Self {
        SessionStore {
            counter: AtomicU32::new(0),
            sessions: Mutex::new(BTreeMap::new()),
            ttl: (ttl_secs > 0).then(|| Duration::from_secs(u64::from(ttl_secs))),
            max_sessions: max_sessions as usize,
            clock,
        }
    }

    /// Create a session over a fresh runtime context for `model`.
    ///
    /// At capacity, evicts the first expired session (creation order) when a
    /// TTL is configured; otherwise fails with [`Error::CapacityReached`].
    /// The id counter is committed only once context creation succeeds, so a
    /// failed create burns no id.
    pub(crate) fn create(
        &self,
        model: Arc<ModelEntry>,
        context_size: u32,
        batch_size: u32,
    ) -> Result<Arc<SessionHandle>> {
        let mut sessions = self.sessions.lock().unwrap();

        if self.max_sessions > 0 && sessions.len() >= self.max_sessions {
            if self.ttl.is_none() {
                return Err(Error::CapacityReached);
            }
            let now = self.clock.now();
            let victim = sessions
                .iter()
                .find(|(_, handle)| handle.is_expired(now))
                .map(|(&id, _)| id);
            match victim {
                Some(id) => {
                    debug!(session = id, "evicting expired session");
                    sessions.remove(&id);
                }
                None => return Err(Error::CapacityReached),
            }
        }

        let id = self.counter.load(Ordering::Relaxed) + 1;

        let progress = Arc::new(ProgressSlot::default());
        let eval_hook: EvalHook = {
            let slot = Arc::clone(&progress);
            Arc::new(move || slot.fire())
        };
        let params = ContextParams {
            context_size,
            batch_size,
            // Always on: toggling it would change state-file compatibility.
            flash_attention: true,
        };
        let context = model.api.new_context(&params, eval_hook).map_err(|e| {
            error!(model = %model.id, error = %e, "context creation failed");
            Error::ContextCreation
        })?;

        self.counter.store(id, Ordering::Relaxed);

        let handle = Arc::new(SessionHandle {
            id,
            ttl: self.ttl,
            clock: Arc::clone(&self.clock),
            expires_at_ms: AtomicU64::new(0),
            state: Mutex::new(Session {
                context,
                model,
                prompt: Vec::new(),
                initial_prompt_len: 0,
                progress,
            }),
        });
        handle.touch();
        sessions.insert(id, Arc::clone(&handle));
        debug!(session = id, "created session");

        Ok(handle)
    }

    /// Run `f` on the session, holding its mutex.
    ///
    /// The session mutex is acquired while the store mutex is still held;
    /// the store mutex is released as soon as the session lock is obtained.
    pub(crate) fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&SessionHandle, &mut Session) -> Result<T>,
    ) -> Result<T> {
        let sessions = self.sessions.lock().unwrap();
        let handle = sessions
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound(id))?;
        let mut state = handle.lock();
        drop(sessions);

        f(&handle, &mut state)
    }

    /// Remove a session, waiting for any in-flight operation to finish
    /// before its context can be freed.
    pub(crate) fn remove(&self, id: SessionId) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let handle = sessions.remove(&id).ok_or(Error::SessionNotFound(id))?;
        // Wait until the session is idle; the context drops with the last
        // Arc reference.
        drop(handle.lock());
        Ok(())
    }

    /// Whether the session exists and has not expired. An expired session
    /// is removed; a live one has its TTL refreshed.
    pub(crate) fn touch(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(handle) = sessions.get(&id).cloned() else {
            return false;
        };
        if handle.is_expired(self.clock.now()) {
            debug!(session = id, "removing expired session on touch");
            sessions.remove(&id);
            return false;
        }
        handle.touch();
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
