//! # palaver
//!
//! Multi-session inference manager for transformer language models.
//!
//! palaver sits above a token-level tensor runtime (model loading, batched
//! decode, KV cache, sampling primitives) and below an application that
//! feeds prompts and consumes generated text. It manages the lifecycle of
//! loaded models and of long-lived generation *sessions*: conversation-like
//! stateful contexts whose expensive attention key/value cache is reused
//! across calls.
//!
//! ## Architecture
//!
//! - **Runtime** ([`runtime`]): the narrow-waist traits every other module
//!   depends on. Production builds plug in an FFI-backed runtime; tests plug
//!   in a scriptable mock.
//!
//! - **Registry** ([`registry`]): process-wide `model id → loaded model`
//!   mapping with a memoized 64-bit content hash per model.
//!
//! - **Sessions** ([`session`]): monotonic id allocation, capacity and TTL
//!   eviction, and the per-session locking that makes concurrent callers
//!   safe over a runtime that is not thread-safe per context.
//!
//! - **Decode** ([`decode`]): prefix-reuse decoding — only the suffix that
//!   differs from the cached prompt is re-decoded, in batches, with
//!   progress reporting.
//!
//! - **Infer** ([`infer`]): the sampling loop with stop-sequence detection
//!   and programmable end-of-stream handling.
//!
//! - **Grammar** ([`grammar`]): an embedded Lua host that produces grammar
//!   strings at start and on end-of-stream.
//!
//! - **ABI** ([`abi`]): the C surface, dispatching through a process-wide
//!   [`Engine`] slot.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use palaver::{CreateParams, Engine, EngineConfig, InferenceOptions};
//!
//! # fn run(runtime: Arc<dyn palaver::runtime::Runtime>) -> palaver::Result<()> {
//! let engine = Engine::new(runtime, EngineConfig::default());
//! engine.load_model("/models/story.gguf".as_ref(), "story", None)?;
//!
//! let id = engine.create_session(CreateParams {
//!     model_id: "story",
//!     initial_prompt: Some("Once upon a time"),
//!     ..Default::default()
//! })?;
//!
//! engine.infer(id, None, 64, &InferenceOptions::default(), None, &mut |piece| {
//!     print!("{piece}");
//!     true
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Locking
//!
//! Three mutexes, acquired strictly downward: registry → session store →
//! session. The sole exception is the content hash, which releases the
//! registry lock before streaming the model file and memoizes through an
//! atomic.

pub mod abi;
pub mod decode;
pub mod error;
pub mod grammar;
pub mod hash;
pub mod infer;
pub mod registry;
pub mod runtime;
pub mod sampling;
pub mod session;

use std::path::Path;
use std::sync::Arc;

pub use error::{Error, Result};
pub use infer::InferenceOptions;
pub use registry::ModelRegistry;
pub use runtime::{ModelInfo, TokenId};
pub use session::{Clock, SessionId, SystemClock};

/// Caller-facing progress callback, receiving fractions in `[0, 1]`.
///
/// Runs synchronously on the calling thread while the relevant session lock
/// is held; it must not re-enter the library.
pub type ProgressCallback = Box<dyn FnMut(f32) + Send>;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine-wide configuration.
#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session time-to-live in seconds; 0 disables expiry.
    pub session_ttl_secs: u32,
    /// Maximum live sessions; 0 means unlimited.
    pub max_sessions: u32,
}

/// Parameters for [`Engine::create_session`].
#[derive(Default)]
pub struct CreateParams<'a> {
    /// Id of a previously loaded model.
    pub model_id: &'a str,
    /// Context window in tokens; 0 selects the runtime default.
    pub context_size: u32,
    /// Decode batch size in tokens; 0 selects the runtime default.
    pub batch_size: u32,
    /// Prompt decoded into the fresh context. Its length becomes the
    /// session's reset point.
    pub initial_prompt: Option<&'a str>,
    /// File to load a pre-baked context state from, or to save it to after
    /// a fresh decode. Ignored without an initial prompt.
    pub state_file: Option<&'a Path>,
    /// Progress over state loading or the initial decode.
    pub on_progress: Option<ProgressCallback>,
}

/// The single explicit handle owning all engine state: the model registry
/// and the session store. All public APIs dispatch through it; the C ABI
/// keeps one in a process-wide slot.
pub struct Engine {
    models: ModelRegistry,
    sessions: session::SessionStore,
}

impl Engine {
    pub fn new(runtime: Arc<dyn runtime::Runtime>, config: EngineConfig) -> Self {
        Self::with_clock(runtime, config, Arc::new(SystemClock))
    }

    /// Build an engine over an explicit time source. Tests use this to
    /// drive TTL expiry without sleeping.
    pub fn with_clock(
        runtime: Arc<dyn runtime::Runtime>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Engine {
            models: ModelRegistry::new(runtime),
            sessions: session::SessionStore::new(
                config.session_ttl_secs,
                config.max_sessions,
                clock,
            ),
        }
    }

    // ----- models -----------------------------------------------------------

    /// Load a model and register it under `id`. See [`ModelRegistry::load`].
    pub fn load_model(
        &self,
        path: &Path,
        id: &str,
        on_progress: Option<&mut dyn FnMut(f32) -> bool>,
    ) -> Result<ModelInfo> {
        self.models.load(path, id, on_progress)
    }

    /// Unload a model. Sessions created from it keep working; the handle is
    /// freed with the last reference.
    pub fn unload_model(&self, id: &str) -> Result<()> {
        self.models.unload(id)
    }

    /// Memoized content hash of a loaded model.
    pub fn model_hash(&self, id: &str) -> Result<u64> {
        self.models.hash_by_id(id)
    }

    /// Token count of `text` under the model's tokenizer.
    pub fn token_length(&self, id: &str, text: &str) -> Result<usize> {
        self.models.token_length(id, text)
    }

    // ----- sessions ---------------------------------------------------------

    /// Create a session, optionally primed with an initial prompt (and a
    /// pre-baked state file). Returns the new session id.
    pub fn create_session(&self, params: CreateParams<'_>) -> Result<SessionId> {
        let model = self.models.entry(params.model_id)?;
        let handle = self
            .sessions
            .create(model, params.context_size, params.batch_size)?;
        let id = handle.id();

        let mut state = handle.lock();
        if let Some(text) = params.initial_prompt {
            if let Err(e) = decode::prime_session(
                &handle,
                &mut state,
                text,
                params.state_file,
                params.on_progress,
            ) {
                // Don't leave a half-primed session behind.
                drop(state);
                let _ = self.sessions.remove(id);
                return Err(e);
            }
            state.initial_prompt_len = state.prompt.len();
        }

        Ok(id)
    }

    /// Decode `prompt` into the session, reusing the cached prefix.
    /// Returns the new prompt length.
    pub fn decode(
        &self,
        id: SessionId,
        prompt: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<usize> {
        self.sessions.with_session(id, |handle, state| {
            let target = state.model.api.tokenize(prompt, false, true)?;
            decode::decode_session(handle, state, target, on_progress)
        })
    }

    /// Generate up to `n_eval` tokens. `prompt` is the full target prompt;
    /// `None` continues from the session's current prompt. Each generated
    /// piece is passed to `on_token`; returning `false` stops generation.
    /// Returns the prompt length after generation.
    pub fn infer(
        &self,
        id: SessionId,
        prompt: Option<&str>,
        n_eval: usize,
        options: &InferenceOptions,
        decode_progress: Option<ProgressCallback>,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<usize> {
        self.sessions.with_session(id, |handle, state| {
            infer::infer_session(
                handle,
                state,
                prompt,
                n_eval,
                options,
                decode_progress,
                on_token,
            )
        })
    }

    /// Reset the session to its initial prompt. Returns the new prompt
    /// length.
    pub fn reset(&self, id: SessionId) -> Result<usize> {
        self.sessions.with_session(id, |handle, state| {
            let keep = state.initial_prompt_len;
            state.context.remove_kv_range(keep, None);
            state.prompt.truncate(keep);
            handle.touch();
            Ok(state.prompt.len())
        })
    }

    /// Destroy a session, blocking until any in-flight operation finishes.
    pub fn destroy_session(&self, id: SessionId) -> Result<()> {
        self.sessions.remove(id)
    }

    /// Whether the session exists and has not expired; refreshes the TTL.
    /// An expired session is removed.
    pub fn touch(&self, id: SessionId) -> bool {
        self.sessions.touch(id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
