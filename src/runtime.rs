//! The "narrow waist" of the palaver stack: traits describing the capability
//! set the engine requires from the underlying tensor runtime.
//!
//! Everything above this module (registry, session store, prefix decoder,
//! inference loop) depends on *runtime behavior*, not on a concrete
//! implementation. A production build plugs in an FFI-backed runtime; tests
//! plug in a scriptable mock. Both dispatch through trait objects.
//!
//! ## Design Notes
//!
//! ### Thread safety
//! The runtime itself is assumed **not** thread-safe per context: a context
//! (KV cache + scratch buffers) must only ever be driven by one thread at a
//! time. The session store guarantees this with a per-session mutex;
//! [`ContextApi`] therefore only needs `Send`, not `Sync`. Model handles are
//! immutable once loaded and are shared freely (`Send + Sync`).
//!
//! ### Token type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are
//! logically non-negative.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::error::Result;
use crate::sampling::SamplingParams;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Hook invoked by the runtime once per tensor evaluation inside a decode
/// call. Installed at context creation; the decode path uses it to derive
/// caller-facing progress fractions.
pub type EvalHook = Arc<dyn Fn() + Send + Sync>;

/// Upper bound on the byte length of a single token piece. Longer pieces are
/// a runtime contract violation and are reported as conversion failures.
pub const MAX_PIECE_BYTES: usize = 16;

/// Static facts about a loaded model, as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    /// Total parameter count.
    pub n_params: u64,
    /// On-disk size in bytes.
    pub size: u64,
    /// Context length the model was trained with.
    pub n_ctx_train: i64,
}

/// Parameters for creating an inference context.
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    /// Context window in tokens. Zero selects the runtime default.
    pub context_size: u32,
    /// Decode batch size in tokens. Zero selects the runtime default.
    pub batch_size: u32,
    /// Flash attention toggle. Affects state-file compatibility, so the
    /// engine always creates contexts with it enabled.
    pub flash_attention: bool,
}

/// A decode call the runtime could not complete.
#[derive(Debug, Error)]
pub enum DecodeRejection {
    /// No free KV slot for the batch; the caller maps this to a context
    /// overflow.
    #[error("no KV cache slot for the batch")]
    KvSlotExhausted,
    /// Any other non-zero runtime status.
    #[error("runtime decode failed with status {0}")]
    Failed(i32),
}

/// One token of a decode batch: token id tagged with its absolute position
/// and whether logits should be computed for it. All batches are
/// single-sequence (sequence id 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: u32,
    pub logits: bool,
}

/// A bounded, reusable buffer of tokens submitted to the runtime in one
/// decode call. Reused across iterations by clearing the entry count rather
/// than reallocating.
#[derive(Debug)]
pub struct Batch {
    capacity: usize,
    entries: Vec<BatchEntry>,
}

impl Batch {
    /// Allocate a batch able to hold up to `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Batch {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append a token to the batch.
    ///
    /// # Returns
    /// The new number of tokens in the batch.
    ///
    /// # Panics
    /// If the batch is already full; callers chunk their work by
    /// [`ContextApi::batch_size`] before filling.
    pub fn push(&mut self, token: TokenId, pos: u32, logits: bool) -> usize {
        assert!(self.entries.len() < self.capacity, "batch overflow");
        self.entries.push(BatchEntry { token, pos, logits });
        self.entries.len()
    }

    /// Reset the token count, keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The filled entries, in submission order.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

/// Entry point into the tensor runtime: loading models.
pub trait Runtime: Send + Sync {
    /// Load a model from disk.
    ///
    /// `on_progress` receives fractions in `[0, 1]`; returning `false`
    /// aborts the load, which is then reported as a load failure.
    fn load_model(
        &self,
        path: &Path,
        on_progress: Option<&mut dyn FnMut(f32) -> bool>,
    ) -> Result<Arc<dyn ModelApi>>;
}

/// An immutable, loaded model. Shared between the registry and any live
/// session that was created from it; freed when the last reference drops.
pub trait ModelApi: Send + Sync {
    fn info(&self) -> ModelInfo;

    /// The model's end-of-stream token.
    fn eos_token(&self) -> TokenId;

    /// Convert text into a sequence of token IDs.
    ///
    /// `add_special` prepends the model's BOS-style specials;
    /// `parse_special` lets special-token text in the input map to special
    /// token IDs instead of being tokenized literally.
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>>;

    /// Convert a single token into its textual piece (at most
    /// [`MAX_PIECE_BYTES`] bytes). Failures are demoted to a replacement
    /// glyph during inference but fail tokenization-facing calls.
    fn token_piece(&self, token: TokenId) -> Result<String>;

    /// Create a fresh inference context (KV cache + scratch state).
    ///
    /// `eval_hook` is invoked by the runtime once per tensor evaluation
    /// inside every decode on this context.
    fn new_context(&self, params: &ContextParams, eval_hook: EvalHook)
        -> Result<Box<dyn ContextApi>>;

    /// Create a sampling state configured with `params` (including the
    /// optional grammar).
    fn new_sampler(&self, params: &SamplingParams) -> Result<Box<dyn SamplerApi>>;
}

/// A per-session inference context. Driven only while the owning session's
/// mutex is held.
pub trait ContextApi: Send {
    /// Context window in tokens.
    fn context_size(&self) -> usize;

    /// Maximum tokens per decode batch.
    fn batch_size(&self) -> usize;

    /// One forward pass over `batch`, extending the KV cache and computing
    /// logits for the flagged positions.
    fn decode(&mut self, batch: &Batch) -> std::result::Result<(), DecodeRejection>;

    /// Drop KV cache entries for sequence 0 in `[from, to)`; `None` means
    /// to the end of the cache.
    fn remove_kv_range(&mut self, from: usize, to: Option<usize>);

    /// Load a previously saved context state, returning the token sequence
    /// the state was built from. `max_tokens` bounds the returned sequence.
    fn load_state_file(&mut self, path: &Path, max_tokens: usize) -> Result<Vec<TokenId>>;

    /// Persist the context state along with the token sequence it
    /// materializes.
    fn save_state_file(&mut self, path: &Path, tokens: &[TokenId]) -> Result<()>;
}

/// A sampling state: repetition penalties, mirostat, grammar. Lifetime is
/// tied to the inference call that created it.
pub trait SamplerApi: Send {
    /// Sample the next token from the context's current logits.
    fn sample(&mut self, ctx: &mut dyn ContextApi) -> Result<TokenId>;

    /// Feed an emitted token back into the sampling state (penalty windows,
    /// grammar advancement).
    fn accept(&mut self, ctx: &mut dyn ContextApi, token: TokenId);

    /// Replace the grammar portion of the state in place.
    fn set_grammar(&mut self, grammar: &str) -> Result<()>;

    /// Reset the sampling state, keeping its configuration.
    fn reset(&mut self);
}
