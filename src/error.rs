//! Error types for the palaver crate.

use thiserror::Error;

use crate::runtime::ModelInfo;
use crate::session::SessionId;

/// Top-level error type for all engine operations.
///
/// Every fallible path in the crate funnels into this enum; translation to
/// the negative integer codes of the C ABI happens only in [`crate::abi`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("maximum number of sessions reached")]
    CapacityReached,

    /// A model with this id is already loaded. Carries the existing model's
    /// info so callers (and the ABI) can still report it.
    #[error("model already loaded: {id}")]
    DuplicateModel { id: String, info: ModelInfo },

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("context creation failed")]
    ContextCreation,

    #[error("context overflow (max: {max}, given: {given})")]
    ContextOverflow { max: usize, given: usize },

    /// The runtime rejected a decode call with a non-zero status code.
    #[error("decode failed with runtime status {0}")]
    Decode(i32),

    #[error("sampler initialization failed: {0}")]
    SamplingInit(String),

    #[error("sampling failed: {0}")]
    Sampling(String),

    #[error("grammar rejected: {0}")]
    Grammar(String),

    #[error("grammar script failed: {0}")]
    GrammarScript(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    /// Session state file was rejected by the runtime. Never surfaced across
    /// the ABI; state load/save failures are demoted to logs.
    #[error("state file rejected: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, Error>;
