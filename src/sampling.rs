//! Sampling state owned by one inference call.
//!
//! [`SamplingParams`] is the runtime-facing parameter block (penalty windows,
//! nucleus/typical filtering, mirostat, optional grammar). [`Sampler`] wraps
//! the runtime's sampling state behind the error taxonomy the inference loop
//! reports: creation failures are `SamplingInit`, per-token failures are
//! `Sampling`, grammar swaps that the runtime rejects are `Grammar`.

use crate::error::{Error, Result};
use crate::runtime::{ContextApi, ModelApi, SamplerApi, TokenId};

/// Parameters for creating a runtime sampling state.
///
/// Field semantics follow the runtime's conventions: `1.0` disables the
/// probability filters, `temp <= 0` samples greedily, `penalty_last_n = -1`
/// penalizes over the whole context.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub n_prev: i32,
    pub n_probs: i32,
    pub min_keep: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub temp: f32,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_nl: bool,
    pub seed: u32,
    /// Grammar constraining sampling to a formal language, if any.
    pub grammar: Option<String>,
}

/// Wrapper over the runtime sampling state created for one inference call.
pub(crate) struct Sampler {
    inner: Box<dyn SamplerApi>,
}

impl Sampler {
    pub(crate) fn new(model: &dyn ModelApi, params: &SamplingParams) -> Result<Self> {
        let inner = model
            .new_sampler(params)
            .map_err(|e| Error::SamplingInit(e.to_string()))?;
        Ok(Sampler { inner })
    }

    pub(crate) fn sample(&mut self, ctx: &mut dyn ContextApi) -> Result<TokenId> {
        self.inner
            .sample(ctx)
            .map_err(|e| Error::Sampling(e.to_string()))
    }

    pub(crate) fn accept(&mut self, ctx: &mut dyn ContextApi, token: TokenId) {
        self.inner.accept(ctx, token);
    }

    /// Recreate the grammar portion of the state in place.
    pub(crate) fn set_grammar(&mut self, grammar: &str) -> Result<()> {
        self.inner
            .set_grammar(grammar)
            .map_err(|e| Error::Grammar(e.to_string()))
    }
}
