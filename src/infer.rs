//! The token sampling loop.
//!
//! One `infer` call brings the session's KV cache to the end of the prompt,
//! then alternates sampling and single-token decodes until a stop condition:
//! the evaluation budget, an end-of-stream token, a stop sequence at the
//! tail of generation, or the caller's callback returning `false`.
//!
//! End-of-stream is programmable: with a grammar script attached, the
//! script's `on_eos` hook decides whether to stop or to install a new
//! grammar and keep generating. In the latter case the EOS token itself is
//! *not* accepted into the sampler and *not* appended to the prompt, so it
//! never poisons subsequent sampling.
//!
//! Stop sequences are yielded to the caller before the stop fires; trimming
//! the output is the consumer's contract. Their tokens also stay in the
//! session prompt (and the already-decoded part in the KV cache) unless
//! [`InferenceOptions::trim_stop_sequences`] is set.

use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::decode::decode_session;
use crate::error::{Error, Result};
use crate::grammar::GrammarHost;
use crate::runtime::{Batch, DecodeRejection, TokenId};
use crate::sampling::{Sampler, SamplingParams};
use crate::session::{Session, SessionHandle};
use crate::ProgressCallback;

/// Emitted when a token cannot be converted to text.
const REPLACEMENT_GLYPH: &str = "\u{FFFD}";

/// Knobs for one inference call.
///
/// Scalar defaults mirror the runtime's sampling defaults and are part of
/// the ABI contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceOptions {
    /// Number of previous tokens the sampler remembers.
    pub n_prev: i32,
    /// If greater than 0, output probabilities of the top `n_probs` tokens.
    pub n_probs: i32,
    /// 0 = disabled; otherwise samplers return at least this many tokens.
    pub min_keep: i32,
    /// <= 0 to use the full vocabulary.
    pub top_k: i32,
    /// 1.0 = disabled.
    pub top_p: f32,
    /// 0.0 = disabled.
    pub min_p: f32,
    /// 1.0 = disabled.
    pub tfs_z: f32,
    /// 1.0 = disabled.
    pub typical_p: f32,
    /// <= 0.0 samples greedily.
    pub temp: f32,
    /// 0.0 = disabled.
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    /// Last n tokens to penalize (0 = disabled, -1 = context size).
    pub penalty_last_n: i32,
    /// 1.0 = disabled.
    pub penalty_repeat: f32,
    /// 0.0 = disabled.
    pub penalty_freq: f32,
    /// 0.0 = disabled.
    pub penalty_present: f32,
    /// 0 = disabled, 1 = mirostat, 2 = mirostat 2.0.
    pub mirostat: i32,
    /// Target entropy.
    pub mirostat_tau: f32,
    /// Learning rate.
    pub mirostat_eta: f32,
    /// Consider newlines a repeatable token.
    pub penalize_nl: bool,
    /// Sampler RNG seed.
    pub seed: u32,
    /// Static grammar. Mutually exclusive with `grammar_script`.
    pub grammar: Option<String>,
    /// Token patterns that end generation once matched at the tail.
    pub stop_sequences: Vec<String>,
    /// Lua grammar script (see [`crate::grammar`]). Mutually exclusive with
    /// `grammar`.
    pub grammar_script: Option<String>,
    /// Remove a matched stop sequence from the prompt and KV cache instead
    /// of leaving it in. Not part of the C ABI.
    pub trim_stop_sequences: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        InferenceOptions {
            n_prev: 64,
            n_probs: 0,
            min_keep: 0,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            tfs_z: 1.0,
            typical_p: 1.0,
            temp: 0.80,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.10,
            penalize_nl: false,
            seed: 0,
            grammar: None,
            stop_sequences: Vec::new(),
            grammar_script: None,
            trim_stop_sequences: false,
        }
    }
}

impl InferenceOptions {
    fn sampling_params(&self, grammar: Option<String>) -> SamplingParams {
        SamplingParams {
            n_prev: self.n_prev,
            n_probs: self.n_probs,
            min_keep: self.min_keep,
            top_k: self.top_k,
            top_p: self.top_p,
            min_p: self.min_p,
            tfs_z: self.tfs_z,
            typical_p: self.typical_p,
            temp: self.temp,
            dynatemp_range: self.dynatemp_range,
            dynatemp_exponent: self.dynatemp_exponent,
            penalty_last_n: self.penalty_last_n,
            penalty_repeat: self.penalty_repeat,
            penalty_freq: self.penalty_freq,
            penalty_present: self.penalty_present,
            mirostat: self.mirostat,
            mirostat_tau: self.mirostat_tau,
            mirostat_eta: self.mirostat_eta,
            penalize_nl: self.penalize_nl,
            seed: self.seed,
            grammar,
        }
    }
}

/// Generate up to `n_eval` tokens, feeding each piece to `on_token`.
///
/// `prompt` is the *full* target prompt; `None` continues from the session's
/// current prompt. Returns the session prompt length after generation.
pub(crate) fn infer_session(
    handle: &SessionHandle,
    session: &mut Session,
    prompt: Option<&str>,
    n_eval: usize,
    options: &InferenceOptions,
    decode_progress: Option<ProgressCallback>,
    on_token: &mut dyn FnMut(&str) -> bool,
) -> Result<usize> {
    if options.grammar.is_some() && options.grammar_script.is_some() {
        return Err(Error::Grammar(
            "grammar and grammar_script are mutually exclusive".into(),
        ));
    }

    // A grammar script supplies the working grammar through start(); its
    // on_eos hook (if defined) takes over end-of-stream handling below.
    let host = options
        .grammar_script
        .as_deref()
        .map(GrammarHost::new)
        .transpose()?;
    let grammar = match (&options.grammar, &host) {
        (Some(grammar), _) => Some(grammar.clone()),
        (None, Some(host)) => Some(host.start()?),
        (None, None) => None,
    };

    let params = options.sampling_params(grammar);
    debug!(?params, "initializing sampler");
    let mut sampler = Sampler::new(session.model.api.as_ref(), &params)?;

    // Stop sequences match on token patterns, tokenized the same way as
    // prompt text.
    let stop_patterns = options
        .stop_sequences
        .iter()
        .map(|s| {
            let tokens = session.model.api.tokenize(s, false, true)?;
            debug!(stop = %s, ?tokens, "stop sequence");
            Ok(tokens)
        })
        .collect::<Result<Vec<Vec<TokenId>>>>()?;

    // Bring the KV cache to end-of-prompt.
    let target = match prompt {
        Some(text) => session.model.api.tokenize(text, false, true)?,
        None => session.prompt.clone(),
    };
    decode_session(handle, session, target, decode_progress)?;

    // Single-token reusable batch; reloaded with each sampled token.
    let mut batch = Batch::new(1);
    if let Some(&last) = session.prompt.last() {
        batch.push(last, (session.prompt.len() - 1) as u32, true);
    }

    let eos = session.model.api.eos_token();
    let mut generated: Vec<TokenId> = Vec::new();
    // Textual output since the last grammar switch; only feeds on_eos.
    let mut output = String::new();
    let started = Instant::now();

    while generated.len() < n_eval {
        let next = sampler.sample(session.context.as_mut())?;

        if next == eos {
            match host.as_ref().filter(|h| h.has_on_eos()) {
                Some(host) => {
                    info!(output = %output, "end of stream, consulting script");
                    match host.on_eos(&output)? {
                        Some(new_grammar) => {
                            sampler.set_grammar(&new_grammar)?;
                            debug!("installed new grammar");
                            output.clear();
                            // The EOS token is dropped on the floor: not
                            // accepted, not appended, not decoded.
                            continue;
                        }
                        None => {
                            info!("stop: on_eos returned nil");
                            break;
                        }
                    }
                }
                None => {
                    info!("stop: end-of-stream token");
                    break;
                }
            }
        }

        sampler.accept(session.context.as_mut(), next);
        generated.push(next);
        session.prompt.push(next);

        let piece = session.model.api.token_piece(next).unwrap_or_else(|_| {
            warn!(token = next, "failed to convert token to piece");
            REPLACEMENT_GLYPH.to_owned()
        });

        if !on_token(&piece) {
            info!("stop: inference callback returned false");
            break;
        }

        if let Some(pattern) = stop_patterns.iter().find(|p| generated.ends_with(p.as_slice())) {
            info!(?pattern, "stop: sequence found");
            if options.trim_stop_sequences {
                let keep = session.prompt.len() - pattern.len();
                session.context.remove_kv_range(keep, None);
                session.prompt.truncate(keep);
            }
            break;
        }

        output.push_str(&piece);

        batch.clear();
        batch.push(next, (session.prompt.len() - 1) as u32, true);
        match session.context.decode(&batch) {
            Ok(()) => {}
            Err(DecodeRejection::KvSlotExhausted) => {
                return Err(Error::ContextOverflow {
                    max: session.context.context_size(),
                    given: session.prompt.len(),
                });
            }
            Err(DecodeRejection::Failed(code)) => {
                warn!(code, "failed to decode sampled token");
                return Err(Error::Decode(code));
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        tokens = generated.len(),
        elapsed_s = elapsed,
        tok_per_s = generated.len() as f64 / elapsed.max(f64::EPSILON),
        "inference finished"
    );

    handle.touch();
    Ok(session.prompt.len())
}
