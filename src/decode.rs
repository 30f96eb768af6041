//! Prefix-reuse decoding.
//!
//! Bringing a session's KV cache to a target prompt costs one forward pass
//! per token that is *not* already cached. The decoder computes the longest
//! common token prefix of the session's current prompt and the target, drops
//! the stale cache suffix, and re-decodes only the remainder in
//! batch-size-bounded chunks, reporting progress through the session's eval
//! hook slot.
//!
//! After a successful call the session's prompt equals the target and the
//! KV cache materializes exactly that sequence.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::runtime::{Batch, DecodeRejection, TokenId};
use crate::session::{Session, SessionHandle};
use crate::ProgressCallback;

/// Re-decode `target` into the session's context, reusing the cached prefix.
///
/// Progress is reported per tensor evaluation: the runtime fires the
/// session's eval hook twice per batched token (key and value passes), and
/// the installed closure maps call counts to a fraction in `[0, 1]` across
/// all batches.
pub(crate) fn decode_session(
    handle: &SessionHandle,
    session: &mut Session,
    target: Vec<TokenId>,
    on_progress: Option<ProgressCallback>,
) -> Result<usize> {
    let ctx_size = session.context.context_size();
    if target.len() > ctx_size {
        error!(
            given = target.len(),
            max = ctx_size,
            "prompt does not fit the context"
        );
        return Err(Error::ContextOverflow {
            max: ctx_size,
            given: target.len(),
        });
    }

    let n_match = common_prefix(&session.prompt, &target);
    debug!(
        n_target = target.len(),
        n_session = session.prompt.len(),
        n_match,
        "prefix match"
    );

    // Drop the cache suffix that no longer matches.
    session.context.remove_kv_range(n_match, None);

    if n_match == target.len() {
        debug!("prompt already fully decoded");
        session.prompt = target;
        handle.touch();
        return Ok(session.prompt.len());
    }

    let batch_size = session.context.batch_size().max(1);
    let pending = target.len() - n_match;
    let n_batches = pending.div_ceil(batch_size);
    // Two eval-hook calls per batched token (key + value); `| 1` keeps the
    // divisor non-zero in degenerate configurations.
    let max_calls = (2 * batch_size) | 1;

    let shared_cb = on_progress.map(|cb| Arc::new(Mutex::new(cb)));
    let mut batch = Batch::new(batch_size);
    let started = Instant::now();

    let Session {
        context, progress, ..
    } = session;

    for (batch_index, chunk) in target[n_match..].chunks(batch_size).enumerate() {
        batch.clear();
        let base = n_match + batch_index * batch_size;
        for (offset, &token) in chunk.iter().enumerate() {
            let pos = base + offset;
            // Only the final target position needs logits; it becomes the
            // sampling head.
            batch.push(token, pos as u32, pos + 1 == target.len());
        }

        debug!(
            batch = batch_index + 1,
            of = n_batches,
            tokens = batch.len(),
            "decoding batch"
        );

        let _hook = shared_cb.as_ref().map(|cb| {
            let cb = Arc::clone(cb);
            let mut call = 0usize;
            progress.install(Box::new(move || {
                call += 1;
                let fraction = batch_index as f32 / n_batches as f32
                    + (call as f32 / max_calls as f32) / n_batches as f32;
                (*cb.lock().unwrap())(fraction);
            }))
        });

        context.decode(&batch).map_err(|rejection| match rejection {
            DecodeRejection::KvSlotExhausted => Error::ContextOverflow {
                max: ctx_size,
                given: target.len(),
            },
            DecodeRejection::Failed(code) => Error::Decode(code),
        })?;
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        tokens = pending,
        elapsed_s = elapsed,
        tok_per_s = pending as f64 / elapsed.max(f64::EPSILON),
        "decoded prompt suffix"
    );

    session.prompt = target;
    handle.touch();
    Ok(session.prompt.len())
}

/// Prime a freshly created session with its initial prompt.
///
/// If `state_file` names an existing file, try to install the pre-baked KV
/// cache from it; a load failure is non-fatal (the file may be stale or
/// corrupt) and falls back to tokenize + decode. After a fresh decode the
/// state is persisted to `state_file` if it did not already exist; a save
/// failure is logged, never reported.
pub(crate) fn prime_session(
    handle: &SessionHandle,
    session: &mut Session,
    initial_prompt: &str,
    state_file: Option<&Path>,
    mut on_progress: Option<ProgressCallback>,
) -> Result<()> {
    let mut state_loaded = false;
    let mut file_existed = false;

    if let Some(path) = state_file {
        file_existed = path.exists();
        if file_existed {
            debug!(path = %path.display(), "loading session state");
            if let Some(cb) = on_progress.as_mut() {
                cb(0.0);
            }
            let max_tokens = session.context.context_size();
            match session.context.load_state_file(path, max_tokens) {
                Ok(tokens) => {
                    if let Some(cb) = on_progress.as_mut() {
                        cb(1.0);
                    }
                    info!(path = %path.display(), tokens = tokens.len(), "session state loaded");
                    session.prompt = tokens;
                    handle.touch();
                    state_loaded = true;
                }
                Err(e) => {
                    // Not fatal: fall back to a fresh decode.
                    error!(path = %path.display(), error = %e, "failed to load session state");
                }
            }
        }
    }

    if !state_loaded {
        let tokens = session.model.api.tokenize(initial_prompt, false, false)?;
        decode_session(handle, session, tokens, on_progress)?;

        if let Some(path) = state_file {
            if !file_existed {
                match session.context.save_state_file(path, &session.prompt) {
                    Ok(()) => info!(path = %path.display(), "session state saved"),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "failed to save session state")
                    }
                }
            }
        }
    }

    Ok(())
}

/// Length of the longest common prefix of two token sequences.
fn common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::common_prefix;

    #[test]
    fn common_prefix_lengths() {
        assert_eq!(common_prefix(&[], &[]), 0);
        assert_eq!(common_prefix(&[1, 2], &[]), 0);
        assert_eq!(common_prefix(&[1, 2], &[1, 2, 3]), 2);
        assert_eq!(common_prefix(&[1, 2, 3], &[1, 2]), 2);
        assert_eq!(common_prefix(&[1, 9, 3], &[1, 2, 3]), 1);
        assert_eq!(common_prefix(&[5], &[5]), 1);
    }
}
