//! Process-wide registry of loaded models.
//!
//! Maps caller-chosen model ids to loaded runtime handles plus a memoized
//! content hash. Model handles are immutable once loaded and shared between
//! the registry and any live session, so a model stays functional for its
//! sessions even after `unload` removes the registry entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hash;
use crate::runtime::{ModelApi, ModelInfo, Runtime};

/// A registered model: its source path, the runtime handle, and the
/// memoized 64-bit content hash (0 = not yet computed).
pub struct ModelEntry {
    pub id: String,
    pub path: PathBuf,
    pub api: Arc<dyn ModelApi>,
    /// Memoized content hash. Written at most once with the stable positive
    /// digest; a relaxed atomic is enough since readers either see 0 and
    /// recompute, or the final value.
    hash: AtomicU64,
}

pub struct ModelRegistry {
    runtime: Arc<dyn Runtime>,
    models: Mutex<HashMap<String, Arc<ModelEntry>>>,
}

impl ModelRegistry {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        ModelRegistry {
            runtime,
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Load a model from `path` and register it under `id`.
    ///
    /// Holds the registry mutex for the duration of the load. If a model
    /// with the same id already exists, fails with
    /// [`Error::DuplicateModel`], which still carries the existing model's
    /// info.
    ///
    /// `on_progress` receives fractions in `[0, 1]`; returning `false`
    /// aborts the load.
    pub fn load(
        &self,
        path: &Path,
        id: &str,
        on_progress: Option<&mut dyn FnMut(f32) -> bool>,
    ) -> Result<ModelInfo> {
        debug!(model = id, path = %path.display(), "loading model");

        let mut models = self.models.lock().unwrap();

        if let Some(existing) = models.get(id) {
            return Err(Error::DuplicateModel {
                id: id.to_owned(),
                info: existing.api.info(),
            });
        }

        let api = self.runtime.load_model(path, on_progress)?;
        let info = api.info();

        models.insert(
            id.to_owned(),
            Arc::new(ModelEntry {
                id: id.to_owned(),
                path: path.to_owned(),
                api,
                hash: AtomicU64::new(0),
            }),
        );

        info!(
            model = id,
            n_params = info.n_params,
            size = info.size,
            n_ctx_train = info.n_ctx_train,
            "model loaded"
        );

        Ok(info)
    }

    /// Remove the registry entry for `id`. The runtime handle is freed once
    /// the last referencing session is destroyed.
    pub fn unload(&self, id: &str) -> Result<()> {
        let mut models = self.models.lock().unwrap();
        match models.remove(id) {
            Some(_) => {
                info!(model = id, "model unloaded");
                Ok(())
            }
            None => Err(Error::ModelNotFound(id.to_owned())),
        }
    }

    /// Look up a registered model.
    pub fn entry(&self, id: &str) -> Result<Arc<ModelEntry>> {
        let models = self.models.lock().unwrap();
        models
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ModelNotFound(id.to_owned()))
    }

    /// Content hash of the model registered under `id`, memoized after the
    /// first call.
    ///
    /// The registry lock is released before the hash runs: hashing streams
    /// the whole model file and must not stall loads, and the memo slot is
    /// an atomic so the unlocked store is safe.
    pub fn hash_by_id(&self, id: &str) -> Result<u64> {
        let entry = self.entry(id)?;

        let memoized = entry.hash.load(Ordering::Relaxed);
        if memoized != 0 {
            debug!(model = id, hash = memoized, "returning memoized hash");
            return Ok(memoized);
        }

        let digest = hash::file_hash(&entry.path)
            .map_err(|e| Error::ModelLoad(format!("failed to hash {}: {e}", entry.path.display())))?;
        debug!(model = id, hash = digest, "hashed model file");

        if digest > 0 {
            entry.hash.store(digest, Ordering::Relaxed);
        }

        Ok(digest)
    }

    /// Token count of `text` under the tokenizer of model `id`, without
    /// adding special tokens.
    pub fn token_length(&self, id: &str, text: &str) -> Result<usize> {
        let entry = self.entry(id)?;
        let tokens = entry.api.tokenize(text, false, false).map_err(|e| {
            warn!(model = id, error = %e, "failed to tokenize prompt");
            e
        })?;
        Ok(tokens.len())
    }
}
