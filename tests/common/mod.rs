//! Scriptable mock runtime shared by the integration tests.
//!
//! The mock implements the runtime traits with observable state: every
//! decode batch (tokens, positions, logits flags), KV-range removal,
//! accepted token and grammar swap is recorded, and each created context
//! exposes its simulated KV cache. The tokenizer maps one character to one
//! token (the character's code point), so prompts like `"AB"` tokenize to
//! `[65, 66]`.

// Each test binary uses a different slice of the mock.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use palaver::error::{Error, Result};
use palaver::runtime::{
    Batch, ContextApi, ContextParams, DecodeRejection, EvalHook, ModelApi, ModelInfo, Runtime,
    SamplerApi,
};
use palaver::sampling::SamplingParams;
use palaver::session::Clock;
use palaver::{Engine, EngineConfig, TokenId};

pub const EOS: TokenId = 2;

/// Default context window of mock contexts created with `context_size: 0`.
pub const DEFAULT_CTX: usize = 32;
/// Default batch size of mock contexts created with `batch_size: 0`.
pub const DEFAULT_BATCH: usize = 8;

/// Grammar string the mock sampler refuses at creation.
pub const BAD_GRAMMAR: &str = "<bad grammar>";
/// Grammar string the mock sampler refuses on a swap.
pub const REJECTED_GRAMMAR: &str = "<rejected grammar>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    pub tokens: Vec<TokenId>,
    pub positions: Vec<u32>,
    pub logits: Vec<bool>,
}

/// Shared observation log for everything the engine does to the runtime.
#[derive(Default)]
pub struct RecordLog {
    pub decodes: Mutex<Vec<RecordedBatch>>,
    pub kv_removals: Mutex<Vec<(usize, Option<usize>)>>,
    /// Simulated KV cache of every created context, in creation order.
    pub contexts: Mutex<Vec<Arc<Mutex<Vec<TokenId>>>>>,
    pub accepts: Mutex<Vec<TokenId>>,
    /// Grammar passed to each created sampler.
    pub sampler_grammars: Mutex<Vec<Option<String>>>,
    /// Grammars installed through set_grammar.
    pub grammar_swaps: Mutex<Vec<String>>,
}

impl RecordLog {
    pub fn decode_count(&self) -> usize {
        self.decodes.lock().unwrap().len()
    }

    pub fn decodes(&self) -> Vec<RecordedBatch> {
        self.decodes.lock().unwrap().clone()
    }

    pub fn kv_removals(&self) -> Vec<(usize, Option<usize>)> {
        self.kv_removals.lock().unwrap().clone()
    }

    pub fn kv_of(&self, context_index: usize) -> Vec<TokenId> {
        self.contexts.lock().unwrap()[context_index]
            .lock()
            .unwrap()
            .clone()
    }

    pub fn accepts(&self) -> Vec<TokenId> {
        self.accepts.lock().unwrap().clone()
    }

    pub fn grammar_swaps(&self) -> Vec<String> {
        self.grammar_swaps.lock().unwrap().clone()
    }

    pub fn sampler_grammars(&self) -> Vec<Option<String>> {
        self.sampler_grammars.lock().unwrap().clone()
    }
}

/// What the mock sampler emits.
#[derive(Clone)]
pub enum SamplerScript {
    /// Pop tokens from a shared queue; exhausting it is a sampling error.
    Scripted(Arc<Mutex<VecDeque<TokenId>>>),
    /// Emit `base`, `base + 1`, ... deterministically per sampler.
    Arithmetic { base: TokenId },
}

pub struct MockRuntime {
    pub log: Arc<RecordLog>,
    pub script: SamplerScript,
    /// Token → piece overrides; other tokens render as their code point.
    pub pieces: HashMap<TokenId, String>,
}

impl MockRuntime {
    pub fn new() -> Self {
        MockRuntime {
            log: Arc::new(RecordLog::default()),
            script: SamplerScript::Arithmetic { base: 100 },
            pieces: HashMap::new(),
        }
    }

    pub fn with_script(tokens: Vec<TokenId>) -> Self {
        let mut rt = Self::new();
        rt.script = SamplerScript::Scripted(Arc::new(Mutex::new(tokens.into())));
        rt
    }

    pub fn piece(mut self, token: TokenId, piece: &str) -> Self {
        self.pieces.insert(token, piece.to_owned());
        self
    }
}

impl Runtime for MockRuntime {
    fn load_model(
        &self,
        path: &Path,
        on_progress: Option<&mut dyn FnMut(f32) -> bool>,
    ) -> Result<Arc<dyn ModelApi>> {
        if let Some(cb) = on_progress {
            if !cb(0.5) {
                return Err(Error::ModelLoad("aborted by progress callback".into()));
            }
            cb(1.0);
        }
        if path.extension().is_some_and(|e| e == "missing") {
            return Err(Error::ModelLoad(format!("no such model: {}", path.display())));
        }
        Ok(Arc::new(MockModel {
            log: Arc::clone(&self.log),
            script: self.script.clone(),
            pieces: self.pieces.clone(),
        }))
    }
}

pub struct MockModel {
    log: Arc<RecordLog>,
    script: SamplerScript,
    pieces: HashMap<TokenId, String>,
}

impl ModelApi for MockModel {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            n_params: 7_000_000,
            size: 42,
            n_ctx_train: DEFAULT_CTX as i64,
        }
    }

    fn eos_token(&self) -> TokenId {
        EOS
    }

    fn tokenize(&self, text: &str, _add_special: bool, _parse_special: bool) -> Result<Vec<TokenId>> {
        if text.contains("<untok>") {
            return Err(Error::Tokenize("unmappable input".into()));
        }
        Ok(text.chars().map(|c| c as TokenId).collect())
    }

    fn token_piece(&self, token: TokenId) -> Result<String> {
        if let Some(piece) = self.pieces.get(&token) {
            return Ok(piece.clone());
        }
        u32::try_from(token)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .ok_or_else(|| Error::Tokenize(format!("no piece for token {token}")))
    }

    fn new_context(
        &self,
        params: &ContextParams,
        eval_hook: EvalHook,
    ) -> Result<Box<dyn ContextApi>> {
        let kv = Arc::new(Mutex::new(Vec::new()));
        self.log.contexts.lock().unwrap().push(Arc::clone(&kv));
        Ok(Box::new(MockContext {
            n_ctx: if params.context_size > 0 {
                params.context_size as usize
            } else {
                DEFAULT_CTX
            },
            n_batch: if params.batch_size > 0 {
                params.batch_size as usize
            } else {
                DEFAULT_BATCH
            },
            kv,
            hook: eval_hook,
            log: Arc::clone(&self.log),
        }))
    }

    fn new_sampler(&self, params: &SamplingParams) -> Result<Box<dyn SamplerApi>> {
        if params.grammar.as_deref() == Some(BAD_GRAMMAR) {
            return Err(Error::SamplingInit("mock rejects this grammar".into()));
        }
        self.log
            .sampler_grammars
            .lock()
            .unwrap()
            .push(params.grammar.clone());
        Ok(Box::new(MockSampler {
            script: self.script.clone(),
            emitted: 0,
            log: Arc::clone(&self.log),
        }))
    }
}

pub struct MockContext {
    n_ctx: usize,
    n_batch: usize,
    kv: Arc<Mutex<Vec<TokenId>>>,
    hook: EvalHook,
    log: Arc<RecordLog>,
}

impl ContextApi for MockContext {
    fn context_size(&self) -> usize {
        self.n_ctx
    }

    fn batch_size(&self) -> usize {
        self.n_batch
    }

    fn decode(&mut self, batch: &Batch) -> std::result::Result<(), DecodeRejection> {
        let mut kv = self.kv.lock().unwrap();
        if kv.len() + batch.len() > self.n_ctx {
            return Err(DecodeRejection::KvSlotExhausted);
        }
        for entry in batch.entries() {
            // The engine must only ever extend the cache contiguously.
            if entry.pos as usize != kv.len() {
                return Err(DecodeRejection::Failed(-13));
            }
            kv.push(entry.token);
        }
        drop(kv);

        self.log.decodes.lock().unwrap().push(RecordedBatch {
            tokens: batch.entries().iter().map(|e| e.token).collect(),
            positions: batch.entries().iter().map(|e| e.pos).collect(),
            logits: batch.entries().iter().map(|e| e.logits).collect(),
        });

        // Key + value evaluation passes, as the real runtime reports them.
        for _ in 0..2 * self.n_batch {
            (self.hook)();
        }

        Ok(())
    }

    fn remove_kv_range(&mut self, from: usize, to: Option<usize>) {
        self.log.kv_removals.lock().unwrap().push((from, to));
        let mut kv = self.kv.lock().unwrap();
        match to {
            None => kv.truncate(from),
            Some(to) => {
                let to = to.min(kv.len());
                if from < to {
                    kv.drain(from..to);
                }
            }
        }
    }

    fn load_state_file(&mut self, path: &Path, max_tokens: usize) -> Result<Vec<TokenId>> {
        let bytes =
            fs::read(path).map_err(|e| Error::State(format!("read {}: {e}", path.display())))?;
        let tokens: Vec<TokenId> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::State(format!("parse {}: {e}", path.display())))?;
        if tokens.len() > max_tokens {
            return Err(Error::State("state larger than the context".into()));
        }
        *self.kv.lock().unwrap() = tokens.clone();
        Ok(tokens)
    }

    fn save_state_file(&mut self, path: &Path, tokens: &[TokenId]) -> Result<()> {
        if path.to_string_lossy().contains("unwritable") {
            return Err(Error::State("mock refuses this path".into()));
        }
        let bytes = serde_json::to_vec(tokens).expect("token serialization");
        fs::write(path, bytes).map_err(|e| Error::State(format!("write {}: {e}", path.display())))
    }
}

pub struct MockSampler {
    script: SamplerScript,
    emitted: TokenId,
    log: Arc<RecordLog>,
}

impl SamplerApi for MockSampler {
    fn sample(&mut self, _ctx: &mut dyn ContextApi) -> Result<TokenId> {
        match &self.script {
            SamplerScript::Scripted(queue) => queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Sampling("sampler script exhausted".into())),
            SamplerScript::Arithmetic { base } => {
                let token = base + self.emitted;
                self.emitted += 1;
                Ok(token)
            }
        }
    }

    fn accept(&mut self, _ctx: &mut dyn ContextApi, token: TokenId) {
        self.log.accepts.lock().unwrap().push(token);
    }

    fn set_grammar(&mut self, grammar: &str) -> Result<()> {
        if grammar == REJECTED_GRAMMAR {
            return Err(Error::Grammar("mock rejects this grammar".into()));
        }
        self.log.grammar_swaps.lock().unwrap().push(grammar.to_owned());
        Ok(())
    }

    fn reset(&mut self) {}
}

/// Controllable clock for TTL tests.
pub struct MockClock {
    now_ms: AtomicU64,
}

impl MockClock {
    pub fn new() -> Arc<Self> {
        Arc::new(MockClock {
            now_ms: AtomicU64::new(1_700_000_000_000),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.now_ms.load(Ordering::Relaxed))
    }
}

/// An engine over a mock runtime, with handles on everything observable.
pub struct Fixture {
    pub engine: Engine,
    pub log: Arc<RecordLog>,
    pub clock: Arc<MockClock>,
}

pub fn fixture(config: EngineConfig) -> Fixture {
    fixture_with(MockRuntime::new(), config)
}

pub fn fixture_with(runtime: MockRuntime, config: EngineConfig) -> Fixture {
    let log = Arc::clone(&runtime.log);
    let clock = MockClock::new();
    let engine = Engine::with_clock(Arc::new(runtime), config, clock.clone());
    Fixture { engine, log, clock }
}

/// Load the mock model under id `"m"` and return its info.
pub fn load_default_model(fixture: &Fixture) -> ModelInfo {
    fixture
        .engine
        .load_model(Path::new("model.gguf"), "m", None)
        .expect("mock model load")
}
