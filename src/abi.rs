//! C ABI surface.
//!
//! The Rust core is an explicit [`Engine`] handle; the ABI preserves the
//! traditional illusion of global state by keeping a single engine in a
//! process-wide slot, configured once by [`palaver_init`]. The embedding
//! application installs the tensor runtime with [`install_runtime`] before
//! calling `palaver_init`.
//!
//! Errors cross the boundary as the documented negative integer codes; the
//! translation lives in the per-entry-point `*_code` functions at the bottom
//! of this module. All callbacks run synchronously on the calling thread
//! while it blocks in the call.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::infer::InferenceOptions;
use crate::runtime::{ModelInfo, Runtime};
use crate::{CreateParams, Engine, EngineConfig, ProgressCallback, SessionId};

static RUNTIME: OnceCell<Arc<dyn Runtime>> = OnceCell::new();
static ENGINE: OnceCell<Engine> = OnceCell::new();

/// Install the tensor runtime the ABI engine will be built over. Must be
/// called (from Rust, by the embedding backend) before [`palaver_init`].
/// Returns `false` if a runtime was already installed.
pub fn install_runtime(runtime: Arc<dyn Runtime>) -> bool {
    RUNTIME.set(runtime).is_ok()
}

fn engine() -> Option<&'static Engine> {
    ENGINE.get()
}

/// Load progress callback: return `true` to continue, `false` to abort.
pub type PalaverLoadProgress = Option<unsafe extern "C" fn(progress: f32, user_data: *mut c_void) -> bool>;

/// Decode progress callback.
pub type PalaverProgress = Option<unsafe extern "C" fn(progress: f32, user_data: *mut c_void)>;

/// Inference callback: receives each generated piece; return `true` to
/// continue, `false` to stop.
pub type PalaverInferenceCallback =
    Option<unsafe extern "C" fn(piece: *const c_char, user_data: *mut c_void) -> bool>;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PalaverModelInfo {
    pub n_params: u64,
    pub size: u64,
    pub n_ctx_train: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PalaverInferenceOptions {
    pub n_prev: c_int,
    pub n_probs: c_int,
    pub min_keep: c_int,
    pub top_k: c_int,
    pub top_p: f32,
    pub min_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub temp: f32,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub penalty_last_n: c_int,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub mirostat: c_int,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub penalize_nl: bool,
    pub seed: c_uint,
    pub grammar: *const c_char,
    pub stop_sequences_len: c_uint,
    pub stop_sequences: *const *const c_char,
    pub grammar_script: *const c_char,
}

/// The documented option defaults.
#[no_mangle]
pub extern "C" fn palaver_gpt_inference_options_default() -> PalaverInferenceOptions {
    let defaults = InferenceOptions::default();
    PalaverInferenceOptions {
        n_prev: defaults.n_prev,
        n_probs: defaults.n_probs,
        min_keep: defaults.min_keep,
        top_k: defaults.top_k,
        top_p: defaults.top_p,
        min_p: defaults.min_p,
        tfs_z: defaults.tfs_z,
        typical_p: defaults.typical_p,
        temp: defaults.temp,
        dynatemp_range: defaults.dynatemp_range,
        dynatemp_exponent: defaults.dynatemp_exponent,
        penalty_last_n: defaults.penalty_last_n,
        penalty_repeat: defaults.penalty_repeat,
        penalty_freq: defaults.penalty_freq,
        penalty_present: defaults.penalty_present,
        mirostat: defaults.mirostat,
        mirostat_tau: defaults.mirostat_tau,
        mirostat_eta: defaults.mirostat_eta,
        penalize_nl: defaults.penalize_nl,
        seed: defaults.seed,
        grammar: std::ptr::null(),
        stop_sequences_len: 0,
        stop_sequences: std::ptr::null(),
        grammar_script: std::ptr::null(),
    }
}

/// Initialize the process-wide engine. Must be called once, after
/// [`install_runtime`], before any other entry point.
#[no_mangle]
pub extern "C" fn palaver_init(gpt_sessions_ttl: c_uint, gpt_sessions_max: c_uint) {
    let Some(runtime) = RUNTIME.get() else {
        error!("palaver_init called before a runtime was installed");
        return;
    };
    let config = EngineConfig {
        session_ttl_secs: gpt_sessions_ttl,
        max_sessions: gpt_sessions_max,
    };
    if ENGINE.set(Engine::new(Arc::clone(runtime), config)).is_err() {
        warn!("palaver_init called twice; keeping the first configuration");
    } else {
        info!("initialized");
    }
}

/// # Safety
/// `model_path` and `model_id` must be valid NUL-terminated strings;
/// `model_info` must be valid for writes or null.
#[no_mangle]
pub unsafe extern "C" fn palaver_model_load(
    model_path: *const c_char,
    model_id: *const c_char,
    progress_callback: PalaverLoadProgress,
    progress_callback_user_data: *mut c_void,
    model_info: *mut PalaverModelInfo,
) -> c_int {
    let Some(engine) = engine() else { return -2 };
    let (Some(path), Some(id)) = (cstr(model_path), cstr(model_id)) else {
        return -2;
    };

    let mut forward = progress_callback.map(|cb| {
        move |fraction: f32| -> bool { unsafe { cb(fraction, progress_callback_user_data) } }
    });

    match engine.load_model(
        Path::new(path),
        id,
        forward.as_mut().map(|f| f as &mut dyn FnMut(f32) -> bool),
    ) {
        Ok(info) => {
            write_info(model_info, info);
            0
        }
        Err(Error::DuplicateModel { info, .. }) => {
            write_info(model_info, info);
            -1
        }
        Err(_) => -2,
    }
}

/// # Safety
/// `model_id` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn palaver_model_unload(model_id: *const c_char) -> c_int {
    let Some(engine) = engine() else { return -1 };
    let Some(id) = cstr(model_id) else { return -1 };
    match engine.unload_model(id) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Memoized content hash of a loaded model; `u64::MAX` on error.
///
/// # Safety
/// `model_id` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn palaver_model_get_hash_by_id(model_id: *const c_char) -> u64 {
    let Some(engine) = engine() else { return u64::MAX };
    let Some(id) = cstr(model_id) else { return u64::MAX };
    engine.model_hash(id).unwrap_or(u64::MAX)
}

/// Content hash of an arbitrary model file; never memoized. `u64::MAX` on
/// error.
///
/// # Safety
/// `model_path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn palaver_model_get_hash_by_path(model_path: *const c_char) -> u64 {
    let Some(path) = cstr(model_path) else { return u64::MAX };
    crate::hash::file_hash(Path::new(path)).unwrap_or(u64::MAX)
}

/// # Safety
/// `model_id` and `prompt` must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn palaver_gpt_token_length(
    model_id: *const c_char,
    prompt: *const c_char,
) -> c_int {
    let Some(engine) = engine() else { return -1 };
    let (Some(id), Some(text)) = (cstr(model_id), cstr(prompt)) else {
        return -2;
    };
    match engine.token_length(id, text) {
        Ok(n) => n as c_int,
        Err(Error::ModelNotFound(_)) => -1,
        Err(_) => -2,
    }
}

/// # Safety
/// String arguments must be valid NUL-terminated strings or null where
/// documented optional.
#[no_mangle]
pub unsafe extern "C" fn palaver_gpt_create(
    model_id: *const c_char,
    context_size: c_uint,
    batch_size: c_uint,
    initial_prompt: *const c_char,
    state_file_path: *const c_char,
    progress_callback: PalaverProgress,
    progress_callback_user_data: *mut c_void,
) -> c_int {
    let Some(engine) = engine() else { return -100 };
    let Some(id) = cstr(model_id) else { return -1 };
    let initial_prompt = cstr(initial_prompt);
    let state_file = cstr(state_file_path).map(Path::new);

    match engine.create_session(CreateParams {
        model_id: id,
        context_size,
        batch_size,
        initial_prompt,
        state_file,
        on_progress: progress(progress_callback, progress_callback_user_data),
    }) {
        Ok(session_id) => session_id as c_int,
        Err(e) => create_code(&e),
    }
}

/// # Safety
/// `prompt` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn palaver_gpt_decode(
    session_id: c_uint,
    prompt: *const c_char,
    progress_callback: PalaverProgress,
    progress_callback_user_data: *mut c_void,
) -> c_int {
    let Some(engine) = engine() else { return -100 };
    let Some(text) = cstr(prompt) else { return -100 };

    match engine.decode(
        session_id as SessionId,
        text,
        progress(progress_callback, progress_callback_user_data),
    ) {
        Ok(len) => len as c_int,
        Err(e) => decode_code(&e),
    }
}

/// # Safety
/// `options` pointers must be valid; `prompt` may be null to continue from
/// the session's current prompt.
#[no_mangle]
pub unsafe extern "C" fn palaver_gpt_infer(
    session_id: c_uint,
    prompt: *const c_char,
    n_eval: c_uint,
    options: PalaverInferenceOptions,
    decode_progress_callback: PalaverProgress,
    decode_progress_callback_user_data: *mut c_void,
    inference_callback: PalaverInferenceCallback,
    inference_callback_user_data: *mut c_void,
) -> c_int {
    let Some(engine) = engine() else { return -100 };
    let prompt = cstr(prompt);
    let options = convert_options(&options);

    let mut on_token = |piece: &str| -> bool {
        match inference_callback {
            Some(cb) => {
                let piece = CString::new(piece).unwrap_or_default();
                unsafe { cb(piece.as_ptr(), inference_callback_user_data) }
            }
            None => true,
        }
    };

    match engine.infer(
        session_id as SessionId,
        prompt,
        n_eval as usize,
        &options,
        progress(decode_progress_callback, decode_progress_callback_user_data),
        &mut on_token,
    ) {
        Ok(len) => len as c_int,
        Err(e) => infer_code(&e),
    }
}

#[no_mangle]
pub extern "C" fn palaver_gpt_reset(session_id: c_uint) -> c_int {
    let Some(engine) = engine() else { return -100 };
    match engine.reset(session_id as SessionId) {
        Ok(len) => len as c_int,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn palaver_gpt_destroy(session_id: c_uint) -> c_int {
    let Some(engine) = engine() else { return -100 };
    match engine.destroy_session(session_id as SessionId) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

// ----- plumbing -------------------------------------------------------------

/// Raw user-data pointer made movable into the `Send` progress closure. The
/// callback only ever runs on the thread blocked in the ABI call, so the
/// pointer never actually crosses threads.
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}

fn progress(cb: PalaverProgress, user_data: *mut c_void) -> Option<ProgressCallback> {
    cb.map(|cb| {
        let user_data = SendPtr(user_data);
        Box::new(move |fraction: f32| {
            let user_data = &user_data;
            unsafe { cb(fraction, user_data.0) }
        }) as ProgressCallback
    })
}

unsafe fn cstr<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn write_info(out: *mut PalaverModelInfo, info: ModelInfo) {
    if out.is_null() {
        return;
    }
    unsafe {
        *out = PalaverModelInfo {
            n_params: info.n_params,
            size: info.size,
            n_ctx_train: info.n_ctx_train,
        };
    }
}

unsafe fn convert_options(options: &PalaverInferenceOptions) -> InferenceOptions {
    let mut converted = InferenceOptions {
        n_prev: options.n_prev,
        n_probs: options.n_probs,
        min_keep: options.min_keep,
        top_k: options.top_k,
        top_p: options.top_p,
        min_p: options.min_p,
        tfs_z: options.tfs_z,
        typical_p: options.typical_p,
        temp: options.temp,
        dynatemp_range: options.dynatemp_range,
        dynatemp_exponent: options.dynatemp_exponent,
        penalty_last_n: options.penalty_last_n,
        penalty_repeat: options.penalty_repeat,
        penalty_freq: options.penalty_freq,
        penalty_present: options.penalty_present,
        mirostat: options.mirostat,
        mirostat_tau: options.mirostat_tau,
        mirostat_eta: options.mirostat_eta,
        penalize_nl: options.penalize_nl,
        seed: options.seed,
        ..InferenceOptions::default()
    };

    converted.grammar = cstr(options.grammar).map(str::to_owned);
    converted.grammar_script = cstr(options.grammar_script).map(str::to_owned);

    if !options.stop_sequences.is_null() {
        let ptrs =
            std::slice::from_raw_parts(options.stop_sequences, options.stop_sequences_len as usize);
        converted.stop_sequences = ptrs
            .iter()
            .filter_map(|&p| cstr(p).map(str::to_owned))
            .collect();
    }

    converted
}

// ----- error translation ----------------------------------------------------

fn create_code(e: &Error) -> c_int {
    match e {
        Error::ModelNotFound(_) => -1,
        Error::CapacityReached => -2,
        Error::ContextCreation => -3,
        Error::ContextOverflow { .. } | Error::Decode(_) => -4,
        _ => -100,
    }
}

fn decode_code(e: &Error) -> c_int {
    match e {
        Error::SessionNotFound(_) => -1,
        Error::ContextOverflow { .. } => -2,
        // Runtime statuses are negative by contract.
        Error::Decode(code) => {
            if *code < 0 {
                *code
            } else {
                -6
            }
        }
        _ => -100,
    }
}

fn infer_code(e: &Error) -> c_int {
    match e {
        Error::SessionNotFound(_) => -1,
        Error::ContextOverflow { .. } => -2,
        Error::Grammar(_) | Error::SamplingInit(_) => -3,
        Error::Decode(_) => -4,
        Error::Sampling(_) => -7,
        Error::GrammarScript(_) => -8,
        _ => -100,
    }
}
