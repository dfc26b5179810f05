//! C-compatible FFI interface for the transcode bridge.
//!
//! # Memory Ownership Rules
//!
//! - `vidbridge_open()` allocates a `BridgeHandle`; the caller owns it and
//!   releases it with `vidbridge_free()`
//! - `VidbridgeResultC` and the buffers it points to are owned by the caller
//!   and released with `vidbridge_result_free()`
//! - Strings passed into callbacks are only valid for the duration of the
//!   callback
//!
//! # Threading
//!
//! Each handle owns a tokio runtime and blocks the calling thread until the
//! operation finishes, so these functions must not be called from inside an
//! async runtime. Callbacks run on the calling thread while it is blocked in
//! `vidbridge_transcode`.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::ptr;
use std::slice;
use std::sync::Arc;

use parking_lot::Mutex;
use vidbridge_core::{BridgeError, Result, TranscodeOptions, UNKNOWN_ERROR};
use vidbridge_ffi_common::{cstr_to_str, free_boxed_slice, free_cstring, vec_into_raw, FfiResult};

use crate::bridge::TranscodeBridge;
use crate::slots::Subscription;

/// Progress callback: percent in `0..=100` and the registered user data.
pub type ProgressCallbackC = extern "C" fn(percent: f64, user_data: *mut c_void);

/// Logger callback: a NUL-terminated line and the registered user data.
pub type LoggerCallbackC = extern "C" fn(line: *const c_char, user_data: *mut c_void);

/// Opaque bridge handle.
pub struct BridgeHandle {
    runtime: tokio::runtime::Runtime,
    bridge: Arc<TranscodeBridge>,
    progress: Mutex<Option<Subscription>>,
    logger: Mutex<Option<Subscription>>,
}

impl BridgeHandle {
    /// Wrap a bridge with its own current-thread runtime.
    pub fn new(bridge: TranscodeBridge) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            bridge: Arc::new(bridge),
            progress: Mutex::new(None),
            logger: Mutex::new(None),
        })
    }

    pub fn bridge(&self) -> &Arc<TranscodeBridge> {
        &self.bridge
    }

    /// Hand the handle to C.
    pub fn into_raw(self) -> *mut BridgeHandle {
        Box::into_raw(Box::new(self))
    }
}

/// Opaque caller pointer passed back to callbacks untouched.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

// The bridge never dereferences user data; thread safety of what it points
// to is the registering caller's contract.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    fn ptr(self) -> *mut c_void {
        self.0
    }
}

/// C-compatible transcode options. Null strings take their defaults.
#[repr(C)]
pub struct VidbridgeOptionsC {
    pub output_format: *const c_char,
    pub video_codec: *const c_char,
    pub audio_codec: *const c_char,
    pub video_bitrate: i32,
    pub audio_bitrate: i32,
    /// `same`, `WIDTHxHEIGHT` or a preset such as `720p`
    pub resolution: *const c_char,
}

/// C-compatible result of a bridge operation.
#[repr(C)]
pub struct VidbridgeResultC {
    /// True if the operation succeeded
    pub success: bool,
    /// Error message if success is false (owned, must be freed)
    pub error_msg: *mut c_char,
    /// Output bytes (owned, must be freed with vidbridge_result_free)
    pub output: *mut u8,
    pub output_len: usize,
}

impl VidbridgeResultC {
    fn success(output: Vec<u8>) -> Self {
        let (output, output_len) = vec_into_raw(output);
        Self {
            success: true,
            error_msg: ptr::null_mut(),
            output,
            output_len,
        }
    }

    fn from_result(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(output) => Self::success(output),
            Err(e) => Self::error(&e.to_string()),
        }
    }
}

impl FfiResult for VidbridgeResultC {
    const ERROR_FALLBACK: &'static str = UNKNOWN_ERROR;

    fn error_fields(error_msg: *mut c_char) -> Self {
        Self {
            success: false,
            error_msg,
            output: ptr::null_mut(),
            output_len: 0,
        }
    }
}

/// Read an optional C string field, falling back to `default` when null.
unsafe fn string_field(ptr: *const c_char, name: &str, default: String) -> Result<String> {
    if ptr.is_null() {
        return Ok(default);
    }
    unsafe { cstr_to_str(ptr) }
        .map(str::to_string)
        .map_err(|e| BridgeError::InvalidOptions(format!("{}: {}", name, e)))
}

unsafe fn options_from_c(options: *const VidbridgeOptionsC) -> Result<TranscodeOptions> {
    let defaults = TranscodeOptions::default();
    if options.is_null() {
        return Ok(defaults);
    }
    let options = unsafe { &*options };

    Ok(TranscodeOptions {
        output_format: unsafe {
            string_field(options.output_format, "output_format", defaults.output_format)
        }?,
        video_codec: unsafe {
            string_field(options.video_codec, "video_codec", defaults.video_codec)
        }?,
        audio_codec: unsafe {
            string_field(options.audio_codec, "audio_codec", defaults.audio_codec)
        }?,
        video_bitrate: options.video_bitrate,
        audio_bitrate: options.audio_bitrate,
        resolution: unsafe {
            string_field(options.resolution, "resolution", defaults.resolution)
        }?,
    })
}

// ============================================================================
// Bridge Lifecycle
// ============================================================================

/// Open a bridge over a WebAssembly transcoding module.
///
/// # Arguments
/// - `module_path`: Path to the `.wasm` module (null-terminated)
/// - `config_json`: Bridge configuration as JSON, or NULL for defaults
///
/// # Returns
/// Pointer to BridgeHandle, or NULL on failure. The module is compiled and
/// initialised lazily, on first use.
#[cfg(feature = "wasmtime")]
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_open(
    module_path: *const c_char,
    config_json: *const c_char,
) -> *mut BridgeHandle {
    use crate::config::BridgeConfig;
    use crate::wasm::{WasmEngine, WasmEngineConfig};

    let module_path = match unsafe { cstr_to_str(module_path) } {
        Ok(path) => path.to_string(),
        Err(e) => {
            tracing::error!(error = e, "invalid module path");
            return ptr::null_mut();
        }
    };
    let config = if config_json.is_null() {
        BridgeConfig::default()
    } else {
        match unsafe { cstr_to_str(config_json) }
            .map_err(|e| BridgeError::InvalidOptions(e.to_string()))
            .and_then(BridgeConfig::from_json)
        {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "invalid bridge configuration");
                return ptr::null_mut();
            }
        }
    };

    let engine_config = WasmEngineConfig::new(module_path);
    let bridge = TranscodeBridge::new(config, move || {
        WasmEngine::from_config(&engine_config)
            .map(|engine| Box::new(engine) as Box<dyn vidbridge_core::Engine>)
    });
    match BridgeHandle::new(bridge) {
        Ok(handle) => handle.into_raw(),
        Err(e) => {
            tracing::error!(error = %e, "failed to create bridge runtime");
            ptr::null_mut()
        }
    }
}

vidbridge_ffi_common::define_handle_free!(vidbridge_free, BridgeHandle);

/// Load the engine now instead of on first use.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_load(handle: *const BridgeHandle) -> VidbridgeResultC {
    if handle.is_null() {
        return VidbridgeResultC::error("null bridge pointer");
    }
    let handle = unsafe { &*handle };
    VidbridgeResultC::from_result(
        handle
            .runtime
            .block_on(handle.bridge.load())
            .map(|()| Vec::new()),
    )
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_is_loaded(handle: *const BridgeHandle) -> bool {
    if handle.is_null() {
        return false;
    }
    unsafe { &*handle }.bridge.is_loaded()
}

// ============================================================================
// Transcoding
// ============================================================================

/// Transcode `len` bytes at `data`.
///
/// # Arguments
/// - `handle`: Valid bridge pointer
/// - `data`: Input bytes
/// - `len`: Number of input bytes
/// - `options`: Transcode options, or NULL for defaults
///
/// # Returns
/// VidbridgeResultC with the output. Caller must call `vidbridge_result_free`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_transcode(
    handle: *const BridgeHandle,
    data: *const u8,
    len: usize,
    options: *const VidbridgeOptionsC,
) -> VidbridgeResultC {
    if handle.is_null() {
        return VidbridgeResultC::error("null bridge pointer");
    }
    if data.is_null() && len > 0 {
        return VidbridgeResultC::error("null input pointer");
    }
    let handle = unsafe { &*handle };

    let options = match unsafe { options_from_c(options) } {
        Ok(options) => options,
        Err(e) => return VidbridgeResultC::error(&e.to_string()),
    };
    let input = if len == 0 {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(data, len) }.to_vec()
    };

    VidbridgeResultC::from_result(
        handle
            .runtime
            .block_on(handle.bridge.transcode(input, options)),
    )
}

/// Free a VidbridgeResultC and everything it owns.
#[no_mangle]
pub extern "C" fn vidbridge_result_free(result: VidbridgeResultC) {
    unsafe {
        free_cstring(result.error_msg);
        free_boxed_slice(result.output, result.output_len);
    }
}

/// Run the engine's command line over its virtual filesystem.
///
/// # Arguments
/// - `handle`: Valid bridge pointer
/// - `argv`: `argc` null-terminated argument strings
/// - `argc`: Number of arguments
///
/// # Returns
/// VidbridgeResultC with no output. Caller must call `vidbridge_result_free`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_run(
    handle: *const BridgeHandle,
    argv: *const *const c_char,
    argc: usize,
) -> VidbridgeResultC {
    if handle.is_null() {
        return VidbridgeResultC::error("null bridge pointer");
    }
    if argv.is_null() && argc > 0 {
        return VidbridgeResultC::error("null argv pointer");
    }
    let handle = unsafe { &*handle };

    let pointers = if argc == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(argv, argc) }
    };
    let mut args = Vec::with_capacity(argc);
    for &arg in pointers {
        match unsafe { cstr_to_str(arg) } {
            Ok(arg) => args.push(arg.to_string()),
            Err(e) => return VidbridgeResultC::error(e),
        }
    }

    VidbridgeResultC::from_result(
        handle
            .runtime
            .block_on(handle.bridge.run(args))
            .map(|()| Vec::new()),
    )
}

// ============================================================================
// Callbacks
// ============================================================================

/// Install the progress callback, replacing the previous one. Passing NULL
/// removes it.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_set_progress_callback(
    handle: *const BridgeHandle,
    callback: Option<ProgressCallbackC>,
    user_data: *mut c_void,
) -> bool {
    if handle.is_null() {
        return false;
    }
    let handle = unsafe { &*handle };

    let subscription = callback.map(|callback| {
        let user_data = UserData(user_data);
        handle
            .bridge
            .set_progress_callback(move |percent| callback(percent, user_data.ptr()))
    });
    *handle.progress.lock() = subscription;
    true
}

/// Install the logger callback, replacing the previous one. Passing NULL
/// removes it.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_set_logger_callback(
    handle: *const BridgeHandle,
    callback: Option<LoggerCallbackC>,
    user_data: *mut c_void,
) -> bool {
    if handle.is_null() {
        return false;
    }
    let handle = unsafe { &*handle };

    let subscription = callback.map(|callback| {
        let user_data = UserData(user_data);
        handle.bridge.set_logger_callback(move |line| {
            // Lines with interior NULs are truncated at the first one.
            let line = CString::new(line).unwrap_or_else(|e| {
                let end = e.nul_position();
                CString::new(&line.as_bytes()[..end]).unwrap_or_default()
            });
            callback(line.as_ptr(), user_data.ptr());
        })
    });
    *handle.logger.lock() = subscription;
    true
}

// ============================================================================
// Filesystem Shim
// ============================================================================

/// Store `len` bytes under `name` in the engine's virtual filesystem.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_write_file(
    handle: *const BridgeHandle,
    name: *const c_char,
    data: *const u8,
    len: usize,
) -> VidbridgeResultC {
    if handle.is_null() {
        return VidbridgeResultC::error("null bridge pointer");
    }
    if data.is_null() && len > 0 {
        return VidbridgeResultC::error("null data pointer");
    }
    let handle = unsafe { &*handle };
    let name = match unsafe { cstr_to_str(name) } {
        Ok(name) => name,
        Err(e) => return VidbridgeResultC::error(e),
    };
    let data = if len == 0 {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(data, len) }.to_vec()
    };

    VidbridgeResultC::from_result(
        handle
            .runtime
            .block_on(handle.bridge.write_file(name, data))
            .map(|()| Vec::new()),
    )
}

/// Read `name` from the engine's virtual filesystem.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn vidbridge_read_file(
    handle: *const BridgeHandle,
    name: *const c_char,
) -> VidbridgeResultC {
    if handle.is_null() {
        return VidbridgeResultC::error("null bridge pointer");
    }
    let handle = unsafe { &*handle };
    let name = match unsafe { cstr_to_str(name) } {
        Ok(name) => name,
        Err(e) => return VidbridgeResultC::error(e),
    };

    VidbridgeResultC::from_result(handle.runtime.block_on(handle.bridge.read_file(name)))
}

// ============================================================================
// Utilities
// ============================================================================

vidbridge_ffi_common::define_version_fn!(vidbridge_version);
