//! Error types for the transcode bridge.

use thiserror::Error;

/// Message used when the engine hands back a null result record.
pub const NULL_RESULT_MESSAGE: &str = "no result returned";

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised while marshaling a call across the engine boundary.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Engine failed to initialize. The handle stays empty so the caller can retry.
    #[error("engine failed to load: {0}")]
    LoadFailure(String),

    /// The arena could not satisfy an allocation request
    #[error("out of memory: could not allocate {requested} bytes")]
    OutOfMemory { requested: u64 },

    /// Failure reported by the engine. The message is surfaced verbatim.
    #[error("{0}")]
    EngineFailure(String),

    /// Result record layout does not match the native struct
    #[error("result layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Access outside the engine's linear memory
    #[error("out of bounds arena access: ptr={ptr:#x}, len={len}")]
    OutOfBounds { ptr: u32, len: u64 },

    /// Release of a pointer that is not a live allocation
    #[error("invalid release of {0:#x}")]
    InvalidRelease(u32),

    /// Engine string was not valid UTF-8
    #[error("invalid UTF-8 in engine string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// No terminating zero byte before the end of memory
    #[error("unterminated string at {0:#x}")]
    UnterminatedString(u32),

    /// Another transcode is in flight on this engine
    #[error("a transcode is already in flight")]
    Busy,

    /// The call was cancelled by the caller
    #[error("transcode cancelled")]
    Cancelled,

    /// Transcode options cannot be passed to the engine
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Virtual filesystem lookup failed
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// IO error (config files, CLI input/output)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Config (de)serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Failure for a null result record.
    pub fn null_result() -> Self {
        BridgeError::EngineFailure(NULL_RESULT_MESSAGE.to_string())
    }

    /// True for failures that originate inside the engine.
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, BridgeError::EngineFailure(_))
    }
}
