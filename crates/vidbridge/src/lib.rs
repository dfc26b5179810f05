//! # vidbridge
//!
//! Exposes a blocking, single-threaded media transcoding engine as an async,
//! progress-reporting operation over byte buffers.
//!
//! - **bridge**: [`TranscodeBridge`], the async front end with single-flight
//!   calls and progress/log callbacks
//! - **handle**: lazily loaded engine instance
//! - **marshal**: one engine call with input/result memory management
//! - **slots**: callback slots and subscription tokens
//! - **config**: bridge configuration
//! - **ffi**: C ABI
//! - **wasm**: engine hosted in a WebAssembly module (feature `wasmtime`)
//!
//! ## Usage
//!
//! ```rust
//! use vidbridge::{BridgeConfig, TranscodeBridge};
//! use vidbridge_core::{StubEngine, StubScript, TranscodeOptions};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = StubEngine::new(StubScript::success(500).progress([10.0, 55.0, 100.0]));
//! let bridge = TranscodeBridge::with_engine(BridgeConfig::default(), engine);
//!
//! let _progress = bridge.set_progress_callback(|percent| println!("{percent}%"));
//! let options = TranscodeOptions::new("mp4").resolution("720p");
//! let output = bridge.transcode(vec![0; 1000], options).await.unwrap();
//! assert_eq!(output.len(), 500);
//! # });
//! ```

pub mod bridge;
pub mod config;
pub mod ffi;
pub mod handle;
pub mod logging;
pub mod marshal;
pub mod slots;

#[cfg(feature = "wasmtime")]
pub mod wasm;

// Re-export commonly used items at crate root
pub use bridge::TranscodeBridge;
pub use config::{BridgeConfig, BusyPolicy};
pub use handle::{EngineFactory, EngineHandle, LoadedEngine};
pub use slots::{CallbackSlot, Subscription};
pub use tokio_util::sync::CancellationToken;
pub use vidbridge_core::{BridgeError, Result};

#[cfg(feature = "wasmtime")]
pub use wasm::{WasmEngine, WasmEngineConfig};
