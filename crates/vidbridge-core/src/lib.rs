//! vidbridge core
//!
//! The engine-independent half of the transcode bridge: a bounds-checked view
//! of an engine's linear memory, the result record decoder, transcode options
//! and the [`Engine`] seam the bridge drives.
//!
//! # Example
//!
//! ```rust
//! use vidbridge_core::{Arena, MemoryArena, ResultDecoder, ResultLayout, Decoded};
//!
//! let layout = ResultLayout::wire();
//! let mut arena = MemoryArena::new();
//!
//! // What an engine hands back after a successful call
//! let output = arena.allocate(3).unwrap();
//! arena.write(output, b"abc").unwrap();
//! let record = arena.allocate(layout.record_size).unwrap();
//! layout.encode_success(&mut arena, record, output, 3).unwrap();
//!
//! let decoder = ResultDecoder::new(layout).unwrap();
//! assert_eq!(decoder.decode(&arena, record).unwrap(), Decoded::Success(b"abc".to_vec()));
//! ```

pub mod arena;
pub mod engine;
pub mod error;
pub mod layout;
pub mod options;
pub mod progress;
pub mod stub;

// Re-export main types at crate root
pub use arena::{Arena, ArenaPtr, ArenaStats, MemoryArena};
pub use engine::{Engine, TranscodeCall};
pub use error::{BridgeError, Result, NULL_RESULT_MESSAGE};
pub use layout::{Decoded, ErrorField, LengthWidth, ResultDecoder, ResultLayout, UNKNOWN_ERROR};
pub use options::{TranscodeOptions, RESOLUTION_PRESETS, SAME_RESOLUTION};
pub use progress::{EngineEvent, EventSink, MonotonicFilter, NullSink};
pub use stub::{StubEngine, StubMonitor, StubOutcome, StubScript, StubStep};
