//! The engine seam.
//!
//! An [`Engine`] is a loaded transcoding library plus the linear memory it
//! owns. Its `transcode` export is synchronous and blocking: it returns once,
//! with a pointer to a result record (or null), and may report progress
//! through an [`EventSink`] while it runs.

use std::sync::Arc;

use crate::arena::{Arena, ArenaPtr};
use crate::error::Result;
use crate::options::TranscodeOptions;
use crate::progress::EventSink;

/// Arguments of one engine `transcode` invocation.
#[derive(Debug, Clone, Copy)]
pub struct TranscodeCall<'a> {
    /// Input region in engine memory
    pub input: ArenaPtr,
    pub input_len: u32,
    pub options: &'a TranscodeOptions,
}

/// A loaded transcoding engine.
///
/// Engines are used from one thread at a time; the bridge serialises access.
pub trait Engine: Send {
    /// One-time library initialisation. Called once, right after construction.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Size in bytes of the native result struct, if the engine reports it.
    fn result_record_size(&self) -> Option<u32> {
        None
    }

    fn arena(&self) -> &dyn Arena;

    fn arena_mut(&mut self) -> &mut dyn Arena;

    /// Run the engine's transcode export.
    ///
    /// Returns the result record pointer, [`ArenaPtr::NULL`] if the engine
    /// produced none, or an error if the engine faulted.
    fn transcode(
        &mut self,
        call: TranscodeCall<'_>,
        events: &Arc<dyn EventSink>,
    ) -> Result<ArenaPtr>;

    /// Run the engine's command-line entry point over its virtual
    /// filesystem, as in `ffmpeg -i input.mp4 output.webm`.
    ///
    /// Inputs are staged with [`Engine::write_file`] and outputs collected
    /// with [`Engine::read_file`]. A nonzero exit is an engine failure.
    fn run(&mut self, args: &[String], events: &Arc<dyn EventSink>) -> Result<()>;

    /// Release a result record and everything it owns.
    fn free_result(&mut self, record: ArenaPtr) -> Result<()>;

    /// Store a file in the engine's virtual filesystem.
    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()>;

    /// Read a file from the engine's virtual filesystem.
    fn read_file(&mut self, name: &str) -> Result<Vec<u8>>;
}
