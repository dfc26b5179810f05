//! One engine call, start to finish, on the calling thread.
//!
//! Moves the input into engine memory, invokes the engine, decodes the
//! result record and releases every region it touched. The input region is
//! released exactly once on every path after it was allocated, and a
//! non-null result record is always handed back to the engine.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use vidbridge_core::{
    ArenaPtr, BridgeError, Decoded, Engine, EventSink, Result, ResultDecoder, TranscodeCall,
    TranscodeOptions,
};

/// Run one transcode against a locked engine.
pub fn transcode_blocking(
    engine: &mut dyn Engine,
    decoder: &ResultDecoder,
    input: &[u8],
    options: &TranscodeOptions,
    events: &Arc<dyn EventSink>,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    if cancel.is_cancelled() {
        return Err(BridgeError::Cancelled);
    }

    let input_len = u32::try_from(input.len()).map_err(|_| BridgeError::OutOfMemory {
        requested: input.len() as u64,
    })?;
    let region = engine.arena_mut().allocate(input_len)?;
    debug!(ptr = %region, len = input_len, "input region allocated");

    if let Err(e) = engine.arena_mut().write(region, input) {
        release_logged(engine, region);
        return Err(e);
    }

    let outcome = engine.transcode(
        TranscodeCall {
            input: region,
            input_len,
            options,
        },
        events,
    );
    let released = engine.arena_mut().release(region);

    let record = match outcome {
        Ok(record) => record,
        Err(e) => {
            if let Err(release_err) = released {
                error!(ptr = %region, error = %release_err, "failed to release input region");
            }
            return Err(e);
        }
    };

    if record.is_null() {
        released?;
        return Err(BridgeError::null_result());
    }

    let decoded = if cancel.is_cancelled() {
        debug!(record = %record, "call cancelled, skipping decode");
        None
    } else {
        Some(decoder.decode(engine.arena(), record))
    };

    let freed = engine.free_result(record);
    if let Err(e) = &freed {
        error!(record = %record, error = %e, "failed to free result record");
    }
    released?;
    freed?;

    match decoded {
        None => Err(BridgeError::Cancelled),
        Some(decoded) => match decoded? {
            Decoded::Success(output) => {
                debug!(len = output.len(), "transcode succeeded");
                Ok(output)
            }
            Decoded::Failure(message) => Err(BridgeError::EngineFailure(message)),
        },
    }
}

fn release_logged(engine: &mut dyn Engine, region: ArenaPtr) {
    if let Err(e) = engine.arena_mut().release(region) {
        error!(ptr = %region, error = %e, "failed to release input region");
    }
}
