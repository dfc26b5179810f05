//! Lazily loaded engine handle.
//!
//! The engine is built by a factory on first use and kept for the lifetime of
//! the handle. Concurrent first callers share one load; a failed load leaves
//! the handle empty so a later call can retry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use vidbridge_core::{BridgeError, Engine, ResultDecoder, ResultLayout, Result};

/// Builds a fresh engine instance. Runs on the blocking pool.
pub type EngineFactory = Arc<dyn Fn() -> Result<Box<dyn Engine>> + Send + Sync>;

/// A loaded engine together with the decoder for its result records.
pub struct LoadedEngine {
    engine: Mutex<Box<dyn Engine>>,
    decoder: ResultDecoder,
}

impl LoadedEngine {
    /// Exclusive access to the engine for the duration of one call.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Engine>> {
        self.engine.lock()
    }

    pub fn decoder(&self) -> &ResultDecoder {
        &self.decoder
    }
}

/// Owning handle around one engine instance.
pub struct EngineHandle {
    factory: EngineFactory,
    layout: ResultLayout,
    cell: OnceCell<Arc<LoadedEngine>>,
    load_attempts: AtomicUsize,
}

impl EngineHandle {
    pub fn new<F>(layout: ResultLayout, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Engine>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            layout,
            cell: OnceCell::new(),
            load_attempts: AtomicUsize::new(0),
        }
    }

    /// The loaded engine, loading it first if needed.
    pub async fn get(&self) -> Result<Arc<LoadedEngine>> {
        self.cell
            .get_or_try_init(|| self.load())
            .await
            .map(Arc::clone)
    }

    /// The engine if it has been loaded, without triggering a load.
    pub fn loaded(&self) -> Option<Arc<LoadedEngine>> {
        self.cell.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// How many times the factory has been run.
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    pub fn layout(&self) -> &ResultLayout {
        &self.layout
    }

    async fn load(&self) -> Result<Arc<LoadedEngine>> {
        let attempt = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, "loading engine");

        let decoder = ResultDecoder::new(self.layout)?;
        let factory = Arc::clone(&self.factory);
        let layout = self.layout;

        let engine = tokio::task::spawn_blocking(move || -> Result<Box<dyn Engine>> {
            let mut engine = factory()?;
            engine.init()?;
            if let Some(native_size) = engine.result_record_size() {
                layout.check_native_size(native_size)?;
            }
            Ok(engine)
        })
        .await
        .map_err(|e| BridgeError::LoadFailure(format!("load task join error: {e}")))??;

        info!(record_size = layout.record_size, "engine loaded");
        Ok(Arc::new(LoadedEngine {
            engine: Mutex::new(engine),
            decoder,
        }))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("layout", &self.layout)
            .field("loaded", &self.is_loaded())
            .field("load_attempts", &self.load_attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidbridge_core::{StubEngine, StubScript};

    fn stub_handle(script: StubScript) -> (EngineHandle, vidbridge_core::StubMonitor) {
        let stub = StubEngine::new(script);
        let monitor = stub.monitor();
        let slot = Mutex::new(Some(stub));
        let handle = EngineHandle::new(ResultLayout::wire(), move || {
            slot.lock()
                .take()
                .map(|engine| Box::new(engine) as Box<dyn Engine>)
                .ok_or_else(|| BridgeError::LoadFailure("factory exhausted".to_string()))
        });
        (handle, monitor)
    }

    #[tokio::test]
    async fn test_get_loads_once() {
        let (handle, monitor) = stub_handle(StubScript::success(1));
        assert!(!handle.is_loaded());

        handle.get().await.unwrap();
        handle.get().await.unwrap();

        assert!(handle.is_loaded());
        assert_eq!(handle.load_attempts(), 1);
        assert_eq!(monitor.inits(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_can_be_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let handle = EngineHandle::new(ResultLayout::wire(), move || {
            let mut stub = StubEngine::new(StubScript::success(1));
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                stub = stub.failing_init("module not found");
            }
            Ok(Box::new(stub) as Box<dyn Engine>)
        });

        let err = handle.get().await.err().unwrap();
        assert!(matches!(err, BridgeError::LoadFailure(_)));
        assert!(!handle.is_loaded());

        handle.get().await.unwrap();
        assert_eq!(handle.load_attempts(), 2);
    }

    #[tokio::test]
    async fn test_native_size_mismatch_fails_load() {
        let handle = EngineHandle::new(ResultLayout::wire(), || {
            let stub = StubEngine::new(StubScript::success(1)).with_reported_record_size(Some(272));
            Ok(Box::new(stub) as Box<dyn Engine>)
        });

        let err = handle.get().await.err().unwrap();
        assert!(matches!(err, BridgeError::LayoutMismatch(_)));
        assert!(handle.loaded().is_none());
    }
}
