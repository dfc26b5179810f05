//! The async transcode bridge.
//!
//! [`TranscodeBridge`] turns the engine's blocking, single-threaded
//! `transcode` export into an async operation. Each call:
//!
//! 1. takes the single-flight permit (rejecting or queueing per
//!    [`BusyPolicy`]),
//! 2. loads the engine on first use,
//! 3. runs the marshaled call on the blocking pool with the engine locked,
//! 4. forwards progress and log events from the engine thread through a
//!    channel to the installed callbacks, filtered to strictly increasing
//!    progress values,
//! 5. resolves only after every forwarded event has been delivered.
//!
//! [`TranscodeBridge::run`] drives the engine's command line over its
//! virtual filesystem under the same permit and event plumbing.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vidbridge_core::{
    BridgeError, Engine, EngineEvent, EventSink, MonotonicFilter, Result, ResultDecoder,
    TranscodeOptions,
};

use crate::config::{BridgeConfig, BusyPolicy};
use crate::handle::{EngineHandle, LoadedEngine};
use crate::logging::ENGINE_TARGET;
use crate::marshal;
use crate::slots::{LoggerFn, LoggerSlot, ProgressFn, ProgressSlot, Subscription};

/// Async front end to one engine instance.
pub struct TranscodeBridge {
    handle: EngineHandle,
    config: BridgeConfig,
    flight: tokio::sync::Mutex<()>,
    progress: ProgressSlot,
    logger: LoggerSlot,
}

impl TranscodeBridge {
    /// Bridge whose engine is built by `factory` on first use.
    pub fn new<F>(config: BridgeConfig, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Engine>> + Send + Sync + 'static,
    {
        Self {
            handle: EngineHandle::new(config.layout, factory),
            config,
            flight: tokio::sync::Mutex::new(()),
            progress: ProgressSlot::new(),
            logger: LoggerSlot::new(),
        }
    }

    /// Bridge around an already constructed engine.
    ///
    /// The engine is initialised on first use. If that fails the engine is
    /// gone and later loads fail too.
    pub fn with_engine<E>(config: BridgeConfig, engine: E) -> Self
    where
        E: Engine + 'static,
    {
        let slot = Mutex::new(Some(engine));
        Self::new(config, move || {
            slot.lock()
                .take()
                .map(|engine| Box::new(engine) as Box<dyn Engine>)
                .ok_or_else(|| {
                    BridgeError::LoadFailure("engine instance already consumed".to_string())
                })
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_loaded()
    }

    /// Load the engine. No-op once loaded.
    pub async fn load(&self) -> Result<()> {
        self.handle.get().await.map(|_| ())
    }

    /// Install the progress callback, replacing the current one.
    pub fn set_progress_callback<F>(&self, callback: F) -> Subscription
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        let callback: Arc<ProgressFn> = Arc::new(callback);
        self.progress.install(callback)
    }

    /// Install the logger callback, replacing the current one.
    pub fn set_logger_callback<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let callback: Arc<LoggerFn> = Arc::new(callback);
        self.logger.install(callback)
    }

    pub fn clear_callbacks(&self) {
        self.progress.clear();
        self.logger.clear();
    }

    pub async fn transcode(&self, input: Vec<u8>, options: TranscodeOptions) -> Result<Vec<u8>> {
        self.transcode_with_cancel(input, options, CancellationToken::new())
            .await
    }

    /// Transcode `input`, observing `cancel`.
    ///
    /// Cancellation before the engine starts fails without touching the
    /// engine. Once the engine is running it finishes; its result is then
    /// discarded and released, and the call fails with `Cancelled`.
    pub async fn transcode_with_cancel(
        &self,
        input: Vec<u8>,
        options: TranscodeOptions,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>> {
        let _permit = self.acquire_permit().await?;
        if cancel.is_cancelled() {
            warn!("transcode cancelled before start");
            return Err(BridgeError::Cancelled);
        }

        let loaded = self.handle.get().await?;
        options.validate()?;
        if input.len() as u64 > self.config.max_input_bytes {
            return Err(BridgeError::InvalidOptions(format!(
                "input of {} bytes exceeds the limit of {} bytes",
                input.len(),
                self.config.max_input_bytes
            )));
        }

        debug!(
            input_len = input.len(),
            format = %options.output_format,
            video_codec = %options.video_codec,
            audio_codec = %options.audio_codec,
            resolution = %options.resolution,
            "starting transcode"
        );

        let result = self
            .call_with_events(loaded, move |engine, decoder, sink| {
                marshal::transcode_blocking(engine, decoder, &input, &options, sink, &cancel)
            })
            .await;
        match &result {
            Ok(output) => info!(output_len = output.len(), "transcode complete"),
            Err(BridgeError::Cancelled) => warn!("transcode cancelled"),
            Err(e) => warn!(error = %e, "transcode failed"),
        }
        result
    }

    /// Run the engine's command line, e.g. `["-i", "in.mp4", "out.webm"]`.
    ///
    /// Files are staged and collected with [`write_file`](Self::write_file)
    /// and [`read_file`](Self::read_file). Progress and log lines reach the
    /// installed callbacks exactly as during [`transcode`](Self::transcode).
    pub async fn run(&self, args: Vec<String>) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        if let Some(arg) = args.iter().find(|arg| arg.contains('\0')) {
            return Err(BridgeError::InvalidOptions(format!(
                "argument {:?} contains a NUL byte",
                arg
            )));
        }
        let loaded = self.handle.get().await?;

        debug!(?args, "starting run");
        let result = self
            .call_with_events(loaded, move |engine, _decoder, sink| engine.run(&args, sink))
            .await;
        match &result {
            Ok(()) => info!("run complete"),
            Err(e) => warn!(error = %e, "run failed"),
        }
        result
    }

    /// Store a file in the engine's virtual filesystem.
    pub async fn write_file(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let name = name.to_string();
        self.with_engine_blocking(move |engine| engine.write_file(&name, &data))
            .await
    }

    /// Read a file from the engine's virtual filesystem.
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let name = name.to_string();
        self.with_engine_blocking(move |engine| engine.read_file(&name))
            .await
    }

    /// Run `f` on the blocking pool with the engine locked, forwarding its
    /// events to the callbacks. Returns after the last event is delivered.
    async fn call_with_events<T, F>(&self, loaded: Arc<LoadedEngine>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Engine, &ResultDecoder, &Arc<dyn EventSink>) -> Result<T>
            + Send
            + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_events(
            rx,
            self.progress.clone(),
            self.logger.clone(),
        ));
        let sink: Arc<dyn EventSink> = Arc::new(ChannelSink { tx });

        let call = tokio::task::spawn_blocking(move || {
            let mut engine = loaded.lock();
            f(&mut **engine, loaded.decoder(), &sink)
        })
        .await;

        // The sink was dropped with the blocking closure, so the forwarder
        // ends once it has drained the channel.
        if let Err(e) = forwarder.await {
            error!(error = %e, "event forwarder failed");
        }

        call.map_err(|e| BridgeError::EngineFailure(format!("engine task join error: {e}")))?
    }

    async fn with_engine_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Engine) -> Result<T> + Send + 'static,
    {
        let loaded = self.handle.get().await?;
        tokio::task::spawn_blocking(move || {
            let mut engine = loaded.lock();
            f(&mut **engine)
        })
        .await
        .map_err(|e| BridgeError::EngineFailure(format!("engine task join error: {e}")))?
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        match self.config.busy_policy {
            BusyPolicy::Reject => self.flight.try_lock().map_err(|_| {
                warn!("transcode rejected: another call is in flight");
                BridgeError::Busy
            }),
            BusyPolicy::Queue => Ok(self.flight.lock().await),
        }
    }
}

impl std::fmt::Debug for TranscodeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeBridge")
            .field("handle", &self.handle)
            .field("config", &self.config)
            .finish()
    }
}

/// Event sink used on the engine thread. Never blocks.
struct ChannelSink {
    tx: UnboundedSender<EngineEvent>,
}

impl EventSink for ChannelSink {
    fn progress(&self, percent: f64) {
        let _ = self.tx.send(EngineEvent::Progress(percent));
    }

    fn log(&self, line: &str) {
        let _ = self.tx.send(EngineEvent::Log(line.to_string()));
    }
}

async fn forward_events(
    mut rx: UnboundedReceiver<EngineEvent>,
    progress: ProgressSlot,
    logger: LoggerSlot,
) {
    let mut filter = MonotonicFilter::new();
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::Progress(percent) => {
                let Some(percent) = filter.admit(percent) else {
                    continue;
                };
                if let Some(callback) = progress.current() {
                    callback(percent);
                }
            }
            EngineEvent::Log(line) => {
                debug!(target: ENGINE_TARGET, "{}", line);
                if let Some(callback) = logger.current() {
                    callback(&line);
                }
            }
        }
    }
}
