//! Engine events and the monotonic progress filter.

/// Receives events the engine emits while a call is running.
///
/// Called synchronously on the engine thread, so implementations must not
/// block. Engines hosting callbacks of their own may keep the sink for the
/// duration of a call, hence the `Send + Sync` bound.
pub trait EventSink: Send + Sync {
    /// Progress in percent (0..=100).
    fn progress(&self, percent: f64);

    /// One line of engine log output.
    fn log(&self, line: &str);
}

/// An event emitted by the engine during a call.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress(f64),
    Log(String),
}

/// Sink that drops everything. Used for calls nobody observes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn progress(&self, _percent: f64) {}

    fn log(&self, _line: &str) {}
}

/// Forwards a progress value only if it is strictly greater than the last
/// forwarded one.
///
/// One filter per call. The baseline is 0, so a leading 0 is not reported;
/// values above 100 are clamped and NaN is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicFilter {
    last: f64,
}

impl MonotonicFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value to forward, or `None` if it must be suppressed.
    pub fn admit(&mut self, percent: f64) -> Option<f64> {
        if percent.is_nan() {
            return None;
        }
        let percent = percent.min(100.0);
        if percent > self.last {
            self.last = percent;
            Some(percent)
        } else {
            None
        }
    }

    /// Last forwarded value.
    pub fn last(&self) -> f64 {
        self.last
    }
}
