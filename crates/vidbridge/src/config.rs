//! Bridge configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use vidbridge_core::{ResultLayout, Result};

/// What a `transcode` does when another call is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Fail immediately with `Busy`
    #[default]
    Reject,
    /// Wait for the in-flight call, first come first served
    Queue,
}

/// Configuration for a [`TranscodeBridge`](crate::TranscodeBridge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Layout of the engine's result record
    pub layout: ResultLayout,
    /// Behaviour for concurrent calls
    pub busy_policy: BusyPolicy,
    /// Largest input accepted, in bytes
    pub max_input_bytes: u64,
}

impl BridgeConfig {
    /// Default input limit: 1 GiB.
    pub const DEFAULT_MAX_INPUT_BYTES: u64 = 1 << 30;

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn with_layout(mut self, layout: ResultLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn with_max_input_bytes(mut self, max: u64) -> Self {
        self.max_input_bytes = max;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            layout: ResultLayout::wire(),
            busy_policy: BusyPolicy::Reject,
            max_input_bytes: Self::DEFAULT_MAX_INPUT_BYTES,
        }
    }
}
