//! Runtime configuration for a submitted topology.
//!
//! Builder-style, with defaults matching the classic local topologies: acking
//! enabled, one emission per second per source task, no message timeout.
//! The struct is serde-friendly so callers that keep settings as JSON can
//! parse them with [`TopologyConfig::from_json_str`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings applied to every task of a running topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
  /// Name reported in logs and task contexts.
  pub name: String,
  /// Whether source emissions are tracked by the acker.
  ///
  /// When false, records travel untracked and no completion callbacks fire.
  pub reliable: bool,
  /// Minimum wait between two `produce` calls of one source task.
  pub emit_interval: Duration,
  /// Trees still pending after this long are failed. `None` keeps them forever.
  pub message_timeout: Option<Duration>,
  /// How often the timeout sweeper scans pending trees.
  pub timeout_sweep_interval: Duration,
  /// Longest time shutdown waits for queued records to drain.
  pub shutdown_timeout: Duration,
}

impl TopologyConfig {
  /// Creates a config with defaults and the given name.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Self::default()
    }
  }

  /// Enables or disables delivery tracking.
  #[must_use]
  pub fn with_reliable(mut self, reliable: bool) -> Self {
    self.reliable = reliable;
    self
  }

  /// Sets the source throttle.
  #[must_use]
  pub fn with_emit_interval(mut self, interval: Duration) -> Self {
    self.emit_interval = interval;
    self
  }

  /// Sets the message timeout (None disables it).
  #[must_use]
  pub fn with_message_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.message_timeout = timeout;
    self
  }

  /// Sets how often pending trees are checked against the timeout.
  #[must_use]
  pub fn with_timeout_sweep_interval(mut self, interval: Duration) -> Self {
    self.timeout_sweep_interval = interval;
    self
  }

  /// Sets the drain bound used by shutdown.
  #[must_use]
  pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  /// Parses a config from JSON; missing keys take their defaults.
  ///
  /// # Errors
  ///
  /// Returns the `serde_json` error for malformed input.
  pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}

impl Default for TopologyConfig {
  fn default() -> Self {
    Self {
      name: "topology".to_string(),
      reliable: true,
      emit_interval: Duration::from_secs(1),
      message_timeout: None,
      timeout_sweep_interval: Duration::from_secs(1),
      shutdown_timeout: Duration::from_secs(30),
    }
  }
}
