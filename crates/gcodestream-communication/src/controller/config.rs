//! Runtime configuration of a controller session

use crate::communication::buffered::ErrorPolicy;

/// Settings consumed by [`FirmwareController`](super::FirmwareController)
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Receive buffer size; `None` uses the dialect's size
    pub buffer_size: Option<usize>,
    /// Status poll interval in milliseconds
    pub status_poll_rate_ms: u64,
    /// Poll for status reports at all
    pub status_polling_enabled: bool,
    /// Admit a command only when nothing else is active
    pub single_step_mode: bool,
    /// Reaction to a failed command while streaming
    pub error_policy: ErrorPolicy,
    /// How long commands still active after a cancel may take to complete
    pub drain_timeout_ms: u64,
    /// Unanswered polls tolerated before polling again regardless
    pub max_outstanding_polls: u32,
    /// Feed rate for jogs, in the active units per minute
    pub jog_feed_rate: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            buffer_size: None,
            status_poll_rate_ms: 200,
            status_polling_enabled: true,
            single_step_mode: false,
            error_policy: ErrorPolicy::Continue,
            drain_timeout_ms: 5000,
            max_outstanding_polls: 20,
            jog_feed_rate: 1000.0,
        }
    }
}

impl ControllerConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to override the receive buffer size
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Builder method to set the status poll interval
    pub fn with_status_poll_rate_ms(mut self, rate_ms: u64) -> Self {
        self.status_poll_rate_ms = rate_ms;
        self
    }

    /// Builder method to enable or disable status polling
    pub fn with_status_polling(mut self, enabled: bool) -> Self {
        self.status_polling_enabled = enabled;
        self
    }

    /// Builder method to enable single-step mode
    pub fn with_single_step_mode(mut self, enabled: bool) -> Self {
        self.single_step_mode = enabled;
        self
    }

    /// Builder method to set the error policy
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Builder method to set the drain timeout
    pub fn with_drain_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.drain_timeout_ms = timeout_ms;
        self
    }

    /// Builder method to set the jog feed rate
    pub fn with_jog_feed_rate(mut self, feed_rate: f64) -> Self {
        self.jog_feed_rate = feed_rate;
        self
    }
}
