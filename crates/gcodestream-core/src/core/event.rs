//! Event system for controller communication
//!
//! Provides:
//! - Event types for command, stream and machine state changes
//! - Event dispatcher for publishing events to subscribers
//!
//! Events are published from the controller task in the order they happen, so
//! a subscriber sees command completions in the order the commands were sent.

use crate::command::GcodeCommand;
use crate::data::{ControllerState, ControllerStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Severity of an operator-facing console message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Normal traffic and notices
    Info,
    /// Chatty detail (raw status lines, handshake traffic)
    Verbose,
    /// Errors and alarms
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Verbose => write!(f, "VERBOSE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A console line for the operator
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleMessage {
    /// Severity
    pub level: MessageType,
    /// Text
    pub text: String,
    /// When the message was produced
    pub timestamp: DateTime<Utc>,
}

impl ConsoleMessage {
    /// Create a message stamped now
    pub fn new(level: MessageType, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Controller event types
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Transport opened
    Connected {
        /// Firmware dialect name
        firmware: String,
        /// Port, host or URL
        address: String,
    },
    /// Session ended
    Disconnected {
        /// Cause, when the link failed rather than being closed
        reason: Option<String>,
    },
    /// Firmware identified itself
    FirmwareVersion(String),
    /// Controller state changed
    StateChanged(ControllerState),
    /// A new status snapshot was published
    StatusChanged(Arc<ControllerStatus>),
    /// A command was written to the transport
    CommandSent(Arc<GcodeCommand>),
    /// A command reached its terminal response
    CommandComplete(Arc<GcodeCommand>),
    /// A program row was skipped without sending
    CommandSkipped(Arc<GcodeCommand>),
    /// A stream began
    StreamStarted {
        /// Rows the stream will process
        rows: usize,
    },
    /// Admission was paused
    StreamPaused,
    /// Admission was resumed
    StreamResumed,
    /// Admission was paused because a command failed
    StreamPausedOnError(Arc<GcodeCommand>),
    /// The stream was cancelled
    StreamCanceled,
    /// The stream finished
    StreamComplete {
        /// No command failed
        success: bool,
        /// Time spent sending, excluding pauses
        duration_ms: u64,
    },
    /// Alarm occurred
    Alarm {
        /// Alarm code (0 when the firmware gave none)
        code: u32,
        /// Decoded description
        message: String,
    },
    /// Operator-facing text
    ConsoleMessage(ConsoleMessage),
}

impl std::fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerEvent::Connected { firmware, address } => {
                write!(f, "Connected to {} on {}", firmware, address)
            }
            ControllerEvent::Disconnected { reason: None } => write!(f, "Disconnected"),
            ControllerEvent::Disconnected {
                reason: Some(reason),
            } => write!(f, "Disconnected: {}", reason),
            ControllerEvent::FirmwareVersion(v) => write!(f, "Firmware: {}", v),
            ControllerEvent::StateChanged(state) => write!(f, "State: {}", state),
            ControllerEvent::StatusChanged(status) => write!(f, "Status: {}", status),
            ControllerEvent::CommandSent(cmd) => write!(f, "Sent: {}", cmd.text),
            ControllerEvent::CommandComplete(cmd) => {
                write!(f, "Complete: {} -> {}", cmd.text, cmd.response)
            }
            ControllerEvent::CommandSkipped(cmd) => {
                write!(f, "Skipped: {}", cmd.original_text)
            }
            ControllerEvent::StreamStarted { rows } => write!(f, "Stream started ({} rows)", rows),
            ControllerEvent::StreamPaused => write!(f, "Stream paused"),
            ControllerEvent::StreamResumed => write!(f, "Stream resumed"),
            ControllerEvent::StreamPausedOnError(cmd) => {
                write!(f, "Stream paused on error: {} -> {}", cmd.text, cmd.response)
            }
            ControllerEvent::StreamCanceled => write!(f, "Stream canceled"),
            ControllerEvent::StreamComplete {
                success,
                duration_ms,
            } => write!(
                f,
                "Stream complete ({}) in {}ms",
                if *success { "success" } else { "with errors" },
                duration_ms
            ),
            ControllerEvent::Alarm { code, message } => write!(f, "Alarm {} ({})", code, message),
            ControllerEvent::ConsoleMessage(msg) => write!(f, "[{}] {}", msg.level, msg.text),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for controller events.
    tx: broadcast::Sender<ControllerEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 1024)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Create a new event dispatcher with default buffer size
    pub fn default_with_buffer() -> Self {
        Self::new(1024)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    pub fn publish(
        &self,
        event: ControllerEvent,
    ) -> Result<usize, broadcast::error::SendError<ControllerEvent>> {
        self.tx.send(event)
    }

    /// Publish, ignoring the case where nobody is listening
    pub fn emit(&self, event: ControllerEvent) {
        tracing::trace!("event: {}", event);
        let _ = self.tx.send(event);
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::default_with_buffer()
    }
}
