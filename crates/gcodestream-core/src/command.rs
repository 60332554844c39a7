//! G-Code command value object and its lifecycle
//!
//! A [`GcodeCommand`] is one line headed for the firmware. It is created by a
//! stream reader or issued directly (jog, homing, unlock), marked sent when its
//! bytes are handed to the transport, accumulates response text, and is marked
//! done exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique (per session) identifier of a command
pub type CommandId = u64;

/// Command lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    /// Created, not yet sent
    Pending,
    /// Sent to the controller, awaiting its terminal response
    Sent,
    /// Terminal response received (or completion forced)
    Done,
    /// Never sent because nothing remained after stripping comments
    Skipped,
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Sent => write!(f, "Sent"),
            Self::Done => write!(f, "Done"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Why a command finished without success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFailure {
    /// Firmware error code, when the firmware sent one
    pub code: Option<u32>,
    /// Human readable reason
    pub message: String,
}

/// A single line of G-code (or firmware system command) and its progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcodeCommand {
    /// Identifier assigned at creation
    pub id: CommandId,
    /// Text sent to the firmware, without line terminator
    pub text: String,
    /// Text as it appeared in the program
    pub original_text: String,
    /// Comment stripped from the line, if any
    pub comment: Option<String>,
    /// 1-based row in the program, when read from a stream
    pub line_number: Option<usize>,
    /// Accumulated response text
    pub response: String,
    /// Lifecycle state
    pub state: CommandState,
    /// Whether the terminal response was a success
    pub ok: bool,
    /// Failure details for commands completed without success
    pub failure: Option<CommandFailure>,
    /// Modal changes made by this command are undone afterwards (jogging)
    pub temporary_modal_change: bool,
    /// May be admitted while the controller is in ALARM (unlock, homing)
    pub alarm_exempt: bool,
    /// When the command was handed to the transport
    pub sent_at: Option<DateTime<Utc>>,
    /// When the command completed
    pub completed_at: Option<DateTime<Utc>>,
}

impl GcodeCommand {
    /// Create a command from raw text
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into().trim().to_string();
        Self {
            id: 0,
            original_text: text.clone(),
            text,
            comment: None,
            line_number: None,
            response: String::new(),
            state: CommandState::Pending,
            ok: false,
            failure: None,
            temporary_modal_change: false,
            alarm_exempt: false,
            sent_at: None,
            completed_at: None,
        }
    }

    /// Builder method to set the identifier
    pub fn with_id(mut self, id: CommandId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to record the program text this command came from
    pub fn with_original_text(mut self, original: impl Into<String>) -> Self {
        self.original_text = original.into();
        self
    }

    /// Builder method to attach the stripped comment
    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment.filter(|c| !c.is_empty());
        self
    }

    /// Builder method to set the program row
    pub fn with_line_number(mut self, line_number: usize) -> Self {
        self.line_number = Some(line_number);
        self
    }

    /// Mark modal changes made by this command as temporary
    pub fn temporary_modal(mut self) -> Self {
        self.temporary_modal_change = true;
        self
    }

    /// Allow this command through an alarm lock
    pub fn alarm_exempt(mut self) -> Self {
        self.alarm_exempt = true;
        self
    }

    /// Bytes this command occupies in the firmware receive buffer
    pub fn byte_cost(&self) -> usize {
        self.text.len() + 1
    }

    /// True when nothing is left to send once comments are removed
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Mark this command as sent
    pub fn mark_sent(&mut self) {
        debug_assert!(
            self.state == CommandState::Pending,
            "mark_sent called on command in {:?} state (expected Pending)",
            self.state
        );
        self.state = CommandState::Sent;
        self.sent_at = Some(Utc::now());
    }

    /// Append a line of response text
    pub fn append_response(&mut self, line: &str) {
        if !self.response.is_empty() {
            self.response.push('\n');
        }
        self.response.push_str(line);
    }

    /// Record the terminal response
    ///
    /// Returns `false`, changing nothing, when the command was already done.
    pub fn mark_done(&mut self, ok: bool, failure: Option<CommandFailure>) -> bool {
        if self.state == CommandState::Done {
            return false;
        }
        self.state = CommandState::Done;
        self.ok = ok;
        self.failure = if ok { None } else { failure };
        self.completed_at = Some(Utc::now());
        true
    }

    /// Mark this command as skipped
    pub fn mark_skipped(&mut self) {
        debug_assert!(
            self.state == CommandState::Pending,
            "mark_skipped called on command in {:?} state (expected Pending)",
            self.state
        );
        self.state = CommandState::Skipped;
        self.ok = true;
        self.completed_at = Some(Utc::now());
    }

    /// Check if command has been sent
    pub fn is_sent(&self) -> bool {
        matches!(self.state, CommandState::Sent | CommandState::Done)
    }

    /// Check if command reached its terminal response
    pub fn is_done(&self) -> bool {
        self.state == CommandState::Done
    }

    /// Check if command finished successfully
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Check if command was skipped
    pub fn is_skipped(&self) -> bool {
        self.state == CommandState::Skipped
    }

    /// Time between sending and completion
    pub fn execution_duration(&self) -> Option<chrono::Duration> {
        match (self.sent_at, self.completed_at) {
            (Some(sent), Some(done)) => Some(done - sent),
            _ => None,
        }
    }
}

impl std::fmt::Display for GcodeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line_number {
            Some(n) => write!(f, "[{}] {}: {}", n, self.state, self.text),
            None => write!(f, "{}: {}", self.state, self.text),
        }
    }
}

/// Command numbering generator for sequential tracking
///
/// One generator belongs to one session; clones share the counter.
#[derive(Clone)]
pub struct CommandNumberGenerator {
    counter: Arc<AtomicU64>,
}

impl CommandNumberGenerator {
    /// Create a new command number generator starting at 1
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Get the next command number
    pub fn next(&self) -> CommandId {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Reset the counter
    pub fn reset(&self) {
        self.counter.store(1, Ordering::Relaxed);
    }
}

impl Default for CommandNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_ok() {
        let mut cmd = GcodeCommand::new("G0 X1");
        assert_eq!(cmd.byte_cost(), 6);
        cmd.mark_sent();
        assert!(cmd.is_sent());
        cmd.append_response("ok");
        assert!(cmd.mark_done(true, None));
        assert!(cmd.is_done());
        assert!(cmd.is_ok());
        assert_eq!(cmd.response, "ok");
    }

    #[test]
    fn test_done_only_once() {
        let mut cmd = GcodeCommand::new("G38.2");
        cmd.mark_sent();
        assert!(cmd.mark_done(
            false,
            Some(CommandFailure {
                code: Some(9),
                message: "error:9".into()
            })
        ));
        assert!(!cmd.mark_done(true, None));
        assert!(!cmd.is_ok());
        assert_eq!(cmd.failure.as_ref().and_then(|f| f.code), Some(9));
    }

    #[test]
    fn test_generator_is_sequential() {
        let ids = CommandNumberGenerator::new();
        let shared = ids.clone();
        assert_eq!(ids.next(), 1);
        assert_eq!(shared.next(), 2);
        ids.reset();
        assert_eq!(shared.next(), 1);
    }
}
