//! Buffered communication with flow control and acknowledgment tracking
//!
//! Implements character-counting streaming: the firmware can hold at most
//! `buffer_size` bytes of unacknowledged command text, so a command is only
//! written once `sent + len + 1 <= buffer_size` (the `+1` is the line
//! terminator). Acknowledgements carry no identifier; they always complete the
//! oldest active command.
//!
//! # Features
//! - Manual command queue with priority over stream rows
//! - Lazy pulling from a [`GcodeStreamReader`]
//! - Skipping of rows with nothing left after comment removal
//! - Single-step mode and a configurable error policy
//! - Pause/resume and cancel without retracting sent bytes
//! - Row statistics and send duration excluding paused time
//!
//! The flow controller performs no I/O of its own: admitted commands are
//! written through a [`LineWriter`] while the caller holds the controller's
//! lock, which keeps write order identical to admission order.

use crate::communication::Communicator;
use gcodestream_core::{
    CommandFailure, CommandNumberGenerator, ControllerError, GcodeCommand, GcodeStreamReader,
    Result, StreamProgress,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Destination for admitted command lines
pub trait LineWriter: Send + Sync {
    /// Write one command line (terminator added by the writer)
    fn write_line(&self, text: &str) -> Result<()>;
}

impl LineWriter for Communicator {
    fn write_line(&self, text: &str) -> Result<()> {
        Communicator::write_line(self, text)
    }
}

/// What happens to the rest of a stream when a command fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Keep streaming
    #[default]
    Continue,
    /// Stop admitting until resumed
    Pause,
    /// Drop everything still pending
    Halt,
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Pause => write!(f, "pause"),
            Self::Halt => write!(f, "halt"),
        }
    }
}

impl std::str::FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "pause" => Ok(Self::Pause),
            "halt" => Ok(Self::Halt),
            other => Err(format!("unknown error policy '{}'", other)),
        }
    }
}

/// Configuration for buffered communication
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedCommunicatorConfig {
    /// Firmware receive buffer capacity in bytes
    pub buffer_size: usize,
    /// Admit a command only when nothing else is active
    pub single_step_mode: bool,
    /// Reaction to a failed command while streaming
    pub error_policy: ErrorPolicy,
}

impl Default for BufferedCommunicatorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 127,
            single_step_mode: false,
            error_policy: ErrorPolicy::Continue,
        }
    }
}

/// Something the flow controller did, in the order it happened
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Command admitted and written
    Sent(Arc<GcodeCommand>),
    /// Row had nothing to send
    Skipped(Arc<GcodeCommand>),
    /// Oldest active command reached its terminal response
    Completed(Arc<GcodeCommand>),
    /// A failure paused admission
    PausedOnError(Arc<GcodeCommand>),
    /// A failure dropped the rest of the stream
    Halted(Arc<GcodeCommand>),
    /// Stream row too large for the receive buffer; the stream stops here
    Rejected {
        /// The oversized row
        command: Arc<GcodeCommand>,
        /// Why it was rejected
        error: ControllerError,
    },
    /// The stream reader failed; the stream stops here
    ReadFailed(String),
}

/// Result of a finished stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    /// No command failed and nothing was rejected
    pub success: bool,
    /// Time spent sending, excluding pauses
    pub duration: Duration,
}

/// Wall clock of a stream with paused intervals removed
#[derive(Debug, Default)]
struct SendTimer {
    started: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl SendTimer {
    fn start(&mut self) {
        *self = Self {
            started: Some(Instant::now()),
            ..Default::default()
        };
    }

    fn pause(&mut self) {
        if self.started.is_some() && self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += at.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let paused = self.paused_total
            + self
                .paused_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
        started.elapsed().saturating_sub(paused)
    }
}

/// Flow controller between the command sources and the transport
pub struct BufferedCommunicator {
    config: BufferedCommunicatorConfig,
    ids: CommandNumberGenerator,
    /// Manual commands; admitted before stream rows
    command_queue: VecDeque<GcodeCommand>,
    /// Stream rows pulled from the reader but not yet admitted
    stream_queue: VecDeque<GcodeCommand>,
    reader: Option<Box<dyn GcodeStreamReader>>,
    /// Sent commands awaiting their terminal response, oldest first
    active_commands: VecDeque<GcodeCommand>,
    /// Bytes of active command text, terminators included
    sent_buffer_size: usize,
    send_paused: bool,
    alarm_locked: bool,
    streaming: bool,
    stream_failed: bool,
    error_count: usize,
    progress: StreamProgress,
    timer: SendTimer,
}

impl BufferedCommunicator {
    /// Create a new flow controller
    pub fn new(config: BufferedCommunicatorConfig) -> Self {
        Self {
            config,
            ids: CommandNumberGenerator::new(),
            command_queue: VecDeque::new(),
            stream_queue: VecDeque::new(),
            reader: None,
            active_commands: VecDeque::new(),
            sent_buffer_size: 0,
            send_paused: false,
            alarm_locked: false,
            streaming: false,
            stream_failed: false,
            error_count: 0,
            progress: StreamProgress::default(),
            timer: SendTimer::default(),
        }
    }

    /// Current configuration
    pub fn config(&self) -> &BufferedCommunicatorConfig {
        &self.config
    }

    /// Change the receive buffer capacity (the dialect is known only at connect)
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.config.buffer_size = buffer_size;
    }

    /// Enable or disable single-step mode
    pub fn set_single_step_mode(&mut self, enabled: bool) {
        self.config.single_step_mode = enabled;
    }

    /// Change the error policy
    pub fn set_error_policy(&mut self, policy: ErrorPolicy) {
        self.config.error_policy = policy;
    }

    /// Queue a manual command ahead of any stream rows
    ///
    /// # Errors
    /// [`ControllerError::CommandOverflow`] if the command can never fit the buffer
    pub fn queue_command(&mut self, command: GcodeCommand) -> Result<()> {
        self.check_fits(&command)?;
        self.command_queue.push_back(command);
        Ok(())
    }

    /// Queue a manual command ahead of everything else pending
    pub fn queue_command_front(&mut self, command: GcodeCommand) -> Result<()> {
        self.check_fits(&command)?;
        self.command_queue.push_front(command);
        Ok(())
    }

    fn check_fits(&self, command: &GcodeCommand) -> std::result::Result<(), ControllerError> {
        if command.byte_cost() > self.config.buffer_size {
            return Err(ControllerError::CommandOverflow {
                length: command.byte_cost(),
                capacity: self.config.buffer_size,
            });
        }
        Ok(())
    }

    /// Attach a program to stream; returns the number of rows it will process
    ///
    /// # Errors
    /// [`ControllerError::Busy`] if a stream is already open
    pub fn start_stream(&mut self, reader: Box<dyn GcodeStreamReader>) -> Result<usize> {
        if self.streaming {
            return Err(ControllerError::Busy.into());
        }
        let rows = reader.rows_remaining();
        self.stream_queue.clear();
        if let Some(preamble) = reader.preamble() {
            let preamble = GcodeCommand::new(preamble);
            self.check_fits(&preamble)?;
            tracing::debug!("Stream preamble: {}", preamble.text);
            self.stream_queue.push_back(preamble);
        }
        self.reader = Some(reader);
        self.streaming = true;
        self.stream_failed = false;
        self.error_count = 0;
        self.progress = StreamProgress {
            total_rows: rows,
            ..Default::default()
        };
        self.timer.start();
        if self.send_paused {
            self.timer.pause();
        }
        Ok(rows)
    }

    /// A stream is open (possibly paused or draining)
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Check if there is room in the controller buffer for a command
    fn has_room_in_buffer(&self, byte_cost: usize) -> bool {
        self.sent_buffer_size + byte_cost <= self.config.buffer_size
    }

    /// Next stream row, pulling from the reader when nothing is cached
    fn peek_stream(&mut self, events: &mut Vec<FlowEvent>) -> Option<&GcodeCommand> {
        if self.stream_queue.is_empty() {
            let reader = self.reader.as_mut()?;
            match reader.next_command() {
                Ok(Some(command)) => {
                    if command.byte_cost() > self.config.buffer_size {
                        let error = ControllerError::CommandOverflow {
                            length: command.byte_cost(),
                            capacity: self.config.buffer_size,
                        };
                        tracing::warn!("Row rejected: {}", error);
                        self.stop_stream_source();
                        self.stream_failed = true;
                        self.progress.error_rows += 1;
                        events.push(FlowEvent::Rejected {
                            command: Arc::new(command),
                            error,
                        });
                        return None;
                    }
                    self.stream_queue.push_back(command);
                }
                Ok(None) => {
                    self.reader = None;
                    return None;
                }
                Err(e) => {
                    tracing::error!("Stream read failed: {}", e);
                    self.stop_stream_source();
                    self.stream_failed = true;
                    events.push(FlowEvent::ReadFailed(e.to_string()));
                    return None;
                }
            }
        }
        self.stream_queue.front()
    }

    fn stop_stream_source(&mut self) {
        self.reader = None;
        self.stream_queue.clear();
    }

    /// Admit as many pending commands as the buffer allows, writing each one
    ///
    /// # Errors
    /// Returns the writer's error; the command that failed to write stays
    /// pending and the events produced before it are lost with the link.
    pub fn stream_commands(&mut self, out: &dyn LineWriter) -> Result<Vec<FlowEvent>> {
        let mut events = Vec::new();
        self.admit(out, &mut events)?;
        Ok(events)
    }

    fn admit(&mut self, out: &dyn LineWriter, events: &mut Vec<FlowEvent>) -> Result<()> {
        loop {
            if self.send_paused {
                break;
            }
            if self.config.single_step_mode && !self.active_commands.is_empty() {
                break;
            }

            let from_manual = !self.command_queue.is_empty();
            let (empty, exempt, cost) = {
                let candidate = if from_manual {
                    self.command_queue.front()
                } else {
                    self.peek_stream(events)
                };
                let Some(candidate) = candidate else {
                    break;
                };
                (
                    candidate.is_empty(),
                    candidate.alarm_exempt,
                    candidate.byte_cost(),
                )
            };

            if empty {
                let mut command = self.pop_candidate(from_manual);
                command.mark_skipped();
                if command.line_number.is_some() {
                    self.progress.completed_rows += 1;
                }
                tracing::trace!("Skipped: {}", command.original_text);
                events.push(FlowEvent::Skipped(Arc::new(command)));
                continue;
            }
            if self.alarm_locked && !exempt {
                break;
            }
            if !self.has_room_in_buffer(cost) {
                break;
            }

            let mut command = self.pop_candidate(from_manual);
            if let Err(e) = out.write_line(&command.text) {
                tracing::error!("Failed to send command: {}", e);
                if from_manual {
                    self.command_queue.push_front(command);
                } else {
                    self.stream_queue.push_front(command);
                }
                return Err(e);
            }
            command.id = self.ids.next();
            command.mark_sent();
            self.sent_buffer_size += command.byte_cost();
            if command.line_number.is_some() {
                self.progress.sent_rows += 1;
            }
            debug_assert!(self.sent_buffer_size <= self.config.buffer_size);
            events.push(FlowEvent::Sent(Arc::new(command.clone())));
            self.active_commands.push_back(command);
        }
        Ok(())
    }

    fn pop_candidate(&mut self, from_manual: bool) -> GcodeCommand {
        let queue = if from_manual {
            &mut self.command_queue
        } else {
            &mut self.stream_queue
        };
        // The candidate was just observed at the front
        queue.pop_front().unwrap_or_else(|| GcodeCommand::new(""))
    }

    /// Append a non-terminal response line to the oldest active command
    ///
    /// Returns `false` when nothing is active.
    pub fn append_response(&mut self, line: &str) -> bool {
        match self.active_commands.front_mut() {
            Some(command) => {
                command.append_response(line);
                true
            }
            None => false,
        }
    }

    /// Oldest active command, if any
    pub fn oldest_active(&self) -> Option<&GcodeCommand> {
        self.active_commands.front()
    }

    /// Complete the oldest active command, free its bytes, then admit more
    ///
    /// A `failure` marks the command not-ok and applies the error policy.
    ///
    /// # Errors
    /// [`ControllerError::UnexpectedCommand`] if nothing is active; queue
    /// state is left untouched.
    pub fn complete_oldest(
        &mut self,
        out: &dyn LineWriter,
        response: &str,
        failure: Option<CommandFailure>,
    ) -> Result<Vec<FlowEvent>> {
        let Some(mut command) = self.active_commands.pop_front() else {
            return Err(ControllerError::UnexpectedCommand {
                response: response.to_string(),
            }
            .into());
        };
        self.sent_buffer_size = self.sent_buffer_size.saturating_sub(command.byte_cost());

        command.append_response(response);
        let ok = failure.is_none();
        command.mark_done(ok, failure);
        if command.line_number.is_some() {
            self.progress.completed_rows += 1;
            if !ok {
                self.progress.error_rows += 1;
            }
        }

        let command = Arc::new(command);
        let mut events = vec![FlowEvent::Completed(command.clone())];
        if !ok && self.streaming {
            self.error_count += 1;
            self.apply_error_policy(&command, &mut events);
        }

        self.admit(out, &mut events)?;
        Ok(events)
    }

    fn apply_error_policy(&mut self, command: &Arc<GcodeCommand>, events: &mut Vec<FlowEvent>) {
        match self.config.error_policy {
            ErrorPolicy::Continue => {}
            ErrorPolicy::Pause => {
                if self.pause() {
                    tracing::warn!("Stream paused on error: {}", command.text);
                    events.push(FlowEvent::PausedOnError(command.clone()));
                }
            }
            ErrorPolicy::Halt => {
                tracing::warn!("Stream halted on error: {}", command.text);
                self.stop_stream_source();
                self.command_queue.clear();
                events.push(FlowEvent::Halted(command.clone()));
            }
        }
    }

    /// Force-complete every active command as failed and release the buffer
    pub fn fail_all_active(&mut self, reason: &str) -> Vec<FlowEvent> {
        let mut events = Vec::with_capacity(self.active_commands.len());
        while let Some(mut command) = self.active_commands.pop_front() {
            command.mark_done(
                false,
                Some(CommandFailure {
                    code: None,
                    message: reason.to_string(),
                }),
            );
            if command.line_number.is_some() {
                self.progress.completed_rows += 1;
                self.progress.error_rows += 1;
            }
            if self.streaming {
                self.error_count += 1;
            }
            events.push(FlowEvent::Completed(Arc::new(command)));
        }
        self.sent_buffer_size = 0;
        events
    }

    /// Drop everything not yet sent and close the stream.
    ///
    /// Active commands are kept; their bytes are already with the firmware.
    /// Returns the number of queued commands dropped.
    pub fn cancel_send(&mut self) -> usize {
        let dropped = self.command_queue.len() + self.stream_queue.len();
        self.command_queue.clear();
        self.stop_stream_source();
        self.streaming = false;
        self.send_paused = false;
        self.timer.resume();
        tracing::info!(
            "Send cancelled: {} queued commands dropped, {} still active",
            dropped,
            self.active_commands.len()
        );
        dropped
    }

    /// Drop everything not yet sent and mark the open stream failed
    ///
    /// Used when the firmware flushed its own buffer (alarm). The stream
    /// closes with `success == false` once nothing it sent is still active.
    /// Returns the number of queued commands dropped.
    pub fn abort_stream(&mut self) -> usize {
        let dropped = self.command_queue.len() + self.stream_queue.len();
        self.command_queue.clear();
        self.stop_stream_source();
        if self.streaming {
            self.stream_failed = true;
        }
        self.send_paused = false;
        dropped
    }

    /// Forget all state (disconnect)
    pub fn reset(&mut self) {
        self.command_queue.clear();
        self.stop_stream_source();
        self.active_commands.clear();
        self.sent_buffer_size = 0;
        self.send_paused = false;
        self.alarm_locked = false;
        self.streaming = false;
        self.stream_failed = false;
        self.error_count = 0;
        self.progress = StreamProgress::default();
        self.timer = SendTimer::default();
        self.ids.reset();
    }

    /// Stop admitting; returns `false` if already paused
    pub fn pause(&mut self) -> bool {
        if self.send_paused {
            return false;
        }
        self.send_paused = true;
        self.timer.pause();
        true
    }

    /// Re-enable admission and admit what fits
    ///
    /// Resuming while not paused changes nothing.
    pub fn resume(&mut self, out: &dyn LineWriter) -> Result<Vec<FlowEvent>> {
        if !self.send_paused {
            return Ok(Vec::new());
        }
        self.send_paused = false;
        self.timer.resume();
        self.stream_commands(out)
    }

    /// Check if sending is paused
    pub fn is_paused(&self) -> bool {
        self.send_paused
    }

    /// Block admission of everything except alarm-exempt commands
    pub fn set_alarm_locked(&mut self, locked: bool) {
        if self.alarm_locked != locked {
            tracing::debug!("Alarm lock {}", if locked { "engaged" } else { "released" });
        }
        self.alarm_locked = locked;
    }

    /// Check if admission is alarm-locked
    pub fn is_alarm_locked(&self) -> bool {
        self.alarm_locked
    }

    /// Close the stream if everything it produced has completed
    pub fn take_finished_stream(&mut self) -> Option<StreamOutcome> {
        let source_drained = match &self.reader {
            None => true,
            Some(reader) => reader.rows_remaining() == 0,
        };
        if !self.streaming
            || !source_drained
            || !self.stream_queue.is_empty()
            || !self.active_commands.is_empty()
        {
            return None;
        }
        self.streaming = false;
        self.reader = None;
        self.timer.resume();
        let outcome = StreamOutcome {
            success: self.error_count == 0 && !self.stream_failed,
            duration: self.timer.elapsed(),
        };
        tracing::info!(
            "Stream finished: {} rows, {} errors, {:?}",
            self.progress.completed_rows,
            self.progress.error_rows,
            outcome.duration
        );
        Some(outcome)
    }

    /// Row counters of the current (or last) stream
    pub fn progress(&self) -> StreamProgress {
        self.progress
    }

    /// Rows not yet completed
    pub fn rows_remaining(&self) -> usize {
        self.progress
            .total_rows
            .saturating_sub(self.progress.completed_rows)
    }

    /// Time spent sending the current (or last) stream, pauses excluded
    pub fn send_duration(&self) -> Duration {
        self.timer.elapsed()
    }

    /// Failed commands in the current stream
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Commands queued but not yet sent (manual and cached stream rows)
    pub fn queued_commands_count(&self) -> usize {
        self.command_queue.len() + self.stream_queue.len()
    }

    /// Commands sent and awaiting completion
    pub fn active_commands_count(&self) -> usize {
        self.active_commands.len()
    }

    /// Bytes of active command text
    pub fn sent_buffer_size(&self) -> usize {
        self.sent_buffer_size
    }

    /// Something is queued, cached or streaming
    pub fn has_pending(&self) -> bool {
        !self.command_queue.is_empty() || !self.stream_queue.is_empty() || self.reader.is_some()
    }

    /// Get the current buffer usage as a percentage
    pub fn buffer_usage_percent(&self) -> u32 {
        if self.config.buffer_size == 0 {
            return 0;
        }

        ((self.sent_buffer_size as f64 / self.config.buffer_size as f64) * 100.0) as u32
    }
}

impl Default for BufferedCommunicator {
    fn default() -> Self {
        Self::new(BufferedCommunicatorConfig::default())
    }
}
