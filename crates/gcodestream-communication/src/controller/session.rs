//! Session state shared by the controller handle, the session task and the
//! status poll timer
//!
//! All queue, modal and cancel state sits behind one mutex. Events are
//! published while it is held, so listeners observe them in the order the
//! session changed.

use super::config::ControllerConfig;
use super::poller::{StatusPollTimer, StatusRequester};
use crate::communication::buffered::{BufferedCommunicator, BufferedCommunicatorConfig, FlowEvent};
use crate::communication::Communicator;
use crate::firmware::{CancelStrategy, FirmwareDialect, Response, StatusReport};
use gcodestream_core::{
    Axis, CommandFailure, CommunicatorState, ConsoleMessage, ControllerError, ControllerEvent,
    ControllerState, ControllerStatus, Error, EventDispatcher, FirmwareError, GcodeCommand,
    GcodeStreamReader, MessageType, OverrideCommand, PartialPosition, Result,
};
use gcodestream_gcode::{strip_comment, GcodeParser};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sub-state GRBL reports once a feed hold has brought the machine to rest
const HOLD_COMPLETE: &str = "Hold:0";

/// Progress of a cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelState {
    /// Nothing being cancelled
    Idle,
    /// Feed hold sent; reset once the machine is at rest
    AwaitingHold { deadline: Instant },
    /// Waiting for commands already sent to complete
    Draining { deadline: Instant },
}

pub(crate) struct Session {
    pub(crate) flow: BufferedCommunicator,
    pub(crate) link: Option<Communicator>,
    pub(crate) modal: GcodeParser,
    /// Boot handshake seen
    pub(crate) ready: bool,
    pub(crate) cancel: CancelState,
    pub(crate) last_alarm: Option<(u32, String)>,
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) dialect: Box<dyn FirmwareDialect>,
    pub(crate) config: RwLock<ControllerConfig>,
    pub(crate) session: Mutex<Session>,
    status: RwLock<Arc<ControllerStatus>>,
    pub(crate) events: EventDispatcher,
    pub(crate) poller: Arc<StatusPollTimer>,
}

impl Shared {
    pub(crate) fn new(dialect: Box<dyn FirmwareDialect>, config: ControllerConfig) -> Self {
        let flow = BufferedCommunicator::new(BufferedCommunicatorConfig {
            buffer_size: config.buffer_size.unwrap_or_else(|| dialect.buffer_size()),
            single_step_mode: config.single_step_mode,
            error_policy: config.error_policy,
        });
        let poller = Arc::new(StatusPollTimer::new(
            config.status_poll_rate_ms,
            dialect.min_status_poll_ms(),
            config.status_polling_enabled,
            config.max_outstanding_polls,
        ));
        Self {
            name: dialect.controller_type().to_string(),
            dialect,
            config: RwLock::new(config),
            session: Mutex::new(Session {
                flow,
                link: None,
                modal: GcodeParser::new(),
                ready: false,
                cancel: CancelState::Idle,
                last_alarm: None,
            }),
            status: RwLock::new(Arc::new(ControllerStatus::new())),
            events: EventDispatcher::default(),
            poller,
        }
    }

    pub(crate) fn status(&self) -> Arc<ControllerStatus> {
        self.status.read().clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session.lock().link.is_some()
    }

    pub(crate) fn is_ready(&self) -> bool {
        let session = self.session.lock();
        session.link.is_some() && session.ready
    }

    // ---- publishing ----

    /// Swap in a new snapshot and tell listeners what changed
    fn publish_status(&self, status: ControllerStatus) {
        let mut current = self.status.write();
        if **current == status {
            return;
        }
        let state_changed = current.state != status.state;
        let status = Arc::new(status);
        *current = status.clone();
        drop(current);

        if state_changed {
            tracing::info!("State: {}", status.state);
            self.events.emit(ControllerEvent::StateChanged(status.state));
        }
        self.events.emit(ControllerEvent::StatusChanged(status));
    }

    fn set_state(&self, state: ControllerState) {
        let status = (*self.status())
            .clone()
            .with_state(state)
            .with_sub_state(None);
        self.publish_status(status);
    }

    fn console(&self, level: MessageType, text: impl Into<String>) {
        self.events
            .emit(ControllerEvent::ConsoleMessage(ConsoleMessage::new(level, text)));
    }

    /// Publish what the flow controller did, then close a finished stream
    fn dispatch(&self, session: &mut Session, events: Vec<FlowEvent>) {
        let mut unlocked = false;
        for event in events {
            match event {
                FlowEvent::Sent(command) => {
                    self.events.emit(ControllerEvent::CommandSent(command));
                }
                FlowEvent::Skipped(command) => {
                    self.events.emit(ControllerEvent::CommandSkipped(command));
                }
                FlowEvent::Completed(command) => {
                    unlocked |= self.on_command_complete(session, &command);
                    self.events.emit(ControllerEvent::CommandComplete(command));
                }
                FlowEvent::PausedOnError(command) => {
                    self.console(
                        MessageType::Error,
                        format!("Stream paused after error in '{}'", command.text),
                    );
                    self.events
                        .emit(ControllerEvent::StreamPausedOnError(command));
                }
                FlowEvent::Halted(command) => {
                    self.console(
                        MessageType::Error,
                        format!("Stream halted after error in '{}'", command.text),
                    );
                }
                FlowEvent::Rejected { command, error } => {
                    let row = command
                        .line_number
                        .map(|n| format!("Row {}", n))
                        .unwrap_or_else(|| "Command".to_string());
                    self.console(MessageType::Error, format!("{} rejected: {}", row, error));
                }
                FlowEvent::ReadFailed(reason) => {
                    self.console(MessageType::Error, format!("Stream read failed: {}", reason));
                }
            }
        }

        if let Some(outcome) = session.flow.take_finished_stream() {
            let duration_ms = outcome.duration.as_millis() as u64;
            self.console(
                MessageType::Info,
                format!(
                    "Stream {} in {}ms",
                    if outcome.success { "complete" } else { "finished with errors" },
                    duration_ms
                ),
            );
            self.events.emit(ControllerEvent::StreamComplete {
                success: outcome.success,
                duration_ms,
            });
        }
        if matches!(session.cancel, CancelState::Draining { .. })
            && session.flow.active_commands_count() == 0
        {
            tracing::debug!("Cancel drained");
            session.cancel = CancelState::Idle;
        }
        if unlocked {
            if let Err(e) = self.admit(session) {
                tracing::error!("Failed to send after unlock: {}", e);
            }
        }
    }

    /// Track modal state and alarm release; returns `true` when the alarm
    /// lock was released
    fn on_command_complete(&self, session: &mut Session, command: &GcodeCommand) -> bool {
        if !command.is_ok() {
            return false;
        }
        if !command.temporary_modal_change {
            if let Err(e) = session.modal.process(&command.text) {
                tracing::debug!("Modal state not updated from '{}': {}", command.text, e);
            }
        }
        let clears_alarm = command.text == self.dialect.unlock_command().text
            || command.text == self.dialect.homing_command().text;
        if clears_alarm && session.flow.is_alarm_locked() {
            tracing::info!("Alarm cleared by '{}'", command.text);
            session.flow.set_alarm_locked(false);
            session.last_alarm = None;
            if self.status().state == ControllerState::Alarm {
                self.set_state(ControllerState::Idle);
            }
            return true;
        }
        false
    }

    // ---- admission ----

    fn admit(&self, session: &mut Session) -> Result<()> {
        let events = {
            let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
            session.flow.stream_commands(link)?
        };
        self.dispatch(session, events);
        Ok(())
    }

    fn complete_oldest(&self, session: &mut Session, line: &str, failure: Option<CommandFailure>) {
        let result = match session.link.as_ref() {
            Some(link) => session.flow.complete_oldest(link, line, failure),
            None => return,
        };
        match result {
            Ok(events) => self.dispatch(session, events),
            Err(Error::Controller(ControllerError::UnexpectedCommand { .. })) => {
                tracing::debug!("Ignoring '{}' with no active command", line);
            }
            Err(e) => tracing::error!("Failed to send after completion: {}", e),
        }
    }

    fn ensure_ready(&self, session: &Session) -> Result<()> {
        if session.link.is_none() {
            return Err(ControllerError::NotConnected.into());
        }
        if !session.ready {
            return Err(ControllerError::NotReady {
                reason: "waiting for the firmware to finish booting".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn ensure_not_alarmed(&self, session: &Session, command: &GcodeCommand) -> Result<()> {
        if !session.flow.is_alarm_locked() || command.alarm_exempt {
            return Ok(());
        }
        let (code, message) = session
            .last_alarm
            .clone()
            .unwrap_or_else(|| (0, "machine is in alarm state".to_string()));
        Err(ControllerError::Alarm { code, message }.into())
    }

    fn ensure_not_streaming(&self, session: &Session) -> Result<()> {
        if session.flow.is_streaming() || session.cancel != CancelState::Idle {
            return Err(ControllerError::Busy.into());
        }
        Ok(())
    }

    // ---- session lifecycle ----

    /// Install a freshly opened link; hands it back if one is already open
    pub(crate) fn start_session(&self, link: Communicator) -> std::result::Result<(), Communicator> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        if session.link.is_some() {
            return Err(link);
        }
        let config = self.config.read().clone();
        session.flow.reset();
        session
            .flow
            .set_buffer_size(config.buffer_size.unwrap_or_else(|| self.dialect.buffer_size()));
        session.flow.set_single_step_mode(config.single_step_mode);
        session.flow.set_error_policy(config.error_policy);
        session.modal.reset();
        session.ready = false;
        session.cancel = CancelState::Idle;
        session.last_alarm = None;
        self.poller.reset();

        let address = link.address().to_string();
        session.link = Some(link);
        tracing::info!("Connected to {} controller at {}", self.name, address);
        self.events.emit(ControllerEvent::Connected {
            firmware: self.name.clone(),
            address: address.clone(),
        });
        self.console(MessageType::Info, format!("Connected to {}", address));
        self.set_state(ControllerState::Connecting);
        Ok(())
    }

    /// Fail everything in flight and close the link
    ///
    /// `reason` is set when the link failed rather than being closed.
    pub(crate) async fn end_session(&self, reason: Option<String>) {
        let link = {
            let mut guard = self.session.lock();
            let session = &mut *guard;
            let Some(link) = session.link.take() else {
                return;
            };
            self.abort_commands(session, reason.as_deref().unwrap_or("Disconnected"));
            session.flow.reset();
            session.ready = false;
            session.last_alarm = None;
            self.publish_status(ControllerStatus::new());

            match &reason {
                Some(reason) => {
                    tracing::error!("Connection to {} lost: {}", link.address(), reason);
                    self.console(MessageType::Error, format!("Connection lost: {}", reason));
                }
                None => {
                    tracing::info!("Disconnected from {}", link.address());
                    self.console(MessageType::Info, "Disconnected");
                }
            }
            self.events.emit(ControllerEvent::Disconnected { reason });
            link
        };
        link.close().await;
    }

    /// Drop everything queued and force-fail everything active
    fn abort_commands(&self, session: &mut Session, reason: &str) {
        let was_streaming = session.flow.is_streaming();
        session.flow.cancel_send();
        if was_streaming {
            self.events.emit(ControllerEvent::StreamCanceled);
        }
        let events = session.flow.fail_all_active(reason);
        session.flow.set_alarm_locked(false);
        session.modal.reset();
        session.cancel = CancelState::Idle;
        self.poller.reset();
        self.dispatch(session, events);
    }

    fn reset_firmware(&self, session: &mut Session, reason: &str) -> Result<()> {
        let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
        link.send_byte_immediately(self.dialect.soft_reset_byte())?;
        tracing::info!("Soft reset: {}", reason);
        self.abort_commands(session, reason);

        let state = self.dialect.state_after_reset();
        if state == ControllerState::Connecting {
            session.ready = false;
        }
        self.set_state(state);
        Ok(())
    }

    /// Firmware finished booting (or identified itself on a link without a
    /// boot banner)
    fn on_ready(&self, session: &mut Session, version: Option<String>) {
        session.ready = true;
        match &version {
            Some(version) => {
                tracing::info!("Firmware: {}", version);
                self.console(MessageType::Info, format!("{} ready", version));
                self.events
                    .emit(ControllerEvent::FirmwareVersion(version.clone()));
            }
            None => self.console(MessageType::Info, format!("{} ready", self.name)),
        }
        if matches!(
            self.status().state,
            ControllerState::Connecting | ControllerState::Disconnected | ControllerState::Unknown
        ) {
            self.set_state(ControllerState::Idle);
        }
        for command in self.dialect.handshake_commands() {
            if let Err(e) = session.flow.queue_command(command) {
                tracing::warn!("Handshake command not queued: {}", e);
            }
        }
        if let Err(e) = self.admit(session) {
            tracing::error!("Failed to send handshake: {}", e);
        }
    }

    // ---- responses ----

    pub(crate) fn handle_line(&self, line: &str) {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        for (index, response) in self.dialect.parse_line(line).into_iter().enumerate() {
            self.handle_response(session, line, response, index == 0);
        }
    }

    fn handle_response(&self, session: &mut Session, line: &str, response: Response, first: bool) {
        match response {
            Response::Ok => {
                self.console(MessageType::Verbose, line);
                self.complete_oldest(session, line, None);
            }
            Response::Error { code, message } => {
                let text = match session.flow.oldest_active() {
                    Some(command) => format!("{} in '{}': {}", line, command.text, message),
                    None => format!("{}: {}", line, message),
                };
                tracing::warn!("{}", text);
                self.console(MessageType::Error, text);
                self.complete_oldest(session, line, Some(CommandFailure { code, message }));
            }
            Response::Status(report) => self.on_status(session, line, report),
            Response::Alarm { code, message } => self.on_alarm(session, code, message),
            Response::ParserState(words) => {
                if let Err(e) = session.modal.process_parser_state(&words) {
                    tracing::debug!("Parser state '{}' not applied: {}", words, e);
                }
                if first {
                    session.flow.append_response(line);
                }
                self.console(MessageType::Verbose, line);
            }
            Response::Welcome { version } => {
                if session.ready {
                    tracing::warn!("Firmware restarted: {}", version);
                    self.console(MessageType::Info, format!("Firmware restarted ({})", version));
                    self.abort_commands(session, "Firmware restarted");
                }
                self.on_ready(session, Some(version));
            }
            Response::Version(version) => {
                session.flow.append_response(line);
                if session.ready {
                    self.console(MessageType::Info, line);
                    self.events.emit(ControllerEvent::FirmwareVersion(version));
                } else {
                    self.on_ready(session, Some(version));
                }
            }
            Response::Feedback(text) => {
                session.flow.append_response(line);
                self.console(MessageType::Info, text);
            }
            Response::Warning(message) => {
                tracing::warn!("Firmware reported: {}", message);
                self.console(MessageType::Error, message);
            }
            Response::Unknown(text) => {
                tracing::debug!("Unrecognised response: {}", text);
                self.console(MessageType::Info, text);
            }
        }
    }

    fn on_status(&self, session: &mut Session, line: &str, report: StatusReport) {
        self.poller.report_received();
        self.console(MessageType::Verbose, line);
        if !session.ready && self.dialect.ready_on_status() {
            self.on_ready(session, None);
        }

        let mut status = report.apply_to(&self.status());
        if !session.ready {
            status.state = ControllerState::Connecting;
        }
        let was_locked = session.flow.is_alarm_locked();
        let in_alarm = status.state == ControllerState::Alarm;
        session.flow.set_alarm_locked(in_alarm);
        let hold_complete = status.sub_state.as_deref() == Some(HOLD_COMPLETE);
        let at_rest = status.state.is_idle();
        self.publish_status(status);

        if let CancelState::AwaitingHold { .. } = session.cancel {
            if hold_complete {
                if let Err(e) = self.reset_firmware(session, "Stream canceled") {
                    tracing::error!("Reset after cancel failed: {}", e);
                }
            } else if at_rest && session.flow.active_commands_count() == 0 {
                session.cancel = CancelState::Idle;
            }
        }
        if was_locked && !in_alarm {
            session.last_alarm = None;
            if let Err(e) = self.admit(session) {
                tracing::error!("Failed to send after alarm cleared: {}", e);
            }
        }
    }

    /// The firmware drops whatever it had buffered on an alarm and never
    /// acknowledges it, so active commands fail here and the stream closes.
    fn on_alarm(&self, session: &mut Session, code: u32, message: String) {
        tracing::warn!("Alarm {}: {}", code, message);
        let text = format!("ALARM:{} ({})", code, message);
        session.flow.set_alarm_locked(true);
        session.last_alarm = Some((code, message.clone()));
        session.cancel = CancelState::Idle;
        self.set_state(ControllerState::Alarm);
        self.console(MessageType::Error, text.clone());
        self.events.emit(ControllerEvent::Alarm { code, message });

        let dropped = session.flow.abort_stream();
        if dropped > 0 {
            tracing::info!("{} queued commands dropped on alarm", dropped);
        }
        let events = session.flow.fail_all_active(&text);
        self.dispatch(session, events);
    }

    // ---- cancel ----

    fn drain_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.read().drain_timeout_ms)
    }

    fn start_drain(&self, session: &mut Session) {
        session.cancel = if session.flow.active_commands_count() > 0 {
            CancelState::Draining {
                deadline: self.drain_deadline(),
            }
        } else {
            CancelState::Idle
        };
    }

    /// Fail stuck commands and finish stalled holds
    pub(crate) fn check_deadlines(&self) {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        let now = Instant::now();
        match session.cancel {
            CancelState::AwaitingHold { deadline } if now >= deadline => {
                tracing::warn!("Machine did not come to rest after cancel, resetting");
                if let Err(e) = self.reset_firmware(session, "Cancel timed out") {
                    tracing::error!("Reset after cancel failed: {}", e);
                }
            }
            CancelState::Draining { deadline } if now >= deadline => {
                let reason = ControllerError::Timeout {
                    timeout_ms: self.config.read().drain_timeout_ms,
                }
                .to_string();
                tracing::warn!(
                    "{} commands still active after cancel: {}",
                    session.flow.active_commands_count(),
                    reason
                );
                self.console(MessageType::Error, reason.clone());
                session.cancel = CancelState::Idle;
                let events = session.flow.fail_all_active(&reason);
                self.dispatch(session, events);
            }
            _ => {}
        }
    }

    // ---- operations ----

    pub(crate) fn send_command(&self, mut command: GcodeCommand) -> Result<()> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        self.ensure_ready(session)?;
        let (code, comment) = strip_comment(&command.text);
        if comment.is_some() {
            command.text = code;
            command.comment = comment;
        }
        if command.text == self.dialect.unlock_command().text
            || command.text == self.dialect.homing_command().text
        {
            command.alarm_exempt = true;
        }
        self.ensure_not_alarmed(session, &command)?;
        session.flow.queue_command(command)?;
        self.admit(session)
    }

    pub(crate) fn send(&self, program: Box<dyn GcodeStreamReader>) -> Result<()> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        self.ensure_ready(session)?;
        self.ensure_not_streaming(session)?;
        self.ensure_not_alarmed(session, &GcodeCommand::new(""))?;
        let state = self.status().state;
        if state.is_moving() || state.is_held() {
            return Err(ControllerError::InvalidState {
                operation: "start a stream".to_string(),
                state: state.to_string(),
            }
            .into());
        }
        let rows = session.flow.start_stream(program)?;
        tracing::info!("Streaming {} rows", rows);
        self.console(MessageType::Info, format!("Streaming {} rows", rows));
        self.events.emit(ControllerEvent::StreamStarted { rows });
        self.admit(session)
    }

    pub(crate) fn pause(&self) -> Result<()> {
        let mut guard = self.session.lock();
        self.pause_locked(&mut guard)
    }

    fn pause_locked(&self, session: &mut Session) -> Result<()> {
        let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
        if session.flow.is_paused() {
            return Ok(());
        }
        link.send_byte_immediately(self.dialect.feed_hold_byte())?;
        session.flow.pause();
        tracing::info!("Stream paused");
        self.events.emit(ControllerEvent::StreamPaused);
        Ok(())
    }

    pub(crate) fn resume(&self) -> Result<()> {
        let mut guard = self.session.lock();
        self.resume_locked(&mut guard)
    }

    fn resume_locked(&self, session: &mut Session) -> Result<()> {
        let was_paused = session.flow.is_paused();
        if !was_paused && !self.status().state.is_held() {
            return Ok(());
        }
        let events = {
            let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
            link.send_byte_immediately(self.dialect.cycle_start_byte())?;
            session.flow.resume(link)?
        };
        if was_paused {
            tracing::info!("Stream resumed");
            self.events.emit(ControllerEvent::StreamResumed);
        }
        self.dispatch(session, events);
        Ok(())
    }

    pub(crate) fn pause_resume(&self) -> Result<()> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        if session.link.is_none() {
            return Err(ControllerError::NotConnected.into());
        }
        let state = self.status().state;
        if session.flow.is_paused() || state.is_held() {
            self.resume_locked(session)
        } else if session.flow.is_streaming() || state.is_moving() {
            self.pause_locked(session)
        } else {
            Err(ControllerError::InvalidState {
                operation: "pause".to_string(),
                state: state.to_string(),
            }
            .into())
        }
    }

    pub(crate) fn cancel(&self) -> Result<()> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        if session.link.is_none() {
            return Err(ControllerError::NotConnected.into());
        }
        let was_streaming = session.flow.is_streaming();
        session.flow.cancel_send();
        if was_streaming {
            self.console(MessageType::Info, "Stream canceled");
            self.events.emit(ControllerEvent::StreamCanceled);
        }

        // Reports lag behind the stream; with commands in flight the machine
        // may already be moving even though the last report said Idle.
        let reported = self.status().state;
        let in_flight = was_streaming || session.flow.active_commands_count() > 0;
        let state = if in_flight
            && matches!(reported, ControllerState::Idle | ControllerState::Unknown)
        {
            ControllerState::Run
        } else {
            reported
        };
        let strategy = self.dialect.cancel_strategy(state);
        tracing::debug!("Cancel in {} (reported {}) using {:?}", state, reported, strategy);
        match strategy {
            CancelStrategy::DrainOnly => {}
            CancelStrategy::Realtime(bytes) => {
                let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
                for byte in bytes {
                    link.send_byte_immediately(byte)?;
                }
            }
            CancelStrategy::HoldThenReset => {
                let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
                link.send_byte_immediately(self.dialect.feed_hold_byte())?;
                session.cancel = CancelState::AwaitingHold {
                    deadline: self.drain_deadline(),
                };
                return Ok(());
            }
            CancelStrategy::Reset => return self.reset_firmware(session, "Stream canceled"),
        }
        self.start_drain(session);
        Ok(())
    }

    pub(crate) fn jog(&self, axis: Axis, delta: f64) -> Result<()> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        self.ensure_ready(session)?;
        self.ensure_not_streaming(session)?;
        let feed_rate = self.config.read().jog_feed_rate;
        let command =
            self.dialect
                .jog_command(axis, delta, feed_rate, session.modal.state().units());
        self.ensure_not_alarmed(session, &command)?;
        session.flow.queue_command(command)?;
        if self.dialect.jog_needs_modal_restore() {
            session
                .flow
                .queue_command(GcodeCommand::new(session.modal.restore_commands()))?;
        }
        self.admit(session)
    }

    pub(crate) fn cancel_jog(&self) -> Result<()> {
        let session = self.session.lock();
        let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
        match self.dialect.jog_cancel_byte() {
            Some(byte) => link.send_byte_immediately(byte),
            None => Err(FirmwareError::UnsupportedFeature {
                firmware: self.name.clone(),
                feature: "jog cancel".to_string(),
            }
            .into()),
        }
    }

    pub(crate) fn send_override(&self, command: OverrideCommand) -> Result<()> {
        let session = self.session.lock();
        let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
        let Some(byte) = self.dialect.override_byte(command) else {
            return Err(FirmwareError::UnsupportedFeature {
                firmware: self.name.clone(),
                feature: "realtime overrides".to_string(),
            }
            .into());
        };
        link.send_byte_immediately(byte)?;
        tracing::debug!(
            "Override {:?} sent, expecting {}",
            command,
            command.apply_to(self.status().overrides)
        );
        Ok(())
    }

    /// Queue a dialect command that needs a ready, idle session
    pub(crate) fn queue_idle_command(&self, command: GcodeCommand) -> Result<()> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        self.ensure_ready(session)?;
        self.ensure_not_streaming(session)?;
        self.ensure_not_alarmed(session, &command)?;
        session.flow.queue_command(command)?;
        self.admit(session)
    }

    pub(crate) fn kill_alarm_lock(&self) -> Result<()> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        self.ensure_ready(session)?;
        let state = self.status().state;
        if state != ControllerState::Alarm {
            return Err(ControllerError::InvalidState {
                operation: "kill alarm lock".to_string(),
                state: state.to_string(),
            }
            .into());
        }
        session
            .flow
            .queue_command_front(self.dialect.unlock_command())?;
        self.admit(session)
    }

    pub(crate) fn soft_reset(&self) -> Result<()> {
        let mut guard = self.session.lock();
        self.reset_firmware(&mut guard, "Soft reset requested")
    }

    pub(crate) fn set_work_position(&self, position: PartialPosition) -> Result<()> {
        if position.is_empty() {
            return Err(ControllerError::Other {
                message: "no axis given for the work position".to_string(),
            }
            .into());
        }
        let command = {
            let session = self.session.lock();
            self.dialect.set_work_position_command(
                &position,
                &self.status(),
                &session.modal.state(),
            )
        };
        self.queue_idle_command(command)
    }

    pub(crate) fn restore_parser_modal_state(&self) -> Result<()> {
        let mut guard = self.session.lock();
        let session = &mut *guard;
        self.ensure_ready(session)?;
        let command = GcodeCommand::new(session.modal.restore_commands());
        session.flow.queue_command(command)?;
        self.admit(session)
    }

    pub(crate) fn request_status_report(&self) -> Result<()> {
        let session = self.session.lock();
        let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
        link.send_byte_immediately(self.dialect.status_request_byte())
    }

    pub(crate) fn communicator_state(&self) -> CommunicatorState {
        let session = self.session.lock();
        if session.link.is_none() {
            return CommunicatorState::Disconnected;
        }
        let state = self.status().state;
        if state == ControllerState::Check {
            CommunicatorState::Check
        } else if session.flow.is_streaming() {
            if session.flow.is_paused() {
                CommunicatorState::SendingPaused
            } else {
                CommunicatorState::Sending
            }
        } else if state.is_moving() || session.flow.active_commands_count() > 0 {
            CommunicatorState::Sending
        } else {
            CommunicatorState::Idle
        }
    }
}

impl StatusRequester for Shared {
    fn can_poll(&self) -> bool {
        let session = self.session.lock();
        let open = session.link.as_ref().is_some_and(|link| link.is_connected());
        open && (session.ready || self.dialect.ready_on_status())
    }

    fn request_status(&self) -> Result<()> {
        let session = self.session.lock();
        let link = session.link.as_ref().ok_or(ControllerError::NotConnected)?;
        link.send_byte_immediately(self.dialect.status_request_byte())
    }
}
