//! Firmware controller session
//!
//! [`FirmwareController`] implements [`ControllerTrait`] once for every
//! dialect. A connect opens the transport, starts the [`Communicator`] and
//! spawns the session task, which routes every received line through the
//! dialect and the flow controller, fires cancel deadlines and owns the
//! [`StatusPollTimer`].

pub mod config;
pub mod poller;
mod session;

pub use config::ControllerConfig;
pub use poller::{StatusPollTimer, StatusRequester};

use crate::communication::buffered::ErrorPolicy;
use crate::communication::{
    open_transport, Communicator, CommunicatorEvent, ConnectionParams, TransportHalves,
};
use crate::firmware::{ControllerType, FirmwareDialect};
use async_trait::async_trait;
use gcodestream_core::{
    spawn_listener_bridge, Axis, CommunicatorState, ControllerError, ControllerEvent,
    ControllerListener, ControllerListenerHandle, ControllerStatus, ControllerTrait,
    FirmwareError, GcodeCommand, GcodeStreamReader, OverrideCommand, PartialPosition, Result,
    StreamProgress,
};
use gcodestream_gcode::GcodeState;
use parking_lot::Mutex;
use session::{CancelState, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How often cancel deadlines are checked
const DEADLINE_TICK: Duration = Duration::from_millis(50);

/// The running session task and its stop signal
struct SessionTask {
    handle: JoinHandle<()>,
    shutdown: mpsc::Sender<()>,
}

/// One controller session, for any supported firmware
pub struct FirmwareController {
    shared: Arc<Shared>,
    task: Mutex<Option<SessionTask>>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FirmwareController {
    /// Create a controller for `controller_type`
    pub fn new(controller_type: ControllerType, config: ControllerConfig) -> Self {
        Self::with_dialect(controller_type.create_dialect(), config)
    }

    /// Create a controller around an explicit dialect
    pub fn with_dialect(dialect: Box<dyn FirmwareDialect>, config: ControllerConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(dialect, config)),
            task: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Firmware this controller speaks to
    pub fn controller_type(&self) -> ControllerType {
        self.shared.dialect.controller_type()
    }

    /// Current configuration
    pub fn config(&self) -> ControllerConfig {
        self.shared.config.read().clone()
    }

    /// Raw event channel, for callers that prefer a receiver to a listener
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }

    /// Start a session over an already opened transport
    ///
    /// # Errors
    /// [`ControllerError::AlreadyConnected`] if a session is running
    pub async fn connect_with_transport(&self, halves: TransportHalves) -> Result<()> {
        if self.shared.is_connected() {
            return Err(ControllerError::AlreadyConnected.into());
        }
        // A session that ended on a transport fault leaves its finished task
        let stale = self.task.lock().take();
        if let Some(stale) = stale {
            let _ = stale.handle.await;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = Communicator::start(halves, events_tx);
        if let Err(link) = self.shared.start_session(link) {
            link.close().await;
            return Err(ControllerError::AlreadyConnected.into());
        }

        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_session(self.shared.clone(), events_rx, shutdown_rx));
        *self.task.lock() = Some(SessionTask { handle, shutdown });
        Ok(())
    }

    /// A transport is open
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// The firmware finished its boot handshake
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Stop admission and hold the machine; pausing twice changes nothing
    pub fn pause(&self) -> Result<()> {
        self.shared.pause()
    }

    /// Release a hold and re-enable admission; resuming a running stream
    /// changes nothing
    pub fn resume(&self) -> Result<()> {
        self.shared.resume()
    }

    /// Stop a jog in progress, on firmware that can
    pub fn cancel_jog(&self) -> Result<()> {
        self.shared.cancel_jog()
    }

    /// Adjust feed, rapid or spindle override while the machine runs.
    ///
    /// Sent as a realtime byte ahead of queued commands. The firmware's
    /// next status report carries the resulting percentages.
    pub fn send_override(&self, command: OverrideCommand) -> Result<()> {
        self.shared.send_override(command)
    }

    /// Toggle the firmware's check (dry-run) mode
    pub fn toggle_check_mode(&self) -> Result<()> {
        match self.shared.dialect.check_mode_command() {
            Some(command) => self.shared.queue_idle_command(command),
            None => Err(FirmwareError::UnsupportedFeature {
                firmware: self.shared.name.clone(),
                feature: "check mode".to_string(),
            }
            .into()),
        }
    }

    /// Ask the firmware for its modal state
    pub fn request_parser_state(&self) -> Result<()> {
        match self.shared.dialect.parser_state_command() {
            Some(command) => self.shared.queue_idle_command(command),
            None => Err(FirmwareError::UnsupportedFeature {
                firmware: self.shared.name.clone(),
                feature: "parser state report".to_string(),
            }
            .into()),
        }
    }

    /// Re-send the tracked distance mode and units
    pub fn restore_parser_modal_state(&self) -> Result<()> {
        self.shared.restore_parser_modal_state()
    }

    /// Modal state as tracked from completed commands and parser reports
    pub fn modal_state(&self) -> GcodeState {
        self.shared.session.lock().modal.state()
    }

    /// Row counters of the current (or last) stream
    pub fn progress(&self) -> StreamProgress {
        self.shared.session.lock().flow.progress()
    }

    /// Time spent sending the current (or last) stream, pauses excluded
    pub fn send_duration(&self) -> Duration {
        self.shared.session.lock().flow.send_duration()
    }

    /// Commands sent and awaiting completion
    pub fn active_commands_count(&self) -> usize {
        self.shared.session.lock().flow.active_commands_count()
    }

    /// A cancel is still bringing the machine to rest: a feed hold awaits
    /// its reset, or commands already sent are draining.
    pub fn is_cancelling(&self) -> bool {
        let session = self.shared.session.lock();
        !matches!(session.cancel, CancelState::Idle) || session.flow.active_commands_count() > 0
    }

    /// Wait for a cancel to finish before dropping the link.
    ///
    /// Returns false if `timeout` passed or the link closed first. The
    /// session's own deadlines bound the wait, so a timeout longer than
    /// twice the drain timeout only trips on a stalled session.
    pub async fn wait_for_cancel(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_connected() {
                return false;
            }
            if !self.is_cancelling() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Cancel still in progress after {} ms",
                    timeout.as_millis()
                );
                return false;
            }
            tokio::time::sleep(DEADLINE_TICK).await;
        }
    }

    /// Bytes of unacknowledged command text held by the firmware
    pub fn sent_buffer_size(&self) -> usize {
        self.shared.session.lock().flow.sent_buffer_size()
    }

    /// Enable or disable status polling
    pub fn set_status_updates_enabled(&self, enabled: bool) {
        self.shared.poller.set_enabled(enabled);
        self.shared.config.write().status_polling_enabled = enabled;
    }

    /// Status polling is enabled
    pub fn status_updates_enabled(&self) -> bool {
        self.shared.poller.is_enabled()
    }

    /// Change the status poll interval
    pub fn set_status_update_rate(&self, rate_ms: u64) {
        self.shared.poller.set_rate_ms(rate_ms);
        self.shared.config.write().status_poll_rate_ms = self.shared.poller.rate_ms();
    }

    /// Status poll interval in milliseconds
    pub fn status_update_rate(&self) -> u64 {
        self.shared.poller.rate_ms()
    }

    /// Enable or disable single-step mode
    pub fn set_single_step_mode(&self, enabled: bool) {
        self.shared.config.write().single_step_mode = enabled;
        self.shared.session.lock().flow.set_single_step_mode(enabled);
    }

    /// Change the reaction to failed commands while streaming
    pub fn set_error_policy(&self, policy: ErrorPolicy) {
        self.shared.config.write().error_policy = policy;
        self.shared.session.lock().flow.set_error_policy(policy);
    }
}

/// Route link traffic and deadlines until shutdown or a transport fault
async fn run_session(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<CommunicatorEvent>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let poll_task = shared.poller.spawn(shared.clone());
    let mut tick = tokio::time::interval(DEADLINE_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = shutdown.recv() => break None,
            event = events.recv() => match event {
                Some(CommunicatorEvent::Line(line)) => shared.handle_line(&line),
                Some(CommunicatorEvent::Disconnected(reason)) => {
                    break Some(reason.unwrap_or_else(|| "Connection lost".to_string()));
                }
                None => break Some("Connection lost".to_string()),
            },
            _ = tick.tick() => shared.check_deadlines(),
        }
    };

    poll_task.abort();
    shared.end_session(reason).await;
}

#[async_trait]
impl ControllerTrait for FirmwareController {
    type ConnectParams = ConnectionParams;

    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn connect(&self, params: &ConnectionParams) -> Result<()> {
        if self.is_connected() {
            return Err(ControllerError::AlreadyConnected.into());
        }
        let halves = open_transport(params).await?;
        self.connect_with_transport(halves).await
    }

    async fn disconnect(&self) -> Result<()> {
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                let _ = task.shutdown.send(()).await;
                if let Err(e) = task.handle.await {
                    tracing::debug!("Session task ended abnormally: {}", e);
                }
            }
            None => tracing::debug!("Disconnect without a session"),
        }
        self.shared.end_session(None).await;
        Ok(())
    }

    async fn send_command(&self, command: GcodeCommand) -> Result<()> {
        self.shared.send_command(command)
    }

    async fn send(&self, program: Box<dyn GcodeStreamReader>) -> Result<()> {
        self.shared.send(program)
    }

    async fn pause_resume(&self) -> Result<()> {
        self.shared.pause_resume()
    }

    async fn cancel(&self) -> Result<()> {
        self.shared.cancel()
    }

    async fn jog(&self, axis: Axis, delta: f64) -> Result<()> {
        self.shared.jog(axis, delta)
    }

    async fn perform_homing_cycle(&self) -> Result<()> {
        self.shared
            .queue_idle_command(self.shared.dialect.homing_command())
    }

    async fn kill_alarm_lock(&self) -> Result<()> {
        self.shared.kill_alarm_lock()
    }

    async fn soft_reset(&self) -> Result<()> {
        self.shared.soft_reset()
    }

    async fn set_work_position(&self, position: PartialPosition) -> Result<()> {
        self.shared.set_work_position(position)
    }

    async fn request_status_report(&self) -> Result<()> {
        self.shared.request_status_report()
    }

    /// Must be called from within a tokio runtime
    fn add_listener(&self, listener: Arc<dyn ControllerListener>) -> ControllerListenerHandle {
        let id = Uuid::new_v4().to_string();
        let task = spawn_listener_bridge(self.shared.events.subscribe(), listener);
        self.listeners.lock().insert(id.clone(), task);
        ControllerListenerHandle(id)
    }

    fn remove_listener(&self, handle: &ControllerListenerHandle) {
        if let Some(task) = self.listeners.lock().remove(&handle.0) {
            task.abort();
        }
    }

    fn status(&self) -> Arc<ControllerStatus> {
        self.shared.status()
    }

    fn communicator_state(&self) -> CommunicatorState {
        self.shared.communicator_state()
    }

    fn is_idle(&self) -> bool {
        self.is_ready()
            && matches!(
                self.communicator_state(),
                CommunicatorState::Idle | CommunicatorState::Check
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::virtual_port::{HostMessage, VirtualFirmware, VirtualPort};
    use gcodestream_core::ControllerState;

    async fn connected(controller_type: ControllerType) -> (FirmwareController, VirtualFirmware) {
        let controller = FirmwareController::new(
            controller_type,
            ControllerConfig::default().with_status_polling(false),
        );
        let (halves, firmware) = VirtualPort::open("unit");
        controller.connect_with_transport(halves).await.unwrap();
        (controller, firmware)
    }

    async fn wait_for<F: Fn(&FirmwareController) -> bool>(controller: &FirmwareController, f: F) {
        for _ in 0..100 {
            if f(controller) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_not_ready_before_banner() {
        let (controller, _firmware) = connected(ControllerType::Grbl).await;
        assert_eq!(controller.state(), ControllerState::Connecting);
        let err = controller
            .send_command(GcodeCommand::new("G0 X1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            gcodestream_core::Error::Controller(ControllerError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_banner_makes_ready_and_runs_handshake() {
        let (controller, mut firmware) = connected(ControllerType::Grbl).await;
        firmware.send_line("Grbl 1.1h ['$' for help]").await.unwrap();
        assert_eq!(firmware.next_line().await.unwrap().as_deref(), Some("$$"));
        assert_eq!(firmware.next_line().await.unwrap().as_deref(), Some("$G"));
        wait_for(&controller, |c| c.is_ready()).await;
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (controller, _firmware) = connected(ControllerType::Grbl).await;
        let (halves, _other) = VirtualPort::open("second");
        assert!(controller.connect_with_transport(halves).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_resets_status() {
        let (controller, _firmware) = connected(ControllerType::Smoothieware).await;
        controller.disconnect().await.unwrap();
        assert!(!controller.is_connected());
        assert_eq!(controller.state(), ControllerState::Disconnected);
        assert_eq!(
            controller.communicator_state(),
            CommunicatorState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_status_request_is_realtime() {
        let (controller, mut firmware) = connected(ControllerType::Grbl).await;
        controller.request_status_report().await.unwrap();
        assert_eq!(
            firmware.next_message().await.unwrap(),
            Some(HostMessage::Realtime(b'?'))
        );
    }

    #[tokio::test]
    async fn test_poll_rate_is_clamped_and_stored() {
        let controller = FirmwareController::new(ControllerType::Grbl, ControllerConfig::default());
        controller.set_status_update_rate(1);
        assert_eq!(controller.status_update_rate(), 50);
        assert_eq!(controller.config().status_poll_rate_ms, 50);
        controller.set_status_updates_enabled(false);
        assert!(!controller.status_updates_enabled());
    }
}
