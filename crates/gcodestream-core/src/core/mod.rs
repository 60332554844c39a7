//! Controller contract, events and listeners

pub mod event;
pub mod listener;

pub use listener::{ControllerListener, ControllerListenerHandle};

use crate::command::GcodeCommand;
use crate::data::{Axis, CommunicatorState, ControllerState, ControllerStatus, PartialPosition};
use crate::error::Result;
use crate::stream::GcodeStreamReader;
use async_trait::async_trait;
use std::sync::Arc;

/// Operations a front-end performs on a firmware controller session
///
/// Every firmware dialect is driven through this one contract. Operations
/// that only write bytes return as soon as the bytes are queued for the
/// transport; progress is observed through listeners.
#[async_trait]
pub trait ControllerTrait: Send + Sync {
    /// Transport address and settings accepted by [`ControllerTrait::connect`]
    type ConnectParams: Send + Sync;

    /// Dialect name
    fn name(&self) -> &str;

    /// Open the transport and start the firmware handshake
    async fn connect(&self, params: &Self::ConnectParams) -> Result<()>;

    /// Close the transport; active commands are failed
    async fn disconnect(&self) -> Result<()>;

    /// Queue a single command and start sending
    async fn send_command(&self, command: GcodeCommand) -> Result<()>;

    /// Stream a whole program
    async fn send(&self, program: Box<dyn GcodeStreamReader>) -> Result<()>;

    /// Pause a running stream, or resume a paused one
    async fn pause_resume(&self) -> Result<()>;

    /// Stop streaming: drop queued commands and abort the firmware
    async fn cancel(&self) -> Result<()>;

    /// Relative jog of one axis
    async fn jog(&self, axis: Axis, delta: f64) -> Result<()>;

    /// Run the homing cycle
    async fn perform_homing_cycle(&self) -> Result<()>;

    /// Clear an alarm; only valid in ALARM
    async fn kill_alarm_lock(&self) -> Result<()>;

    /// Reset the firmware
    async fn soft_reset(&self) -> Result<()>;

    /// Redefine the work coordinates of the given axes
    async fn set_work_position(&self, position: PartialPosition) -> Result<()>;

    /// Ask for a status report now
    async fn request_status_report(&self) -> Result<()>;

    /// Register a listener
    ///
    /// Listeners are fed from the event channel in publish order. One that
    /// falls a full channel behind loses events and is told so through
    /// [`ControllerListener::on_events_dropped`].
    fn add_listener(&self, listener: Arc<dyn ControllerListener>) -> ControllerListenerHandle;

    /// Unregister a listener
    fn remove_listener(&self, handle: &ControllerListenerHandle);

    /// Current controller state
    fn state(&self) -> ControllerState {
        self.status().state
    }

    /// Latest status snapshot
    fn status(&self) -> Arc<ControllerStatus>;

    /// State of the sending side
    fn communicator_state(&self) -> CommunicatorState;

    /// Ready to accept a new stream
    fn is_idle(&self) -> bool {
        matches!(
            self.communicator_state(),
            CommunicatorState::Idle | CommunicatorState::Check
        )
    }
}
