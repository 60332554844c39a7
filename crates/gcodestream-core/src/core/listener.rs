//! Controller listener interface
//!
//! Defines the listener trait for controller events and the bridge task that
//! feeds a listener from the event channel.

use crate::command::GcodeCommand;
use crate::core::event::{ConsoleMessage, ControllerEvent};
use crate::data::{ControllerState, ControllerStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Handle for a registered controller listener.
///
/// Uniquely identifies a listener subscription. Can be used to unsubscribe
/// from controller events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerListenerHandle(pub String);

/// Listener trait for controller events
///
/// Implement this trait to receive notifications of controller state changes.
/// Every method defaults to a no-op.
#[async_trait]
pub trait ControllerListener: Send + Sync {
    /// Called when the transport is open
    async fn on_connected(&self, _firmware: &str, _address: &str) {}

    /// Called when the session ends
    async fn on_disconnected(&self, _reason: Option<&str>) {}

    /// Called when the firmware identifies itself
    async fn on_firmware_version(&self, _version: &str) {}

    /// Called when controller state changes
    async fn on_state_changed(&self, _new_state: ControllerState) {}

    /// Called when controller status is updated
    async fn on_status_changed(&self, _status: &ControllerStatus) {}

    /// Called when a command is written to the transport
    async fn on_command_sent(&self, _command: &GcodeCommand) {}

    /// Called when a command is completed
    async fn on_command_complete(&self, _command: &GcodeCommand) {}

    /// Called when a program row is skipped
    async fn on_command_skipped(&self, _command: &GcodeCommand) {}

    /// Called when a stream starts
    async fn on_stream_started(&self, _rows: usize) {}

    /// Called when a stream is paused
    async fn on_stream_paused(&self) {}

    /// Called when a stream is resumed
    async fn on_stream_resumed(&self) {}

    /// Called when a failed command pauses the stream
    async fn on_stream_paused_on_error(&self, _command: &GcodeCommand) {}

    /// Called when a stream is cancelled
    async fn on_stream_canceled(&self) {}

    /// Called when a stream finishes
    async fn on_stream_complete(&self, _success: bool) {}

    /// Called when an alarm occurs
    async fn on_alarm(&self, _code: u32, _description: &str) {}

    /// Called for operator-facing console text
    async fn on_console_message(&self, _message: &ConsoleMessage) {}

    /// Called after the listener fell behind and `count` events were lost.
    ///
    /// Status and state changes may be among them; re-read
    /// [`ControllerTrait::status`](super::ControllerTrait::status) to resync.
    async fn on_events_dropped(&self, _count: u64) {}
}

/// Deliver one event to the matching listener method
pub async fn dispatch_event(listener: &dyn ControllerListener, event: &ControllerEvent) {
    match event {
        ControllerEvent::Connected { firmware, address } => {
            listener.on_connected(firmware, address).await
        }
        ControllerEvent::Disconnected { reason } => {
            listener.on_disconnected(reason.as_deref()).await
        }
        ControllerEvent::FirmwareVersion(v) => listener.on_firmware_version(v).await,
        ControllerEvent::StateChanged(state) => listener.on_state_changed(*state).await,
        ControllerEvent::StatusChanged(status) => listener.on_status_changed(status).await,
        ControllerEvent::CommandSent(cmd) => listener.on_command_sent(cmd).await,
        ControllerEvent::CommandComplete(cmd) => listener.on_command_complete(cmd).await,
        ControllerEvent::CommandSkipped(cmd) => listener.on_command_skipped(cmd).await,
        ControllerEvent::StreamStarted { rows } => listener.on_stream_started(*rows).await,
        ControllerEvent::StreamPaused => listener.on_stream_paused().await,
        ControllerEvent::StreamResumed => listener.on_stream_resumed().await,
        ControllerEvent::StreamPausedOnError(cmd) => {
            listener.on_stream_paused_on_error(cmd).await
        }
        ControllerEvent::StreamCanceled => listener.on_stream_canceled().await,
        ControllerEvent::StreamComplete { success, .. } => {
            listener.on_stream_complete(*success).await
        }
        ControllerEvent::Alarm { code, message } => listener.on_alarm(*code, message).await,
        ControllerEvent::ConsoleMessage(msg) => listener.on_console_message(msg).await,
    }
}

/// Spawn a task that feeds `listener` every event from `rx`, one at a time.
///
/// Events reach the listener in publish order. The channel holds a fixed
/// number of events; a listener that falls further behind loses the oldest
/// ones, a warning is logged and [`ControllerListener::on_events_dropped`]
/// is called before delivery resumes with the oldest event still held.
pub fn spawn_listener_bridge(
    mut rx: broadcast::Receiver<ControllerEvent>,
    listener: Arc<dyn ControllerListener>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => dispatch_event(listener.as_ref(), &event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Listener fell behind, {} events dropped", skipped);
                    listener.on_events_dropped(skipped).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::EventDispatcher;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct TestListener {
        calls: Arc<Mutex<Vec<String>>>,
    }

    /// Blocks on its first event until released
    struct StuckListener {
        gate: Arc<tokio::sync::Semaphore>,
        dropped: Arc<Mutex<Vec<u64>>>,
        seen: Arc<Mutex<Vec<ControllerState>>>,
    }

    #[async_trait]
    impl ControllerListener for StuckListener {
        async fn on_state_changed(&self, new_state: ControllerState) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.seen.lock().await.push(new_state);
        }

        async fn on_events_dropped(&self, count: u64) {
            self.dropped.lock().await.push(count);
        }
    }

    #[async_trait]
    impl ControllerListener for TestListener {
        async fn on_state_changed(&self, new_state: ControllerState) {
            self.calls.lock().await.push(format!("state:{}", new_state));
        }

        async fn on_command_complete(&self, command: &GcodeCommand) {
            // Slow listener must still observe order
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.calls.lock().await.push(format!("done:{}", command.text));
        }
    }

    #[tokio::test]
    async fn test_bridge_preserves_order() {
        let dispatcher = EventDispatcher::default();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(TestListener {
            calls: calls.clone(),
        });
        let task = spawn_listener_bridge(dispatcher.subscribe(), listener);

        dispatcher.emit(ControllerEvent::CommandComplete(Arc::new(GcodeCommand::new(
            "G0 X1",
        ))));
        dispatcher.emit(ControllerEvent::StateChanged(ControllerState::Idle));
        dispatcher.emit(ControllerEvent::CommandComplete(Arc::new(GcodeCommand::new(
            "G0 X2",
        ))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let g = calls.lock().await;
        assert_eq!(
            *g,
            vec![
                "done:G0 X1".to_string(),
                "state:Idle".to_string(),
                "done:G0 X2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_lagging_listener_is_told_what_it_lost() {
        let dispatcher = EventDispatcher::new(4);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(StuckListener {
            gate: gate.clone(),
            dropped: dropped.clone(),
            seen: seen.clone(),
        });
        let task = spawn_listener_bridge(dispatcher.subscribe(), listener);

        dispatcher.emit(ControllerEvent::StateChanged(ControllerState::Run));
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The listener is parked on Run; these overflow a channel of four
        for _ in 0..9 {
            dispatcher.emit(ControllerEvent::StateChanged(ControllerState::Hold));
        }
        dispatcher.emit(ControllerEvent::StateChanged(ControllerState::Idle));
        gate.add_permits(100);
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(*dropped.lock().await, vec![6]);
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.first(), Some(&ControllerState::Run));
        assert_eq!(seen.last(), Some(&ControllerState::Idle));
    }
}
