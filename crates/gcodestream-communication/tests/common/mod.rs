//! Helpers for driving a controller against a virtual port

#![allow(dead_code)]

use gcodestream_communication::{HostMessage, VirtualFirmware};
use gcodestream_core::{ControllerEvent, GcodeCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(150);

pub async fn next_message(firmware: &mut VirtualFirmware) -> HostMessage {
    timeout(WAIT, firmware.next_message())
        .await
        .expect("nothing written")
        .unwrap()
        .expect("link closed")
}

pub async fn next_line(firmware: &mut VirtualFirmware) -> String {
    match next_message(firmware).await {
        HostMessage::Line(line) => line,
        other => panic!("expected a line, got {:?}", other),
    }
}

pub async fn assert_quiet(firmware: &mut VirtualFirmware) {
    if let Ok(message) = timeout(QUIET, firmware.next_message()).await {
        panic!("unexpected write: {:?}", message);
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub async fn expect_event<T>(
    events: &mut broadcast::Receiver<ControllerEvent>,
    mut select: impl FnMut(ControllerEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(found) = select(event) {
                return found;
            }
        }
    })
    .await
    .expect("event not published")
}

pub async fn completion(
    events: &mut broadcast::Receiver<ControllerEvent>,
    text: &str,
) -> Arc<GcodeCommand> {
    expect_event(events, |e| match e {
        ControllerEvent::CommandComplete(c) if c.text == text => Some(c),
        _ => None,
    })
    .await
}
