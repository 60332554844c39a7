//! GRBL sessions driven end to end through a virtual port

mod common;

use common::*;
use gcodestream_communication::{
    ControllerConfig, ControllerType, FirmwareController, HostMessage, VirtualFirmware,
    VirtualPort,
};
use gcodestream_core::{
    Axis, CommunicatorState, ControllerError, ControllerEvent, ControllerState, ControllerTrait,
    Error, ErrorKind, GcodeCommand, OverrideCommand,
};
use gcodestream_gcode::StringStreamReader;
use tokio::sync::broadcast;

const BANNER: &str = "Grbl 1.1h ['$' for help]";

struct Session {
    controller: FirmwareController,
    firmware: VirtualFirmware,
    events: broadcast::Receiver<ControllerEvent>,
}

async fn connect(config: ControllerConfig) -> Session {
    let controller =
        FirmwareController::new(ControllerType::Grbl, config.with_status_polling(false));
    let events = controller.subscribe();
    let (halves, firmware) = VirtualPort::open("grbl");
    controller.connect_with_transport(halves).await.unwrap();
    Session {
        controller,
        firmware,
        events,
    }
}

/// Connect and answer the boot handshake
async fn ready(config: ControllerConfig) -> Session {
    let mut s = connect(config).await;
    s.firmware.send_line(BANNER).await.unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "$$");
    assert_eq!(next_line(&mut s.firmware).await, "$G");
    s.firmware.send_line("ok").await.unwrap();
    s.firmware
        .send_line("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]")
        .await
        .unwrap();
    s.firmware.send_line("ok").await.unwrap();
    let controller = &s.controller;
    wait_until(|| controller.is_ready() && controller.active_commands_count() == 0).await;
    s
}

#[tokio::test]
async fn test_ok_completes_command() {
    let mut s = ready(ControllerConfig::default()).await;
    s.controller
        .send_command(GcodeCommand::new("G0 X1"))
        .await
        .unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G0 X1");
    s.firmware.send_line("ok").await.unwrap();

    let command = completion(&mut s.events, "G0 X1").await;
    assert!(command.is_done());
    assert!(command.is_ok());
    assert_eq!(command.response, "ok");
}

#[tokio::test]
async fn test_error_fails_only_that_command() {
    let mut s = ready(ControllerConfig::default()).await;
    s.controller
        .send_command(GcodeCommand::new("G38.2"))
        .await
        .unwrap();
    s.controller
        .send_command(GcodeCommand::new("G0 X2"))
        .await
        .unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G38.2");
    assert_eq!(next_line(&mut s.firmware).await, "G0 X2");
    s.firmware.send_line("error:9").await.unwrap();
    s.firmware.send_line("ok").await.unwrap();

    let failed = completion(&mut s.events, "G38.2").await;
    assert!(failed.is_done());
    assert!(!failed.is_ok());
    assert_eq!(failed.failure.as_ref().and_then(|f| f.code), Some(9));
    let next = completion(&mut s.events, "G0 X2").await;
    assert!(next.is_ok());
}

#[tokio::test]
async fn test_third_command_waits_for_buffer_space() {
    let mut s = ready(ControllerConfig::default().with_buffer_size(10)).await;
    for text in ["G0X1", "G0X2", "G0X3"] {
        s.controller
            .send_command(GcodeCommand::new(text))
            .await
            .unwrap();
    }
    assert_eq!(next_line(&mut s.firmware).await, "G0X1");
    assert_eq!(next_line(&mut s.firmware).await, "G0X2");
    assert_quiet(&mut s.firmware).await;
    assert_eq!(s.controller.active_commands_count(), 2);
    assert_eq!(s.controller.sent_buffer_size(), 10);

    s.firmware.send_line("ok").await.unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G0X3");
}

#[tokio::test]
async fn test_pause_while_running_freezes_admission() {
    let mut s = ready(ControllerConfig::default().with_buffer_size(24)).await;
    let program = "G1 X1 F500\nG1 X2 F500\nG1 X3 F500\nG1 X4 F500";
    s.controller
        .send(Box::new(StringStreamReader::new(program)))
        .await
        .unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G1 X1 F500");
    assert_eq!(next_line(&mut s.firmware).await, "G1 X2 F500");
    s.firmware
        .send_line("<Run|MPos:1.000,0.000,0.000|FS:500,0>")
        .await
        .unwrap();
    let controller = &s.controller;
    wait_until(|| controller.state() == ControllerState::Run).await;

    s.controller.pause_resume().await.unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(b'!'));
    s.firmware
        .send_line("<Hold:1|MPos:1.500,0.000,0.000|FS:0,0>")
        .await
        .unwrap();
    wait_until(|| controller.state() == ControllerState::Hold).await;
    assert_eq!(
        s.controller.communicator_state(),
        CommunicatorState::SendingPaused
    );

    // Sent commands still complete during the hold
    s.firmware.send_line("ok").await.unwrap();
    s.firmware.send_line("ok").await.unwrap();
    completion(&mut s.events, "G1 X2 F500").await;
    assert_quiet(&mut s.firmware).await;

    s.controller.pause_resume().await.unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(b'~'));
    assert_eq!(next_line(&mut s.firmware).await, "G1 X3 F500");
}

#[tokio::test]
async fn test_idle_status_report_updates_snapshot() {
    let mut s = ready(ControllerConfig::default()).await;
    s.firmware
        .send_line("<Run|MPos:1.000,2.000,3.000|WPos:1.000,2.000,3.000>")
        .await
        .unwrap();
    let controller = &s.controller;
    wait_until(|| controller.state() == ControllerState::Run).await;

    s.firmware
        .send_line("<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000>")
        .await
        .unwrap();
    wait_until(|| controller.state() == ControllerState::Idle).await;
    let status = s.controller.status();
    for axis in [Axis::X, Axis::Y, Axis::Z] {
        assert_eq!(status.machine_coord.get(axis), Some(0.0));
        assert_eq!(status.work_coord.get(axis), Some(0.0));
    }
}

#[tokio::test]
async fn test_kill_alarm_lock_outside_alarm_is_rejected() {
    let mut s = ready(ControllerConfig::default()).await;
    assert_eq!(s.controller.state(), ControllerState::Idle);

    let err = s.controller.kill_alarm_lock().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Controller(ControllerError::InvalidState { .. })
    ));
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_quiet(&mut s.firmware).await;
}

#[tokio::test]
async fn test_alarm_blocks_commands_until_unlocked() {
    let mut s = ready(ControllerConfig::default()).await;
    s.firmware.send_line("ALARM:1").await.unwrap();
    let (code, _) = expect_event(&mut s.events, |e| match e {
        ControllerEvent::Alarm { code, message } => Some((code, message)),
        _ => None,
    })
    .await;
    assert_eq!(code, 1);
    assert_eq!(s.controller.state(), ControllerState::Alarm);

    let err = s
        .controller
        .send_command(GcodeCommand::new("G0 X1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Alarm);

    s.controller.kill_alarm_lock().await.unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "$X");
    s.firmware
        .send_line("[MSG:Caution: Unlocked]")
        .await
        .unwrap();
    s.firmware.send_line("ok").await.unwrap();
    let controller = &s.controller;
    wait_until(|| controller.state() == ControllerState::Idle).await;

    s.controller
        .send_command(GcodeCommand::new("G0 X1"))
        .await
        .unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G0 X1");
}

#[tokio::test]
async fn test_cancel_while_running_holds_then_resets() {
    let mut s = ready(ControllerConfig::default()).await;
    let program = "G1 X1 F100\nG1 X2\nG1 X3";
    s.controller
        .send(Box::new(StringStreamReader::new(program)))
        .await
        .unwrap();
    for _ in 0..3 {
        next_line(&mut s.firmware).await;
    }
    s.firmware
        .send_line("<Run|MPos:0.500,0.000,0.000|FS:100,0>")
        .await
        .unwrap();
    let controller = &s.controller;
    wait_until(|| controller.state() == ControllerState::Run).await;

    s.controller.cancel().await.unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(b'!'));
    expect_event(&mut s.events, |e| {
        matches!(e, ControllerEvent::StreamCanceled).then_some(())
    })
    .await;

    s.firmware
        .send_line("<Hold:0|MPos:0.600,0.000,0.000|FS:0,0>")
        .await
        .unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(0x18));
    let failed = completion(&mut s.events, "G1 X1 F100").await;
    assert!(!failed.is_ok());
    wait_until(|| controller.active_commands_count() == 0).await;
    assert_eq!(s.controller.state(), ControllerState::Connecting);
    assert!(!s.controller.is_ready());

    // The firmware reboots and the session becomes ready again
    s.firmware.send_line(BANNER).await.unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "$$");
}

#[tokio::test]
async fn test_cancel_before_first_report_still_holds() {
    let mut s = ready(ControllerConfig::default().with_drain_timeout_ms(200)).await;
    let program = "G1 X10 F100\nG1 X20\nG1 X30\nG1 X40";
    s.controller
        .send(Box::new(StringStreamReader::new(program)))
        .await
        .unwrap();
    for _ in 0..4 {
        next_line(&mut s.firmware).await;
    }
    assert_eq!(s.controller.state(), ControllerState::Idle);
    assert_eq!(s.controller.active_commands_count(), 4);

    // No report says Run yet, but the firmware is already executing
    s.controller.cancel().await.unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(b'!'));

    // No Hold:0 arrives, so the drain deadline forces the reset
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(0x18));
    let failed = completion(&mut s.events, "G1 X10 F100").await;
    assert!(!failed.is_ok());
    assert_eq!(s.controller.active_commands_count(), 0);
}

#[tokio::test]
async fn test_cancel_with_nothing_in_flight_sends_nothing() {
    let mut s = ready(ControllerConfig::default()).await;
    s.controller.cancel().await.unwrap();
    assert_quiet(&mut s.firmware).await;
    assert_eq!(s.controller.communicator_state(), CommunicatorState::Idle);
}

#[tokio::test]
async fn test_jog_cancel_drains_then_times_out() {
    let mut s = ready(
        ControllerConfig::default()
            .with_drain_timeout_ms(200)
            .with_jog_feed_rate(500.0),
    )
    .await;
    s.controller.jog(Axis::X, 1.0).await.unwrap();
    s.controller.jog(Axis::X, 2.0).await.unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "$J=G91 G21 X1 F500");
    assert_eq!(next_line(&mut s.firmware).await, "$J=G91 G21 X2 F500");
    s.firmware
        .send_line("<Jog|MPos:0.200,0.000,0.000|FS:500,0>")
        .await
        .unwrap();
    let controller = &s.controller;
    wait_until(|| controller.state() == ControllerState::Jog).await;

    s.controller.cancel().await.unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(0x85));
    s.firmware.send_line("ok").await.unwrap();
    assert!(completion(&mut s.events, "$J=G91 G21 X1 F500").await.is_ok());

    let stuck = completion(&mut s.events, "$J=G91 G21 X2 F500").await;
    assert!(!stuck.is_ok());
    let expected = ControllerError::Timeout { timeout_ms: 200 }.to_string();
    assert_eq!(
        stuck.failure.as_ref().map(|f| f.message.as_str()),
        Some(expected.as_str())
    );
    assert_eq!(s.controller.active_commands_count(), 0);
    assert_quiet(&mut s.firmware).await;
}

#[tokio::test]
async fn test_alarm_fails_stream_and_unlock_is_acknowledged() {
    let mut s = ready(ControllerConfig::default()).await;
    s.controller
        .send(Box::new(StringStreamReader::new("G1 X100 F100\nG1 X0")))
        .await
        .unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G1 X100 F100");
    assert_eq!(next_line(&mut s.firmware).await, "G1 X0");

    // Limit switch: the firmware flushes its buffer and never answers
    s.firmware.send_line("ALARM:2").await.unwrap();
    let failed = completion(&mut s.events, "G1 X100 F100").await;
    assert!(!failed.is_ok());
    assert!(failed
        .failure
        .as_ref()
        .is_some_and(|f| f.message.starts_with("ALARM:2")));
    let success = expect_event(&mut s.events, |e| match e {
        ControllerEvent::StreamComplete { success, .. } => Some(success),
        _ => None,
    })
    .await;
    assert!(!success);
    assert_eq!(s.controller.active_commands_count(), 0);

    s.controller.kill_alarm_lock().await.unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "$X");
    s.firmware
        .send_line("[MSG:Caution: Unlocked]")
        .await
        .unwrap();
    s.firmware.send_line("ok").await.unwrap();
    let unlock = completion(&mut s.events, "$X").await;
    assert!(unlock.is_ok());
    let controller = &s.controller;
    wait_until(|| controller.state() == ControllerState::Idle).await;
    assert_eq!(s.controller.active_commands_count(), 0);
    assert_quiet(&mut s.firmware).await;
}

#[tokio::test]
async fn test_pause_and_resume_are_idempotent() {
    let mut s = ready(ControllerConfig::default().with_buffer_size(8)).await;
    s.controller
        .send(Box::new(StringStreamReader::new("G0 X1\nG0 X2\nG0 X3")))
        .await
        .unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G0 X1");

    s.controller.pause().unwrap();
    s.controller.pause().unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(b'!'));
    assert_quiet(&mut s.firmware).await;

    s.controller.resume().unwrap();
    s.controller.resume().unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(b'~'));
    assert_quiet(&mut s.firmware).await;

    s.firmware.send_line("ok").await.unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G0 X2");
}

#[tokio::test]
async fn test_stream_reports_skipped_rows_and_completion() {
    let mut s = ready(ControllerConfig::default()).await;
    let program = "G21 (metric)\n; setup done\nG0 X1";
    s.controller
        .send(Box::new(StringStreamReader::new(program)))
        .await
        .unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G21");
    assert_eq!(next_line(&mut s.firmware).await, "G0 X1");
    let skipped = expect_event(&mut s.events, |e| match e {
        ControllerEvent::CommandSkipped(c) => Some(c),
        _ => None,
    })
    .await;
    assert_eq!(skipped.line_number, Some(2));

    s.firmware.send_line("ok").await.unwrap();
    s.firmware.send_line("ok").await.unwrap();
    let success = expect_event(&mut s.events, |e| match e {
        ControllerEvent::StreamComplete { success, .. } => Some(success),
        _ => None,
    })
    .await;
    assert!(success);
    let progress = s.controller.progress();
    assert_eq!(progress.total_rows, 3);
    assert_eq!(progress.completed_rows, 3);
    assert_eq!(progress.sent_rows, 2);
}

#[tokio::test]
async fn test_stream_rejected_while_streaming() {
    let mut s = ready(ControllerConfig::default()).await;
    s.controller
        .send(Box::new(StringStreamReader::new("G0 X1")))
        .await
        .unwrap();
    next_line(&mut s.firmware).await;
    let err = s
        .controller
        .send(Box::new(StringStreamReader::new("G0 X2")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Controller(ControllerError::Busy)));
}

#[tokio::test]
async fn test_transport_fault_fails_active_commands() {
    let Session {
        controller,
        mut firmware,
        mut events,
    } = ready(ControllerConfig::default()).await;
    controller
        .send_command(GcodeCommand::new("G0 X5"))
        .await
        .unwrap();
    assert_eq!(next_line(&mut firmware).await, "G0 X5");
    firmware.hang_up().await;

    let failed = completion(&mut events, "G0 X5").await;
    assert!(!failed.is_ok());
    let reason = expect_event(&mut events, |e| match e {
        ControllerEvent::Disconnected { reason } => Some(reason),
        _ => None,
    })
    .await;
    assert!(reason.is_some());
    assert!(!controller.is_connected());
    assert_eq!(controller.state(), ControllerState::Disconnected);

    // A new session can be started on a fresh link
    let (halves, _firmware) = VirtualPort::open("again");
    controller.connect_with_transport(halves).await.unwrap();
    assert_eq!(controller.state(), ControllerState::Connecting);
}

#[tokio::test]
async fn test_jog_uses_realtime_jog_command() {
    let mut s = ready(ControllerConfig::default().with_jog_feed_rate(500.0)).await;
    s.controller.jog(Axis::Y, -2.5).await.unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "$J=G91 G21 Y-2.5 F500");
    s.firmware.send_line("ok").await.unwrap();

    s.firmware
        .send_line("<Jog|MPos:0.000,-1.000,0.000|FS:500,0>")
        .await
        .unwrap();
    let controller = &s.controller;
    wait_until(|| controller.state() == ControllerState::Jog).await;
    s.controller.cancel_jog().unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(0x85));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_snapshots_are_never_torn() {
    const REPORTS: u32 = 300;
    let s = ready(ControllerConfig::default()).await;
    let mut firmware = s.firmware;

    // Report n: MPos 2n, WCO n, so WPos n, at feed n
    let writer = tokio::spawn(async move {
        for n in 1..=REPORTS {
            let line = format!(
                "<Run|MPos:{}.000,0.000,0.000|FS:{},0|WCO:{}.000,0.000,0.000>",
                2 * n,
                n,
                n
            );
            firmware.send_line(&line).await.unwrap();
        }
        firmware
    });

    let mut seen = 0.0;
    tokio::time::timeout(WAIT * 5, async {
        while seen < f64::from(REPORTS) {
            let status = s.controller.status();
            if status.state == ControllerState::Run {
                let n = status.work_coord.x;
                assert_eq!(status.machine_coord.x, 2.0 * n, "{:?}", status);
                assert_eq!(status.feed_speed, n, "{:?}", status);
                assert_eq!(
                    status.work_coordinate_offset.map(|p| p.x),
                    Some(n),
                    "{:?}",
                    status
                );
                assert!(n >= seen, "snapshot went backwards: {} after {}", n, seen);
                seen = n;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    writer.await.unwrap();
}

#[tokio::test]
async fn test_overrides_go_out_as_realtime_bytes() {
    let mut s = ready(ControllerConfig::default()).await;
    s.controller
        .send(Box::new(StringStreamReader::new("G1 X10 F100\nG1 X20")))
        .await
        .unwrap();
    next_line(&mut s.firmware).await;
    next_line(&mut s.firmware).await;

    s.controller
        .send_override(OverrideCommand::FeedCoarseUp)
        .unwrap();
    s.controller
        .send_override(OverrideCommand::RapidQuarter)
        .unwrap();
    s.controller
        .send_override(OverrideCommand::SpindleFineDown)
        .unwrap();
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(0x91));
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(0x97));
    assert_eq!(next_message(&mut s.firmware).await, HostMessage::Realtime(0x9D));
    // Overrides never occupy the receive buffer
    assert_eq!(s.controller.active_commands_count(), 2);

    s.firmware
        .send_line("<Run|MPos:2.000,0.000,0.000|FS:110,0|Ov:110,25,99>")
        .await
        .unwrap();
    let controller = &s.controller;
    wait_until(|| controller.status().overrides.feed == 110).await;
    let overrides = s.controller.status().overrides;
    assert_eq!((overrides.rapid, overrides.spindle), (25, 99));
}

#[tokio::test]
async fn test_override_needs_a_link() {
    let controller = FirmwareController::new(ControllerType::Grbl, ControllerConfig::default());
    let err = controller
        .send_override(OverrideCommand::FeedReset)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
}

#[tokio::test]
async fn test_modal_state_follows_completed_commands() {
    let mut s = ready(ControllerConfig::default()).await;
    s.controller
        .send_command(GcodeCommand::new("G20 G91"))
        .await
        .unwrap();
    next_line(&mut s.firmware).await;
    s.firmware.send_line("ok").await.unwrap();
    completion(&mut s.events, "G20 G91").await;

    let modal = s.controller.modal_state();
    assert_eq!(modal.units_mode, 20);
    assert_eq!(modal.distance_mode, 91);

    s.controller.restore_parser_modal_state().unwrap();
    assert_eq!(next_line(&mut s.firmware).await, "G91 G20");
}

#[tokio::test]
async fn test_polling_sends_realtime_requests() {
    let controller = FirmwareController::new(
        ControllerType::Grbl,
        ControllerConfig::default().with_status_poll_rate_ms(50),
    );
    let (halves, mut firmware) = VirtualPort::open("poll");
    controller.connect_with_transport(halves).await.unwrap();

    // GRBL answers status requests before its banner, so polling starts at once
    assert_eq!(next_message(&mut firmware).await, HostMessage::Realtime(b'?'));
    firmware
        .send_line("<Idle|MPos:0.000,0.000,0.000|FS:0,0>")
        .await
        .unwrap();
    wait_until(|| controller.is_ready()).await;
    controller.disconnect().await.unwrap();
    assert!(!controller.is_connected());
}
