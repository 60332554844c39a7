//! Smoothieware dialect
//!
//! Smoothieware borrows GRBL's status report shape and realtime bytes but has
//! its own acknowledgement spelling, halts with `!!`, and has no jog command,
//! so jogs are plain relative G-code followed by a modal restore.

use crate::firmware::grbl::{decode_error, StatusParser};
use crate::firmware::{axis_word, CancelStrategy, ControllerType, FirmwareDialect, Response};
use gcodestream_core::{
    Axis, ControllerState, ControllerStatus, GcodeCommand, PartialPosition, Units,
};
use gcodestream_gcode::GcodeState;

/// Smoothieware serial receive buffer
pub const SMOOTHIE_RX_BUFFER_SIZE: usize = 127;

/// Smoothieware boards
#[derive(Debug, Clone, Default)]
pub struct SmoothiewareDialect;

impl SmoothiewareDialect {
    /// Create the dialect
    pub fn new() -> Self {
        Self
    }

    fn parse_error(rest: &str) -> Response {
        let rest = rest.trim();
        match rest.parse::<u32>() {
            Ok(code) => Response::Error {
                code: Some(code),
                message: decode_error(code),
            },
            Err(_) => Response::Error {
                code: None,
                message: rest.to_string(),
            },
        }
    }
}

impl FirmwareDialect for SmoothiewareDialect {
    fn controller_type(&self) -> ControllerType {
        ControllerType::Smoothieware
    }

    fn buffer_size(&self) -> usize {
        SMOOTHIE_RX_BUFFER_SIZE
    }

    fn parse_line(&self, line: &str) -> Vec<Response> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        if line.eq_ignore_ascii_case("ok") {
            return vec![Response::Ok];
        }
        if let Some(rest) = line
            .strip_prefix("error:")
            .or_else(|| line.strip_prefix("Error:"))
        {
            return vec![Self::parse_error(rest)];
        }
        if line.starts_with("!!") {
            return vec![Response::Alarm {
                code: 0,
                message: "Halted, send $X or M999 to resume".to_string(),
            }];
        }
        if let Some(rest) = line.strip_prefix("ALARM:") {
            return vec![Response::Alarm {
                code: rest.trim().parse().unwrap_or(0),
                message: rest.trim().to_string(),
            }];
        }
        if line.starts_with('<') {
            return vec![match StatusParser::parse(line) {
                Some(report) => Response::Status(report),
                None => Response::Unknown(line.to_string()),
            }];
        }
        if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let words = inner.strip_prefix("GC:").unwrap_or(inner).trim();
            if words.starts_with('G') {
                return vec![Response::ParserState(words.to_string())];
            }
            return vec![Response::Feedback(line.to_string())];
        }
        if line.eq_ignore_ascii_case("smoothie") {
            return vec![Response::Welcome {
                version: "Smoothieware".to_string(),
            }];
        }
        if let Some(rest) = line.strip_prefix("Build version:") {
            let build = rest.split(',').next().unwrap_or_default().trim();
            return vec![Response::Version(format!("Smoothieware {}", build))];
        }
        vec![Response::Unknown(line.to_string())]
    }

    fn handshake_commands(&self) -> Vec<GcodeCommand> {
        vec![
            GcodeCommand::new("version").alarm_exempt(),
            GcodeCommand::new("$G").alarm_exempt(),
        ]
    }

    /// Smoothieware has no safe-stop sequence; reset straight away
    fn cancel_strategy(&self, state: ControllerState) -> CancelStrategy {
        match state {
            ControllerState::Idle | ControllerState::Check | ControllerState::Alarm => {
                CancelStrategy::DrainOnly
            }
            _ => CancelStrategy::Reset,
        }
    }

    /// Smoothieware does not reboot on reset; the next report says where it is
    fn state_after_reset(&self) -> ControllerState {
        ControllerState::Unknown
    }

    fn homing_command(&self) -> GcodeCommand {
        GcodeCommand::new("$H").alarm_exempt()
    }

    fn unlock_command(&self) -> GcodeCommand {
        GcodeCommand::new("$X").alarm_exempt()
    }

    fn jog_command(&self, axis: Axis, delta: f64, _feed_rate: f64, units: Units) -> GcodeCommand {
        GcodeCommand::new(format!(
            "G91 {} G0 {}",
            units.gcode().unwrap_or("G21"),
            axis_word(axis, delta)
        ))
        .temporary_modal()
    }

    fn jog_needs_modal_restore(&self) -> bool {
        true
    }

    fn set_work_position_command(
        &self,
        position: &PartialPosition,
        _status: &ControllerStatus,
        modal: &GcodeState,
    ) -> GcodeCommand {
        GcodeCommand::new(format!(
            "G10 L20 P{} {}",
            modal.wcs_index(),
            position.to_gcode_words()
        ))
    }

    fn parser_state_command(&self) -> Option<GcodeCommand> {
        Some(GcodeCommand::new("$G").alarm_exempt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Vec<Response> {
        SmoothiewareDialect::new().parse_line(line)
    }

    #[test]
    fn test_acknowledgements() {
        assert_eq!(parse("ok"), vec![Response::Ok]);
        assert_eq!(parse("OK"), vec![Response::Ok]);
        assert_eq!(
            parse("Error: Unsupported command"),
            vec![Response::Error {
                code: None,
                message: "Unsupported command".into()
            }]
        );
        assert!(matches!(
            parse("error:20").as_slice(),
            [Response::Error { code: Some(20), .. }]
        ));
    }

    #[test]
    fn test_halt_is_alarm() {
        assert!(matches!(
            parse("!!").as_slice(),
            [Response::Alarm { code: 0, .. }]
        ));
        assert!(matches!(
            parse("ALARM: Hard limit +X").as_slice(),
            [Response::Alarm { code: 0, .. }]
        ));
    }

    #[test]
    fn test_banners() {
        assert_eq!(
            parse("Smoothie"),
            vec![Response::Welcome {
                version: "Smoothieware".into()
            }]
        );
        assert_eq!(
            parse("Build version: edge-3332442, Build date: xxx, MCU: LPC1769, System Clock: 120MHz"),
            vec![Response::Version("Smoothieware edge-3332442".into())]
        );
    }

    #[test]
    fn test_status_and_parser_state() {
        match parse("<Idle|MPos:1.0000,2.0000,3.0000|WPos:1.0000,2.0000,3.0000|F:4000.0,100.0>")
            .as_slice()
        {
            [Response::Status(report)] => {
                assert_eq!(report.state, Some(ControllerState::Idle));
                assert_eq!(report.feed_speed, Some(4000.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            parse("[G0 G54 G17 G21 G90 G94 M0 M5 M9 T1 F4000.0000 S0.8000]"),
            vec![Response::ParserState(
                "G0 G54 G17 G21 G90 G94 M0 M5 M9 T1 F4000.0000 S0.8000".into()
            )]
        );
    }

    #[test]
    fn test_jog_is_temporary_modal() {
        let d = SmoothiewareDialect::new();
        let jog = d.jog_command(Axis::Y, 2.5, 1000.0, Units::MM);
        assert_eq!(jog.text, "G91 G21 G0 Y2.5");
        assert!(jog.temporary_modal_change);
        assert!(d.jog_needs_modal_restore());
        assert_eq!(d.jog_cancel_byte(), None);
    }

    #[test]
    fn test_work_position_uses_active_wcs() {
        let d = SmoothiewareDialect::new();
        let mut modal = GcodeState::default();
        modal.coordinate_system = 55;
        let cmd = d.set_work_position_command(
            &PartialPosition::axis(Axis::Z, 0.0),
            &ControllerStatus::new(),
            &modal,
        );
        assert_eq!(cmd.text, "G10 L20 P2 Z0");
    }

    #[test]
    fn test_cancel_resets() {
        let d = SmoothiewareDialect::new();
        assert_eq!(d.cancel_strategy(ControllerState::Run), CancelStrategy::Reset);
        assert_eq!(d.cancel_strategy(ControllerState::Idle), CancelStrategy::DrainOnly);
        assert_eq!(d.state_after_reset(), ControllerState::Unknown);
    }
}
