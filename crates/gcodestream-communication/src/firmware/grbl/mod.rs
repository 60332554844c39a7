//! GRBL dialect
//!
//! The reference dialect. Its response grammar is shared by FluidNC and,
//! for status reports, by Smoothieware.

pub mod error_decoder;
pub mod status_parser;

pub use error_decoder::{decode_alarm, decode_error, format_alarm, format_error};
pub use status_parser::StatusParser;

use crate::firmware::{axis_word, CancelStrategy, ControllerType, FirmwareDialect, Response};
use gcodestream_core::{
    format_coordinate, Axis, ControllerState, ControllerStatus, GcodeCommand, OverrideCommand,
    PartialPosition, Units,
};
use gcodestream_gcode::GcodeState;
use regex::Regex;
use std::sync::OnceLock;

/// Receive buffer of an Arduino GRBL build
pub const GRBL_RX_BUFFER_SIZE: usize = 127;

/// Realtime jog cancel (GRBL 1.1)
pub const JOG_CANCEL: u8 = 0x85;

fn banner_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Grbl\s+(\d+\.\d+[a-zA-Z]?)").expect("invalid regex pattern")
    })
}

/// Lines every GRBL-family firmware answers the same way
///
/// Returns `None` for text the caller should try its own rules on.
pub(crate) fn parse_common(line: &str) -> Option<Response> {
    if line == "ok" {
        return Some(Response::Ok);
    }
    if let Some(rest) = line.strip_prefix("error:") {
        return Some(match rest.trim().parse::<u32>() {
            Ok(code) => Response::Error {
                code: Some(code),
                message: decode_error(code),
            },
            Err(_) => Response::Error {
                code: None,
                message: rest.trim().to_string(),
            },
        });
    }
    if let Some(rest) = line.strip_prefix("ALARM:") {
        return Some(match rest.trim().parse::<u32>() {
            Ok(code) => Response::Alarm {
                code,
                message: decode_alarm(code),
            },
            Err(_) => Response::Alarm {
                code: 0,
                message: rest.trim().to_string(),
            },
        });
    }
    if line.starts_with('<') {
        return Some(match StatusParser::parse(line) {
            Some(report) => Response::Status(report),
            None => Response::Unknown(line.to_string()),
        });
    }
    if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
        if let Some(words) = inner.strip_prefix("GC:") {
            return Some(Response::ParserState(words.trim().to_string()));
        }
        // GRBL 0.9 reports the parser state without a tag
        if inner.starts_with('G') && inner.chars().nth(1).is_some_and(|c| c.is_ascii_digit()) {
            return Some(Response::ParserState(inner.trim().to_string()));
        }
        return Some(Response::Feedback(line.to_string()));
    }
    if line.starts_with('$') || line.starts_with('>') {
        return Some(Response::Feedback(line.to_string()));
    }
    None
}

/// GRBL 0.9 / 1.1
#[derive(Debug, Clone, Default)]
pub struct GrblDialect;

impl GrblDialect {
    /// Create the dialect
    pub fn new() -> Self {
        Self
    }

    /// Version from a `Grbl 1.1h ['$' for help]` banner
    pub fn parse_banner(line: &str) -> Option<String> {
        banner_regex()
            .captures(line)
            .map(|c| format!("Grbl {}", &c[1]))
    }
}

impl FirmwareDialect for GrblDialect {
    fn controller_type(&self) -> ControllerType {
        ControllerType::Grbl
    }

    fn buffer_size(&self) -> usize {
        GRBL_RX_BUFFER_SIZE
    }

    fn parse_line(&self, line: &str) -> Vec<Response> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        if let Some(response) = parse_common(line) {
            return vec![response];
        }
        if let Some(version) = Self::parse_banner(line) {
            return vec![Response::Welcome { version }];
        }
        vec![Response::Unknown(line.to_string())]
    }

    fn handshake_commands(&self) -> Vec<GcodeCommand> {
        vec![
            GcodeCommand::new("$$").alarm_exempt(),
            GcodeCommand::new("$G").alarm_exempt(),
        ]
    }

    /// Jogs are cancelled with 0x85. Program motion is held, then reset once
    /// the hold has decelerated so no position is lost.
    fn cancel_strategy(&self, state: ControllerState) -> CancelStrategy {
        match state {
            ControllerState::Jog => CancelStrategy::Realtime(vec![JOG_CANCEL]),
            ControllerState::Run | ControllerState::Hold | ControllerState::Home => {
                CancelStrategy::HoldThenReset
            }
            _ => CancelStrategy::DrainOnly,
        }
    }

    fn homing_command(&self) -> GcodeCommand {
        GcodeCommand::new("$H").alarm_exempt()
    }

    fn unlock_command(&self) -> GcodeCommand {
        GcodeCommand::new("$X").alarm_exempt()
    }

    fn jog_command(&self, axis: Axis, delta: f64, feed_rate: f64, units: Units) -> GcodeCommand {
        GcodeCommand::new(format!(
            "$J=G91 {} {} F{}",
            units.gcode().unwrap_or("G21"),
            axis_word(axis, delta),
            format_coordinate(feed_rate)
        ))
    }

    fn jog_cancel_byte(&self) -> Option<u8> {
        Some(JOG_CANCEL)
    }

    fn override_byte(&self, command: OverrideCommand) -> Option<u8> {
        Some(match command {
            OverrideCommand::FeedReset => 0x90,
            OverrideCommand::FeedCoarseUp => 0x91,
            OverrideCommand::FeedCoarseDown => 0x92,
            OverrideCommand::FeedFineUp => 0x93,
            OverrideCommand::FeedFineDown => 0x94,
            OverrideCommand::RapidFull => 0x95,
            OverrideCommand::RapidHalf => 0x96,
            OverrideCommand::RapidQuarter => 0x97,
            OverrideCommand::SpindleReset => 0x99,
            OverrideCommand::SpindleCoarseUp => 0x9A,
            OverrideCommand::SpindleCoarseDown => 0x9B,
            OverrideCommand::SpindleFineUp => 0x9C,
            OverrideCommand::SpindleFineDown => 0x9D,
        })
    }

    fn set_work_position_command(
        &self,
        position: &PartialPosition,
        _status: &ControllerStatus,
        _modal: &GcodeState,
    ) -> GcodeCommand {
        GcodeCommand::new(format!("G10 P0 L20 {}", position.to_gcode_words()))
    }

    fn parser_state_command(&self) -> Option<GcodeCommand> {
        Some(GcodeCommand::new("$G").alarm_exempt())
    }

    fn check_mode_command(&self) -> Option<GcodeCommand> {
        Some(GcodeCommand::new("$C"))
    }
}
