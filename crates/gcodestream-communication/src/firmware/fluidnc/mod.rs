//! FluidNC dialect
//!
//! FluidNC speaks GRBL 1.1 on ESP32 boards. It differs in its banner, a
//! larger receive buffer and in being reached over TCP or WebSocket, where no
//! banner is printed on connect. `$I` identifies it in that case.

use crate::firmware::grbl::{self, GrblDialect};
use crate::firmware::{CancelStrategy, ControllerType, FirmwareDialect, Response};
use gcodestream_core::{
    Axis, ControllerState, ControllerStatus, GcodeCommand, OverrideCommand, PartialPosition,
    Units,
};
use gcodestream_gcode::GcodeState;
use regex::Regex;
use std::sync::OnceLock;

/// FluidNC's serial/telnet receive buffer
pub const FLUIDNC_RX_BUFFER_SIZE: usize = 512;

fn banner_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Grbl\s+\S+\s+\[FluidNC\s+v?([^\s\]]+)").expect("invalid regex pattern")
    })
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[VER:[^\s]*\s*FluidNC\s+v?([^\s:\]]+)").expect("invalid regex pattern")
    })
}

/// FluidNC 3.x
#[derive(Debug, Clone, Default)]
pub struct FluidNcDialect {
    grbl: GrblDialect,
}

impl FluidNcDialect {
    /// Create the dialect
    pub fn new() -> Self {
        Self::default()
    }
}

impl FirmwareDialect for FluidNcDialect {
    fn controller_type(&self) -> ControllerType {
        ControllerType::FluidNC
    }

    fn buffer_size(&self) -> usize {
        FLUIDNC_RX_BUFFER_SIZE
    }

    fn parse_line(&self, line: &str) -> Vec<Response> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        if let Some(c) = version_regex().captures(line) {
            return vec![Response::Version(format!("FluidNC v{}", &c[1]))];
        }
        if let Some(response) = grbl::parse_common(line) {
            return vec![response];
        }
        if let Some(c) = banner_regex().captures(line) {
            return vec![Response::Welcome {
                version: format!("FluidNC v{}", &c[1]),
            }];
        }
        // Plain GRBL banner from an older build still means ready
        self.grbl.parse_line(line)
    }

    fn handshake_commands(&self) -> Vec<GcodeCommand> {
        vec![
            GcodeCommand::new("$I").alarm_exempt(),
            GcodeCommand::new("$G").alarm_exempt(),
        ]
    }

    fn cancel_strategy(&self, state: ControllerState) -> CancelStrategy {
        self.grbl.cancel_strategy(state)
    }

    fn homing_command(&self) -> GcodeCommand {
        self.grbl.homing_command()
    }

    fn unlock_command(&self) -> GcodeCommand {
        self.grbl.unlock_command()
    }

    fn jog_command(&self, axis: Axis, delta: f64, feed_rate: f64, units: Units) -> GcodeCommand {
        self.grbl.jog_command(axis, delta, feed_rate, units)
    }

    fn jog_cancel_byte(&self) -> Option<u8> {
        self.grbl.jog_cancel_byte()
    }

    fn override_byte(&self, command: OverrideCommand) -> Option<u8> {
        self.grbl.override_byte(command)
    }

    fn set_work_position_command(
        &self,
        position: &PartialPosition,
        status: &ControllerStatus,
        modal: &GcodeState,
    ) -> GcodeCommand {
        self.grbl.set_work_position_command(position, status, modal)
    }

    fn parser_state_command(&self) -> Option<GcodeCommand> {
        self.grbl.parser_state_command()
    }

    fn check_mode_command(&self) -> Option<GcodeCommand> {
        self.grbl.check_mode_command()
    }
}
