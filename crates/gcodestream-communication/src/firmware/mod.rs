//! Firmware dialects for the supported CNC controllers
//!
//! Supported controllers:
//! - GRBL: the reference dialect, 127 byte receive buffer
//! - FluidNC: GRBL grammar on ESP32 hardware with a larger buffer
//! - Smoothieware: GRBL-style status reports with its own acknowledgements
//! - TinyG: JSON response grammar
//!
//! Every dialect implements [`FirmwareDialect`]: it classifies response lines
//! into [`Response`] values and builds the commands that differ between
//! firmwares. The session logic in [`crate::controller`] is shared.

pub mod fluidnc;
pub mod grbl;
pub mod smoothieware;
pub mod tinyg;

use gcodestream_core::{
    Axis, BufferState, ControllerState, ControllerStatus, FirmwareError, GcodeCommand,
    OverrideCommand, Overrides, PartialPosition, Position, Units,
};
use gcodestream_gcode::GcodeState;
use serde::{Deserialize, Serialize};

pub use fluidnc::FluidNcDialect;
pub use grbl::GrblDialect;
pub use smoothieware::SmoothiewareDialect;
pub use tinyg::TinyGDialect;

/// Realtime status request
pub const STATUS_REQUEST: u8 = b'?';
/// Realtime feed hold
pub const FEED_HOLD: u8 = b'!';
/// Realtime cycle start / resume
pub const CYCLE_START: u8 = b'~';
/// Realtime soft reset (ctrl-x)
pub const SOFT_RESET: u8 = 0x18;

/// Supported CNC controller types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    /// GRBL (default, most common)
    #[default]
    Grbl,
    /// FluidNC
    #[serde(rename = "fluidnc")]
    FluidNC,
    /// Smoothieware
    #[serde(rename = "smoothie", alias = "smoothieware")]
    Smoothieware,
    /// TinyG
    TinyG,
}

impl ControllerType {
    /// Every supported type
    pub const ALL: [ControllerType; 4] = [
        ControllerType::Grbl,
        ControllerType::FluidNC,
        ControllerType::Smoothieware,
        ControllerType::TinyG,
    ];

    /// Build the dialect for this firmware
    pub fn create_dialect(&self) -> Box<dyn FirmwareDialect> {
        match self {
            Self::Grbl => Box::new(GrblDialect::new()),
            Self::FluidNC => Box::new(FluidNcDialect::new()),
            Self::Smoothieware => Box::new(SmoothiewareDialect::new()),
            Self::TinyG => Box::new(TinyGDialect::new()),
        }
    }
}

impl std::fmt::Display for ControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grbl => write!(f, "GRBL"),
            Self::FluidNC => write!(f, "FluidNC"),
            Self::Smoothieware => write!(f, "Smoothieware"),
            Self::TinyG => write!(f, "TinyG"),
        }
    }
}

impl std::str::FromStr for ControllerType {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grbl" => Ok(Self::Grbl),
            "fluidnc" => Ok(Self::FluidNC),
            "smoothie" | "smoothieware" => Ok(Self::Smoothieware),
            "tinyg" => Ok(Self::TinyG),
            _ => Err(FirmwareError::UnknownFirmware {
                firmware_type: s.to_string(),
            }),
        }
    }
}

/// A classified response line
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Terminal success for the oldest active command
    Ok,
    /// Terminal failure for the oldest active command
    Error {
        /// Firmware error code, when given
        code: Option<u32>,
        /// Decoded description
        message: String,
    },
    /// Machine status report
    Status(StatusReport),
    /// The firmware entered ALARM
    Alarm {
        /// Alarm code (0 when the firmware gave none)
        code: u32,
        /// Decoded description
        message: String,
    },
    /// Modal state report (the words of `[GC:...]`)
    ParserState(String),
    /// Boot banner; the firmware (re)started and is ready
    Welcome {
        /// Version text from the banner
        version: String,
    },
    /// Firmware identification answered to a query, no restart implied
    Version(String),
    /// Informational line (bracketed messages, settings listings)
    Feedback(String),
    /// Firmware-side fault not tied to any command
    Warning(String),
    /// Nothing the dialect recognises
    Unknown(String),
}

/// Dialect-neutral content of one status report
///
/// Fields the firmware did not send are `None` and keep their previous value
/// when the report is applied to a [`ControllerStatus`]. Positions are partial
/// because some firmware only reports the axes that changed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusReport {
    /// Mapped run state
    pub state: Option<ControllerState>,
    /// Raw state token including any sub-state (e.g. `Hold:0`)
    pub raw_state: String,
    /// The full token when it carries a sub-state (`Hold:0`, `Door:1`)
    pub sub_state: Option<String>,
    /// Machine position
    pub machine_coord: Option<PartialPosition>,
    /// Work position
    pub work_coord: Option<PartialPosition>,
    /// Work coordinate offset
    pub work_coordinate_offset: Option<Position>,
    /// Feed rate
    pub feed_speed: Option<f64>,
    /// Spindle speed
    pub spindle_speed: Option<f64>,
    /// Override percentages
    pub overrides: Option<Overrides>,
    /// Buffer availability
    pub buffer: Option<BufferState>,
    /// Units the work position is reported in
    pub work_units: Option<Units>,
}

impl StatusReport {
    /// Build the next snapshot from `previous` and this report.
    ///
    /// A coordinate the report left out is derived from the other one and the
    /// (new or remembered) work coordinate offset: `WPos = MPos - WCO`.
    pub fn apply_to(&self, previous: &ControllerStatus) -> ControllerStatus {
        let wco = self
            .work_coordinate_offset
            .or(previous.work_coordinate_offset);

        let mut machine = self
            .machine_coord
            .map(|p| p.apply_to(&previous.machine_coord));
        let mut work = self.work_coord.map(|p| {
            let base = match self.work_units {
                Some(units) => previous.work_coord.with_units(units),
                None => previous.work_coord,
            };
            p.apply_to(&base)
        });
        if let Some(offset) = wco {
            if work.is_none() {
                work = machine.map(|m| m.subtract(&offset));
            }
            if machine.is_none() {
                machine = work.map(|w| w.add(&offset));
            }
        }

        ControllerStatus {
            state: self.state.unwrap_or(previous.state),
            sub_state: if self.state.is_some() {
                self.sub_state.clone()
            } else {
                previous.sub_state.clone()
            },
            machine_coord: machine.unwrap_or(previous.machine_coord),
            work_coord: work.unwrap_or(previous.work_coord),
            work_coordinate_offset: wco,
            feed_speed: self.feed_speed.unwrap_or(previous.feed_speed),
            spindle_speed: self.spindle_speed.unwrap_or(previous.spindle_speed),
            overrides: self.overrides.unwrap_or(previous.overrides),
            buffer: self.buffer.or(previous.buffer),
        }
    }
}

/// How a dialect aborts a running stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelStrategy {
    /// Nothing is moving; drop the queue and let active commands drain
    DrainOnly,
    /// Send these realtime bytes, then let active commands drain
    Realtime(Vec<u8>),
    /// Feed hold first, soft reset once the hold has decelerated
    HoldThenReset,
    /// Soft reset straight away
    Reset,
}

/// Per-firmware response grammar and command policy
pub trait FirmwareDialect: Send + Sync {
    /// Firmware family
    fn controller_type(&self) -> ControllerType;

    /// Receive buffer capacity in bytes
    fn buffer_size(&self) -> usize;

    /// Classify one response line
    ///
    /// One line can carry more than one response (a TinyG acknowledgement with
    /// an embedded status report). Blank lines yield nothing.
    fn parse_line(&self, line: &str) -> Vec<Response>;

    /// Commands queued once the firmware reported ready
    fn handshake_commands(&self) -> Vec<GcodeCommand> {
        Vec::new()
    }

    /// Realtime byte requesting a status report
    fn status_request_byte(&self) -> u8 {
        STATUS_REQUEST
    }

    /// Realtime byte pausing motion
    fn feed_hold_byte(&self) -> u8 {
        FEED_HOLD
    }

    /// Realtime byte resuming motion
    fn cycle_start_byte(&self) -> u8 {
        CYCLE_START
    }

    /// Realtime byte resetting the firmware
    fn soft_reset_byte(&self) -> u8 {
        SOFT_RESET
    }

    /// How to abort what the machine is doing in `state`
    fn cancel_strategy(&self, state: ControllerState) -> CancelStrategy;

    /// State to assume right after a soft reset
    ///
    /// Firmware that reboots on reset is `Connecting` until its banner.
    fn state_after_reset(&self) -> ControllerState {
        ControllerState::Connecting
    }

    /// Whether a status report proves the firmware is up when no banner was seen
    fn ready_on_status(&self) -> bool {
        true
    }

    /// Homing cycle
    fn homing_command(&self) -> GcodeCommand;

    /// Alarm unlock
    fn unlock_command(&self) -> GcodeCommand;

    /// Relative jog of one axis.
    ///
    /// Jogs built from plain G-code are marked as temporary modal changes and
    /// [`FirmwareDialect::jog_needs_modal_restore`] returns true.
    fn jog_command(&self, axis: Axis, delta: f64, feed_rate: f64, units: Units) -> GcodeCommand;

    /// Jogging leaves the parser in G91 and must be followed by a modal restore
    fn jog_needs_modal_restore(&self) -> bool {
        false
    }

    /// Realtime byte that aborts a jog, if the firmware has one
    fn jog_cancel_byte(&self) -> Option<u8> {
        None
    }

    /// Realtime byte applying an override adjustment, if the firmware has one
    fn override_byte(&self, _command: OverrideCommand) -> Option<u8> {
        None
    }

    /// Make the current position read as `position` in the active work
    /// coordinate system of `modal`
    fn set_work_position_command(
        &self,
        position: &PartialPosition,
        status: &ControllerStatus,
        modal: &GcodeState,
    ) -> GcodeCommand;

    /// Command requesting a parser-state report, if supported
    fn parser_state_command(&self) -> Option<GcodeCommand> {
        None
    }

    /// Command toggling check mode, if supported
    fn check_mode_command(&self) -> Option<GcodeCommand> {
        None
    }

    /// Shortest sensible status poll interval in milliseconds
    fn min_status_poll_ms(&self) -> u64 {
        50
    }
}

/// Parse `x,y,z[,a...]` into a position; fewer than three values is malformed
pub(crate) fn parse_position(text: &str) -> Option<Position> {
    let coords: Vec<f64> = text
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if coords.len() < 3 {
        return None;
    }
    let mut position = Position::new(coords[0], coords[1], coords[2]);
    position.a = coords.get(3).copied();
    Some(position)
}

/// Map a GRBL-family state token (without sub-state)
pub(crate) fn map_state_token(token: &str) -> ControllerState {
    match token.to_ascii_lowercase().as_str() {
        "idle" => ControllerState::Idle,
        "run" => ControllerState::Run,
        "jog" => ControllerState::Jog,
        "hold" => ControllerState::Hold,
        "door" => ControllerState::Door,
        "home" => ControllerState::Home,
        "alarm" => ControllerState::Alarm,
        "check" => ControllerState::Check,
        "sleep" => ControllerState::Sleep,
        _ => ControllerState::Unknown,
    }
}

/// Axis words shared by every dialect's `G10`/jog builders
pub(crate) fn axis_word(axis: Axis, value: f64) -> String {
    format!("{}{}", axis.letter(), gcodestream_core::format_coordinate(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_type_parsing() {
        assert_eq!("grbl".parse::<ControllerType>().unwrap(), ControllerType::Grbl);
        assert_eq!(
            "Smoothie".parse::<ControllerType>().unwrap(),
            ControllerType::Smoothieware
        );
        assert_eq!(
            "FluidNC".parse::<ControllerType>().unwrap(),
            ControllerType::FluidNC
        );
        assert!("marlin".parse::<ControllerType>().is_err());
    }

    #[test]
    fn test_buffer_sizes() {
        let sizes: Vec<usize> = ControllerType::ALL
            .iter()
            .map(|t| t.create_dialect().buffer_size())
            .collect();
        assert_eq!(sizes, vec![127, 512, 127, 254]);
    }

    #[test]
    fn test_parse_position() {
        let p = parse_position("1.000,-2.5,3").unwrap();
        assert_eq!((p.x, p.y, p.z, p.a), (1.0, -2.5, 3.0, None));
        assert_eq!(parse_position("1,2,3,4").unwrap().a, Some(4.0));
        assert!(parse_position("1,2").is_none());
        assert!(parse_position("1,x,3").is_none());
    }

    #[test]
    fn test_apply_derives_work_position_from_offset() {
        let report = StatusReport {
            state: Some(ControllerState::Run),
            machine_coord: Some(PartialPosition::xyz(10.0, 5.0, 0.0)),
            work_coordinate_offset: Some(Position::new(2.0, 1.0, 0.0)),
            ..Default::default()
        };
        let status = report.apply_to(&ControllerStatus::new());
        assert_eq!(status.work_coord, Position::new(8.0, 4.0, 0.0));

        // Next report without WCO reuses the remembered offset
        let report = StatusReport {
            state: Some(ControllerState::Run),
            machine_coord: Some(PartialPosition::xyz(12.0, 5.0, 0.0)),
            ..Default::default()
        };
        let status = report.apply_to(&status);
        assert_eq!(status.work_coord, Position::new(10.0, 4.0, 0.0));
    }

    #[test]
    fn test_apply_partial_position() {
        let previous = ControllerStatus::new().with_work_coord(Position::new(1.0, 2.0, 3.0));
        let report = StatusReport {
            work_coord: Some(PartialPosition::axis(Axis::Y, 7.0)),
            work_units: Some(Units::INCH),
            ..Default::default()
        };
        let status = report.apply_to(&previous);
        assert_eq!((status.work_coord.x, status.work_coord.y), (1.0, 7.0));
        assert_eq!(status.work_coord.units, Units::INCH);
    }

    #[test]
    fn test_apply_keeps_unreported_fields() {
        let previous = ControllerStatus::new()
            .with_state(ControllerState::Idle)
            .with_feed_speed(500.0);
        let report = StatusReport {
            spindle_speed: Some(12000.0),
            ..Default::default()
        };
        let status = report.apply_to(&previous);
        assert_eq!(status.state, ControllerState::Idle);
        assert_eq!(status.feed_speed, 500.0);
        assert_eq!(status.spindle_speed, 12000.0);
    }
}
