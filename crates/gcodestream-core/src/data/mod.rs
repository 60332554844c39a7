//! Data models for positions, machine state and status snapshots
//!
//! This module provides:
//! - Position tracking with an optional fourth axis
//! - Partial positions for axis-selective commands (jog, set work position)
//! - The controller and communicator state enums
//! - The immutable [`ControllerStatus`] snapshot published on every update

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine coordinate units (millimeters or inches)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    /// Millimeters (metric)
    MM,
    /// Inches (imperial)
    INCH,
    /// Unknown or uninitialized
    Unknown,
}

impl Units {
    /// Convert a value from one unit to another
    ///
    /// # Arguments
    /// * `value` - The value to convert
    /// * `from` - The unit of the input value
    /// * `to` - The target unit
    ///
    /// # Returns
    /// The converted value, or the original value if units are the same or unknown
    pub fn convert(value: f64, from: Units, to: Units) -> f64 {
        if from == to {
            return value;
        }

        match (from, to) {
            (Units::MM, Units::INCH) => value / 25.4,
            (Units::INCH, Units::MM) => value * 25.4,
            _ => value,
        }
    }

    /// The G-code word selecting these units, if known
    pub fn gcode(&self) -> Option<&'static str> {
        match self {
            Units::MM => Some("G21"),
            Units::INCH => Some("G20"),
            Units::Unknown => None,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::MM => write!(f, "mm"),
            Units::INCH => write!(f, "in"),
            Units::Unknown => write!(f, "unknown"),
        }
    }
}

/// A machine axis addressable by jog and work-offset commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
    /// Fourth (rotary) axis
    A,
}

impl Axis {
    /// Parse an axis letter (case-insensitive)
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            'A' => Some(Axis::A),
            _ => None,
        }
    }

    /// The axis letter
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::A => 'A',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Format a coordinate for a G-code word: at most four decimals, no trailing zeros.
pub fn format_coordinate(value: f64) -> String {
    let mut s = format!("{:.4}", value);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    if s == "-0" {
        s = "0".to_string();
    }
    s
}

/// Position in 3D space with optional fourth axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
    /// Fourth axis (A) if present
    pub a: Option<f64>,
    /// Units the coordinates are expressed in
    pub units: Units,
}

impl Position {
    /// Create a new millimetre position with X, Y, Z coordinates
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            a: None,
            units: Units::MM,
        }
    }

    /// Create a position with four axes including the A axis
    pub fn with_a(x: f64, y: f64, z: f64, a: f64) -> Self {
        Self {
            a: Some(a),
            ..Self::new(x, y, z)
        }
    }

    /// Same coordinates tagged with different units
    pub fn with_units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    /// Value of a single axis
    pub fn get(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => Some(self.x),
            Axis::Y => Some(self.y),
            Axis::Z => Some(self.z),
            Axis::A => self.a,
        }
    }

    /// Convert this position to different units
    pub fn convert_to(&self, units: Units) -> Self {
        Self {
            x: Units::convert(self.x, self.units, units),
            y: Units::convert(self.y, self.units, units),
            z: Units::convert(self.z, self.units, units),
            a: self.a,
            units,
        }
    }

    /// Add another position (component-wise)
    pub fn add(&self, other: &Position) -> Self {
        Self {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
            a: match (self.a, other.a) {
                (Some(a1), Some(a2)) => Some(a1 + a2),
                (Some(a), None) | (None, Some(a)) => Some(a),
                _ => None,
            },
            units: self.units,
        }
    }

    /// Subtract another position (component-wise)
    pub fn subtract(&self, other: &Position) -> Self {
        Self {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
            a: match (self.a, other.a) {
                (Some(a1), Some(a2)) => Some(a1 - a2),
                (Some(a), None) => Some(a),
                (None, Some(a)) => Some(-a),
                _ => None,
            },
            units: self.units,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.a {
            Some(a) => write!(
                f,
                "X:{:.3} Y:{:.3} Z:{:.3} A:{:.3}",
                self.x, self.y, self.z, a
            ),
            None => write!(f, "X:{:.3} Y:{:.3} Z:{:.3}", self.x, self.y, self.z),
        }
    }
}

/// Partial position for commands that address only specific axes
///
/// Each axis is an `Option` where `None` means "leave this axis alone".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialPosition {
    /// X-axis value
    pub x: Option<f64>,
    /// Y-axis value
    pub y: Option<f64>,
    /// Z-axis value
    pub z: Option<f64>,
    /// A-axis value
    pub a: Option<f64>,
}

impl PartialPosition {
    /// Create a new empty partial position (all axes None)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a partial position with a single axis set
    pub fn axis(axis: Axis, value: f64) -> Self {
        Self::default().with(axis, value)
    }

    /// Create a partial position with XYZ axes set
    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            a: None,
        }
    }

    /// Builder method setting one axis
    pub fn with(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x = Some(value),
            Axis::Y => self.y = Some(value),
            Axis::Z => self.z = Some(value),
            Axis::A => self.a = Some(value),
        }
        self
    }

    /// The set axes in X, Y, Z, A order
    pub fn axes(&self) -> Vec<(Axis, f64)> {
        [
            (Axis::X, self.x),
            (Axis::Y, self.y),
            (Axis::Z, self.z),
            (Axis::A, self.a),
        ]
        .into_iter()
        .filter_map(|(axis, v)| v.map(|v| (axis, v)))
        .collect()
    }

    /// Apply this partial position to an existing position, updating only specified axes
    pub fn apply_to(&self, pos: &Position) -> Position {
        Position {
            x: self.x.unwrap_or(pos.x),
            y: self.y.unwrap_or(pos.y),
            z: self.z.unwrap_or(pos.z),
            a: self.a.or(pos.a),
            units: pos.units,
        }
    }

    /// Render the set axes as G-code words, e.g. `X1.5 Z-2`
    pub fn to_gcode_words(&self) -> String {
        self.axes()
            .into_iter()
            .map(|(axis, v)| format!("{}{}", axis, format_coordinate(v)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Check if this partial position is empty (no axes set)
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none() && self.a.is_none()
    }
}

impl From<Position> for PartialPosition {
    fn from(pos: Position) -> Self {
        Self {
            x: Some(pos.x),
            y: Some(pos.y),
            z: Some(pos.z),
            a: pos.a,
        }
    }
}

/// Machine/Controller state machine states
///
/// Tracks the session from connection through execution and fault states.
/// Raw firmware tokens without a mapping land in [`ControllerState::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    /// Not connected to any controller
    Disconnected,
    /// Link open, waiting for the firmware boot handshake
    Connecting,
    /// Connected and idle, ready for commands
    Idle,
    /// Manual jog in progress
    Jog,
    /// Executing a G-code program
    Run,
    /// Feed hold, awaiting resume
    Hold,
    /// Safety door interlock triggered
    Door,
    /// Homing cycle in progress
    Home,
    /// Machine alarm state (requires explicit unlock)
    Alarm,
    /// Check mode (dry-run without machine movement)
    Check,
    /// Low-power sleep state
    Sleep,
    /// Connected, but the firmware reported a state with no mapping
    Unknown,
}

impl ControllerState {
    /// Check if this state indicates the controller is connected
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            ControllerState::Disconnected | ControllerState::Connecting
        )
    }

    /// Check if the firmware is ready to accept a new command stream
    pub fn is_idle(&self) -> bool {
        matches!(self, ControllerState::Idle | ControllerState::Check)
    }

    /// Check if this state indicates an error condition
    pub fn is_error(&self) -> bool {
        matches!(self, ControllerState::Alarm)
    }

    /// Check if this state indicates active motion
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            ControllerState::Run | ControllerState::Jog | ControllerState::Home
        )
    }

    /// Check if motion is suspended (feed hold or door)
    pub fn is_held(&self) -> bool {
        matches!(self, ControllerState::Hold | ControllerState::Door)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Idle => write!(f, "Idle"),
            Self::Jog => write!(f, "Jog"),
            Self::Run => write!(f, "Run"),
            Self::Hold => write!(f, "Hold"),
            Self::Door => write!(f, "Door"),
            Self::Home => write!(f, "Home"),
            Self::Alarm => write!(f, "Alarm"),
            Self::Check => write!(f, "Check"),
            Self::Sleep => write!(f, "Sleep"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// State of the sending side of a session
///
/// Derived from the controller state and the streaming flags; separate from
/// [`ControllerState`] because a stream can be paused while the machine is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommunicatorState {
    /// No connection
    Disconnected,
    /// Connected, nothing being sent
    Idle,
    /// A stream is being sent
    Sending,
    /// A stream is open but admission is paused
    SendingPaused,
    /// Firmware is in check (dry-run) mode
    Check,
}

impl fmt::Display for CommunicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Idle => write!(f, "Idle"),
            Self::Sending => write!(f, "Sending"),
            Self::SendingPaused => write!(f, "Sending (paused)"),
            Self::Check => write!(f, "Check"),
        }
    }
}

/// Feed, rapid and spindle override percentages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    /// Feed override percentage
    pub feed: u16,
    /// Rapid override percentage
    pub rapid: u16,
    /// Spindle override percentage
    pub spindle: u16,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

impl fmt::Display for Overrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "F:{}% R:{}% S:{}%",
            self.feed, self.rapid, self.spindle
        )
    }
}

/// A realtime override adjustment, applied while the machine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideCommand {
    /// Feed override back to 100%
    FeedReset,
    /// Feed override +10%
    FeedCoarseUp,
    /// Feed override -10%
    FeedCoarseDown,
    /// Feed override +1%
    FeedFineUp,
    /// Feed override -1%
    FeedFineDown,
    /// Rapids at 100%
    RapidFull,
    /// Rapids at 50%
    RapidHalf,
    /// Rapids at 25%
    RapidQuarter,
    /// Spindle override back to 100%
    SpindleReset,
    /// Spindle override +10%
    SpindleCoarseUp,
    /// Spindle override -10%
    SpindleCoarseDown,
    /// Spindle override +1%
    SpindleFineUp,
    /// Spindle override -1%
    SpindleFineDown,
}

impl OverrideCommand {
    /// The overrides expected once the firmware applies this adjustment.
    /// Feed and spindle stay within 10-200%.
    pub fn apply_to(&self, overrides: Overrides) -> Overrides {
        let step = |value: u16, delta: i32, min: u16, max: u16| {
            (i32::from(value) + delta).clamp(i32::from(min), i32::from(max)) as u16
        };
        let mut next = overrides;
        match self {
            Self::FeedReset => next.feed = 100,
            Self::FeedCoarseUp => next.feed = step(next.feed, 10, 10, 200),
            Self::FeedCoarseDown => next.feed = step(next.feed, -10, 10, 200),
            Self::FeedFineUp => next.feed = step(next.feed, 1, 10, 200),
            Self::FeedFineDown => next.feed = step(next.feed, -1, 10, 200),
            Self::RapidFull => next.rapid = 100,
            Self::RapidHalf => next.rapid = 50,
            Self::RapidQuarter => next.rapid = 25,
            Self::SpindleReset => next.spindle = 100,
            Self::SpindleCoarseUp => next.spindle = step(next.spindle, 10, 10, 200),
            Self::SpindleCoarseDown => next.spindle = step(next.spindle, -10, 10, 200),
            Self::SpindleFineUp => next.spindle = step(next.spindle, 1, 10, 200),
            Self::SpindleFineDown => next.spindle = step(next.spindle, -1, 10, 200),
        }
        next
    }
}

/// Firmware buffer availability as reported in a status line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferState {
    /// Free planner blocks
    pub planner_blocks_available: u16,
    /// Free bytes in the serial receive buffer
    pub rx_bytes_available: u16,
}

/// Immutable snapshot of the machine as last reported
///
/// A new value is built for every update and published behind an `Arc`, so a
/// reader holding a snapshot never sees fields from two different reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    /// Run state
    pub state: ControllerState,
    /// Raw sub-state token reported alongside the state (e.g. `Hold:0`)
    pub sub_state: Option<String>,
    /// Machine coordinates
    pub machine_coord: Position,
    /// Work coordinates
    pub work_coord: Position,
    /// Offset between machine and work coordinates, if known
    pub work_coordinate_offset: Option<Position>,
    /// Current feed rate (units per minute)
    pub feed_speed: f64,
    /// Current spindle speed (RPM)
    pub spindle_speed: f64,
    /// Override percentages
    pub overrides: Overrides,
    /// Firmware buffer availability, if reported
    pub buffer: Option<BufferState>,
}

impl ControllerStatus {
    /// Snapshot used before a session exists
    pub fn new() -> Self {
        Self {
            state: ControllerState::Disconnected,
            sub_state: None,
            machine_coord: Position::default(),
            work_coord: Position::default(),
            work_coordinate_offset: None,
            feed_speed: 0.0,
            spindle_speed: 0.0,
            overrides: Overrides::default(),
            buffer: None,
        }
    }

    /// Builder method to set the run state
    pub fn with_state(mut self, state: ControllerState) -> Self {
        self.state = state;
        self
    }

    /// Builder method to set the sub-state token
    pub fn with_sub_state(mut self, sub_state: Option<String>) -> Self {
        self.sub_state = sub_state;
        self
    }

    /// Builder method to set machine coordinates
    pub fn with_machine_coord(mut self, position: Position) -> Self {
        self.machine_coord = position;
        self
    }

    /// Builder method to set work coordinates
    pub fn with_work_coord(mut self, position: Position) -> Self {
        self.work_coord = position;
        self
    }

    /// Builder method to set the work coordinate offset
    pub fn with_work_coordinate_offset(mut self, offset: Position) -> Self {
        self.work_coordinate_offset = Some(offset);
        self
    }

    /// Builder method to set feed speed
    pub fn with_feed_speed(mut self, feed: f64) -> Self {
        self.feed_speed = feed;
        self
    }

    /// Builder method to set spindle speed
    pub fn with_spindle_speed(mut self, speed: f64) -> Self {
        self.spindle_speed = speed;
        self
    }

    /// Builder method to set overrides
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Builder method to set buffer availability
    pub fn with_buffer(mut self, buffer: BufferState) -> Self {
        self.buffer = Some(buffer);
        self
    }
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} MPos[{}] WPos[{}] F:{} S:{}",
            self.state, self.machine_coord, self.work_coord, self.feed_speed, self.spindle_speed
        )
    }
}
