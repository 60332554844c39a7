//! G-Code parser and modal state tracking
//!
//! Only as much of G-code is understood as is needed to resume a program
//! part-way through: units, distance mode, plane, feed mode, work coordinate
//! system, feed rate, spindle speed and tool.

use gcodestream_core::{GcodeError, Result, Units};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A single address word such as `G1` or `X-2.5`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word {
    /// Upper-case address letter
    pub letter: char,
    /// Numeric value
    pub value: f64,
}

impl Word {
    /// The value as an integral code (`G1` -> 1), if it has no fraction
    pub fn code(&self) -> Option<u16> {
        if self.value.fract() == 0.0 && self.value >= 0.0 && self.value <= u16::MAX as f64 {
            Some(self.value as u16)
        } else {
            None
        }
    }
}

fn comment_regex() -> &'static Regex {
    static COMMENT_REGEX: OnceLock<Regex> = OnceLock::new();
    COMMENT_REGEX.get_or_init(|| {
        Regex::new(r"\(([^)]*)\)|;(.*)$").expect("invalid regex pattern")
    })
}

fn word_regex() -> &'static Regex {
    static WORD_REGEX: OnceLock<Regex> = OnceLock::new();
    WORD_REGEX.get_or_init(|| {
        Regex::new(r"(?i)([A-Z])\s*([-+]?(?:\d+(?:\.\d*)?|\.\d+))")
            .expect("invalid regex pattern")
    })
}

/// Split a program line into the code to send and its comment text.
///
/// Both `( ... )` and `; ...` comments are removed. The returned code is
/// trimmed; the comment is `None` when the line had none.
pub fn strip_comment(line: &str) -> (String, Option<String>) {
    let mut comments = Vec::new();
    for caps in comment_regex().captures_iter(line) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            let text = m.as_str().trim();
            if !text.is_empty() {
                comments.push(text.to_string());
            }
        }
    }
    let code = comment_regex().replace_all(line, "").trim().to_string();
    let comment = if comments.is_empty() {
        None
    } else {
        Some(comments.join(" "))
    };
    (code, comment)
}

/// Split comment-free code into address words
pub fn tokenize(code: &str) -> Vec<Word> {
    word_regex()
        .captures_iter(code)
        .filter_map(|caps| {
            let letter = caps.get(1)?.as_str().chars().next()?.to_ascii_uppercase();
            let value = caps.get(2)?.as_str().parse::<f64>().ok()?;
            Some(Word { letter, value })
        })
        .collect()
}

/// Modal G-Code execution state
///
/// Tracks the modal groups that must be re-established when a program is
/// resumed from a later row:
/// - Motion group (G00, G01, G02, G03, G80)
/// - Plane selection group (G17, G18, G19)
/// - Distance mode group (G90, G91)
/// - Feed rate mode group (G93, G94, G95)
/// - Units group (G20, G21)
/// - Coordinate system group (G54-G59)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GcodeState {
    /// Motion mode - Group 1 (G00, G01, G02, G03, G80)
    pub motion_mode: u8,

    /// Plane selection - Group 2 (G17=XY, G18=XZ, G19=YZ)
    pub plane_mode: u8,

    /// Distance mode - Group 3 (G90=absolute, G91=incremental)
    pub distance_mode: u8,

    /// Feed rate mode - Group 5 (G93=inverse_time, G94=units_per_minute, G95=units_per_revolution)
    pub feed_rate_mode: u8,

    /// Units mode - Group 6 (G20=inches, G21=millimeters)
    pub units_mode: u8,

    /// Coordinate system - Group 12 (G54-G59)
    pub coordinate_system: u8,

    /// Current feed rate (F value)
    pub feed_rate: f64,

    /// Current spindle speed (S value)
    pub spindle_speed: f64,

    /// Tool number (T value)
    pub tool_number: u16,
}

impl Default for GcodeState {
    fn default() -> Self {
        Self {
            motion_mode: 0,        // G00 (rapid)
            plane_mode: 17,        // G17 (XY plane)
            distance_mode: 90,     // G90 (absolute)
            feed_rate_mode: 94,    // G94 (units per minute)
            units_mode: 21,        // G21 (millimeters)
            coordinate_system: 54, // G54 (first WCS)
            feed_rate: 0.0,
            spindle_speed: 0.0,
            tool_number: 0,
        }
    }
}

fn invalid(reason: String) -> GcodeError {
    GcodeError::InvalidModalState { reason }
}

impl GcodeState {
    /// Create a new G-Code state with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set motion mode (G00, G01, G02, G03, G80)
    pub fn set_motion_mode(&mut self, mode: u8) -> std::result::Result<(), GcodeError> {
        match mode {
            0..=3 | 80 => {
                self.motion_mode = mode;
                Ok(())
            }
            _ => Err(invalid(format!("Invalid motion mode: {}", mode))),
        }
    }

    /// Set plane mode (G17, G18, G19)
    pub fn set_plane_mode(&mut self, mode: u8) -> std::result::Result<(), GcodeError> {
        match mode {
            17..=19 => {
                self.plane_mode = mode;
                Ok(())
            }
            _ => Err(invalid(format!("Invalid plane mode: {}", mode))),
        }
    }

    /// Set distance mode (G90, G91)
    pub fn set_distance_mode(&mut self, mode: u8) -> std::result::Result<(), GcodeError> {
        match mode {
            90 | 91 => {
                self.distance_mode = mode;
                Ok(())
            }
            _ => Err(invalid(format!("Invalid distance mode: {}", mode))),
        }
    }

    /// Set feed rate mode (G93, G94, G95)
    pub fn set_feed_rate_mode(&mut self, mode: u8) -> std::result::Result<(), GcodeError> {
        match mode {
            93..=95 => {
                self.feed_rate_mode = mode;
                Ok(())
            }
            _ => Err(invalid(format!("Invalid feed rate mode: {}", mode))),
        }
    }

    /// Set units mode (G20 for inches, G21 for mm)
    pub fn set_units_mode(&mut self, mode: u8) -> std::result::Result<(), GcodeError> {
        match mode {
            20 | 21 => {
                self.units_mode = mode;
                Ok(())
            }
            _ => Err(invalid(format!("Invalid units mode: {}", mode))),
        }
    }

    /// Set coordinate system (G54-G59)
    pub fn set_coordinate_system(&mut self, system: u8) -> std::result::Result<(), GcodeError> {
        match system {
            54..=59 => {
                self.coordinate_system = system;
                Ok(())
            }
            _ => Err(invalid(format!("Invalid coordinate system: {}", system))),
        }
    }

    /// Set feed rate value
    pub fn set_feed_rate(&mut self, rate: f64) -> std::result::Result<(), GcodeError> {
        if rate < 0.0 {
            return Err(invalid("Feed rate cannot be negative".to_string()));
        }
        self.feed_rate = rate;
        Ok(())
    }

    /// Set spindle speed value
    pub fn set_spindle_speed(&mut self, speed: f64) -> std::result::Result<(), GcodeError> {
        if speed < 0.0 {
            return Err(invalid("Spindle speed cannot be negative".to_string()));
        }
        self.spindle_speed = speed;
        Ok(())
    }

    /// Units selected by the units group
    pub fn units(&self) -> Units {
        match self.units_mode {
            20 => Units::INCH,
            21 => Units::MM,
            _ => Units::Unknown,
        }
    }

    /// Work coordinate system index, 1 for G54 through 6 for G59
    pub fn wcs_index(&self) -> u8 {
        self.coordinate_system.saturating_sub(53).clamp(1, 6)
    }

    /// Apply one G word
    fn apply_g(&mut self, code: u16) -> std::result::Result<(), GcodeError> {
        let Ok(code) = u8::try_from(code) else {
            return Ok(());
        };
        match code {
            0..=3 | 80 => self.set_motion_mode(code),
            17..=19 => self.set_plane_mode(code),
            20 | 21 => self.set_units_mode(code),
            54..=59 => self.set_coordinate_system(code),
            90 | 91 => self.set_distance_mode(code),
            93..=95 => self.set_feed_rate_mode(code),
            _ => Ok(()),
        }
    }

    /// Line re-establishing this state on a freshly reset controller
    ///
    /// Units come first so the feed rate is read in the right units.
    pub fn to_gcode(&self) -> String {
        let mut words = vec![
            format!("G{}", self.units_mode),
            format!("G{}", self.distance_mode),
            format!("G{}", self.plane_mode),
            format!("G{}", self.feed_rate_mode),
            format!("G{}", self.coordinate_system),
        ];
        if self.feed_rate > 0.0 {
            words.push(format!(
                "F{}",
                gcodestream_core::format_coordinate(self.feed_rate)
            ));
        }
        if self.spindle_speed > 0.0 {
            words.push(format!(
                "S{}",
                gcodestream_core::format_coordinate(self.spindle_speed)
            ));
        }
        words.join(" ")
    }
}

/// G-Code parser with modal state tracking
#[derive(Debug, Clone, Default)]
pub struct GcodeParser {
    current_state: GcodeState,
}

impl GcodeParser {
    /// Create a new G-Code parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current GcodeState
    pub fn state(&self) -> GcodeState {
        self.current_state
    }

    /// Set current GcodeState
    pub fn set_state(&mut self, state: GcodeState) {
        self.current_state = state;
    }

    /// Reset to power-on defaults
    pub fn reset(&mut self) {
        self.current_state = GcodeState::default();
    }

    /// Update modal state from a program line (comments allowed).
    ///
    /// Firmware system commands (`$...`) and JSON configuration lines (`{...}`)
    /// carry no modal state and are ignored.
    /// On error the state is left as it was before the line.
    pub fn process(&mut self, line: &str) -> Result<()> {
        let (code, _) = strip_comment(line);
        if code.is_empty() || code.starts_with('$') || code.starts_with('{') {
            return Ok(());
        }
        self.process_words(&tokenize(&code))
    }

    /// Update modal state from a parser-state report such as
    /// `G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0`
    pub fn process_parser_state(&mut self, report: &str) -> Result<()> {
        self.process_words(&tokenize(report))
    }

    fn process_words(&mut self, words: &[Word]) -> Result<()> {
        let mut next = self.current_state;
        for word in words {
            match word.letter {
                'G' => {
                    if let Some(code) = word.code() {
                        next.apply_g(code)?;
                    }
                }
                'F' => next.set_feed_rate(word.value)?,
                'S' => next.set_spindle_speed(word.value)?,
                'T' => {
                    if let Some(tool) = word.code() {
                        next.tool_number = tool;
                    }
                }
                _ => {}
            }
        }
        self.current_state = next;
        Ok(())
    }

    /// Line that puts a controller into the tracked modal state
    pub fn preamble(&self) -> String {
        self.current_state.to_gcode()
    }

    /// Commands restoring the distance mode and units after a temporary
    /// modal change such as a plain G-code jog
    pub fn restore_commands(&self) -> String {
        format!(
            "G{} G{}",
            self.current_state.distance_mode, self.current_state.units_mode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comment() {
        assert_eq!(
            strip_comment("G0 X1 (rapid) ; move"),
            ("G0 X1".to_string(), Some("rapid move".to_string()))
        );
        assert_eq!(strip_comment("(only a comment)"), (String::new(), Some("only a comment".into())));
        assert_eq!(strip_comment("  G1 Y2  "), ("G1 Y2".to_string(), None));
    }

    #[test]
    fn test_tokenize() {
        let words = tokenize("g1x-1.5 Y.25 F1200");
        assert_eq!(words.len(), 4);
        assert_eq!(words[0], Word { letter: 'G', value: 1.0 });
        assert_eq!(words[1], Word { letter: 'X', value: -1.5 });
        assert_eq!(words[2], Word { letter: 'Y', value: 0.25 });
        assert_eq!(words[3].code(), Some(1200));
    }

    #[test]
    fn test_modal_tracking() {
        let mut parser = GcodeParser::new();
        parser.process("G20 G91 (inch, relative)").unwrap();
        parser.process("G1 X1 F30").unwrap();
        parser.process("G55 S9000").unwrap();
        let state = parser.state();
        assert_eq!(state.units(), Units::INCH);
        assert_eq!(state.distance_mode, 91);
        assert_eq!(state.motion_mode, 1);
        assert_eq!(state.coordinate_system, 55);
        assert_eq!(state.wcs_index(), 2);
        assert_eq!(parser.preamble(), "G20 G91 G17 G94 G55 F30 S9000");
        assert_eq!(parser.restore_commands(), "G91 G20");
    }

    #[test]
    fn test_g_codes_not_confused_by_substrings() {
        let mut parser = GcodeParser::new();
        // G38.2 must not be read as G3 and X20 must not be read as G20
        parser.process("G38.2 Z-10 F100").unwrap();
        parser.process("G0 X20").unwrap();
        assert_eq!(parser.state().motion_mode, 0);
        assert_eq!(parser.state().units_mode, 21);
    }

    #[test]
    fn test_system_commands_ignored() {
        let mut parser = GcodeParser::new();
        parser.process("$J=G91 G20 X1 F10").unwrap();
        assert_eq!(parser.state(), GcodeState::default());
    }

    #[test]
    fn test_invalid_value_leaves_state() {
        let mut parser = GcodeParser::new();
        parser.process("G20").unwrap();
        assert!(parser.process("G21 F-5").is_err());
        assert_eq!(parser.state().units_mode, 20);
    }

    #[test]
    fn test_parser_state_report() {
        let mut parser = GcodeParser::new();
        parser
            .process_parser_state("G1 G56 G18 G20 G91 G93 M5 M9 T3 F250 S0")
            .unwrap();
        let state = parser.state();
        assert_eq!(state.motion_mode, 1);
        assert_eq!(state.coordinate_system, 56);
        assert_eq!(state.plane_mode, 18);
        assert_eq!(state.feed_rate_mode, 93);
        assert_eq!(state.tool_number, 3);
        assert_eq!(state.feed_rate, 250.0);
    }
}
