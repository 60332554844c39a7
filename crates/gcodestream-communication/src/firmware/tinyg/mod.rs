//! TinyG dialect
//!
//! TinyG answers in JSON once `{ej:1}` is set. A command is acknowledged by
//! an `r` object whose footer `f` carries the status code (0 = ok); status
//! reports arrive as `sr` objects, either alone or inside an acknowledgement.

use crate::firmware::{
    axis_word, CancelStrategy, ControllerType, FirmwareDialect, Response, StatusReport,
    FEED_HOLD,
};
use gcodestream_core::{
    format_coordinate, Axis, ControllerState, ControllerStatus, GcodeCommand, Overrides,
    PartialPosition, Units,
};
use gcodestream_gcode::GcodeState;
use serde_json::{Map, Value};

/// TinyG serial receive buffer
pub const TINYG_RX_BUFFER_SIZE: usize = 254;

/// Realtime queue flush, valid while in feed hold
pub const QUEUE_FLUSH: u8 = b'%';

/// Fields requested in every status report
const STATUS_REPORT_CONFIG: &str = "{sr:{posx:t,posy:t,posz:t,mpox:t,mpoy:t,mpoz:t,plan:t,vel:t,unit:t,stat:t,dist:t,frmo:t,coor:t}}";

type JsonObject = Map<String, Value>;

/// TinyG / g2core in JSON mode
#[derive(Debug, Clone, Default)]
pub struct TinyGDialect;

impl TinyGDialect {
    /// Create the dialect
    pub fn new() -> Self {
        Self
    }

    fn parse_json(&self, line: &str, root: &JsonObject) -> Vec<Response> {
        if let Some(sr) = root.get("sr").and_then(Value::as_object) {
            return status_responses(sr);
        }
        if let Some(er) = root.get("er").and_then(Value::as_object) {
            let message = er
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("exception report");
            return vec![Response::Warning(message.to_string())];
        }
        if let Some(r) = root.get("r").and_then(Value::as_object) {
            return self.parse_acknowledgement(line, root, r);
        }
        if ["qr", "rx", "ack"].iter().any(|key| root.contains_key(*key)) {
            return vec![Response::Feedback(line.to_string())];
        }
        vec![Response::Unknown(line.to_string())]
    }

    fn parse_acknowledgement(&self, line: &str, root: &JsonObject, r: &JsonObject) -> Vec<Response> {
        let msg = r.get("msg").and_then(Value::as_str);
        if msg == Some("SYSTEM READY") {
            let version = match r.get("fv").and_then(Value::as_f64) {
                Some(fv) => format!("TinyG {}", fv),
                None => "TinyG".to_string(),
            };
            return vec![Response::Welcome { version }];
        }
        if msg == Some("Loading configs from EEPROM") {
            return vec![Response::Feedback(line.to_string())];
        }

        let mut responses = match r.get("sr").and_then(Value::as_object) {
            Some(sr) => status_responses(sr),
            None => Vec::new(),
        };
        let status = root
            .get("f")
            .and_then(Value::as_array)
            .and_then(|f| f.get(1))
            .and_then(Value::as_u64);
        responses.push(match status {
            None | Some(0) => Response::Ok,
            Some(code) => Response::Error {
                code: u32::try_from(code).ok(),
                message: msg
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("TinyG status {}", code)),
            },
        });
        responses
    }
}

/// A status report, followed by the modal words it carries, if any
fn status_responses(sr: &JsonObject) -> Vec<Response> {
    let mut responses = vec![Response::Status(parse_status_report(sr))];
    let words = modal_words(sr);
    if !words.is_empty() {
        responses.push(Response::ParserState(words.join(" ")));
    }
    responses
}

fn number(sr: &JsonObject, key: &str) -> Option<f64> {
    sr.get(key).and_then(Value::as_f64)
}

fn integer(sr: &JsonObject, key: &str) -> Option<i64> {
    sr.get(key).and_then(Value::as_i64)
}

fn partial(sr: &JsonObject, keys: [&str; 3]) -> Option<PartialPosition> {
    let position = PartialPosition {
        x: number(sr, keys[0]),
        y: number(sr, keys[1]),
        z: number(sr, keys[2]),
        a: None,
    };
    (!position.is_empty()).then_some(position)
}

fn map_stat(stat: i64) -> ControllerState {
    match stat {
        1 | 3 | 4 => ControllerState::Idle,
        2 | 12 | 13 => ControllerState::Alarm,
        5 | 7 => ControllerState::Run,
        6 => ControllerState::Hold,
        9 => ControllerState::Home,
        10 => ControllerState::Jog,
        11 => ControllerState::Door,
        _ => ControllerState::Unknown,
    }
}

fn parse_status_report(sr: &JsonObject) -> StatusReport {
    let ratio = |key: &str| number(sr, key).map(|v| (v * 100.0).round() as u16);
    let (feed, rapid, spindle) = (ratio("mfo"), ratio("mto"), ratio("sso"));
    let overrides = (feed.is_some() || rapid.is_some() || spindle.is_some()).then(|| Overrides {
        feed: feed.unwrap_or(100),
        rapid: rapid.unwrap_or(100),
        spindle: spindle.unwrap_or(100),
    });
    let stat = integer(sr, "stat");

    StatusReport {
        state: stat.map(map_stat),
        raw_state: stat.map(|s| format!("stat:{}", s)).unwrap_or_default(),
        sub_state: None,
        machine_coord: partial(sr, ["mpox", "mpoy", "mpoz"]),
        work_coord: partial(sr, ["posx", "posy", "posz"]),
        work_coordinate_offset: None,
        feed_speed: number(sr, "vel"),
        spindle_speed: None,
        overrides,
        buffer: None,
        work_units: integer(sr, "unit").map(|u| if u == 0 { Units::INCH } else { Units::MM }),
    }
}

/// G-code words equivalent to the modal fields of a status report
fn modal_words(sr: &JsonObject) -> Vec<String> {
    let mut words = Vec::new();
    if let Some(coor) = integer(sr, "coor").filter(|c| (1..=6).contains(c)) {
        words.push(format!("G{}", 53 + coor));
    }
    match integer(sr, "unit") {
        Some(0) => words.push("G20".to_string()),
        Some(1) => words.push("G21".to_string()),
        _ => {}
    }
    match integer(sr, "plan") {
        Some(0) => words.push("G17".to_string()),
        Some(1) => words.push("G18".to_string()),
        Some(2) => words.push("G19".to_string()),
        _ => {}
    }
    match integer(sr, "dist") {
        Some(0) => words.push("G90".to_string()),
        Some(1) => words.push("G91".to_string()),
        _ => {}
    }
    match integer(sr, "frmo") {
        Some(0) => words.push("G94".to_string()),
        Some(1) => words.push("G93".to_string()),
        _ => {}
    }
    words
}

impl FirmwareDialect for TinyGDialect {
    fn controller_type(&self) -> ControllerType {
        ControllerType::TinyG
    }

    fn buffer_size(&self) -> usize {
        TINYG_RX_BUFFER_SIZE
    }

    fn parse_line(&self, line: &str) -> Vec<Response> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        if !line.starts_with('{') {
            // Text mode output before JSON mode is switched on
            if line.contains("SYSTEM READY") {
                return vec![Response::Welcome {
                    version: "TinyG".to_string(),
                }];
            }
            return vec![Response::Feedback(line.to_string())];
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(root)) => self.parse_json(line, &root),
            _ => vec![Response::Unknown(line.to_string())],
        }
    }

    fn handshake_commands(&self) -> Vec<GcodeCommand> {
        // JSON mode, report layout, footer verbosity, no queue reports,
        // filtered status reports, then one report now
        ["{ej:1}", STATUS_REPORT_CONFIG, "{jv:4}", "{qv:0}", "{sv:1}", "{sr:n}"]
            .into_iter()
            .map(|text| GcodeCommand::new(text).alarm_exempt())
            .collect()
    }

    /// Hold, then flush the planner queue
    fn cancel_strategy(&self, state: ControllerState) -> CancelStrategy {
        match state {
            ControllerState::Idle | ControllerState::Check | ControllerState::Alarm => {
                CancelStrategy::DrainOnly
            }
            _ => CancelStrategy::Realtime(vec![FEED_HOLD, QUEUE_FLUSH]),
        }
    }

    fn ready_on_status(&self) -> bool {
        false
    }

    fn homing_command(&self) -> GcodeCommand {
        GcodeCommand::new("G28.2 X0 Y0 Z0").alarm_exempt()
    }

    fn unlock_command(&self) -> GcodeCommand {
        GcodeCommand::new("{clear:n}").alarm_exempt()
    }

    fn jog_command(&self, axis: Axis, delta: f64, feed_rate: f64, units: Units) -> GcodeCommand {
        GcodeCommand::new(format!(
            "G91 {} G1 {} F{}",
            units.gcode().unwrap_or("G21"),
            axis_word(axis, delta),
            format_coordinate(feed_rate)
        ))
        .temporary_modal()
    }

    fn jog_needs_modal_restore(&self) -> bool {
        true
    }

    /// `G10 L2` takes the offset itself: machine position minus the wanted
    /// work position, in the active units
    fn set_work_position_command(
        &self,
        position: &PartialPosition,
        status: &ControllerStatus,
        modal: &GcodeState,
    ) -> GcodeCommand {
        let machine = status.machine_coord.convert_to(modal.units());
        let mut offsets = PartialPosition::new();
        for (axis, value) in position.axes() {
            offsets = offsets.with(axis, machine.get(axis).unwrap_or(0.0) - value);
        }
        GcodeCommand::new(format!(
            "G10 L2 P{} {}",
            modal.wcs_index(),
            offsets.to_gcode_words()
        ))
    }

    fn parser_state_command(&self) -> Option<GcodeCommand> {
        Some(GcodeCommand::new("{sr:n}").alarm_exempt())
    }
}
