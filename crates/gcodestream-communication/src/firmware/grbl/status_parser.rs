//! GRBL status report parsing
//!
//! Handles the GRBL 1.1 pipe-delimited format
//! (`<Run|MPos:1.000,2.000,0.000|FS:500,0|WCO:0.000,0.000,0.000>`) and the
//! comma-delimited format of GRBL 0.9 (`<Idle,MPos:0.000,0.000,0.000,WPos:...>`).
//! Smoothieware and FluidNC send the same shapes.

use crate::firmware::{map_state_token, parse_position, StatusReport};
use gcodestream_core::{BufferState, Overrides, PartialPosition, Position};
use regex::Regex;
use std::sync::OnceLock;

/// Status report parser for the GRBL family
pub struct StatusParser;

impl StatusParser {
    /// Parse a complete `<...>` line; `None` when it is not a status report
    pub fn parse(line: &str) -> Option<StatusReport> {
        let body = line.trim().strip_prefix('<')?.strip_suffix('>')?;
        if body.is_empty() {
            return None;
        }
        if body.contains('|') || !body.contains(',') {
            Self::parse_pipe_format(body)
        } else {
            Self::parse_legacy_format(body)
        }
    }

    fn parse_pipe_format(body: &str) -> Option<StatusReport> {
        let mut fields = body.split('|');
        let mut report = Self::with_state(fields.next()?.trim())?;

        for field in fields {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            match key {
                "MPos" => report.machine_coord = parse_position(value).map(PartialPosition::from),
                "WPos" => report.work_coord = parse_position(value).map(PartialPosition::from),
                "WCO" => report.work_coordinate_offset = parse_position(value),
                "Bf" => report.buffer = Self::parse_buffer(value),
                "Ov" => report.overrides = Self::parse_overrides(value),
                // Smoothieware appends the override: `F:4000.0,100.0`
                "F" => report.feed_speed = first_number(value),
                "S" => report.spindle_speed = first_number(value),
                "FS" => {
                    let mut parts = value.split(',');
                    report.feed_speed = parts.next().and_then(|f| f.trim().parse().ok());
                    report.spindle_speed = parts.next().and_then(|s| s.trim().parse().ok());
                }
                _ => {}
            }
        }
        Some(report)
    }

    fn parse_legacy_format(body: &str) -> Option<StatusReport> {
        let (state, _) = body.split_once(',')?;
        let mut report = Self::with_state(state.trim())?;
        report.machine_coord = Self::legacy_position(body, "MPos").map(PartialPosition::from);
        report.work_coord = Self::legacy_position(body, "WPos").map(PartialPosition::from);
        report.work_coordinate_offset = Self::legacy_position(body, "WCO");
        report.feed_speed = legacy_feed_regex()
            .captures(body)
            .and_then(|c| c[1].parse().ok());
        Some(report)
    }

    fn with_state(token: &str) -> Option<StatusReport> {
        if token.is_empty() {
            return None;
        }
        let (name, sub_state) = match token.split_once(':') {
            Some((name, _)) => (name, Some(token.to_string())),
            None => (token, None),
        };
        Some(StatusReport {
            state: Some(map_state_token(name)),
            raw_state: token.to_string(),
            sub_state,
            ..Default::default()
        })
    }

    fn legacy_position(body: &str, key: &str) -> Option<Position> {
        let start = body.find(&format!("{}:", key))? + key.len() + 1;
        let values: Vec<&str> = body[start..].split(',').take(3).collect();
        parse_position(&values.join(","))
    }

    fn parse_buffer(value: &str) -> Option<BufferState> {
        let (planner, rx) = value.split_once(',')?;
        Some(BufferState {
            planner_blocks_available: planner.trim().parse().ok()?,
            rx_bytes_available: rx.trim().parse().ok()?,
        })
    }

    fn parse_overrides(value: &str) -> Option<Overrides> {
        let parts: Vec<u16> = value
            .split(',')
            .map(|p| p.trim().parse::<u16>())
            .collect::<Result<_, _>>()
            .ok()?;
        if parts.len() < 3 {
            return None;
        }
        Some(Overrides {
            feed: parts[0],
            rapid: parts[1],
            spindle: parts[2],
        })
    }
}

fn first_number(value: &str) -> Option<f64> {
    value.split(',').next().and_then(|v| v.trim().parse().ok())
}

fn legacy_feed_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|,)F:(-?[\d.]+)").expect("invalid regex pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcodestream_core::ControllerState;

    #[test]
    fn test_idle_report_with_both_positions() {
        let report =
            StatusParser::parse("<Idle|MPos:0.000,0.000,0.000|WPos:0.000,0.000,0.000>").unwrap();
        assert_eq!(report.state, Some(ControllerState::Idle));
        assert_eq!(report.machine_coord, Some(PartialPosition::xyz(0.0, 0.0, 0.0)));
        assert_eq!(report.work_coord, Some(PartialPosition::xyz(0.0, 0.0, 0.0)));
        assert_eq!(report.sub_state, None);
    }

    #[test]
    fn test_run_report_fields() {
        let report = StatusParser::parse(
            "<Run|MPos:10.000,5.500,-1.000|Bf:15,128|FS:500,12000|Ov:120,100,90|WCO:1.000,1.000,0.000>",
        )
        .unwrap();
        assert_eq!(report.state, Some(ControllerState::Run));
        assert_eq!(report.feed_speed, Some(500.0));
        assert_eq!(report.spindle_speed, Some(12000.0));
        assert_eq!(
            report.buffer,
            Some(BufferState {
                planner_blocks_available: 15,
                rx_bytes_available: 128
            })
        );
        assert_eq!(report.overrides.map(|o| o.feed), Some(120));
        assert_eq!(
            report.work_coordinate_offset,
            Some(Position::new(1.0, 1.0, 0.0))
        );
        assert!(report.work_coord.is_none());
    }

    #[test]
    fn test_sub_state_is_kept() {
        let report = StatusParser::parse("<Hold:0|MPos:0.000,0.000,0.000|FS:0,0>").unwrap();
        assert_eq!(report.state, Some(ControllerState::Hold));
        assert_eq!(report.sub_state.as_deref(), Some("Hold:0"));
        assert_eq!(report.raw_state, "Hold:0");
    }

    #[test]
    fn test_legacy_format() {
        let report = StatusParser::parse(
            "<Idle,MPos:5.529,0.560,7.000,WPos:1.529,-5.440,-0.000,Buf:0,RX:0>",
        )
        .unwrap();
        assert_eq!(report.state, Some(ControllerState::Idle));
        assert_eq!(
            report.machine_coord,
            Some(PartialPosition::xyz(5.529, 0.56, 7.0))
        );
        assert_eq!(report.work_coord.and_then(|p| p.y), Some(-5.44));
    }

    #[test]
    fn test_separate_feed_and_spindle_fields() {
        let report =
            StatusParser::parse("<Run|MPos:0.0000,0.0000,0.0000|F:4000.0,100.0|S:8000.0>").unwrap();
        assert_eq!(report.feed_speed, Some(4000.0));
        assert_eq!(report.spindle_speed, Some(8000.0));
    }

    #[test]
    fn test_unknown_state_token() {
        let report = StatusParser::parse("<Tool|MPos:0,0,0>").unwrap();
        assert_eq!(report.state, Some(ControllerState::Unknown));
    }

    #[test]
    fn test_not_a_status_report() {
        assert!(StatusParser::parse("ok").is_none());
        assert!(StatusParser::parse("<>").is_none());
        assert!(StatusParser::parse("<Idle|MPos:0,0,0").is_none());
    }

    #[test]
    fn test_malformed_position_is_dropped() {
        let report = StatusParser::parse("<Idle|MPos:1,x,3|FS:0,0>").unwrap();
        assert!(report.machine_coord.is_none());
        assert_eq!(report.feed_speed, Some(0.0));
    }
}
