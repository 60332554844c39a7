//! GRBL error and alarm code decoder
//!
//! Turns the numeric codes of `error:N` and `ALARM:N` into text for console
//! messages and command failures. Smoothieware and FluidNC reuse the GRBL
//! numbering.

const ERRORS: &[(u32, &str)] = &[
    (1, "Expected command letter"),
    (2, "Bad number format"),
    (3, "'$' system command not recognized"),
    (4, "Negative value for an expected positive value"),
    (5, "Homing cycle not enabled in settings"),
    (6, "Step pulse must be at least 3 microseconds"),
    (7, "EEPROM read failed, settings restored to defaults"),
    (8, "'$' command only valid when idle"),
    (9, "G-code locked out during alarm or jog"),
    (10, "Soft limits require homing to be enabled"),
    (11, "Line exceeds the maximum length and was not executed"),
    (12, "Setting exceeds the maximum step rate"),
    (13, "Safety door opened"),
    (14, "Build info or startup line too long for EEPROM"),
    (15, "Jog target exceeds machine travel"),
    (16, "Invalid jog command"),
    (17, "Laser mode requires PWM output"),
    (20, "Unsupported or invalid G-code command"),
    (21, "More than one command from the same modal group"),
    (22, "Feed rate not set"),
    (23, "Command requires an integer value"),
    (24, "Two commands in the block need the axis words"),
    (25, "Repeated word in block"),
    (26, "Command needs axis words but none were given"),
    (27, "Line number out of range"),
    (28, "Missing P or L value"),
    (29, "Unsupported work coordinate system"),
    (30, "G53 needs G0 or G1 motion mode"),
    (31, "Unused axis words while G80 is active"),
    (32, "Arc has no axis words in the selected plane"),
    (33, "Invalid motion target"),
    (34, "Arc radius definition error"),
    (35, "Arc offset definition is missing IJK words"),
    (36, "Unused words left in block"),
    (37, "Tool length offset on an axis other than the configured one"),
    (38, "Tool number out of range"),
];

const ALARMS: &[(u32, &str)] = &[
    (1, "Hard limit triggered, position likely lost"),
    (2, "Soft limit: target exceeds machine travel"),
    (3, "Reset while in motion, position likely lost"),
    (4, "Probe not in the expected initial state"),
    (5, "Probe did not make contact"),
    (6, "Homing failed: reset during cycle"),
    (7, "Homing failed: safety door opened during cycle"),
    (8, "Homing failed: could not clear limit switch on pull-off"),
    (9, "Homing failed: limit switch not found"),
    (10, "Homing failed: second limit switch not found"),
];

/// Description of a GRBL error code
pub fn decode_error(code: u32) -> String {
    ERRORS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, text)| text.to_string())
        .unwrap_or_else(|| format!("Unknown error code {}", code))
}

/// Description of a GRBL alarm code
pub fn decode_alarm(code: u32) -> String {
    ALARMS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, text)| text.to_string())
        .unwrap_or_else(|| format!("Unknown alarm code {}", code))
}

/// `error:N (description)`
pub fn format_error(code: u32) -> String {
    format!("error:{} ({})", code, decode_error(code))
}

/// `ALARM:N (description)`
pub fn format_alarm(code: u32) -> String {
    format!("ALARM:{} ({})", code, decode_alarm(code))
}
