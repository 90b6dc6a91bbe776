//! GRBL error and alarm code decoding

use jogkit_core::AlarmSeverity;

/// Text for an `error:n` code
pub fn decode_error(code: u8) -> String {
    let text = match code {
        1 => "Expected command letter",
        2 => "Bad number format",
        3 => "Invalid '$' statement",
        4 => "Negative value",
        5 => "Homing disabled",
        6 => "Step pulse too short",
        7 => "EEPROM read failed, defaults restored",
        8 => "'$' command requires Idle",
        9 => "G-code locked out during alarm or jog",
        10 => "Soft limits require homing",
        11 => "Line too long",
        12 => "Step rate exceeded",
        13 => "Safety door open",
        14 => "Startup line too long",
        15 => "Jog target exceeds machine travel",
        16 => "Invalid jog command",
        17 => "Laser mode requires PWM output",
        20 => "Unsupported G-code command",
        21 => "Modal group violation",
        22 => "Undefined feed rate",
        23 => "Command requires integer value",
        24 => "Axis words used by two commands",
        25 => "Repeated G-code word",
        26 => "Missing axis words",
        27 => "Line number out of range",
        28 => "Missing P or L value",
        29 => "Unsupported work coordinate system",
        30 => "G53 requires G0 or G1",
        31 => "Unused axis words",
        32 => "Arc has no axis words in plane",
        33 => "Invalid motion target",
        34 => "Arc radius error",
        35 => "Arc missing offset word",
        36 => "Unused G-code words",
        37 => "Tool length offset axis mismatch",
        38 => "Tool number out of range",
        _ => return format!("Unknown error code: {}", code),
    };
    text.to_string()
}

/// Text for an `ALARM:n` code
pub fn decode_alarm(code: u8) -> String {
    let text = match code {
        1 => "Hard limit triggered, position lost",
        2 => "Soft limit: motion target exceeds machine travel",
        3 => "Reset while in motion, position lost",
        4 => "Probe fail: probe not in expected initial state",
        5 => "Probe fail: no contact within travel",
        6 => "Homing fail: reset during homing",
        7 => "Homing fail: safety door opened",
        8 => "Homing fail: could not clear limit switch",
        9 => "Homing fail: limit switch not found",
        10 => "Homing fail: limit switch already engaged",
        11 => "Homing required",
        12 => "Emergency stop",
        _ => return format!("Unknown alarm code: {}", code),
    };
    text.to_string()
}

/// Severity of an alarm code
pub fn alarm_severity(code: u8) -> AlarmSeverity {
    match code {
        1 | 3 | 12 => AlarmSeverity::Critical,
        2 | 11 => AlarmSeverity::Warning,
        _ => AlarmSeverity::Error,
    }
}

/// Format error message with code and description
pub fn format_error(code: u8) -> String {
    format!("error:{} - {}", code, decode_error(code))
}

/// Format alarm message with code and description
pub fn format_alarm(code: u8) -> String {
    format!("ALARM:{} - {}", code, decode_alarm(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error() {
        assert_eq!(decode_error(9), "G-code locked out during alarm or jog");
        assert_eq!(decode_error(15), "Jog target exceeds machine travel");
        assert!(decode_error(255).contains("Unknown error code"));
    }

    #[test]
    fn test_decode_alarm() {
        assert!(decode_alarm(1).contains("Hard limit"));
        assert!(decode_alarm(9).starts_with("Homing fail"));
        assert!(decode_alarm(200).contains("Unknown alarm code"));
        assert_eq!(alarm_severity(12), AlarmSeverity::Critical);
        assert_eq!(alarm_severity(9), AlarmSeverity::Error);
    }

    #[test]
    fn test_format() {
        assert!(format_error(22).starts_with("error:22 - "));
        assert!(format_alarm(1).starts_with("ALARM:1 - "));
    }
}
