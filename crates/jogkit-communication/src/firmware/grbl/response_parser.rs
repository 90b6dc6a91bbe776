//! GRBL Response Parser
//!
//! Classifies lines received from a GRBL controller: acknowledgments,
//! errors, alarms, status reports and informational text.

use jogkit_core::{MachineStatus, Position};
use serde::{Deserialize, Serialize};
use std::fmt;

/// GRBL response types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GrblResponse {
    /// OK acknowledgment
    Ok,
    /// Error response with error code
    Error(u8),
    /// Alarm with alarm code
    Alarm(u8),
    /// Status report
    Status(StatusReport),
    /// Setting response ($n=value)
    Setting { number: u16, value: String },
    /// Startup banner (`Grbl 1.1h ['$' for help]`)
    Version(String),
    /// Bracketed feedback (`[MSG:...]`, `[GC:...]`)
    Feedback(String),
    /// Anything else
    Message(String),
}

impl GrblResponse {
    /// Whether this line terminates a command exchange
    pub fn is_ack(&self) -> bool {
        matches!(self, GrblResponse::Ok | GrblResponse::Error(_))
    }
}

impl fmt::Display for GrblResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(code) => write!(f, "{}", super::error_decoder::format_error(*code)),
            Self::Alarm(code) => write!(f, "{}", super::error_decoder::format_alarm(*code)),
            Self::Status(report) => write!(f, "status:{}", report.state),
            Self::Setting { number, value } => write!(f, "setting:${}={}", number, value),
            Self::Version(version) => write!(f, "version:{}", version),
            Self::Feedback(text) => write!(f, "feedback:{}", text),
            Self::Message(msg) => write!(f, "message:{}", msg),
        }
    }
}

/// Planner and serial buffer availability (`Bf:15,128`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferState {
    /// Free planner blocks
    pub planner: u16,
    /// Free serial RX bytes
    pub rx: u16,
}

/// GRBL status report (`<Idle|MPos:1.000,2.000,0.000|FS:0,0|WCO:0,0,0>`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Raw state word, including any substate (`Hold:0`)
    pub state: String,
    /// Parsed state
    pub status: Option<MachineStatus>,
    /// Machine position, if reported
    pub machine_position: Option<Position>,
    /// Work position, if reported
    pub work_position: Option<Position>,
    /// Work coordinate offset, if reported
    pub work_offset: Option<Position>,
    /// Current feed rate
    pub feed_rate: Option<f64>,
    /// Current spindle speed
    pub spindle_speed: Option<f64>,
    /// Buffer state
    pub buffer: Option<BufferState>,
}

impl StatusReport {
    /// Machine position, derived from `WPos` and `WCO` when `MPos` is absent
    pub fn resolved_machine_position(&self) -> Option<Position> {
        self.machine_position.or_else(|| {
            self.work_position
                .zip(self.work_offset)
                .map(|(work, offset)| work.add(&offset))
        })
    }
}

/// Parse a GRBL response line
///
/// Returns `None` for blank lines.
pub fn parse_response(line: &str) -> Option<GrblResponse> {
    let line = line.trim();

    if line.is_empty() {
        return None;
    }

    if line == "ok" {
        return Some(GrblResponse::Ok);
    }

    if let Some(code) = strip_prefix_ci(line, "error:").and_then(|c| c.trim().parse().ok()) {
        return Some(GrblResponse::Error(code));
    }

    if let Some(code) = strip_prefix_ci(line, "alarm:").and_then(|c| c.trim().parse().ok()) {
        return Some(GrblResponse::Alarm(code));
    }

    if let Some(body) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
        return parse_status_report(body).map(GrblResponse::Status);
    }

    if let Some((number, value)) = line
        .strip_prefix('$')
        .and_then(|rest| rest.split_once('='))
    {
        if let Ok(number) = number.trim().parse::<u16>() {
            return Some(GrblResponse::Setting {
                number,
                value: value.trim().to_string(),
            });
        }
    }

    if line.starts_with("Grbl ") {
        return Some(GrblResponse::Version(line.to_string()));
    }

    if line.starts_with('[') && line.ends_with(']') {
        return Some(GrblResponse::Feedback(line[1..line.len() - 1].to_string()));
    }

    Some(GrblResponse::Message(line.to_string()))
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

/// Parse the body of a status report (without the angle brackets)
pub fn parse_status_report(body: &str) -> Option<StatusReport> {
    let mut parts = body.split('|');

    let state = parts.next()?.trim().to_string();
    if state.is_empty() {
        return None;
    }

    let mut report = StatusReport {
        status: MachineStatus::from_report(&state),
        state,
        machine_position: None,
        work_position: None,
        work_offset: None,
        feed_rate: None,
        spindle_speed: None,
        buffer: None,
    };

    for part in parts {
        let part = part.trim();
        let Some((key, value)) = part.split_once(':') else {
            continue;
        };
        match key {
            "MPos" => report.machine_position = parse_position(value),
            "WPos" => report.work_position = parse_position(value),
            "WCO" => report.work_offset = parse_position(value),
            "F" => report.feed_rate = value.trim().parse().ok(),
            "FS" => {
                let mut fs = value.split(',').map(|v| v.trim().parse::<f64>().ok());
                report.feed_rate = fs.next().flatten();
                report.spindle_speed = fs.next().flatten();
            }
            "Bf" => {
                let mut bf = value.split(',').map(|v| v.trim().parse::<u16>().ok());
                if let (Some(Some(planner)), Some(Some(rx))) = (bf.next(), bf.next()) {
                    report.buffer = Some(BufferState { planner, rx });
                }
            }
            _ => {}
        }
    }

    Some(report)
}

/// Parse `x,y,z[,a,...]`; extra axes are ignored
fn parse_position(value: &str) -> Option<Position> {
    let coords: Vec<f64> = value
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;

    match coords.as_slice() {
        [x, y, z, ..] => Some(Position::new(*x, *y, *z)),
        _ => None,
    }
}

/// Render a status report the way GRBL prints it
pub fn format_status_report(status: MachineStatus, machine: &Position, offset: &Position) -> String {
    format!(
        "<{}|MPos:{:.3},{:.3},{:.3}|FS:0,0|WCO:{:.3},{:.3},{:.3}>",
        status, machine.x, machine.y, machine.z, offset.x, offset.y, offset.z
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_acks() {
        assert_eq!(parse_response("ok"), Some(GrblResponse::Ok));
        assert_eq!(parse_response("error:22"), Some(GrblResponse::Error(22)));
        assert_eq!(parse_response("ALARM:9"), Some(GrblResponse::Alarm(9)));
        assert_eq!(parse_response("alarm:1"), Some(GrblResponse::Alarm(1)));
        assert_eq!(parse_response("  "), None);
        assert!(parse_response("error:5").unwrap().is_ack());
        assert!(!parse_response("ALARM:5").unwrap().is_ack());
    }

    #[test]
    fn test_parse_status_report() {
        let response =
            parse_response("<Hold:0|MPos:10.000,-2.500,3.000|FS:500,12000|WCO:1.000,1.000,0.000>")
                .unwrap();
        let GrblResponse::Status(report) = response else {
            panic!("expected status report");
        };
        assert_eq!(report.state, "Hold:0");
        assert_eq!(report.status, Some(MachineStatus::Hold));
        assert_eq!(report.machine_position, Some(Position::new(10.0, -2.5, 3.0)));
        assert_eq!(report.work_offset, Some(Position::new(1.0, 1.0, 0.0)));
        assert_eq!(report.feed_rate, Some(500.0));
        assert_eq!(report.spindle_speed, Some(12000.0));
    }

    #[test]
    fn test_machine_position_from_work_position() {
        let report = parse_status_report("Idle|WPos:1,2,3|WCO:10,10,10").unwrap();
        assert_eq!(
            report.resolved_machine_position(),
            Some(Position::new(11.0, 12.0, 13.0))
        );
    }

    #[test]
    fn test_parse_other_lines() {
        assert_eq!(
            parse_response("$110=1000.000"),
            Some(GrblResponse::Setting {
                number: 110,
                value: "1000.000".to_string()
            })
        );
        assert!(matches!(
            parse_response("Grbl 1.1h ['$' for help]"),
            Some(GrblResponse::Version(_))
        ));
        assert_eq!(
            parse_response("[MSG:Reset to continue]"),
            Some(GrblResponse::Feedback("MSG:Reset to continue".to_string()))
        );
    }

    #[test]
    fn test_format_status_round_trip() {
        let line = format_status_report(
            MachineStatus::Idle,
            &Position::new(1.0, 2.0, 3.0),
            &Position::ORIGIN,
        );
        let GrblResponse::Status(report) = parse_response(&line).unwrap() else {
            panic!("expected status report");
        };
        assert_eq!(report.machine_position, Some(Position::new(1.0, 2.0, 3.0)));
    }
}
