use jogkit_communication::firmware::grbl::error_decoder::{
    alarm_severity, decode_alarm, decode_error, format_error,
};
use jogkit_communication::firmware::grbl::response_parser::*;
use jogkit_core::{AlarmSeverity, MachineStatus, Position};

#[test]
fn test_parse_ok_and_error() {
    assert_eq!(parse_response("ok"), Some(GrblResponse::Ok));
    assert_eq!(parse_response("error:1"), Some(GrblResponse::Error(1)));
    assert_eq!(parse_response("ERROR:23"), Some(GrblResponse::Error(23)));
}

#[test]
fn test_parse_status_with_buffer() {
    let response = parse_response("<Jog|MPos:5.000,0.000,-1.000|Bf:15,128|FS:1000,0>");
    let Some(GrblResponse::Status(report)) = response else {
        panic!("expected status report");
    };
    assert_eq!(report.status, Some(MachineStatus::Jog));
    assert_eq!(report.machine_position, Some(Position::new(5.0, 0.0, -1.0)));
    assert_eq!(report.buffer, Some(BufferState { planner: 15, rx: 128 }));
    assert_eq!(report.feed_rate, Some(1000.0));
}

#[test]
fn test_unknown_state_word() {
    let report = parse_status_report("Tool|MPos:0,0,0").unwrap();
    assert_eq!(report.state, "Tool");
    assert_eq!(report.status, None);
}

#[test]
fn test_malformed_status_fields_are_skipped() {
    let report = parse_status_report("Idle|MPos:1,2|FS:x,y").unwrap();
    assert_eq!(report.machine_position, None);
    assert_eq!(report.feed_rate, None);
}

#[test]
fn test_decoded_messages() {
    assert!(decode_error(9).contains("locked"));
    assert!(format_error(20).starts_with("error:20"));
    assert!(decode_alarm(9).to_lowercase().contains("homing"));
    assert_eq!(alarm_severity(12), AlarmSeverity::Critical);
    assert_eq!(alarm_severity(2), AlarmSeverity::Warning);
    assert_eq!(alarm_severity(9), AlarmSeverity::Error);
}
