//! GRBL protocol support: response parsing, code decoding and command
//! construction.

pub mod commands;
pub mod error_decoder;
pub mod response_parser;

pub use error_decoder::{alarm_severity, decode_alarm, decode_error};
pub use response_parser::{parse_response, BufferState, GrblResponse, StatusReport};
