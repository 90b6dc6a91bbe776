//! # JogKit Communication
//!
//! Everything that touches the controller: transports (serial and a
//! simulated GRBL device), the GRBL line codec, the priority command
//! dispatcher and the connection lifecycle manager.

pub mod communication;
pub mod connection;
pub mod dispatcher;
pub mod firmware;

pub use communication::{
    list_ports, MockDevice, MockTransport, MockTransportFactory, SentFrame, SerialPortInfo,
    SerialTransport, SerialTransportFactory, Transport, TransportFactory,
};
pub use connection::{ConnectionManager, STATUS_POLL_TAG};
pub use dispatcher::{
    Command, CommandCallback, CommandDispatcher, CommandId, CommandPayload, CommandQueue,
    CommandResponse, Completion, DeviceListener, FailureHandler,
};
pub use firmware::grbl::{GrblResponse, StatusReport};
