//! OBD-II Protocol Implementation
//!
//! This crate talks to ELM327-compatible OBD-II adapters over a pre-bound
//! serial device. It provides the PID decoder table, the response parser,
//! frame delimiting, and a reconnecting link adapter.

mod command;
mod elm;
mod error;
mod frame;
mod link;
mod parser;
mod pid;
mod transport;

pub use command::Command;
pub use elm::{classify, is_init_ack, strip_searching, ElmStatus};
pub use error::{DecodeError, FrameCodecError, LinkError, ParseError};
pub use frame::{decode_frame, encode_frame, FrameAssembler, RawFrame, FRAME_TERMINATOR, MAX_FRAME_LEN};
pub use link::{LinkAdapter, LinkConfig, LinkState, LinkStats, DEFAULT_DEVICE_PATH};
pub use parser::{parse_response, parse_response_at, TelemetryRecord};
pub use pid::{decode, metric_name, metric_unit, Pid};
pub use transport::{Connector, DeviceStream, SerialConnector};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
}
