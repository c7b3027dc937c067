use std::io;
use thiserror::Error;

/// Errors returned to callers of the link, the registry and the bridge.
///
/// Wire-level anomalies (bad checksums, short payloads, retry exhaustion) are not errors: they
/// are reported as events so a misbehaving controller never unwinds into the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// A request field is missing or cannot be encoded.
    #[error("invalid field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// The outbound command name is not in the command table.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Another transaction is still in flight.
    #[error("busy: command in progress (comm {seq}: {description})")]
    Busy { seq: u8, description: String },

    /// Sequence byte plus payload would not fit the one-byte length field.
    #[error("payload of {len} bytes does not fit in a frame")]
    PayloadTooLarge { len: usize },

    /// Poll and ack ids are owned by the link itself.
    #[error("command id {0:#04X} is reserved for link control")]
    ReservedCommand(u8),

    /// The inbound request could not be interpreted at all.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An I/O error occurred while talking to the device stream.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The serial device could not be opened or configured.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl Error {
    pub(crate) fn validation(field: &str, reason: impl Into<String>) -> Error {
        Error::Validation {
            field: field.to_owned(),
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for VMC link operations.
pub type Result<T> = std::result::Result<T, Error>;
