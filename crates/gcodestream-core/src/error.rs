//! Error handling for GCodeStream
//!
//! Provides error types for every layer of the streaming engine:
//! - Controller errors (session state, preconditions, flow control)
//! - G-Code errors (stream reading, modal tracking)
//! - Connection errors (transport faults)
//! - Firmware errors (protocol errors and response grammar)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Controller error type
///
/// Represents errors raised by the controller session: operations attempted
/// in the wrong state, command budget violations and drain timeouts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// Controller is not connected
    #[error("Controller not connected")]
    NotConnected,

    /// Controller is already connected
    #[error("Controller already connected")]
    AlreadyConnected,

    /// Firmware has not finished its boot handshake yet
    #[error("Controller not ready: {reason}")]
    NotReady {
        /// Why the controller cannot accept commands yet.
        reason: String,
    },

    /// A stream is already being sent
    #[error("Controller is busy streaming")]
    Busy,

    /// Operation requires a different controller state
    #[error("Cannot {operation} while controller is in state {state}")]
    InvalidState {
        /// The rejected operation.
        operation: String,
        /// The state the controller was in.
        state: String,
    },

    /// Controller operation timed out
    #[error("Controller operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// A single command is larger than the firmware receive buffer
    #[error("Command of {length} bytes exceeds the {capacity} byte receive buffer")]
    CommandOverflow {
        /// Byte cost of the command including its line terminator.
        length: usize,
        /// The firmware receive buffer capacity.
        capacity: usize,
    },

    /// Alarm condition detected
    #[error("Alarm: {code} - {message}")]
    Alarm {
        /// The alarm code.
        code: u32,
        /// The alarm message.
        message: String,
    },

    /// A response arrived while no command was awaiting completion
    #[error("Unexpected acknowledgement '{response}' with no active command")]
    UnexpectedCommand {
        /// The orphaned response line.
        response: String,
    },

    /// Generic controller error
    #[error("Controller error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// G-Code error type
///
/// Represents errors related to reading programs and tracking modal state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GcodeError {
    /// File parsing error
    #[error("File error: {reason}")]
    FileError {
        /// The reason for the file error.
        reason: String,
    },

    /// Requested start row is outside the program
    #[error("Row {row} is out of range (program has {total} rows)")]
    RowOutOfRange {
        /// The requested 1-based row.
        row: usize,
        /// Total rows in the program.
        total: usize,
    },

    /// The reader has already handed out commands
    #[error("Stream already started at row {row}")]
    StreamAlreadyStarted {
        /// The row the reader had reached.
        row: usize,
    },

    /// Invalid modal state
    #[error("Invalid modal state: {reason}")]
    InvalidModalState {
        /// The reason for the invalid modal state.
        reason: String,
    },

    /// Generic G-Code error
    #[error("G-Code error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Connection error type
///
/// Represents transport faults on serial, TCP and WebSocket links.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// WebSocket error
    #[error("WebSocket error: {reason}")]
    WebSocketError {
        /// The reason for the WebSocket error.
        reason: String,
    },

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::IoError {
            reason: err.to_string(),
        }
    }
}

/// Firmware error type
///
/// Represents errors reported by, or about, the firmware protocol.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FirmwareError {
    /// Unknown firmware type
    #[error("Unknown firmware type: {firmware_type}")]
    UnknownFirmware {
        /// The unknown firmware type identifier.
        firmware_type: String,
    },

    /// Firmware rejected a command with an error code
    #[error("Protocol error {code}: {message}")]
    ProtocolError {
        /// The firmware error code.
        code: u32,
        /// Decoded description of the code.
        message: String,
    },

    /// Unsupported feature
    #[error("Feature not supported by {firmware}: {feature}")]
    UnsupportedFeature {
        /// The firmware that does not support the feature.
        firmware: String,
        /// The unsupported feature name.
        feature: String,
    },

    /// Response parsing error
    #[error("Failed to parse firmware response: {reason}")]
    ResponseParseError {
        /// The reason the response parsing failed.
        reason: String,
    },
}

/// Coarse classification of an [`Error`]
///
/// Mirrors the way the streaming engine reacts to a failure: transport faults
/// end the session, protocol errors and alarms are surfaced and survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection dropped or unreachable
    Transport,
    /// Firmware rejected a single command
    Protocol,
    /// Firmware entered ALARM
    Alarm,
    /// Unrecognised or malformed response line
    MalformedResponse,
    /// A command too large for the receive buffer
    CommandOverflow,
    /// Gave up waiting for completion
    Timeout,
    /// Operation attempted in the wrong state
    Precondition,
    /// Anything else
    Other,
}

/// Main error type for GCodeStream
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// G-Code error
    #[error(transparent)]
    Gcode(#[from] GcodeError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Firmware error
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Controller(ControllerError::Timeout { .. })
                | Error::Connection(ConnectionError::ConnectionTimeout { .. })
        )
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a G-Code error
    pub fn is_gcode_error(&self) -> bool {
        matches!(self, Error::Gcode(_))
    }

    /// Check if this is a controller error
    pub fn is_controller_error(&self) -> bool {
        matches!(self, Error::Controller(_))
    }

    /// Check if this is a firmware error
    pub fn is_firmware_error(&self) -> bool {
        matches!(self, Error::Firmware(_))
    }

    /// Classify this error the way the streaming engine reacts to it
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(ConnectionError::ConnectionTimeout { .. }) => ErrorKind::Timeout,
            Error::Connection(_) | Error::Io(_) => ErrorKind::Transport,
            Error::Firmware(FirmwareError::ProtocolError { .. }) => ErrorKind::Protocol,
            Error::Firmware(FirmwareError::ResponseParseError { .. }) => {
                ErrorKind::MalformedResponse
            }
            Error::Controller(ControllerError::Alarm { .. }) => ErrorKind::Alarm,
            Error::Controller(ControllerError::CommandOverflow { .. }) => {
                ErrorKind::CommandOverflow
            }
            Error::Controller(ControllerError::Timeout { .. }) => ErrorKind::Timeout,
            Error::Controller(
                ControllerError::NotConnected
                | ControllerError::AlreadyConnected
                | ControllerError::NotReady { .. }
                | ControllerError::Busy
                | ControllerError::InvalidState { .. },
            ) => ErrorKind::Precondition,
            Error::Gcode(GcodeError::StreamAlreadyStarted { .. })
            | Error::Gcode(GcodeError::RowOutOfRange { .. }) => ErrorKind::Precondition,
            _ => ErrorKind::Other,
        }
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
