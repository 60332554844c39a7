//! # GCodeStream
//!
//! Flow-controlled G-code streaming for GRBL, FluidNC, Smoothieware and
//! TinyG controllers over serial, TCP and WebSocket links.
//!
//! ## Architecture
//!
//! GCodeStream is organized as a workspace with multiple crates:
//!
//! 1. **gcodestream-core** - Commands, status snapshots, events, errors
//! 2. **gcodestream-gcode** - Modal state tracking and program readers
//! 3. **gcodestream-communication** - Transports, flow control, firmware dialects
//! 4. **gcodestream-settings** - Configuration files
//! 5. **gcodestream** - Command line streamer that ties the crates together

pub use gcodestream_core::{
    Axis, CommandFailure, CommandState, ConnectionError, ControllerError, ControllerEvent,
    ControllerListener, ControllerListenerHandle, ControllerState, ControllerStatus,
    ControllerTrait, Error, ErrorKind, EventDispatcher, FirmwareError, GcodeCommand, GcodeError,
    GcodeStreamReader, OverrideCommand, Overrides, PartialPosition, Position, Result,
    StreamProgress, Units,
};

pub use gcodestream_gcode::{FileStreamReader, GcodeParser, GcodeState, StringStreamReader};

pub use gcodestream_communication::{
    list_ports, open_transport, ConnectionDriver, ConnectionParams, ControllerConfig,
    ControllerType, ErrorPolicy, FirmwareController, HostMessage, SerialPortInfo,
    VirtualFirmware, VirtualPort,
};

pub use gcodestream_settings::{
    Config, ConnectionSettings, MachineSettings, SettingsError, StreamingSettings,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// Logs go to stderr so program output stays clean. `RUST_LOG` overrides
/// the default `info` level. With `json` set every event is one JSON object
/// per line.
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}
