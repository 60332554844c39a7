//! # GCodeStream Communication
//!
//! Transports, flow control and firmware dialects for GCodeStream.
//! Supports Serial/USB, TCP/IP, and WebSocket connections plus an in-memory
//! virtual port. [`FirmwareController`] streams G-code to GRBL, FluidNC,
//! Smoothieware and TinyG controllers.

pub mod communication;
pub mod controller;
pub mod firmware;

pub use communication::{
    buffered::{
        BufferedCommunicator, BufferedCommunicatorConfig, ErrorPolicy, FlowEvent, StreamOutcome,
    },
    open_transport,
    serial::{list_ports, SerialPortInfo},
    virtual_port::{HostMessage, VirtualFirmware, VirtualPort},
    Communicator, CommunicatorEvent, ConnectionDriver, ConnectionParams, LineFramer,
    SerialParity, TransportHalves,
};

pub use controller::{ControllerConfig, FirmwareController, StatusPollTimer, StatusRequester};

pub use firmware::{
    CancelStrategy, ControllerType, FirmwareDialect, FluidNcDialect, GrblDialect, Response,
    SmoothiewareDialect, StatusReport, TinyGDialect,
};
