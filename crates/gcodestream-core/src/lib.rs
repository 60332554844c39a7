//! # GCodeStream Core
//!
//! Core types, traits, and utilities for GCodeStream.
//! Provides the command value object, the controller contract, events,
//! the status snapshot and the error taxonomy.

pub mod command;
pub mod core;
pub mod data;
pub mod error;
pub mod stream;

pub use command::{CommandFailure, CommandId, CommandNumberGenerator, CommandState, GcodeCommand};

pub use core::{
    event::{ConsoleMessage, ControllerEvent, EventDispatcher, MessageType},
    listener::{dispatch_event, spawn_listener_bridge},
    ControllerListener, ControllerListenerHandle, ControllerTrait,
};

pub use data::{
    format_coordinate, Axis, BufferState, CommunicatorState, ControllerState, ControllerStatus,
    OverrideCommand, Overrides, PartialPosition, Position, Units,
};

pub use error::{
    ConnectionError, ControllerError, Error, ErrorKind, FirmwareError, GcodeError, Result,
};

pub use stream::{GcodeStreamReader, StreamProgress};
