use std::{error, io};

use crate::model::{Address, DeviceId};
use strum::Display;
use thiserror::Error;

/// Failure of a single register or bit-field access
#[derive(Error, Debug)]
pub enum Error {
    #[error("'{0}' is neither a bit-field nor a register in the register map")]
    NameResolution(String),
    #[error("range check failed")]
    Range(#[from] RangeError),
    #[error("transport failure")]
    Transport(#[from] TransportError),
}

impl Error {
    /// Whether this error was raised by validation, before any bus traffic took place
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::NameResolution(_) | Self::Range(_))
    }
}

/// A value or byte run does not fit the capacity declared by the register map
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("value {value:#x} exceeds the maximum {max:#x} of bit-field '{name}'")]
    Value { name: String, value: u64, max: u64 },
    #[error("cannot write {len} bytes into '{name}' which holds {capacity} byte(s)")]
    ByteCount {
        name: String,
        len: usize,
        capacity: usize,
    },
    #[error("'{name}' spans {span} byte(s) from {offset:#x}, overflowing the address space")]
    AddrOverflow {
        name: String,
        offset: Address,
        span: usize,
    },
}

/// What the transport was asked to do when it failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransportOp {
    Open,
    Close,
    Read,
    Write,
}

/// Opaque failure reported by a [`crate::ByteTransport`]
///
/// The accessor passes these through unchanged and never retries.
#[derive(Error, Debug)]
#[error("transport failed to {op} device {device_id:#04x} at address {address:#x}")]
pub struct TransportError {
    op: TransportOp,
    device_id: DeviceId,
    address: Address,
    #[source]
    source: Box<dyn error::Error + Send + Sync>,
}

impl TransportError {
    pub fn new(
        op: TransportOp,
        device_id: DeviceId,
        address: Address,
        source: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            op,
            device_id,
            address,
            source: source.into(),
        }
    }

    pub const fn op(&self) -> TransportOp {
        self.op
    }

    pub const fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub const fn address(&self) -> Address {
        self.address
    }
}

/// Error that happened while loading a register map or a memory image
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read input file")]
    Io(#[from] io::Error),
    #[error("input is not valid JSON")]
    Json(#[from] json::Error),
    #[error("expected a JSON {expected} for {context}")]
    UnexpectedType {
        context: String,
        expected: &'static str,
    },
    #[error("'{record}' is missing attribute '{attr}'")]
    MissingAttribute { record: String, attr: &'static str },
    #[error("'{record}' has an invalid '{attr}': {value}")]
    InvalidAttribute {
        record: String,
        attr: &'static str,
        value: String,
    },
    #[error("'{name}' is defined more than once")]
    Duplicate { name: String },
    #[error("bit-field '{field}' belongs to unknown register '{register}'")]
    DanglingRegister { field: String, register: String },
}

/// Error that happened while saving or loading a settings file
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("cannot access settings file")]
    Io(#[from] io::Error),
    #[error("line {line}: expected '<name>: <value>', found {text:?}")]
    MalformedLine { line: usize, text: String },
    #[error("register access failed while saving settings")]
    Access(#[from] Error),
}
