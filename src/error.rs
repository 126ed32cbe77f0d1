use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::ConnectionState;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start application (runtime): {source}")]
    Runtime { #[from] source: io::Error },
}

/// Failures reported by the host stack.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("The host stack does not know a peripheral with address {0}")]
    UnknownDevice(String),

    #[error("The host stack rejected the request: {0}")]
    Rejected(String),

    #[error("The host stack did not answer in time")]
    Timeout,
}

/// Why a control command was not handed to the command channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("No writable command channel is bound")]
    NotReady,

    #[error("The command channel did not accept the write")]
    Rejected,
}

/// Everything that ends in a FAILED transition. The display text is used as the transition reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Cannot {operation} while {state}")]
    InvalidStateTransition { operation: &'static str, state: ConnectionState },

    #[error("Scan could not be started: {0}")]
    ScanFailed(String),

    #[error("Device not found in scan results: {0}")]
    DeviceNotFound(String),

    #[error("Device protocol not supported")]
    UnsupportedProtocol,

    #[error("Resource exhausted: max clients reached")]
    ResourceExhausted,

    #[error("Could not find compatible service/characteristics")]
    DiscoveryFailure,

    #[error("Timed out")]
    Timeout,

    #[error("Connection lost unexpectedly")]
    UnexpectedDisconnect,

    #[error("connect() failed: {0}")]
    ConnectFailed(String),
}

/// A response from the peripheral that could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Response is not terminated: {0:?}")]
    Unterminated(String),

    #[error("Malformed identity response: {0:?}")]
    MalformedIdentity(String),

    #[error("Battery level out of range: {0}")]
    BatteryOutOfRange(i64),

    #[error("Don't know how to handle response: {0:?}")]
    Unrecognized(String),
}
