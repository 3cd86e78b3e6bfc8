//! Error types surfaced by the ScientISST Sense driver, split between the
//! protocol-level taxonomy and the Bluetooth transport backend.
use std::io;
use thiserror::Error;

/// Errors raised by the command/response protocol and frame codec.
///
/// One variant per failure mode named in the protocol specification; each
/// carries the diagnostic string the caller should surface.
#[derive(Debug, Error)]
pub enum SenseError {
    #[error("invalid address: {0}")]
    /// The address passed to the session constructor is not a MAC literal.
    InvalidAddress(String),
    #[error("device not found: {0}")]
    /// Transport open failed or timed out before a connection was established.
    DeviceNotFound(String),
    #[error("error contacting device: {0}")]
    /// A write-flush or read deadline was exceeded.
    ContactingDevice(String),
    #[error("device not idle: {0}")]
    /// A command that requires the idle state was issued during acquisition.
    DeviceNotIdle(String),
    #[error("device not in acquisition: {0}")]
    /// `read`/`stop` was invoked while idle.
    DeviceNotInAcquisition(String),
    #[error("invalid parameter: {0}")]
    /// Out-of-range channel, duplicate channel, bad API, bad DAC/battery value, wrong trigger length.
    InvalidParameter(String),
    #[error("not supported: {0}")]
    /// Decode attempted under an API mode this core does not implement.
    NotSupported(String),
    #[error("unknown error: {0}")]
    /// The acquisition stream died before delivering a single frame.
    Unknown(String),
    #[error("bluetooth error: {0}")]
    /// Failures from the RFCOMM transport backend.
    Bluetooth(#[from] BluetoothError),
    #[error("io error: {0}")]
    /// I/O failures from the underlying transport.
    Io(#[from] io::Error),
}

/// Bluetooth-specific failures, separated from the protocol taxonomy.
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {mac}")]
    /// Adapter scan failed to discover the requested MAC address.
    NotFound { mac: String },
    #[error("connection not established: {0}")]
    /// RFCOMM connection was not established.
    NotConnected(String),
    #[error("rfcomm connection failed: {0}")]
    /// Low-level RFCOMM socket errors.
    Connection(String),
}

/// Convenience result alias for driver operations.
pub type Result<T> = std::result::Result<T, SenseError>;
