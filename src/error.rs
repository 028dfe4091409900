//! Error taxonomy.
//!
//! One enum per component boundary, matching the classification in the
//! gateway's error handling design: pairing/transmission errors are logged
//! and recovered from on the next packet or connect; only startup transport
//! errors are fatal.

use thiserror::Error;

/// Fatal at startup: BLE enable/advertise failure, control-socket bind failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind control socket at {path}: {source}")]
    SocketBind {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("BLE adapter unavailable: {0}")]
    BleUnavailable(String),
    #[error("BLE advertising failed: {0}")]
    AdvertiseFailed(String),
}

/// Malformed wire data: bad header, length mismatch, unknown datatype tag.
/// Logged; the offending payload is dropped and the component resets on the
/// next arrival for that address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("capability payload has length {0}, expected 6")]
    BadCapabilityLength(usize),
    #[error("unknown hardware model code {0:#04x}")]
    UnknownHardwareModel(u8),
    #[error("payload length {got} is not a valid {datatype} frame (expected multiple of {unit})")]
    LengthMismatch {
        datatype: &'static str,
        got: usize,
        unit: usize,
    },
    #[error("unknown datatype tag {0:#04x}")]
    UnknownDatatypeTag(u8),
    #[error("malformed MAC string {0:?}")]
    BadMacString(String),
    #[error("malformed UUID string {0:?}")]
    BadUuidString(String),
}

/// Raised by the RTD conversion when the Callendar-Van Dusen discriminant
/// (or its quadratic-approximation fallback) is negative.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("temperature conversion out of domain for adc code {adc_code}")]
pub struct NumericDomainError {
    pub adc_code: i16,
}

/// Returned to the control-socket caller verbatim as `ERR:<CMD>:<msg>`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("sensor {0} not found")]
    NotFound(String),
    #[error("unrecognized setting path {0:?}")]
    InvalidSetting(String),
    #[error("value {value:?} is out of range for {path}: {reason}")]
    RangeError {
        path: String,
        value: String,
        reason: String,
    },
    #[error("setting exceeds collection capacity ({used} > {capacity} bytes)")]
    CapacityExceeded { used: u64, capacity: u64 },
}

/// Pairing engine operation failures, returned as `MSG:` events rather than
/// hard errors (see pairing.rs).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("pairing is disabled")]
    Disabled,
    #[error("no pending request for {0}")]
    NotFound(String),
}

/// Failure writing a measurement body into `unsent/`. Logged; the
/// measurement for that attempt is lost.
#[derive(Debug, Error)]
#[error("failed to persist unsent measurement to {path}: {source}")]
pub struct DurabilityError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}
