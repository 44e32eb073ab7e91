//! Error types for yunflash.

use std::io;
use thiserror::Error;

/// Result type for yunflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for yunflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid expect pattern.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Expected console output never arrived within its budget.
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// A value read back from the device differs from what was just set.
    #[error("Verification failed for {what}: expected {expected}, got {actual}")]
    Verification {
        /// What was being verified (environment variable, byte count).
        what: &'static str,
        /// Value the device was told to use.
        expected: String,
        /// Value the device reported.
        actual: String,
    },

    /// No serial port matching the board's USB identity was found.
    #[error("No serial port suitable for updating {0}")]
    DeviceNotFound(String),

    /// The external programmer exited with a failure status.
    #[error("Programmer failed: {0}")]
    Programmer(String),

    /// Host networking problem (no usable interface, no free address).
    #[error("Network error: {0}")]
    Network(String),

    /// Firmware transfer protocol error.
    #[error("TFTP error: {0}")]
    Tftp(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
