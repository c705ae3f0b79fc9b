// src/common/error.rs

use super::command::CommandFormatError;

/// Crate-wide error type, generic over the pulse peripheral's error.
///
/// `E` defaults to `()` for errors raised before any peripheral access
/// (validation, parsing).
#[derive(Debug, thiserror::Error)]
pub enum Sdi12Error<E = ()>
where
    E: core::fmt::Debug,
{
    /// Failure reported by the underlying pulse peripheral.
    #[error("pulse line error: {0:?}")]
    Io(E),

    /// No response line within the allotted time.
    #[error("response timed out")]
    Timeout,

    /// A measurement's service-request window elapsed without the sensor
    /// announcing completion.
    #[error("measurement not finished within reported time")]
    NotFinished,

    /// Character is not a valid SDI-12 address.
    #[error("invalid SDI-12 address character: '{0}'")]
    InvalidAddress(char),

    /// Command could not be rendered to a valid `<address><body>!` string.
    #[error("malformed command: {0}")]
    CommandFormat(CommandFormatError),

    /// Response was decoded but its content does not match what the
    /// command requires (wrong address echo, malformed fields).
    #[error("invalid response")]
    InvalidResponse,

    /// Decoded line does not fit the destination buffer.
    #[error("response buffer too small: needed {needed}, got {got}")]
    BufferOverflow { needed: usize, got: usize },

    /// Stop unit sampled at the wrong level.
    #[error("framing error")]
    Framing,

    /// Parity unit disagrees with the received data bits.
    #[error("parity error")]
    Parity,

    /// Response CRC trailer does not match the payload.
    #[error("CRC mismatch: received {received:#06x}, calculated {calculated:#06x}")]
    CrcMismatch { received: u16, calculated: u16 },

    /// A capture ended without the CR LF terminator.
    #[error("no response terminator found")]
    NotFound,
}
