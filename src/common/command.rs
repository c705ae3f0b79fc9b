//! SDI-12 command grammar.
//!
//! Every command on the wire is `<address><body>!`. This module builds
//! those strings; classification of a formatted command (measurement
//! class, data class) happens byte-wise in the bus, which also accepts
//! raw strings for vendor-specific traffic.

use arrayvec::ArrayString;
use core::fmt::{self, Write};

use super::address::Sdi12Addr;

/// Longest command this crate will put on the wire, extended commands
/// included.
pub const MAX_COMMAND_LEN: usize = 24;

/// Longest body accepted for extended (`aXNNN!`-style) commands, without
/// address and `!`.
pub const MAX_EXTENDED_BODY_LEN: usize = 16;

/// Bounded storage for an extended-command body.
pub type ExtendedBody = ArrayString<MAX_EXTENDED_BODY_LEN>;

/// A protocol command, ready to be rendered with [`Command::format_into`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `a!`: acknowledge active.
    AcknowledgeActive { address: Sdi12Addr },
    /// `?!`: address query. Only meaningful with a single device on the
    /// bus; with several, replies collide and the exchange fails.
    AddressQuery,
    /// `aAb!`: change address from `a` to `b`.
    ChangeAddress {
        address: Sdi12Addr,
        new_address: Sdi12Addr,
    },
    /// `aM!`, `aMx!`, `aMC!`, `aMCx!`: start measurement. Index 0 selects
    /// the base command; 1..=9 the additional measurements. `crc` asks the
    /// sensor to append a CRC to the subsequent data responses.
    StartMeasurement {
        address: Sdi12Addr,
        index: u8,
        crc: bool,
    },
    /// `aC!`, `aCx!`, `aCC!`, `aCCx!`: start concurrent measurement.
    StartConcurrentMeasurement {
        address: Sdi12Addr,
        index: u8,
        crc: bool,
    },
    /// `aV!`: start verification.
    StartVerification { address: Sdi12Addr },
    /// `aDx!`: read data from a completed measurement, index 0..=9.
    SendData { address: Sdi12Addr, index: u8 },
    /// `aRx!`: continuous measurement read, index 0..=9.
    ReadContinuous { address: Sdi12Addr, index: u8 },
    /// `aI!`: read identification.
    ReadIdentification { address: Sdi12Addr },
    /// `aI<body>!`: identify-measurement passthrough (e.g. body `M1`).
    IdentifyMeasurement {
        address: Sdi12Addr,
        body: ExtendedBody,
    },
    /// `a<body>!`: raw vendor-specific command.
    Extended {
        address: Sdi12Addr,
        body: ExtendedBody,
    },
}

/// Why a [`Command`] could not be rendered.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CommandFormatError {
    #[error("index {0} not in 0..=9")]
    IndexOutOfRange(u8),
    #[error("extended body empty or too long")]
    BodyLength,
    #[error("extended body contains non-printable characters")]
    BodyNotPrintable,
    #[error("change-address target may not be '?'")]
    QueryTarget,
    #[error("command does not end in '!'")]
    MissingTerminator,
    #[error("formatted command exceeds capacity")]
    Overflow,
}

impl Command {
    /// Builds an extended command, validating the body (1..=16 printable
    /// ASCII characters; the `!` terminator is appended on format).
    pub fn extended(address: Sdi12Addr, body: &str) -> Result<Self, CommandFormatError> {
        Ok(Command::Extended {
            address,
            body: checked_body(body)?,
        })
    }

    /// Builds an `aI<body>!` identify-measurement command.
    pub fn identify_measurement(
        address: Sdi12Addr,
        body: &str,
    ) -> Result<Self, CommandFormatError> {
        Ok(Command::IdentifyMeasurement {
            address,
            body: checked_body(body)?,
        })
    }

    /// The address the command is directed at (`?` for the address query).
    pub fn address(&self) -> Sdi12Addr {
        match self {
            Command::AcknowledgeActive { address }
            | Command::ChangeAddress { address, .. }
            | Command::StartMeasurement { address, .. }
            | Command::StartConcurrentMeasurement { address, .. }
            | Command::StartVerification { address }
            | Command::SendData { address, .. }
            | Command::ReadContinuous { address, .. }
            | Command::ReadIdentification { address }
            | Command::IdentifyMeasurement { address, .. }
            | Command::Extended { address, .. } => *address,
            Command::AddressQuery => Sdi12Addr::QUERY,
        }
    }

    /// Renders the command to its wire string.
    pub fn format_into(&self) -> Result<ArrayString<MAX_COMMAND_LEN>, CommandFormatError> {
        self.validate()?;
        let mut out = ArrayString::new();
        self.write_to(&mut out).map_err(|_| CommandFormatError::Overflow)?;
        Ok(out)
    }

    fn write_to<W: Write>(&self, out: &mut W) -> fmt::Result {
        match self {
            Command::AcknowledgeActive { address } => write!(out, "{address}!"),
            Command::AddressQuery => write!(out, "?!"),
            Command::ChangeAddress {
                address,
                new_address,
            } => write!(out, "{address}A{new_address}!"),
            Command::StartMeasurement { address, index, crc } => {
                write_measurement(out, *address, 'M', *index, *crc)
            }
            Command::StartConcurrentMeasurement { address, index, crc } => {
                write_measurement(out, *address, 'C', *index, *crc)
            }
            Command::StartVerification { address } => write!(out, "{address}V!"),
            Command::SendData { address, index } => write!(out, "{address}D{index}!"),
            Command::ReadContinuous { address, index } => write!(out, "{address}R{index}!"),
            Command::ReadIdentification { address } => write!(out, "{address}I!"),
            Command::IdentifyMeasurement { address, body } => {
                write!(out, "{address}I{body}!")
            }
            Command::Extended { address, body } => write!(out, "{address}{body}!"),
        }
    }

    fn validate(&self) -> Result<(), CommandFormatError> {
        match self {
            Command::StartMeasurement { index, .. }
            | Command::StartConcurrentMeasurement { index, .. }
            | Command::SendData { index, .. }
            | Command::ReadContinuous { index, .. }
                if *index > 9 =>
            {
                Err(CommandFormatError::IndexOutOfRange(*index))
            }
            Command::ChangeAddress { new_address, .. } if new_address.is_query() => {
                Err(CommandFormatError::QueryTarget)
            }
            _ => Ok(()),
        }
    }
}

/// `aM[C][x]!` / `aC[C][x]!`: the CRC marker precedes the index, and index
/// 0 is expressed by omission.
fn write_measurement<W: Write>(
    out: &mut W,
    address: Sdi12Addr,
    verb: char,
    index: u8,
    crc: bool,
) -> fmt::Result {
    write!(out, "{address}{verb}")?;
    if crc {
        out.write_char('C')?;
    }
    if index != 0 {
        write!(out, "{index}")?;
    }
    out.write_char('!')
}

fn checked_body(body: &str) -> Result<ExtendedBody, CommandFormatError> {
    if body.is_empty() {
        return Err(CommandFormatError::BodyLength);
    }
    if !body.bytes().all(|b| (0x20..=0x7e).contains(&b) && b != b'!') {
        return Err(CommandFormatError::BodyNotPrintable);
    }
    ExtendedBody::from(body).map_err(|_| CommandFormatError::BodyLength)
}
