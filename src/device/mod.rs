//! Address-bound device sessions.
//!
//! A [`Sdi12Device`] couples one sensor address with a borrowed
//! [`Sdi12Bus`] and speaks the protocol verbs for it. Creation proves the
//! sensor is reachable (acknowledge active, or address query for `?`);
//! a session is never handed out for a silent address.
//!
//! Every response is checked to echo the session's address in its first
//! byte; a mismatch is an [`Sdi12Error::InvalidResponse`] regardless of
//! transport-level success.

use arrayvec::ArrayString;
use core::time::Duration;
use embassy_sync::blocking_mutex::raw::RawMutex;
use log::debug;

use crate::bus::link::PulseLine;
use crate::bus::Sdi12Bus;
use crate::common::address::Sdi12Addr;
use crate::common::command::Command;
use crate::common::error::Sdi12Error;

/// Protocol revision a sensor reports in its identification string.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Sdi12Version {
    V1_3,
    V1_4,
    #[default]
    Unknown,
}

/// Parsed `aI!` identification, cached on the session.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Identification {
    pub version: Sdi12Version,
    pub vendor: ArrayString<8>,
    pub model: ArrayString<6>,
    pub model_version: ArrayString<3>,
    pub optional: ArrayString<13>,
}

/// A live session with one sensor on a shared bus.
///
/// The session borrows the bus, so the bus cannot be released while the
/// session exists. Several sessions may share one bus; the bus serializes
/// their transactions.
pub struct Sdi12Device<'bus, M: RawMutex, L: PulseLine> {
    address: Sdi12Addr,
    info: Option<Identification>,
    bus: &'bus Sdi12Bus<M, L>,
}

impl<'bus, M: RawMutex, L: PulseLine> Sdi12Device<'bus, M, L> {
    /// Opens a session with the sensor at `address`.
    ///
    /// Passing [`Sdi12Addr::QUERY`] discovers the address with `?!` first
    /// (single-device buses only); any other address is probed with
    /// acknowledge active. Either probe failing means no session.
    pub fn new(
        bus: &'bus Sdi12Bus<M, L>,
        address: Sdi12Addr,
        timeout: Duration,
    ) -> Result<Self, Sdi12Error<L::Error>> {
        let device = if address.is_query() {
            let discovered = Self::address_query(bus, timeout)?;
            debug!("discovered sensor at '{discovered}'");
            Sdi12Device {
                address: discovered,
                info: None,
                bus,
            }
        } else {
            let device = Sdi12Device {
                address,
                info: None,
                bus,
            };
            device.acknowledge_active(timeout)?;
            device
        };

        Ok(device)
    }

    /// Sends `?!` and returns the single responding sensor's address.
    ///
    /// Usable without a session, e.g. by bus scanners. With more than one
    /// sensor attached the replies collide and this fails.
    pub fn address_query(
        bus: &Sdi12Bus<M, L>,
        timeout: Duration,
    ) -> Result<Sdi12Addr, Sdi12Error<L::Error>> {
        let mut out = [0u8; 4];
        bus.send_command(&Command::AddressQuery, false, timeout, &mut out)?;

        let c = out[0] as char;
        Sdi12Addr::new_device(c).map_err(|_| Sdi12Error::InvalidAddress(c))
    }

    /// The sensor address this session is bound to.
    pub fn address(&self) -> Sdi12Addr {
        self.address
    }

    /// Identification cached by the last successful
    /// [`read_identification`](Self::read_identification).
    pub fn identification(&self) -> Option<&Identification> {
        self.info.as_ref()
    }

    /// `a!`: liveness check.
    pub fn acknowledge_active(&self, timeout: Duration) -> Result<(), Sdi12Error<L::Error>> {
        let cmd = Command::AcknowledgeActive {
            address: self.address,
        };
        let mut out = [0u8; 4];
        let len = self.bus.send_command(&cmd, false, timeout, &mut out)?;
        self.check_echo(&out[..len])
    }

    /// `aAb!`: re-addresses the sensor. The session follows the new
    /// address on success; on an unexpected reply it stays on the old one.
    pub fn change_address(
        &mut self,
        new_address: Sdi12Addr,
        timeout: Duration,
    ) -> Result<(), Sdi12Error<L::Error>> {
        let cmd = Command::ChangeAddress {
            address: self.address,
            new_address,
        };
        let mut out = [0u8; 4];
        let len = self.bus.send_command(&cmd, false, timeout, &mut out)?;

        if out[..len].first() == Some(&(new_address.as_char() as u8)) {
            self.address = new_address;
            Ok(())
        } else {
            Err(Sdi12Error::InvalidResponse)
        }
    }

    /// `aI!`: reads and caches the sensor identification. The cache is
    /// replaced wholesale; a failed read leaves the previous one intact.
    pub fn read_identification(
        &mut self,
        timeout: Duration,
    ) -> Result<&Identification, Sdi12Error<L::Error>> {
        let cmd = Command::ReadIdentification {
            address: self.address,
        };
        let mut out = [0u8; 48];
        let len = self.bus.send_command(&cmd, false, timeout, &mut out)?;
        let line = &out[..len];

        self.check_echo(line)?;
        let info = parse_identification(line)?;
        Ok(self.info.insert(info))
    }

    /// `aM[C][x]!`: starts a measurement and returns the announced value
    /// count. If the sensor reports a preparation time, the bus has
    /// already waited for its service request when this returns.
    pub fn start_measurement(
        &self,
        index: u8,
        crc: bool,
        timeout: Duration,
    ) -> Result<u8, Sdi12Error<L::Error>> {
        let cmd = Command::StartMeasurement {
            address: self.address,
            index,
            crc,
        };
        let mut out = [0u8; 8];
        let len = self.bus.send_command(&cmd, false, timeout, &mut out)?;
        let line = &out[..len];

        self.check_echo(line)?;
        atttn_count(line)
    }

    /// `aC[C][x]!`: starts a concurrent measurement. Returns the
    /// announced `(ready_seconds, value_count)`; no service request is
    /// awaited, poll with [`read_data`](Self::read_data) after the
    /// reported time.
    pub fn start_concurrent_measurement(
        &self,
        index: u8,
        crc: bool,
        timeout: Duration,
    ) -> Result<(u16, u8), Sdi12Error<L::Error>> {
        let cmd = Command::StartConcurrentMeasurement {
            address: self.address,
            index,
            crc,
        };
        let mut out = [0u8; 8];
        let len = self.bus.send_command(&cmd, false, timeout, &mut out)?;
        let line = &out[..len];

        self.check_echo(line)?;
        let seconds = decimal_field(line.get(1..4).ok_or(Sdi12Error::InvalidResponse)?)?;
        let count = atttn_count(line)?;
        Ok((seconds as u16, count))
    }

    /// `aV!`: starts a verification sequence, returns the value count.
    pub fn start_verification(&self, timeout: Duration) -> Result<u8, Sdi12Error<L::Error>> {
        let cmd = Command::StartVerification {
            address: self.address,
        };
        let mut out = [0u8; 8];
        let len = self.bus.send_command(&cmd, false, timeout, &mut out)?;
        let line = &out[..len];

        self.check_echo(line)?;
        atttn_count(line)
    }

    /// `aDx!`: reads measurement data. Returns the values payload
    /// (address echo stripped); with `crc`, the trailer has been verified
    /// and removed by the bus.
    pub fn read_data<'buf>(
        &self,
        index: u8,
        crc: bool,
        timeout: Duration,
        out: &'buf mut [u8],
    ) -> Result<&'buf [u8], Sdi12Error<L::Error>> {
        let cmd = Command::SendData {
            address: self.address,
            index,
        };
        let len = self.bus.send_command(&cmd, crc, timeout, out)?;
        self.check_echo(&out[..len])?;
        Ok(&out[1..len])
    }

    /// `aRx!`: continuous measurement read, same conventions as
    /// [`read_data`](Self::read_data).
    pub fn read_continuous<'buf>(
        &self,
        index: u8,
        crc: bool,
        timeout: Duration,
        out: &'buf mut [u8],
    ) -> Result<&'buf [u8], Sdi12Error<L::Error>> {
        let cmd = Command::ReadContinuous {
            address: self.address,
            index,
        };
        let len = self.bus.send_command(&cmd, crc, timeout, out)?;
        self.check_echo(&out[..len])?;
        Ok(&out[1..len])
    }

    /// `aI<body>!`: identify-measurement passthrough (e.g. `M1`, `C2`).
    /// Returns the announced value count from the `attt{n}` reply.
    pub fn read_identify_measurement(
        &self,
        body: &str,
        timeout: Duration,
    ) -> Result<u16, Sdi12Error<L::Error>> {
        let cmd = Command::identify_measurement(self.address, body)
            .map_err(Sdi12Error::CommandFormat)?;
        let mut out = [0u8; 12];
        let len = self.bus.send_command(&cmd, false, timeout, &mut out)?;
        let line = &out[..len];

        self.check_echo(line)?;
        if line.len() < 5 {
            return Err(Sdi12Error::InvalidResponse);
        }
        Ok(decimal_field(&line[4..])? as u16)
    }

    /// `a<body>!`: raw vendor-specific command. Only the address echo is
    /// checked; the full response line is returned.
    pub fn extended_command<'buf>(
        &self,
        body: &str,
        crc: bool,
        timeout: Duration,
        out: &'buf mut [u8],
    ) -> Result<&'buf [u8], Sdi12Error<L::Error>> {
        let cmd =
            Command::extended(self.address, body).map_err(Sdi12Error::CommandFormat)?;
        let len = self.bus.send_command(&cmd, crc, timeout, out)?;
        self.check_echo(&out[..len])?;
        Ok(&out[..len])
    }

    fn check_echo(&self, line: &[u8]) -> Result<(), Sdi12Error<L::Error>> {
        if line.first() == Some(&(self.address.as_char() as u8)) {
            Ok(())
        } else {
            Err(Sdi12Error::InvalidResponse)
        }
    }
}

/// Parses the value count of an `atttn[n]` reply (digits from offset 4).
fn atttn_count<E: core::fmt::Debug>(line: &[u8]) -> Result<u8, Sdi12Error<E>> {
    if line.len() < 5 {
        return Err(Sdi12Error::InvalidResponse);
    }
    u8::try_from(decimal_field(&line[4..])?).map_err(|_| Sdi12Error::InvalidResponse)
}

/// Small all-digits decimal field, as used for `ttt` and `n` counts.
fn decimal_field<E: core::fmt::Debug>(bytes: &[u8]) -> Result<u32, Sdi12Error<E>> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(Sdi12Error::InvalidResponse);
    }

    let mut value = 0u32;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return Err(Sdi12Error::InvalidResponse);
        }
        value = value * 10 + u32::from(b - b'0');
    }
    Ok(value)
}

/// Splits `allccccccccmmmmmmvvv[xxx…]` into its fixed-width fields.
fn parse_identification<E: core::fmt::Debug>(
    line: &[u8],
) -> Result<Identification, Sdi12Error<E>> {
    if line.len() < 20 {
        return Err(Sdi12Error::InvalidResponse);
    }

    let version = match &line[1..3] {
        b"13" => Sdi12Version::V1_3,
        b"14" => Sdi12Version::V1_4,
        _ => Sdi12Version::Unknown,
    };

    Ok(Identification {
        version,
        vendor: field(&line[3..11])?,
        model: field(&line[11..17])?,
        model_version: field(&line[17..20])?,
        optional: field(&line[20..])?,
    })
}

fn field<const N: usize, E: core::fmt::Debug>(
    bytes: &[u8],
) -> Result<ArrayString<N>, Sdi12Error<E>> {
    let s = core::str::from_utf8(bytes).map_err(|_| Sdi12Error::InvalidResponse)?;
    ArrayString::from(s).map_err(|_| Sdi12Error::InvalidResponse)
}
