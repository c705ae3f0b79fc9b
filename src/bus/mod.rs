//! Bus transport: owns one physical SDI-12 line and runs the
//! command/response protocol on it.
//!
//! All traffic goes through [`Sdi12Bus::send_command`] (or
//! [`Sdi12Bus::send_raw`] for preformatted vendor commands). A transaction
//! (transmit, capture loop, optional deferred service-request wait) runs
//! as one critical section of the bus mutex, so commands issued from
//! different tasks can never interleave pulses on the shared half-duplex
//! line.

pub mod codec;
pub mod link;

#[cfg(test)]
pub(crate) mod mock;

use core::cell::RefCell;
use core::time::Duration;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use log::{debug, trace};

use crate::common::command::{Command, CommandFormatError, MAX_COMMAND_LEN};
use crate::common::crc::verify_response_crc;
use crate::common::error::Sdi12Error;
use crate::common::timing::{BusTiming, DEFAULT_RESPONSE_TIMEOUT};
use codec::Decoded;
use link::{Level, LineDirection, Pulse, PulseLine};

/// Sizing rule for response buffers: 75 value characters plus address,
/// CRC trailer and CR LF, with a little slack. Buffers of this size hold
/// any non-extended response.
pub const MAX_RESPONSE_LEN: usize = 85;

/// Bus-private capture storage, sized for a worst-case response burst.
const CAPTURE_PULSES: usize = 512;

/// An SDI-12 bus master bound to one [`PulseLine`].
///
/// The `RawMutex` parameter selects the lock implementation:
/// `NoopRawMutex` for single-task use, `CriticalSectionRawMutex` or an
/// RTOS-provided mutex when several tasks share the bus.
pub struct Sdi12Bus<M: RawMutex, L: PulseLine> {
    inner: Mutex<M, RefCell<Inner<L>>>,
}

struct Inner<L: PulseLine> {
    link: L,
    timing: BusTiming,
    direction: Option<LineDirection>,
    capture: [Pulse; CAPTURE_PULSES],
}

impl<M: RawMutex, L: PulseLine> Sdi12Bus<M, L> {
    /// Creates a bus over `link`. Zero fields in `timing` fall back to the
    /// protocol defaults.
    pub fn new(link: L, timing: BusTiming) -> Self {
        Sdi12Bus {
            inner: Mutex::new(RefCell::new(Inner {
                link,
                timing: timing.or_default(),
                // Forces a real driver configuration on first use.
                direction: None,
                capture: [Pulse::new(Level::Marking, 0); CAPTURE_PULSES],
            })),
        }
    }

    /// Tears the bus down and hands the pulse peripheral back.
    ///
    /// Outstanding [`Sdi12Device`](crate::device::Sdi12Device) sessions
    /// borrow the bus, so this cannot be called while any of them is
    /// alive.
    pub fn release(self) -> L {
        self.inner.into_inner().into_inner().link
    }

    /// Sends a typed command and fills `out` with the response line
    /// (terminator stripped, address echo intact). Returns the number of
    /// bytes written.
    ///
    /// With `check_crc` set, data-class (`aD…`/`aR…`) responses are
    /// CRC-verified and the three trailer characters are removed from the
    /// returned length. Measurement-class commands (`aM…`/`aV…`) whose
    /// reply announces a non-zero preparation time transparently wait for
    /// the sensor's service request before returning.
    ///
    /// A zero `timeout` selects [`DEFAULT_RESPONSE_TIMEOUT`].
    pub fn send_command(
        &self,
        command: &Command,
        check_crc: bool,
        timeout: Duration,
        out: &mut [u8],
    ) -> Result<usize, Sdi12Error<L::Error>> {
        let cmd = command
            .format_into()
            .map_err(Sdi12Error::CommandFormat)?;
        self.send_str(&cmd, check_crc, timeout, out)
    }

    /// Like [`send_command`](Self::send_command), for callers that carry
    /// preformatted command strings (scanners, consoles, vendor tools).
    pub fn send_raw(
        &self,
        command: &str,
        check_crc: bool,
        timeout: Duration,
        out: &mut [u8],
    ) -> Result<usize, Sdi12Error<L::Error>> {
        self.send_str(command, check_crc, timeout, out)
    }

    fn send_str(
        &self,
        cmd: &str,
        check_crc: bool,
        timeout: Duration,
        out: &mut [u8],
    ) -> Result<usize, Sdi12Error<L::Error>> {
        validate_command(cmd.as_bytes())?;
        if out.is_empty() {
            return Err(Sdi12Error::BufferOverflow { needed: 1, got: 0 });
        }
        let timeout = if timeout.is_zero() {
            DEFAULT_RESPONSE_TIMEOUT
        } else {
            timeout
        };

        debug!("-> {cmd}");

        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let result = inner.transact(cmd.as_bytes(), check_crc, timeout, out);

            // The bus is master-driven: never leave the line floating in
            // receive mode, whatever the transaction outcome was.
            match inner.ensure_direction(LineDirection::Transmit) {
                Ok(()) => result,
                Err(restore) => result.and(Err(restore)),
            }
        })
    }
}

impl<L: PulseLine> Inner<L> {
    fn transact(
        &mut self,
        cmd: &[u8],
        check_crc: bool,
        timeout: Duration,
        out: &mut [u8],
    ) -> Result<usize, Sdi12Error<L::Error>> {
        self.ensure_direction(LineDirection::Transmit)?;
        let train = codec::encode_command(cmd, self.timing);
        self.link.transmit(&train).map_err(Sdi12Error::Io)?;

        let mut len = self.read_response_line(timeout, out)?;

        if check_crc && is_data_class(cmd) {
            verify_response_crc(&out[..len])?;
            len -= 3;
        }

        if is_measurement_class(cmd) {
            let seconds = ready_seconds(&out[..len])?;
            if seconds > 0 {
                self.await_service_request(cmd[0], seconds)?;
            }
        }

        Ok(len)
    }

    /// Captures and decodes until a non-blank line arrives. Blank
    /// (`CR LF`-only) captures re-arm the receive with the same timeout.
    fn read_response_line(
        &mut self,
        timeout: Duration,
        out: &mut [u8],
    ) -> Result<usize, Sdi12Error<L::Error>> {
        self.ensure_direction(LineDirection::Receive)?;

        loop {
            let captured = self
                .link
                .receive(&mut self.capture, timeout)
                .map_err(Sdi12Error::Io)?;
            let Some(n) = captured else {
                return Err(Sdi12Error::Timeout);
            };

            match codec::decode_frames(&self.capture[..n], out)? {
                Decoded::Line(0) => trace!("blank line discarded"),
                Decoded::Line(len) => {
                    if let Ok(s) = core::str::from_utf8(&out[..len]) {
                        debug!("<- {s}");
                    }
                    return Ok(len);
                }
                Decoded::Incomplete => return Err(Sdi12Error::NotFound),
            }
        }
    }

    /// Waits for the unsolicited `a<CR><LF>` a sensor sends once its
    /// measurement is ready, bounded by the seconds it announced.
    fn await_service_request(
        &mut self,
        address: u8,
        seconds: u32,
    ) -> Result<(), Sdi12Error<L::Error>> {
        trace!("waiting up to {seconds} s for service request");

        let mut line = [0u8; 8];
        let len = self
            .read_response_line(Duration::from_secs(u64::from(seconds)), &mut line)
            .map_err(|e| match e {
                Sdi12Error::Timeout => Sdi12Error::NotFinished,
                other => other,
            })?;

        if line[..len].first() == Some(&address) {
            Ok(())
        } else {
            Err(Sdi12Error::InvalidResponse)
        }
    }

    fn ensure_direction(&mut self, direction: LineDirection) -> Result<(), Sdi12Error<L::Error>> {
        if self.direction != Some(direction) {
            self.link
                .set_direction(direction)
                .map_err(Sdi12Error::Io)?;
            trace!("line direction: {direction:?}");
            self.direction = Some(direction);
        }
        Ok(())
    }
}

/// Commands whose reply may be followed by a service request: start
/// measurement (`aM…`) and start verification (`aV…`). Concurrent
/// measurements (`aC…`) deliberately do not wait: they are defined
/// without service requests, so the bus stays free during preparation.
fn is_measurement_class(cmd: &[u8]) -> bool {
    matches!(cmd.get(1), Some(b'M') | Some(b'V'))
}

/// Commands whose reply may carry a CRC trailer: data reads (`aD…`) and
/// continuous reads (`aR…`).
fn is_data_class(cmd: &[u8]) -> bool {
    matches!(cmd.get(1), Some(b'D') | Some(b'R'))
}

/// Grammar gate run before any bus access: `<digit/letter/?>` first,
/// printable body, `!` last, bounded length.
fn validate_command<E: core::fmt::Debug>(cmd: &[u8]) -> Result<(), Sdi12Error<E>> {
    let (&first, rest) = cmd
        .split_first()
        .ok_or(Sdi12Error::CommandFormat(CommandFormatError::MissingTerminator))?;

    if !(first.is_ascii_alphanumeric() || first == b'?') {
        return Err(Sdi12Error::InvalidAddress(first as char));
    }
    if rest.last() != Some(&b'!') {
        return Err(Sdi12Error::CommandFormat(CommandFormatError::MissingTerminator));
    }
    if cmd.len() > MAX_COMMAND_LEN {
        return Err(Sdi12Error::CommandFormat(CommandFormatError::Overflow));
    }
    if !rest.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err(Sdi12Error::CommandFormat(CommandFormatError::BodyNotPrintable));
    }

    Ok(())
}

/// Parses the `ttt` field of an `atttn…` measurement reply.
fn ready_seconds<E: core::fmt::Debug>(line: &[u8]) -> Result<u32, Sdi12Error<E>> {
    if line.len() < 5 {
        return Err(Sdi12Error::InvalidResponse);
    }

    let mut seconds = 0u32;
    for &b in &line[1..4] {
        if !b.is_ascii_digit() {
            return Err(Sdi12Error::InvalidResponse);
        }
        seconds = seconds * 10 + u32::from(b - b'0');
    }
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::mock::MockLine;
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use std::vec::Vec;

    type TestBus = Sdi12Bus<NoopRawMutex, MockLine>;

    fn bus_with(lines: &[&[u8]]) -> TestBus {
        let mut link = MockLine::new();
        for line in lines {
            link.stage_line(line);
        }
        Sdi12Bus::new(link, BusTiming::default())
    }

    /// Decodes what the bus actually put on the wire back into characters.
    fn sent_commands(bus: TestBus) -> Vec<std::string::String> {
        let link = bus.release();
        link.transmitted
            .iter()
            .map(|train| {
                let mut out = [0u8; MAX_RESPONSE_LEN];
                // Commands have no CR LF, so decoding stops at Incomplete
                // with the characters already in `out`.
                let _ = codec::decode_frames::<()>(train, &mut out);
                let len = out.iter().position(|&b| b == 0).unwrap_or(out.len());
                std::string::String::from_utf8(out[..len].to_vec()).unwrap()
            })
            .collect()
    }

    #[test]
    fn acknowledge_roundtrip() {
        let bus = bus_with(&[b"0\r\n"]);
        let mut out = [0u8; 8];
        let len = bus.send_raw("0!", false, Duration::from_millis(1000), &mut out);
        assert_eq!(len.unwrap(), 1);
        assert_eq!(&out[..1], b"0");
        assert_eq!(sent_commands(bus), ["0!"]);
    }

    #[test]
    fn line_is_driven_again_after_the_transaction() {
        let bus = bus_with(&[b"0\r\n"]);
        let mut out = [0u8; 8];
        bus.send_raw("0!", false, Duration::ZERO, &mut out).unwrap();

        let link = bus.release();
        assert_eq!(
            link.directions,
            [
                LineDirection::Transmit,
                LineDirection::Receive,
                LineDirection::Transmit
            ]
        );
    }

    #[test]
    fn quiet_line_times_out() {
        let bus = bus_with(&[]);
        let mut out = [0u8; 8];
        let result = bus.send_raw("0!", false, Duration::from_millis(250), &mut out);
        assert!(matches!(result, Err(Sdi12Error::Timeout)));

        // Line restored to transmit even on the error path.
        let link = bus.release();
        assert_eq!(link.directions.last(), Some(&LineDirection::Transmit));
        assert_eq!(link.receive_timeouts, [Duration::from_millis(250)]);
    }

    #[test]
    fn zero_timeout_means_default() {
        let bus = bus_with(&[b"0\r\n"]);
        let mut out = [0u8; 8];
        bus.send_raw("0!", false, Duration::ZERO, &mut out).unwrap();
        assert_eq!(
            bus.release().receive_timeouts,
            [DEFAULT_RESPONSE_TIMEOUT]
        );
    }

    #[test]
    fn blank_lines_rearm_the_capture() {
        let bus = bus_with(&[b"\r\n", b"\r\n", b"3\r\n"]);
        let mut out = [0u8; 8];
        let len = bus.send_raw("3!", false, Duration::ZERO, &mut out).unwrap();
        assert_eq!(&out[..len], b"3");
        assert_eq!(bus.release().receive_timeouts.len(), 3);
    }

    #[test]
    fn malformed_commands_never_reach_the_line() {
        let bus = bus_with(&[]);
        let mut out = [0u8; 8];

        assert!(matches!(
            bus.send_raw("#0!", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::InvalidAddress('#'))
        ));
        assert!(matches!(
            bus.send_raw("0M", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::CommandFormat(CommandFormatError::MissingTerminator))
        ));
        assert!(matches!(
            bus.send_raw("", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::CommandFormat(CommandFormatError::MissingTerminator))
        ));

        let link = bus.release();
        assert!(link.transmitted.is_empty());
        assert!(link.directions.is_empty());
    }

    #[test]
    fn empty_out_buffer_is_rejected_up_front() {
        let bus = bus_with(&[]);
        let mut out = [0u8; 0];
        assert!(matches!(
            bus.send_raw("0!", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::BufferOverflow { needed: 1, got: 0 })
        ));
        assert!(bus.release().transmitted.is_empty());
    }

    #[test]
    fn measurement_waits_for_the_service_request() {
        // aM! -> "00030": 003 seconds to prepare, 0 values, then the
        // unsolicited completion line.
        let bus = bus_with(&[b"00030\r\n", b"0\r\n"]);
        let mut out = [0u8; 8];
        let len = bus.send_raw("0M!", false, Duration::ZERO, &mut out).unwrap();
        assert_eq!(&out[..len], b"00030");

        let link = bus.release();
        assert_eq!(link.receive_timeouts.len(), 2);
        assert_eq!(link.receive_timeouts[1], Duration::from_secs(3));
    }

    #[test]
    fn service_request_timeout_uses_the_reported_seconds() {
        let bus = bus_with(&[b"01231\r\n", b"0\r\n"]);
        let mut out = [0u8; 8];
        bus.send_raw("0M!", false, Duration::ZERO, &mut out).unwrap();
        assert_eq!(
            bus.release().receive_timeouts[1],
            Duration::from_secs(123)
        );
    }

    #[test]
    fn missing_service_request_is_not_finished() {
        let bus = bus_with(&[b"00051\r\n"]);
        let mut out = [0u8; 8];
        assert!(matches!(
            bus.send_raw("0M!", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::NotFinished)
        ));
    }

    #[test]
    fn foreign_service_request_is_invalid() {
        let bus = bus_with(&[b"00051\r\n", b"1\r\n"]);
        let mut out = [0u8; 8];
        assert!(matches!(
            bus.send_raw("0M!", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::InvalidResponse)
        ));
    }

    #[test]
    fn zero_seconds_skips_the_wait() {
        let bus = bus_with(&[b"00002\r\n"]);
        let mut out = [0u8; 8];
        bus.send_raw("0M!", false, Duration::ZERO, &mut out).unwrap();
        assert_eq!(bus.release().receive_timeouts.len(), 1);
    }

    #[test]
    fn verification_is_measurement_class() {
        let bus = bus_with(&[b"00011\r\n", b"0\r\n"]);
        let mut out = [0u8; 8];
        bus.send_raw("0V!", false, Duration::ZERO, &mut out).unwrap();
        assert_eq!(bus.release().receive_timeouts.len(), 2);
    }

    #[test]
    fn concurrent_measurement_does_not_wait() {
        let bus = bus_with(&[b"000510\r\n"]);
        let mut out = [0u8; 8];
        let len = bus.send_raw("0C!", false, Duration::ZERO, &mut out).unwrap();
        assert_eq!(&out[..len], b"000510");
        assert_eq!(bus.release().receive_timeouts.len(), 1);
    }

    #[test]
    fn crc_verified_responses_are_truncated() {
        let bus = bus_with(&[b"0+3.14OqZ\r\n"]);
        let mut out = [0u8; 16];
        let len = bus.send_raw("0D0!", true, Duration::ZERO, &mut out).unwrap();
        assert_eq!(&out[..len], b"0+3.14");
    }

    #[test]
    fn corrupted_crc_fails_without_truncation() {
        let bus = bus_with(&[b"0+3.14OqX\r\n"]);
        let mut out = [0u8; 16];
        let result = bus.send_raw("0D0!", true, Duration::ZERO, &mut out);
        assert!(matches!(result, Err(Sdi12Error::CrcMismatch { .. })));
        // Buffer still holds the full line, trailer included.
        assert_eq!(&out[..9], b"0+3.14OqX");
    }

    #[test]
    fn crc_flag_is_ignored_outside_data_class() {
        let bus = bus_with(&[b"0\r\n"]);
        let mut out = [0u8; 8];
        let len = bus.send_raw("0!", true, Duration::ZERO, &mut out).unwrap();
        assert_eq!(&out[..len], b"0");
    }

    #[test]
    fn undersized_buffer_reports_invalid_size() {
        let bus = bus_with(&[b"0+1.2\r\n"]);
        let mut out = [0u8; 2];
        assert!(matches!(
            bus.send_raw("0D0!", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::BufferOverflow { .. })
        ));
    }

    #[test]
    fn capture_without_terminator_is_not_found() {
        let mut link = MockLine::new();
        link.stage_line(b"0+1.2");
        let bus: TestBus = Sdi12Bus::new(link, BusTiming::default());
        let mut out = [0u8; 16];
        assert!(matches!(
            bus.send_raw("0D0!", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::NotFound)
        ));
    }

    #[test]
    fn garbled_reply_does_not_succeed() {
        // Two devices answering `?!` at once: overlapping edges produce
        // frames with broken parity. The exchange must error out rather
        // than return fabricated data.
        let mut link = MockLine::new();
        link.stage_garbled(b"0\r\n");
        let bus: TestBus = Sdi12Bus::new(link, BusTiming::default());
        let mut out = [0u8; 8];
        let result = bus.send_raw("?!", false, Duration::ZERO, &mut out);
        assert!(result.is_err());
    }

    #[test]
    fn failing_direction_switch_aborts() {
        let mut link = MockLine::new();
        link.fail_direction = true;
        let bus: TestBus = Sdi12Bus::new(link, BusTiming::default());
        let mut out = [0u8; 8];
        assert!(matches!(
            bus.send_raw("0!", false, Duration::ZERO, &mut out),
            Err(Sdi12Error::Io(_))
        ));
    }
}
