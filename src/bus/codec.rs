//! Pulse-level codec for the SDI-12 wire format.
//!
//! Each character travels as a 10-unit frame at the fixed bit width:
//! start (spacing), 7 data bits LSB-first in inverted logic (1 = marking,
//! 0 = spacing), an even-parity unit counted over the spacing data units,
//! and a stop unit at marking. A command is preceded by one break pulse
//! plus a marking period that wakes every sensor on the bus.

use arrayvec::ArrayVec;
use log::error;

use crate::bus::link::{Level, Pulse};
use crate::common::command::MAX_COMMAND_LEN;
use crate::common::error::Sdi12Error;
use crate::common::timing::{BusTiming, BIT_WIDTH_US};

/// Units per character frame: start + 7 data + parity + stop.
const UNITS_PER_CHAR: usize = 10;

/// Transmit capacity: break + post-break marking, then one pulse per unit
/// in the worst (no coalescing) case.
pub const MAX_TX_PULSES: usize = 2 + MAX_COMMAND_LEN * UNITS_PER_CHAR;

/// A command rendered as its transmission plan.
pub type PulseTrain = ArrayVec<Pulse, MAX_TX_PULSES>;

/// Outcome of a decode pass over one captured burst.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Decoded {
    /// A full CR LF-terminated line was found; the terminator is stripped
    /// and `0` bytes were written for a blank line.
    Line(usize),
    /// The capture ended before any CR LF terminator.
    Incomplete,
}

/// Encodes a validated command string into its pulse train: break,
/// post-break marking, then the character frames.
pub fn encode_command(cmd: &[u8], timing: BusTiming) -> PulseTrain {
    let timing = timing.or_default();
    let mut train = PulseTrain::new();

    push_units(&mut train, Level::Spacing, timing.break_us);
    push_units(&mut train, Level::Marking, timing.post_break_marking_us);
    encode_frames(cmd, &mut train);

    train
}

/// Appends the 10-unit character frames for `bytes` to `train`,
/// coalescing consecutive same-level units into single pulses.
///
/// `train` must have room for `bytes.len() * 10` additional pulses.
pub fn encode_frames<const N: usize>(bytes: &[u8], train: &mut ArrayVec<Pulse, N>) {
    for &byte in bytes {
        let mut parity = false;

        // Start unit.
        push_units(train, Level::Spacing, BIT_WIDTH_US);

        // Seven data units, LSB first, inverted logic.
        for bit in 0..7 {
            let level = if byte & (1 << bit) != 0 {
                Level::Marking
            } else {
                parity = !parity;
                Level::Spacing
            };
            push_units(train, level, BIT_WIDTH_US);
        }

        push_units(train, parity_level(parity), BIT_WIDTH_US);

        // Stop unit.
        push_units(train, Level::Marking, BIT_WIDTH_US);
    }
}

/// Walks a captured pulse sequence through the character state machine,
/// appending decoded characters to `out`.
///
/// Pulses that do not round to 1..=9 bit units carry no frame content
/// (line noise, the break, long idle) and are skipped. The only success
/// condition is a CR LF pair, which is stripped before returning.
pub fn decode_frames<E>(pulses: &[Pulse], out: &mut [u8]) -> Result<Decoded, Sdi12Error<E>>
where
    E: core::fmt::Debug,
{
    let mut written = 0usize;
    // 0 = waiting for start, 1..=7 = data bits, 8 = parity, 9 = stop.
    let mut bit_counter = 0u8;
    let mut c = 0u8;
    let mut parity = false;

    for pulse in pulses {
        let units =
            (u32::from(pulse.duration_us) + u32::from(BIT_WIDTH_US) / 2) / u32::from(BIT_WIDTH_US);
        if !(1..=9).contains(&units) {
            continue;
        }

        for _ in 0..units {
            match bit_counter {
                0 => {
                    // Idle or stop padding until a spacing unit starts a
                    // character.
                    if pulse.level == Level::Spacing {
                        bit_counter = 1;
                        parity = false;
                        c = 0;
                    }
                }
                8 => {
                    if pulse.level != parity_level(parity) {
                        error!("parity error after {written} decoded bytes");
                        return Err(Sdi12Error::Parity);
                    }

                    if written >= out.len() {
                        error!("response exceeds {}-byte buffer", out.len());
                        return Err(Sdi12Error::BufferOverflow {
                            needed: written + 1,
                            got: out.len(),
                        });
                    }

                    out[written] = c;
                    if c == b'\n' && written >= 1 && out[written - 1] == b'\r' {
                        return Ok(Decoded::Line(written - 1));
                    }
                    written += 1;
                    bit_counter = 9;
                }
                9 => {
                    if pulse.level != Level::Marking {
                        error!("stop unit error after {written} decoded bytes");
                        return Err(Sdi12Error::Framing);
                    }
                    bit_counter = 0;
                }
                n => {
                    if pulse.level == Level::Marking {
                        c |= 1 << (n - 1);
                    } else {
                        parity = !parity;
                    }
                    bit_counter = n + 1;
                }
            }
        }
    }

    Ok(Decoded::Incomplete)
}

fn parity_level(parity: bool) -> Level {
    if parity {
        Level::Spacing
    } else {
        Level::Marking
    }
}

fn push_units<const N: usize>(train: &mut ArrayVec<Pulse, N>, level: Level, duration_us: u16) {
    if let Some(last) = train.last_mut() {
        if last.level == level {
            last.duration_us = last.duration_us.saturating_add(duration_us);
            return;
        }
    }
    train.push(Pulse::new(level, duration_us));
}
