// src/bus/link.rs

use core::fmt::Debug;
use core::time::Duration;

/// Logic level of the inverted SDI-12 line code.
///
/// `Marking` is the idle/rest level (wire low), `Spacing` the active level
/// (wire high). Data bits are inverted: a 1 bit is sent at marking.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Level {
    Marking,
    Spacing,
}

/// One timed run of the line at a single level.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Pulse {
    pub level: Level,
    pub duration_us: u16,
}

impl Pulse {
    pub const fn new(level: Level, duration_us: u16) -> Self {
        Pulse { level, duration_us }
    }
}

/// Which way the shared line is currently configured.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LineDirection {
    Transmit,
    Receive,
}

/// Capability contract for the pulse peripheral driving one SDI-12 line.
///
/// Implementable over any hardware that can replay and capture timed level
/// sequences: RMT-style channels, timer capture-compare units, or a
/// software-timed GPIO. The protocol engine never assumes more than these
/// three operations.
pub trait PulseLine {
    type Error: Debug;

    /// Reconfigures the line driver for the given direction. Called only
    /// on actual direction changes; the bus tracks the current mode.
    fn set_direction(&mut self, direction: LineDirection) -> Result<(), Self::Error>;

    /// Emits the pulse sequence, blocking until it is fully on the wire.
    fn transmit(&mut self, pulses: &[Pulse]) -> Result<(), Self::Error>;

    /// Captures one burst of line activity into `out`.
    ///
    /// Returns `Ok(Some(n))` with the number of captured pulses, or
    /// `Ok(None)` if the line stayed quiet for the whole `timeout`.
    /// Captures longer than `out` may be truncated to its length.
    fn receive(
        &mut self,
        out: &mut [Pulse],
        timeout: Duration,
    ) -> Result<Option<usize>, Self::Error>;
}
