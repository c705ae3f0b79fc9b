// src/bus/mock.rs
//
// Test double for the pulse peripheral: staged captures play back in
// order, transmissions and direction switches are recorded for
// assertions. Test-only.

use std::collections::VecDeque;
use std::vec::Vec;

use arrayvec::ArrayVec;
use core::time::Duration;

use super::codec;
use super::link::{Level, LineDirection, Pulse, PulseLine};
use crate::common::timing::BIT_WIDTH_US;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct MockLineError;

#[derive(Default)]
pub(crate) struct MockLine {
    pub captures: VecDeque<Vec<Pulse>>,
    pub transmitted: Vec<Vec<Pulse>>,
    pub directions: Vec<LineDirection>,
    pub receive_timeouts: Vec<Duration>,
    pub fail_direction: bool,
}

impl MockLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a capture holding `line` encoded exactly as a sensor would
    /// send it (character frames only, no break).
    pub fn stage_line(&mut self, line: &[u8]) {
        let mut train = ArrayVec::<Pulse, 2048>::new();
        codec::encode_frames(line, &mut train);
        self.captures.push_back(train.to_vec());
    }

    /// Queues `line` with one data unit inverted, as colliding replies
    /// from multiple sensors produce. The resulting frame cannot pass the
    /// parity check.
    pub fn stage_garbled(&mut self, line: &[u8]) {
        let mut units = uncoalesced(line);
        units[1].level = match units[1].level {
            Level::Marking => Level::Spacing,
            Level::Spacing => Level::Marking,
        };
        self.captures.push_back(units);
    }
}

fn uncoalesced(line: &[u8]) -> Vec<Pulse> {
    let mut train = ArrayVec::<Pulse, 2048>::new();
    codec::encode_frames(line, &mut train);

    let mut units = Vec::new();
    for pulse in &train {
        for _ in 0..(pulse.duration_us / BIT_WIDTH_US) {
            units.push(Pulse::new(pulse.level, BIT_WIDTH_US));
        }
    }
    units
}

impl PulseLine for MockLine {
    type Error = MockLineError;

    fn set_direction(&mut self, direction: LineDirection) -> Result<(), Self::Error> {
        if self.fail_direction {
            return Err(MockLineError);
        }
        self.directions.push(direction);
        Ok(())
    }

    fn transmit(&mut self, pulses: &[Pulse]) -> Result<(), Self::Error> {
        self.transmitted.push(pulses.to_vec());
        Ok(())
    }

    fn receive(
        &mut self,
        out: &mut [Pulse],
        timeout: Duration,
    ) -> Result<Option<usize>, Self::Error> {
        self.receive_timeouts.push(timeout);
        match self.captures.pop_front() {
            None => Ok(None),
            Some(pulses) => {
                let n = pulses.len().min(out.len());
                out[..n].copy_from_slice(&pulses[..n]);
                Ok(Some(n))
            }
        }
    }
}
