// src/common/timing.rs

use core::time::Duration;

/// Nominal width of one bit cell at 1200 baud, in microseconds. Fixed by
/// the protocol; not part of [`BusTiming`].
pub const BIT_WIDTH_US: u16 = 833;

/// Default break duration. The spec minimum is 12 ms; a little margin
/// keeps slow sensors reliable.
pub const DEFAULT_BREAK_US: u16 = 12_200;

/// Default marking period between the break and the first start bit.
pub const DEFAULT_POST_BREAK_MARKING_US: u16 = 8_333;

/// Fallback timeout for a response line when the caller passes zero.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wake-up timing of a bus, applied to every transmitted command.
///
/// A zero field means "use the default", so `BusTiming::default()` and a
/// zeroed struct from configuration both yield the nominal profile.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct BusTiming {
    /// Spacing-level break pulse duration in microseconds.
    pub break_us: u16,
    /// Marking period after the break, before the first character.
    pub post_break_marking_us: u16,
}

impl BusTiming {
    /// Resolves zero fields to their defaults.
    pub fn or_default(self) -> BusTiming {
        BusTiming {
            break_us: match self.break_us {
                0 => DEFAULT_BREAK_US,
                us => us,
            },
            post_break_marking_us: match self.post_break_marking_us {
                0 => DEFAULT_POST_BREAK_MARKING_US,
                us => us,
            },
        }
    }
}
