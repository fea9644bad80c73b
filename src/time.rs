//! RTMFP timestamps are 16 bit unsigned integers counting ticks of 4 milliseconds from an
//! unknown epoch.
//!
//! The counter wraps roughly every 262 seconds, so timestamps have to work with values that
//! overflow and underflow a 16 bit integer but still be able to do comparisons.  To support
//! this the `RtmfpTimestamp` struct abstracts away the calculations.  Two timestamps are
//! considered adjacent if they are within 2<sup>15</sup> - 1 ticks of each other.
//!
//! # Examples
//!
//! Basic arithmetic and comparison support:
//!
//! ```
//! use rml_rtmfp::time::RtmfpTimestamp;
//!
//! let time1 = RtmfpTimestamp::new(10);
//! let time2 = RtmfpTimestamp::new(20);
//! let time3 = RtmfpTimestamp::new(30);
//!
//! assert!(time1 < time2);
//! assert_eq!(time3, time1 + time2);
//! assert_eq!(time2, time1 + 10);
//! ```

use std::cmp::{max, min, Ordering};
use std::num::Wrapping;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Number of milliseconds represented by one timestamp tick
pub const TIMESTAMP_SCALE: u64 = 4;

/// The representation of a RTMFP wire timestamp
#[derive(Eq, PartialEq, Debug, Copy, Clone)]
pub struct RtmfpTimestamp {
    /// The time (as 4 millisecond ticks from an unknown epoch) being represented
    pub value: u16,
}

impl RtmfpTimestamp {
    /// Creates a new timestamp with the specified tick value
    pub fn new(initial_value: u16) -> Self {
        RtmfpTimestamp {
            value: initial_value,
        }
    }

    /// Creates a timestamp from a millisecond count, truncated to the 16 bit tick range
    pub fn from_millis(milliseconds: u64) -> Self {
        RtmfpTimestamp {
            value: ((milliseconds / TIMESTAMP_SCALE) & 0xFFFF) as u16,
        }
    }

    /// Creates a timestamp from a duration since an arbitrary epoch
    pub fn from_duration(duration: Duration) -> Self {
        Self::from_millis(duration.as_millis() as u64)
    }

    /// Number of milliseconds represented by this timestamp's tick count
    pub fn to_millis(self) -> u64 {
        self.value as u64 * TIMESTAMP_SCALE
    }

    /// Sets the timestamp to a new tick value
    pub fn set(&mut self, new_value: u16) {
        self.value = new_value;
    }
}

impl Add for RtmfpTimestamp {
    type Output = RtmfpTimestamp;

    fn add(self, other: RtmfpTimestamp) -> Self {
        RtmfpTimestamp {
            value: add_values(self.value, other.value),
        }
    }
}

impl Add<u16> for RtmfpTimestamp {
    type Output = RtmfpTimestamp;

    fn add(self, other: u16) -> Self {
        RtmfpTimestamp {
            value: add_values(self.value, other),
        }
    }
}

impl Sub for RtmfpTimestamp {
    type Output = RtmfpTimestamp;

    fn sub(self, other: RtmfpTimestamp) -> Self {
        RtmfpTimestamp {
            value: sub_values(self.value, other.value),
        }
    }
}

impl Sub<u16> for RtmfpTimestamp {
    type Output = RtmfpTimestamp;

    fn sub(self, other: u16) -> Self {
        RtmfpTimestamp {
            value: sub_values(self.value, other),
        }
    }
}

impl Ord for RtmfpTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.value, &other.value)
    }
}

impl PartialOrd for RtmfpTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(compare(&self.value, &other.value))
    }
}

impl PartialEq<u16> for RtmfpTimestamp {
    fn eq(&self, other: &u16) -> bool {
        self.value == *other
    }
}

impl PartialEq<RtmfpTimestamp> for u16 {
    fn eq(&self, other: &RtmfpTimestamp) -> bool {
        self == &other.value
    }
}

impl PartialOrd<u16> for RtmfpTimestamp {
    fn partial_cmp(&self, other: &u16) -> Option<Ordering> {
        Some(compare(&self.value, other))
    }
}

fn add_values(value1: u16, value2: u16) -> u16 {
    (Wrapping(value1) + Wrapping(value2)).0
}

fn sub_values(value1: u16, value2: u16) -> u16 {
    (Wrapping(value1) - Wrapping(value2)).0
}

fn compare(value1: &u16, value2: &u16) -> Ordering {
    const MAX_ADJACENT_VALUE: u16 = 32767; //2u16.pow(15) - 1

    let max_val = max(value1, value2);
    let min_val = min(value1, value2);
    let difference = max_val - min_val;
    match difference <= MAX_ADJACENT_VALUE {
        true => value1.cmp(value2),
        false => value2.cmp(value1),
    }
}

#[cfg(test)]
mod tests {
    use super::RtmfpTimestamp;

    #[test]
    fn two_timestamps_can_be_added_together() {
        let time1 = RtmfpTimestamp::new(50);
        let time2 = RtmfpTimestamp::new(60);
        let result = time1 + time2;

        assert_eq!(result.value, 110);
    }

    #[test]
    fn can_add_timestamps_that_overflow_u16() {
        let time1 = RtmfpTimestamp::new(u16::max_value());
        let time2 = RtmfpTimestamp::new(60);
        let result = time1 + time2;

        assert_eq!(result.value, 59);
    }

    #[test]
    fn can_subtract_timestamps_that_underflow() {
        let time1 = RtmfpTimestamp::new(0);
        let time2 = RtmfpTimestamp::new(50);
        let result = time1 - time2;

        assert_eq!(result.value, u16::max_value() - 49);
    }

    #[test]
    fn can_do_basic_comparisons_of_timestamps() {
        let time1 = RtmfpTimestamp::new(50);
        let time2 = RtmfpTimestamp::new(60);

        assert!(time1 < time2, "time1 was not less than time2");
        assert!(time2 > time1, "time2 was not greater than time1");
        assert_eq!(
            time1,
            RtmfpTimestamp::new(50),
            "Two timestamps with the same time were not equal"
        );
    }

    #[test]
    fn can_do_comparisons_with_timestamps_that_wrap_around() {
        let time1 = RtmfpTimestamp::new(100);
        let time2 = RtmfpTimestamp::new(65000);
        let time3 = RtmfpTimestamp::new(40000);

        assert!(time1 > time2, "100 was not marked as greater than 65000");
        assert!(time3 < time2, "40000 was not marked as less than 65000");
    }

    #[test]
    fn millisecond_conversion_uses_four_millisecond_ticks() {
        let time = RtmfpTimestamp::from_millis(1000);

        assert_eq!(time.value, 250);
        assert_eq!(time.to_millis(), 1000);
    }

    #[test]
    fn millisecond_conversion_truncates_to_sixteen_bits() {
        let time = RtmfpTimestamp::from_millis(262144);

        assert_eq!(time.value, 0);
    }
}
