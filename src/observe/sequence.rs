//! Observe sequence numbers.
//!
//! One generator per resource. Values live in a `2^bits` space and are
//! compared with the wraparound-tolerant relation from RFC 7641 §3.4.

use chrono::{DateTime, Duration, Utc};

use crate::config::MAX_SEQUENCE_BITS;
use crate::error::ValidationError;

/// Seconds after which any newer-arriving notification is considered fresh.
pub const FRESHNESS_WINDOW_SECS: i64 = 128;

/// Per-resource monotonic Observe value source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceGenerator {
    bits: u8,
    current: u32,
}

impl SequenceGenerator {
    /// Creates a generator starting at 0.
    pub fn new(bits: u8) -> Result<Self, ValidationError> {
        Self::starting_at(bits, 0)
    }

    /// Creates a generator whose current value is `start` (reduced modulo the space).
    pub fn starting_at(bits: u8, start: u32) -> Result<Self, ValidationError> {
        if bits == 0 || bits > MAX_SEQUENCE_BITS {
            return Err(ValidationError::InvalidSequenceWidth { bits });
        }
        Ok(Self {
            bits,
            current: start & mask(bits),
        })
    }

    /// The most recently emitted value (or the start value).
    #[must_use]
    pub const fn current(&self) -> u32 {
        self.current
    }

    /// Width of the sequence space in bits.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.bits
    }

    /// Advances and returns the new value.
    pub fn next(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1) & mask(self.bits);
        self.current
    }

    /// Whether `candidate` is newer than `reference` in this generator's space.
    #[must_use]
    pub fn is_newer(&self, candidate: u32, reference: u32) -> bool {
        is_newer(candidate, reference, self.bits)
    }
}

const fn mask(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Wraparound-safe "greater than" over a `2^bits` sequence space.
///
/// `candidate` is newer when the forward distance from `reference` is non-zero
/// and less than half the space.
#[must_use]
pub fn is_newer(candidate: u32, reference: u32, bits: u8) -> bool {
    let bits = bits.clamp(1, MAX_SEQUENCE_BITS);
    let m = mask(bits);
    let forward = candidate.wrapping_sub(reference) & m;
    forward != 0 && forward < (1u32 << (bits - 1))
}

/// RFC 7641 §3.4 freshness check for a notification (`v2`, received at `t2`)
/// against the freshest one seen so far (`v1`, received at `t1`).
#[must_use]
pub fn is_fresh(v1: u32, t1: DateTime<Utc>, v2: u32, t2: DateTime<Utc>, bits: u8) -> bool {
    is_newer(v2, v1, bits) || t2 > t1 + Duration::seconds(FRESHNESS_WINDOW_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_strictly_increasing() {
        let mut seq = SequenceGenerator::new(24).unwrap();
        let mut prev = seq.current();
        for _ in 0..1000 {
            let v = seq.next();
            assert!(seq.is_newer(v, prev));
            assert!(!seq.is_newer(prev, v));
            prev = v;
        }
        assert_eq!(prev, 1000);
    }

    #[test]
    fn wraps_at_the_width_and_stays_newer() {
        let mut seq = SequenceGenerator::starting_at(24, 0x00FF_FFFE).unwrap();
        let a = seq.next();
        let b = seq.next();
        let c = seq.next();
        assert_eq!((a, b, c), (0x00FF_FFFF, 0, 1));
        assert!(seq.is_newer(b, a));
        assert!(seq.is_newer(c, b));
        assert!(seq.is_newer(c, a));
    }

    #[test]
    fn narrow_width_wraps_quickly() {
        let mut seq = SequenceGenerator::new(4).unwrap();
        let mut prev = seq.current();
        for _ in 0..40 {
            let v = seq.next();
            assert!(v < 16);
            assert!(seq.is_newer(v, prev));
            prev = v;
        }
    }

    #[test]
    fn half_space_distance_is_not_newer() {
        assert!(!is_newer(1 << 23, 0, 24));
        assert!(is_newer((1 << 23) - 1, 0, 24));
        assert!(!is_newer(5, 5, 24));
    }

    #[test]
    fn rejects_invalid_width() {
        assert!(SequenceGenerator::new(0).is_err());
        assert!(SequenceGenerator::new(25).is_err());
        assert!(SequenceGenerator::new(1).is_ok());
    }

    #[test]
    fn start_value_is_reduced() {
        let seq = SequenceGenerator::starting_at(8, 0x1FF).unwrap();
        assert_eq!(seq.current(), 0xFF);
    }

    #[test]
    fn freshness_accepts_stale_sequence_after_window() {
        let t1 = Utc::now();
        assert!(is_fresh(10, t1, 11, t1, 24));
        assert!(!is_fresh(10, t1, 9, t1 + Duration::seconds(10), 24));
        assert!(is_fresh(10, t1, 9, t1 + Duration::seconds(129), 24));
    }
}
