//! Human-readable size formatting for log output.

use core::fmt;

/// Wraps a byte count and formats it with binary prefixes (KiB, MiB, GiB).
///
/// Formatting is integer-only (no floating point in kernel context) and keeps
/// at most one decimal digit, truncated: `1536` renders as `1.5KiB`, `2048`
/// as `2KiB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl HumanSize {
    /// Creates a new human-readable size from bytes.
    #[inline]
    pub const fn new(bytes: usize) -> Self {
        Self(bytes)
    }

    /// Returns the raw byte count.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.0
    }
}

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<u64> for HumanSize {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value as usize)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }

        let mut unit = 0;
        while (self.0 >> (10 * unit)) >= 1024 && unit < UNITS.len() - 1 {
            unit += 1;
        }

        let shift = 10 * unit;
        let whole = self.0 >> shift;
        let rest = self.0 - (whole << shift);
        let tenths = ((rest as u128 * 10) >> shift) as usize;

        if tenths == 0 {
            write!(f, "{}{}", whole, UNITS[unit])
        } else {
            write!(f, "{}.{}{}", whole, tenths, UNITS[unit])
        }
    }
}
