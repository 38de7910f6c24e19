//! Wraparound-aware address intervals.

/// An inclusive interval of the 16-bit address space.
///
/// Ranges never wrap internally; a span that crosses 0xFFFF is represented
/// as two ranges (see [`AddressRange::covering`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub low: u16,
    pub high: u16,
}

impl AddressRange {
    pub fn new(low: u16, high: u16) -> Self {
        debug_assert!(low <= high);
        Self { low, high }
    }

    /// The 1–2 ranges covered by `length` bytes starting at `base`.
    ///
    /// When `base + length - 1` overflows 0xFFFF the span is split into a
    /// tail range up to 0xFFFF and a head range from 0x0000.
    pub fn covering(base: u16, length: u32) -> (AddressRange, Option<AddressRange>) {
        debug_assert!(length >= 1);
        let end = base as u32 + length - 1;
        if end <= 0xFFFF {
            (AddressRange::new(base, end as u16), None)
        } else {
            (
                AddressRange::new(base, 0xFFFF),
                Some(AddressRange::new(0x0000, (end & 0xFFFF) as u16)),
            )
        }
    }

    pub fn contains(&self, address: u16) -> bool {
        self.low <= address && address <= self.high
    }

    /// Interval intersection test: max of the lows ≤ min of the highs.
    pub fn intersects(&self, other: &AddressRange) -> bool {
        self.low.max(other.low) <= self.high.min(other.high)
    }
}
