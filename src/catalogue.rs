//! System catalogue (C1, §4.1): per-platform memory ranges, masks,
//! endianness, and deterministic 4-byte-aligned range subdivision.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::Address;

/// Sentinel returned by [`SystemDescriptor::range_index`] for an address
/// outside every derived range.
pub const NO_RANGE: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeMode {
    Full,
    Half,
    Quarter,
    Dual,
}

impl TryFrom<&str> for RangeMode {
    type Error = PipelineError;

    /// The source spells `'quater'` for one system entry alongside
    /// `'quarter'` elsewhere (§9 Open Questions). This normalizes the legacy
    /// misspelling to `Quarter`; anything else unrecognized is fatal.
    fn try_from(tag: &str) -> Result<Self, Self::Error> {
        match tag {
            "full" => Ok(RangeMode::Full),
            "half" => Ok(RangeMode::Half),
            "quarter" | "quater" => Ok(RangeMode::Quarter),
            "dual" => Ok(RangeMode::Dual),
            other => Err(PipelineError::InvalidSystem {
                system_id: format!("unknown rangeMode {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub min: Address,
    pub max: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryRange {
    Single(MemoryRegion),
    Dual(MemoryRegion, MemoryRegion),
}

/// A contiguous, 4-byte-aligned subdivision of a system's memory space
/// (§4.1, GLOSSARY "Range").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub label: &'static str,
    pub min: Address,
    pub max: Address,
}

impl MemRange {
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.min && addr <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDescriptor {
    pub name: String,
    pub mask: Option<u32>,
    pub memory_range: MemoryRange,
    pub use_24_bit: bool,
    pub use_big_endian: bool,
    pub range_mode: RangeMode,
}

fn align_down_4(v: u32) -> u32 {
    v & !3
}

/// Split `region` into its 4-byte-aligned low/high halves, covering it
/// contiguously without gaps (§4.1 `half`).
fn halve(region: MemoryRegion, low_label: &'static str, high_label: &'static str) -> (MemRange, MemRange) {
    let mid = align_down_4(region.min + (region.max - region.min) / 2);
    let low = MemRange {
        label: low_label,
        min: region.min,
        max: mid - 4,
    };
    let high = MemRange {
        label: high_label,
        min: mid,
        max: region.max,
    };
    (low, high)
}

/// Split `region` into four contiguous, 4-byte-aligned quarters of equal
/// `floor(size/4)`; the last quarter absorbs the remainder (§4.1 `quarter`).
fn quarter(region: MemoryRegion) -> [MemRange; 4] {
    let size = region.max - region.min + 1;
    let q = align_down_4(size / 4);
    let r0 = region.min;
    let r1 = r0 + q;
    let r2 = r1 + q;
    let r3 = r2 + q;
    [
        MemRange {
            label: "q0",
            min: r0,
            max: r1 - 4,
        },
        MemRange {
            label: "q1",
            min: r1,
            max: r2 - 4,
        },
        MemRange {
            label: "q2",
            min: r2,
            max: r3 - 4,
        },
        MemRange {
            label: "q3",
            min: r3,
            max: region.max,
        },
    ]
}

impl SystemDescriptor {
    /// Derive the range list per `rangeMode`: one, two, or four labelled
    /// ranges that cover the whole memory space without gaps, 4-byte aligned
    /// (§4.1).
    pub fn ranges(&self) -> Vec<MemRange> {
        match (self.range_mode, self.memory_range) {
            (RangeMode::Full, MemoryRange::Single(region)) => vec![MemRange {
                label: "full",
                min: region.min,
                max: region.max,
            }],
            (RangeMode::Half, MemoryRange::Single(region)) => {
                let (low, high) = halve(region, "half-low", "half-high");
                vec![low, high]
            }
            (RangeMode::Quarter, MemoryRange::Single(region)) => quarter(region).to_vec(),
            (RangeMode::Dual, MemoryRange::Dual(a, b)) => {
                let (a_low, a_high) = halve(a, "a-low", "a-high");
                let (b_low, b_high) = halve(b, "b-low", "b-high");
                vec![a_low, a_high, b_low, b_high]
            }
            _ => {
                // A mismatched (rangeMode, memoryRange) pair is a malformed
                // catalogue entry; fall back to treating the first region as
                // the whole space rather than panicking.
                let region = match self.memory_range {
                    MemoryRange::Single(r) => r,
                    MemoryRange::Dual(r, _) => r,
                };
                vec![MemRange {
                    label: "full",
                    min: region.min,
                    max: region.max,
                }]
            }
        }
    }

    /// 0-based index of the range containing `addr`, or [`NO_RANGE`] if
    /// `addr` falls outside every derived range (§4.1).
    pub fn range_index(&self, addr: Address) -> usize {
        self.ranges()
            .iter()
            .position(|r| r.contains(addr))
            .unwrap_or(NO_RANGE)
    }

    /// Apply this system's pointer mask, if any (§3).
    pub fn mask_value(&self, value: u32) -> u32 {
        match self.mask {
            Some(mask) => value & mask,
            None => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(min: u32, max: u32) -> MemoryRegion {
        MemoryRegion { min, max }
    }

    #[test]
    fn full_range_covers_whole_space() {
        let sys = SystemDescriptor {
            name: "test".into(),
            mask: None,
            memory_range: MemoryRange::Single(single(0x8000_0000, 0x8000_FFFF)),
            use_24_bit: false,
            use_big_endian: false,
            range_mode: RangeMode::Full,
        };
        let ranges = sys.ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].min, 0x8000_0000);
        assert_eq!(ranges[0].max, 0x8000_FFFF);
    }

    #[test]
    fn half_range_covers_contiguously_without_gaps() {
        let sys = SystemDescriptor {
            name: "test".into(),
            mask: None,
            memory_range: MemoryRange::Single(single(0x8000_0000, 0x8000_FFFF)),
            use_24_bit: false,
            use_big_endian: false,
            range_mode: RangeMode::Half,
        };
        let ranges = sys.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].min, 0x8000_0000);
        assert_eq!(ranges[1].max, 0x8000_FFFF);
        assert_eq!(ranges[1].min, ranges[0].max + 4);
        for r in &ranges {
            assert_eq!(r.min % 4, 0);
            assert_eq!((r.max + 1) % 4, 0);
        }
    }

    #[test]
    fn quarter_range_absorbs_remainder_in_last_range() {
        let sys = SystemDescriptor {
            name: "test".into(),
            mask: None,
            memory_range: MemoryRange::Single(single(0, 99)),
            use_24_bit: false,
            use_big_endian: false,
            range_mode: RangeMode::Quarter,
        };
        let ranges = sys.ranges();
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].min, 0);
        assert_eq!(ranges.last().unwrap().max, 99);
        // no gaps, no overlaps
        for w in ranges.windows(2) {
            assert_eq!(w[1].min, w[0].max + 4);
        }
    }

    #[test]
    fn dual_range_produces_four_labelled_ranges() {
        let sys = SystemDescriptor {
            name: "test".into(),
            mask: None,
            memory_range: MemoryRange::Dual(
                single(0x8000_0000, 0x8000_FFFF),
                single(0x9000_0000, 0x9000_FFFF),
            ),
            use_24_bit: false,
            use_big_endian: false,
            range_mode: RangeMode::Dual,
        };
        let ranges = sys.ranges();
        assert_eq!(ranges.len(), 4);
    }

    #[test]
    fn range_index_finds_outside_sentinel() {
        let sys = SystemDescriptor {
            name: "test".into(),
            mask: None,
            memory_range: MemoryRange::Single(single(0x8000_0000, 0x8000_FFFF)),
            use_24_bit: false,
            use_big_endian: false,
            range_mode: RangeMode::Full,
        };
        assert_eq!(sys.range_index(0x8000_0100), 0);
        assert_eq!(sys.range_index(0x7000_0000), NO_RANGE);
    }

    #[test]
    fn range_mode_normalizes_legacy_misspelling() {
        assert_eq!(RangeMode::try_from("quater").unwrap(), RangeMode::Quarter);
        assert_eq!(RangeMode::try_from("quarter").unwrap(), RangeMode::Quarter);
        assert!(RangeMode::try_from("bogus").is_err());
    }

    #[test]
    fn mask_value_applies_mask_when_present() {
        let sys = SystemDescriptor {
            name: "test".into(),
            mask: Some(0x1FFF_FFFF),
            memory_range: MemoryRange::Single(single(0, 0xFFFF_FFFF)),
            use_24_bit: false,
            use_big_endian: false,
            range_mode: RangeMode::Full,
        };
        assert_eq!(sys.mask_value(0xFFFF_FFFF), 0x1FFF_FFFF);

        let unmasked = SystemDescriptor { mask: None, ..sys };
        assert_eq!(unmasked.mask_value(0xFFFF_FFFF), 0xFFFF_FFFF);
    }
}
