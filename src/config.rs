use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Absolute cap on batches a [`crate::preprocessor::Preprocessor`] will absorb (§2/§4.2).
pub const MAX_BATCHES: usize = 10;

/// `T <= SOFT_RECOMMEND_THRESHOLD` in range 0 needs no warning (§4.2).
pub const SOFT_RECOMMEND_THRESHOLD: usize = 30_000;

/// Default `warnBasePointerThreshold` (§4.2).
pub const DEFAULT_WARN_BASE_POINTER_THRESHOLD: usize = 50_000;

/// Static-list detection always tightens `minChainLength` to this value,
/// regardless of [`RuntimeConfig::min_chain_length`] (§4.4, §6).
pub const STATIC_MIN_CHAIN_LENGTH: usize = 15;

/// Dynamic-list detection always forces `maxGhostNodes` to zero (§4.4).
pub const DYNAMIC_MAX_GHOST_NODES: usize = 0;

/// Offsets swept by the list detector: 0x00..=0x3C step 4 (§4.4).
pub const DETECTOR_OFFSETS: [u32; 16] = [
    0x00, 0x04, 0x08, 0x0C, 0x10, 0x14, 0x18, 0x1C, 0x20, 0x24, 0x28, 0x2C, 0x30, 0x34, 0x38, 0x3C,
];

/// Byte budget for the forward scanner's precomputed bitmap store (§4.5, §5).
pub const BITMAP_MEMORY_BUDGET_WORDS: u64 = 20 * 1024 * 1024;

/// Bytes spanned by one offset-bitmap word: 32 bits * 4 bytes/offset (§4.5).
pub const BITMAP_WORD_SPAN_BYTES: u32 = 32 * 4;

/// Moving-entry-point detection thresholds (§4.5 step 5, Open Question 3 in
/// `SPEC_FULL.md` §D): named rather than configurable, since §6 does not list
/// them as runtime configuration keys.
pub const ENTRY_POINT_BATCH_FRACTION: f64 = 0.66;
pub const ENTRY_POINT_MODAL_OFFSET_FRACTION: f64 = 0.5;

fn default_min_chain_length() -> usize {
    5
}
fn default_max_ghost_nodes() -> usize {
    10
}
fn default_max_breadth() -> u32 {
    0x0FFC
}
fn default_max_depth() -> u32 {
    12
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_enabled_ranges() -> BTreeSet<usize> {
    [0usize].into_iter().collect()
}
fn default_warn_threshold() -> usize {
    DEFAULT_WARN_BASE_POINTER_THRESHOLD
}

/// Runtime configuration keys read once at stage start (§6). Deserializable
/// with `serde` so a host can load it from JSON alongside the system table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub min_chain_length: usize,
    pub max_ghost_nodes: usize,
    pub max_breadth: u32,
    pub max_depth: u32,
    pub skip_sticky_pointers: bool,
    pub early_out_base_pointer: bool,
    pub early_out_target: bool,
    pub enabled_ranges: BTreeSet<usize>,
    pub warn_base_pointer_threshold: usize,
    /// Not a §6 key: whether [`crate::runtime::scan_progress_bar`] renders a
    /// visible bar. Off by default since library callers own their own UI;
    /// the CLI binary flips it on.
    #[serde(default)]
    pub show_progress_bar: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            min_chain_length: default_min_chain_length(),
            max_ghost_nodes: default_max_ghost_nodes(),
            max_breadth: default_max_breadth(),
            max_depth: default_max_depth(),
            skip_sticky_pointers: default_true(),
            early_out_base_pointer: default_false(),
            early_out_target: default_false(),
            enabled_ranges: default_enabled_ranges(),
            warn_base_pointer_threshold: default_warn_threshold(),
            show_progress_bar: default_false(),
        }
    }
}

impl RuntimeConfig {
    /// `maxBreadth` masked with `& ~3` per §6.
    pub fn max_breadth_masked(&self) -> u32 {
        self.max_breadth & !3
    }

    /// `maxDepth` clamped to the accepted 1..=20 range per §6.
    pub fn max_depth_clamped(&self) -> u32 {
        self.max_depth.clamp(1, 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.min_chain_length, 5);
        assert_eq!(cfg.max_ghost_nodes, 10);
        assert_eq!(cfg.max_breadth, 0x0FFC);
        assert_eq!(cfg.max_depth, 12);
        assert!(cfg.skip_sticky_pointers);
        assert!(!cfg.early_out_base_pointer);
        assert!(!cfg.early_out_target);
        assert_eq!(cfg.enabled_ranges, [0usize].into_iter().collect());
    }

    #[test]
    fn roundtrips_through_json() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn max_breadth_is_masked_to_4_byte_alignment() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_breadth = 0x1003;
        assert_eq!(cfg.max_breadth_masked(), 0x1000);
    }

    #[test]
    fn max_depth_clamps_into_accepted_range() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_depth = 99;
        assert_eq!(cfg.max_depth_clamped(), 20);
        cfg.max_depth = 0;
        assert_eq!(cfg.max_depth_clamped(), 1);
    }
}
