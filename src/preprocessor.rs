//! Preprocessor (C2, §4.2): absorbs up to `MAX_BATCHES` batches, filters
//! VTable anchors and self-referential rows, maintains the per-address slot
//! pool, and classifies/collapses it into the three typed pools the detector
//! and scanner consume.

use ahash::AHashMap;

use crate::catalogue::{SystemDescriptor, NO_RANGE};
use crate::config::{MAX_BATCHES, SOFT_RECOMMEND_THRESHOLD};
use crate::error::{PipelineError, Result, Stage};
use crate::types::{classify, Address, Classification, CollapsedPools, PointerValue, Slots};

/// A discarded row stays discarded silently; this window bounds how many
/// distinct values can share a single frequency count before a batch is
/// considered pathological. VTable anchors occur "strictly more than 10
/// times" per §4.2.
const VTABLE_ANCHOR_THRESHOLD: usize = 10;

/// Self-reference rejection window `[-44, 4]` inclusive (§4.2).
const SELF_REF_LOW: i64 = -44;
const SELF_REF_HIGH: i64 = 4;

/// Soft recommendation returned by [`Preprocessor::get_counts`] (§4.2).
#[derive(Debug, Clone, Default)]
pub struct Counts {
    pub static_statics_by_range: Vec<usize>,
    pub static_nodes_by_range: Vec<usize>,
    pub dynamic_nodes_total: usize,
    pub warning: Option<String>,
    pub skip_sticky_recommended: bool,
}

/// Per-batch filtering/storage state. Owns the node pool until `collapse()`
/// (§3 lifecycle).
pub struct Preprocessor {
    system: SystemDescriptor,
    pool: AHashMap<Address, Slots>,
    batch_count: usize,
    warn_base_pointer_threshold: usize,
}

impl Preprocessor {
    pub fn new(system: SystemDescriptor, warn_base_pointer_threshold: usize) -> Self {
        Preprocessor {
            system,
            pool: AHashMap::default(),
            batch_count: 0,
            warn_base_pointer_threshold,
        }
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Replace the active system and reset all state (§4.2: "changing the
    /// active system resets all state").
    pub fn set_system(&mut self, system: SystemDescriptor) {
        self.system = system;
        self.pool.clear();
        self.batch_count = 0;
    }

    fn vtable_anchors(values: &[PointerValue]) -> ahash::AHashSet<PointerValue> {
        let mut freq: AHashMap<PointerValue, usize> = AHashMap::default();
        for &v in values {
            *freq.entry(v).or_insert(0) += 1;
        }
        freq.into_iter()
            .filter(|&(_, count)| count > VTABLE_ANCHOR_THRESHOLD)
            .map(|(v, _)| v)
            .collect()
    }

    fn is_self_reference(&self, address: Address, value: PointerValue) -> bool {
        let masked = self.system.mask_value(value);
        let diff = address as i64 - masked as i64;
        (SELF_REF_LOW..=SELF_REF_HIGH).contains(&diff)
    }

    /// Filter and merge one batch into the pool, returning fresh per-range
    /// counts (§4.2).
    pub fn add_batch(&mut self, addresses: &[Address], values: &[PointerValue]) -> Result<Counts> {
        if self.batch_count >= MAX_BATCHES {
            return Err(PipelineError::BatchLimitExceeded {
                attempted: self.batch_count + 1,
                max: MAX_BATCHES,
            });
        }
        debug_assert_eq!(addresses.len(), values.len());

        let anchors = Self::vtable_anchors(values);
        let batch_index = self.batch_count;

        for (&addr, &value) in addresses.iter().zip(values.iter()) {
            if anchors.contains(&value) {
                continue;
            }
            if self.is_self_reference(addr, value) {
                continue;
            }
            let slots = self.pool.entry(addr).or_insert([0; MAX_BATCHES]);
            slots[batch_index] = value;
        }

        self.batch_count += 1;
        Ok(self.get_counts())
    }

    /// Shift batch slots down to remove batch `i`, pruning addresses left
    /// fully empty (§4.2).
    pub fn remove_batch(&mut self, i: usize) -> Result<()> {
        if i >= self.batch_count {
            return Err(PipelineError::InvalidBatchIndex {
                index: i,
                count: self.batch_count,
            });
        }
        self.pool.retain(|_, slots| {
            for b in i..self.batch_count - 1 {
                slots[b] = slots[b + 1];
            }
            slots[self.batch_count - 1] = 0;
            slots[..self.batch_count - 1].iter().any(|&v| v != 0)
        });
        self.batch_count -= 1;
        Ok(())
    }

    /// Tally per-range StaticStatic/StaticNode counts and total DynamicNode
    /// count in a single pass, plus the soft recommendation (§4.2).
    pub fn get_counts(&self) -> Counts {
        let ranges = self.system.ranges();
        let mut static_statics_by_range = vec![0usize; ranges.len()];
        let mut static_nodes_by_range = vec![0usize; ranges.len()];
        let mut dynamic_nodes_total = 0usize;

        for (&addr, slots) in self.pool.iter() {
            let idx = self.system.range_index(addr);
            match classify(slots, self.batch_count.max(1)) {
                Classification::StaticStatic => {
                    if idx != NO_RANGE {
                        static_statics_by_range[idx] += 1;
                    }
                }
                Classification::StaticNode => {
                    if idx != NO_RANGE {
                        static_nodes_by_range[idx] += 1;
                    }
                }
                Classification::DynamicNode => dynamic_nodes_total += 1,
            }
        }

        let t = static_statics_by_range.first().copied().unwrap_or(0)
            + static_nodes_by_range.first().copied().unwrap_or(0);
        let warning = if t <= SOFT_RECOMMEND_THRESHOLD {
            None
        } else if t > self.warn_base_pointer_threshold {
            let msg = format!(
                "range 0 has {t} static candidates; scan time will be high — recommend skipSticky"
            );
            log::warn!("{msg}");
            Some(msg)
        } else {
            None
        };

        Counts {
            static_statics_by_range,
            static_nodes_by_range,
            dynamic_nodes_total,
            warning,
            skip_sticky_recommended: true,
        }
    }

    /// Apply the mask, classify every address, and release the pool (§3,
    /// §4.2). Consumes `self`: after collapse the scanner/detector own all
    /// per-batch state.
    pub fn collapse(mut self) -> Result<CollapsedPools> {
        let before = self.get_counts();

        let mut static_statics = AHashMap::default();
        let mut static_nodes = AHashMap::default();
        let mut dynamic_nodes = AHashMap::default();

        for (addr, mut slots) in self.pool.drain() {
            for slot in slots.iter_mut() {
                if *slot != 0 {
                    *slot = self.system.mask_value(*slot);
                }
            }
            match classify(&slots, self.batch_count.max(1)) {
                Classification::StaticStatic => {
                    static_statics.insert(addr, slots[0]);
                }
                Classification::StaticNode => {
                    static_nodes.insert(addr, slots);
                }
                Classification::DynamicNode => {
                    dynamic_nodes.insert(addr, slots);
                }
            }
        }

        let total_before: usize = before
            .static_statics_by_range
            .iter()
            .sum::<usize>()
            + before.static_nodes_by_range.iter().sum::<usize>()
            + before.dynamic_nodes_total;
        let total_after = static_statics.len() + static_nodes.len() + dynamic_nodes.len();
        if total_before != total_after {
            return Err(PipelineError::InternalInvariantViolation {
                stage: Stage::Preprocess,
                detail: format!(
                    "collapse tallied {total_after} addresses but get_counts reported {total_before}"
                ),
            });
        }

        Ok(CollapsedPools {
            batch_count: self.batch_count,
            static_statics,
            static_nodes,
            dynamic_nodes,
        })
    }
}
