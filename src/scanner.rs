//! Forward scanner (C5, §4.5): precomputes per-node offset bitmaps, then
//! runs a chunked depth-first traversal from every base pointer, requiring
//! cross-batch agreement at each step.

use ahash::{AHashMap, AHashSet};
use itertools::Itertools;

use crate::config::{BITMAP_MEMORY_BUDGET_WORDS, BITMAP_WORD_SPAN_BYTES, ENTRY_POINT_BATCH_FRACTION, ENTRY_POINT_MODAL_OFFSET_FRACTION};
use crate::types::{Address, OffsetPath, PointerValue, TargetPath};

/// `address -> row index` lookup, built once per batch (§4.5, §9 "scratch"
/// preallocation note).
#[derive(Debug, Clone, Default)]
pub struct BatchIndex {
    map: AHashMap<Address, usize>,
}

impl BatchIndex {
    pub fn build(addresses: &[Address]) -> Self {
        let mut map = AHashMap::default();
        map.reserve(addresses.len());
        for (i, &addr) in addresses.iter().enumerate() {
            map.insert(addr, i);
        }
        BatchIndex { map }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.map.contains_key(&addr)
    }
}

/// A known structure or entry-point node, for the "every batch names the
/// same structure" merge check in DFS step 2 (§4.5, §9 arena+index model).
#[derive(Debug, Clone, Copy)]
pub struct NodeOwner {
    pub structure_id: u64,
    pub build_offset: u32,
}

/// One bitmap word covers exactly `BITMAP_WORD_SPAN_BYTES` (128 = 0x80)
/// bytes — one DFS chunk — so `chunk_index` maps directly onto the word
/// array with no remainder (§4.5, §9 bit-for-bit fallback-match note).
pub fn compute_bitmap_word(
    base_value: PointerValue,
    chunk_start: u32,
    index: &BatchIndex,
) -> u32 {
    let mut word = 0u32;
    for k in 0..32u32 {
        let addr = base_value.wrapping_add(chunk_start).wrapping_add(k * 4);
        if index.contains(addr) {
            word |= 1 << k;
        }
    }
    word
}

/// Precomputed per-node bitmap store: `node -> [word; batch_count * words_per_batch]`.
#[derive(Debug, Default)]
pub struct BitmapStore {
    words_per_node_per_batch: usize,
    data: AHashMap<Address, Vec<u32>>,
}

impl BitmapStore {
    /// `S = min(ceil(maxBreadth / 128), floor((20 * 2^20) / (N * B)))`, at
    /// least 1 (§4.5).
    pub fn words_per_batch(max_breadth: u32, node_count: usize, batch_count: usize) -> usize {
        if node_count == 0 || batch_count == 0 {
            return 1;
        }
        let by_breadth = (max_breadth as u64).div_ceil(BITMAP_WORD_SPAN_BYTES as u64);
        let by_budget = BITMAP_MEMORY_BUDGET_WORDS / (node_count as u64 * batch_count as u64);
        by_breadth.min(by_budget).max(1) as usize
    }

    /// Precompute bitmaps for `traversal_nodes` (union of all batch
    /// addresses minus base pointers) across every batch, using each node's
    /// per-batch value and that batch's index (§4.5).
    pub fn precompute(
        traversal_nodes: &AHashSet<Address>,
        batch_count: usize,
        max_breadth: u32,
        batch_values: impl Fn(Address, usize) -> Option<PointerValue>,
        batch_indexes: &[BatchIndex],
    ) -> Self {
        let words_per_batch = Self::words_per_batch(max_breadth, traversal_nodes.len(), batch_count);
        let mut data = AHashMap::default();
        data.reserve(traversal_nodes.len());

        for &node in traversal_nodes.iter() {
            let mut words = vec![0u32; words_per_batch * batch_count];
            for b in 0..batch_count {
                let Some(value) = batch_values(node, b) else {
                    continue;
                };
                for s in 0..words_per_batch {
                    let chunk_start = (s as u32) * BITMAP_WORD_SPAN_BYTES;
                    words[b * words_per_batch + s] =
                        compute_bitmap_word(value, chunk_start, &batch_indexes[b]);
                }
            }
            data.insert(node, words);
        }

        BitmapStore {
            words_per_node_per_batch: words_per_batch,
            data
        }
    }

    pub fn words_per_batch_count(&self) -> usize {
        self.words_per_node_per_batch
    }

    /// Word for `node` at chunk `chunk_index` in batch `b`, or `None` if the
    /// node has no precomputed bitmap or the chunk falls outside coverage.
    pub fn word(&self, node: Address, b: usize, chunk_index: usize) -> Option<u32> {
        let words = self.data.get(&node)?;
        if chunk_index >= self.words_per_node_per_batch {
            return None;
        }
        words.get(b * self.words_per_node_per_batch + chunk_index).copied()
    }
}

/// Tuning passed into the DFS driver, collapsed from [`crate::config::RuntimeConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub max_breadth: u32,
    pub max_depth: u32,
    pub early_out_target: bool,
    pub early_out_base_pointer: bool,
}

/// Per-base-pointer DFS outcome (§4.5).
#[derive(Debug, Clone)]
pub enum ScanHit {
    TargetPath(TargetPath),
    EntryPoint {
        root: Address,
        path: OffsetPath,
        structure_id: u64,
        build_offset: u32,
    },
    MovingEntryPoint {
        root: Address,
        path: OffsetPath,
        build_offset: u32,
    },
    None,
}

/// Scan one base pointer's chunked offset space (§4.5 "Chunked DFS").
/// `current_value` returns batch `b`'s current pointer value given the
/// traversal address reached so far (falls through to the on-the-fly bit
/// computation when no precomputed bitmap covers a node, per §9's
/// bit-for-bit parity requirement).
#[allow(clippy::too_many_arguments)]
pub fn scan_base_pointer(
    root: Address,
    base_values: &[PointerValue],
    batch_indexes: &[BatchIndex],
    target_nodes: &[AHashSet<Address>],
    node_owner: &AHashMap<Address, NodeOwner>,
    bitmaps: &BitmapStore,
    opts: ScanOptions,
) -> ScanHit {
    let batch_count = base_values.len();
    if batch_count == 0 || opts.max_breadth == 0 {
        return ScanHit::None;
    }

    let mut current: Vec<PointerValue> = base_values.to_vec();
    let mut path: OffsetPath = OffsetPath::new();
    let mut depth = 1u32;

    loop {
        // Step 1: every batch's current address is an injected target.
        if current.iter().enumerate().all(|(b, &v)| target_nodes[b].contains(&v)) {
            return ScanHit::TargetPath(TargetPath {
                base_pointer: root,
                path,
                target_address: current[0],
            });
        }

        // Step 2: every batch's current address names the same structure.
        if let Some(&first_owner) = node_owner.get(&current[0]) {
            let all_same = current
                .iter()
                .all(|&v| node_owner.get(&v).map(|o| o.structure_id) == Some(first_owner.structure_id));
            if all_same {
                return ScanHit::EntryPoint {
                    root,
                    path,
                    structure_id: first_owner.structure_id,
                    build_offset: first_owner.build_offset,
                };
            }
        }

        if depth > opts.max_depth {
            return ScanHit::None;
        }

        let mut chosen: Option<u32> = None;
        'chunks: for chunk_start in (0..=opts.max_breadth).step_by(BITMAP_WORD_SPAN_BYTES as usize) {
            let chunk_index = (chunk_start / BITMAP_WORD_SPAN_BYTES) as usize;
            let mut combined = 0xFFFF_FFFFu32;
            for b in 0..batch_count {
                let word = bitmaps
                    .word(current[b], b, chunk_index)
                    .unwrap_or_else(|| compute_bitmap_word(current[b], chunk_start, &batch_indexes[b]));
                combined &= word;
                if combined == 0 {
                    break;
                }
            }
            if combined == 0 {
                continue;
            }

            let bit = combined.trailing_zeros();
            let candidate = chunk_start + bit * 4;
            if candidate > opts.max_breadth {
                continue;
            }
            chosen = Some(candidate);
            break 'chunks;
        }

        let Some(chosen_offset) = chosen else {
            return ScanHit::None;
        };

        // Step 5: majority-vote entry detection before committing the hop.
        let mut target_hits = 0usize;
        let mut offset_votes: AHashMap<u32, usize> = AHashMap::default();
        for b in 0..batch_count {
            let next = current[b].wrapping_add(chosen_offset);
            let hits_target = target_nodes[b].contains(&next);
            let owner = node_owner.get(&next);
            if hits_target || owner.is_some() {
                target_hits += 1;
            }
            if let Some(o) = owner {
                *offset_votes.entry(o.build_offset).or_insert(0) += 1;
            }
        }
        let batch_threshold = (ENTRY_POINT_BATCH_FRACTION * batch_count as f64) as usize;
        if target_hits > batch_threshold {
            if let Some((&modal_offset, &modal_count)) = offset_votes.iter().sorted_by_key(|&(&k, _)| k).max_by_key(|&(_, &c)| c) {
                if modal_count as f64 > ENTRY_POINT_MODAL_OFFSET_FRACTION * target_hits as f64 {
                    let mut final_path = path.clone();
                    final_path.push(chosen_offset);
                    return ScanHit::MovingEntryPoint {
                        root,
                        path: final_path,
                        build_offset: modal_offset,
                    };
                }
            }
        }

        // Step 6: advance every batch.
        for b in 0..batch_count {
            current[b] = current[b].wrapping_add(chosen_offset);
        }
        path.push(chosen_offset);
        depth += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_per_batch_respects_memory_budget() {
        let tiny_budget_nodes = 20 * 1024 * 1024; // forces budget term below 1 before max(1)
        let words = BitmapStore::words_per_batch(0xFFC, tiny_budget_nodes, 10);
        assert_eq!(words, 1);
    }

    #[test]
    fn words_per_batch_caps_at_breadth_derived_value() {
        let words = BitmapStore::words_per_batch(0x80, 1, 1);
        assert_eq!(words, 1); // ceil(0x80/128) = 1
    }

    #[test]
    fn bitmap_word_matches_manual_bit_layout() {
        let index = BatchIndex::build(&[0x1000, 0x1004, 0x1010]);
        let word = compute_bitmap_word(0x1000, 0, &index);
        assert_eq!(word & 0b1, 1); // k=0 -> 0x1000, present
        assert_eq!((word >> 1) & 0b1, 1); // k=1 -> 0x1004, present
        assert_eq!((word >> 2) & 0b1, 0); // k=2 -> 0x1008, absent
        assert_eq!((word >> 4) & 0b1, 1); // k=4 -> 0x1010, present
    }

    #[test]
    fn scenario_6_target_path_is_found() {
        let batch_indexes = vec![
            BatchIndex::build(&[0x8020_0004]),
            BatchIndex::build(&[0x8020_0044]),
        ];
        let mut target_nodes = vec![AHashSet::default(), AHashSet::default()];
        target_nodes[0].insert(0x8020_0004);
        target_nodes[1].insert(0x8020_0044);

        let traversal_nodes: AHashSet<Address> = AHashSet::default();
        let bitmaps = BitmapStore::precompute(&traversal_nodes, 2, 0xFFC, |_, _| None, &batch_indexes);

        let base_values = vec![0x8020_0000u32, 0x8020_0040u32];
        let node_owner: AHashMap<Address, NodeOwner> = AHashMap::default();
        let opts = ScanOptions {
            max_breadth: 0xFFC,
            max_depth: 12,
            early_out_target: false,
            early_out_base_pointer: false,
        };

        let hit = scan_base_pointer(
            0x8010_0000,
            &base_values,
            &batch_indexes,
            &target_nodes,
            &node_owner,
            &bitmaps,
            opts,
        );

        match hit {
            ScanHit::TargetPath(tp) => {
                assert_eq!(tp.path.as_slice(), &[0x4]);
                assert_eq!(tp.target_address, 0x8020_0004);
            }
            other => panic!("expected TargetPath, got {other:?}"),
        }
    }

    #[test]
    fn zero_max_breadth_emits_no_findings() {
        let batch_indexes = vec![BatchIndex::build(&[])];
        let target_nodes = vec![AHashSet::default()];
        let traversal_nodes: AHashSet<Address> = AHashSet::default();
        let bitmaps = BitmapStore::precompute(&traversal_nodes, 1, 0, |_, _| None, &batch_indexes);
        let node_owner = AHashMap::default();
        let opts = ScanOptions {
            max_breadth: 0,
            max_depth: 12,
            early_out_target: false,
            early_out_base_pointer: false,
        };
        let hit = scan_base_pointer(
            0x100,
            &[0x200],
            &batch_indexes,
            &target_nodes,
            &node_owner,
            &bitmaps,
            opts,
        );
        assert!(matches!(hit, ScanHit::None));
    }

    #[test]
    fn max_depth_one_only_inspects_first_hop() {
        // A target two hops away should not be found when maxDepth=1.
        let batch_indexes = vec![BatchIndex::build(&[0x300, 0x400])];
        let mut target_nodes = vec![AHashSet::default()];
        target_nodes[0].insert(0x400);
        let traversal_nodes: AHashSet<Address> = [0x300].into_iter().collect();
        let bitmaps = BitmapStore::precompute(
            &traversal_nodes,
            1,
            0xFFC,
            |addr, _| if addr == 0x300 { Some(0x100) } else { None },
            &batch_indexes,
        );
        let node_owner = AHashMap::default();
        let opts = ScanOptions {
            max_breadth: 0xFFC,
            max_depth: 1,
            early_out_target: false,
            early_out_base_pointer: false,
        };
        let hit = scan_base_pointer(
            0x1,
            &[0x200], // current[0] = 0x200, first hop to 0x300 (not target)
            &batch_indexes,
            &target_nodes,
            &node_owner,
            &bitmaps,
            opts,
        );
        // depth starts at 1; after the first hop depth becomes 2 > maxDepth(1),
        // so the second-hop check (which would find 0x400) never runs.
        assert!(matches!(hit, ScanHit::None));
    }
}
