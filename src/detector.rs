//! List detector (C4, §4.4): sweeps offsets `0x00..=0x3C` over the
//! StaticStatic pool (static pass) and over per-batch working sets derived
//! from StaticNodes (dynamic pass), consuming winning chains into the
//! target-node pools as it goes.

use ahash::{AHashMap, AHashSet};
use itertools::Itertools;

use crate::chain_walker::{resolve_chain_conflicts, walk_chains_at_offset, Chain, WalkOptions};
use crate::config::DETECTOR_OFFSETS;
use crate::types::{Address, EntryPoint, PointerValue, Structure, StructureKind, TargetPools};

/// Dominant stride across a chain's consecutive node addresses: the most
/// frequent `nodes[i+1] - nodes[i]` delta; single-node chains fall back to 4,
/// frequency ties break toward the smallest gap (§4.4).
fn dominant_stride(nodes: &[Address]) -> u32 {
    if nodes.len() < 2 {
        return 4;
    }
    let counts: AHashMap<u32, usize> = nodes
        .windows(2)
        .map(|w| w[1].wrapping_sub(w[0]))
        .counts();
    let max_count = counts.values().copied().max().unwrap_or(0);
    counts
        .into_iter()
        .filter(|&(_, c)| c == max_count)
        .map(|(stride, _)| stride)
        .min()
        .unwrap_or(4)
}

fn chain_to_structure(
    chain: Chain,
    kind: StructureKind,
    build_offset: u32,
    batch_idx: Option<usize>,
) -> Structure {
    let mut addresses = chain.nodes;
    addresses.sort_unstable();
    let stride = dominant_stride(&addresses);
    Structure {
        internal_id: 0, // assigned by the orchestrator when admitted into the arena
        kind,
        root: chain.root,
        node_count: addresses.len(),
        addresses,
        ghosts: chain.ghosts,
        stride,
        build_offset,
        batch_idx,
    }
}

/// Result of the static pass (§4.4): the detected `static_list` structures
/// and whatever StaticStatic addresses survived every offset, for the
/// caller to discard (`skipSticky`) or promote into StaticNodes.
#[derive(Debug, Default)]
pub struct StaticPassResult {
    pub structures: Vec<Structure>,
    pub remaining: Vec<(Address, PointerValue)>,
}

/// Static pass: walk each offset smallest-first over a pool that shrinks as
/// chains are consumed, so later offsets never re-detect already-claimed
/// nodes (§4.4).
pub fn detect_static_lists(
    static_statics: &AHashMap<Address, PointerValue>,
    max_ghost_nodes: usize,
    min_chain_length: usize,
    target_nodes: &mut TargetPools,
) -> StaticPassResult {
    let mut pool: AHashSet<Address> = static_statics.keys().copied().collect();
    let mut structures = Vec::new();

    for &offset in DETECTOR_OFFSETS.iter() {
        let opts = WalkOptions {
            min_chain_length,
            max_ghost_nodes,
            target_pool: None,
        };
        let result = walk_chains_at_offset(&pool, offset, |a| static_statics.get(&a).copied(), opts);
        let winners = resolve_chain_conflicts(result.chains);

        for chain in winners {
            for &n in &chain.nodes {
                pool.remove(&n);
            }
            for &g in &chain.ghosts {
                pool.remove(&g);
            }
            for pool_b in target_nodes.iter_mut() {
                pool_b.extend(chain.nodes.iter().copied());
                pool_b.extend(chain.ghosts.iter().copied());
            }
            structures.push(chain_to_structure(chain, StructureKind::StaticList, offset, None));
        }
    }

    let remaining = pool
        .into_iter()
        .map(|addr| (addr, static_statics[&addr]))
        .collect();

    StaticPassResult { structures, remaining }
}

#[derive(Debug, Default)]
pub struct DynamicPassResult {
    pub structures: Vec<Structure>,
    pub entry_points: Vec<EntryPoint>,
}

/// Dynamic pass: one working set per batch, iterated `(offset, batch)`
/// nested in that order to keep findings reproducible (§4.4, §5).
pub fn detect_dynamic_lists(
    static_nodes: &AHashMap<Address, crate::types::Slots>,
    batch_count: usize,
    min_chain_length: usize,
    target_nodes: &mut TargetPools,
) -> DynamicPassResult {
    let mut working_sets: Vec<AHashSet<Address>> = (0..batch_count)
        .map(|b| {
            static_nodes
                .keys()
                .copied()
                .filter(|addr| !target_nodes[b].contains(addr))
                .collect()
        })
        .collect();

    let mut result = DynamicPassResult::default();

    for &offset in DETECTOR_OFFSETS.iter() {
        for b in 0..batch_count {
            let opts = WalkOptions {
                min_chain_length,
                max_ghost_nodes: crate::config::DYNAMIC_MAX_GHOST_NODES,
                target_pool: Some(&target_nodes[b]),
            };
            let walk = walk_chains_at_offset(
                &working_sets[b],
                offset,
                |addr| static_nodes.get(&addr).map(|slots| slots[b]).filter(|&v| v != 0),
                opts,
            );

            let winners = resolve_chain_conflicts(walk.chains);
            for chain in winners {
                for &n in &chain.nodes {
                    working_sets[b].remove(&n);
                }
                target_nodes[b].extend(chain.nodes.iter().copied());
                result.structures.push(chain_to_structure(
                    chain,
                    StructureKind::DynamicList,
                    offset,
                    Some(b),
                ));
            }

            for entry in walk.entry_points {
                for &n in &entry.nodes {
                    working_sets[b].remove(&n);
                }
                result.entry_points.push(EntryPoint {
                    internal_id: 0,
                    root: entry.root,
                    addresses: entry.nodes,
                    build_offset: offset,
                    path: std::iter::once(offset).collect(),
                    batch_idx: Some(b),
                    target_struct: None,
                    claimed: false,
                });
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_BATCHES;
    use crate::types::Slots;

    fn fresh_target_nodes(batch_count: usize) -> TargetPools {
        (0..batch_count).map(|_| AHashSet::default()).collect()
    }

    fn slots(values: &[PointerValue]) -> Slots {
        let mut s: Slots = [0; MAX_BATCHES];
        for (i, &v) in values.iter().enumerate() {
            s[i] = v;
        }
        s
    }

    #[test]
    fn dominant_stride_picks_most_frequent_delta() {
        let nodes = vec![0x100, 0x104, 0x108, 0x200, 0x20C];
        assert_eq!(dominant_stride(&nodes), 4);
    }

    #[test]
    fn dominant_stride_of_short_chain_falls_back_to_4() {
        assert_eq!(dominant_stride(&[0x100]), 4);
    }

    #[test]
    fn scenario_1_static_array_is_detected_whole() {
        // §8 scenario 1: six addresses each pointing at its successor, last
        // wraps to the root.
        let mut pool: AHashMap<Address, PointerValue> = AHashMap::default();
        pool.insert(0x8000_0100, 0x8000_0104);
        pool.insert(0x8000_0104, 0x8000_0108);
        pool.insert(0x8000_0108, 0x8000_010C);
        pool.insert(0x8000_010C, 0x8000_0110);
        pool.insert(0x8000_0110, 0x8000_0114);
        pool.insert(0x8000_0114, 0x8000_0100);

        let mut target_nodes = fresh_target_nodes(1);
        let out = detect_static_lists(&pool, 10, 4, &mut target_nodes);
        assert_eq!(out.structures.len(), 1);
        let s = &out.structures[0];
        assert_eq!(s.root, 0x8000_0100);
        assert_eq!(s.node_count, 6);
        assert_eq!(s.stride, 4);
        assert_eq!(s.build_offset, 0);
        for addr in [
            0x8000_0100u32,
            0x8000_0104,
            0x8000_0108,
            0x8000_010C,
            0x8000_0110,
            0x8000_0114,
        ] {
            assert!(target_nodes[0].contains(&addr));
        }
    }

    #[test]
    fn scenario_2_ghost_bridging_recovers_missing_node() {
        // Same ring as scenario 1 but 0x108 is entirely absent from the
        // pool; since the ghost was never sampled, bridging falls back to
        // address arithmetic (no recorded value to look up) to recover the
        // link.
        let mut pool: AHashMap<Address, PointerValue> = AHashMap::default();
        pool.insert(0x100, 0x104);
        pool.insert(0x104, 0x108);
        pool.insert(0x10C, 0x110);
        pool.insert(0x110, 0x114);
        pool.insert(0x114, 0x100);

        let mut target_nodes = fresh_target_nodes(1);
        let out = detect_static_lists(&pool, 1, 4, &mut target_nodes);
        assert_eq!(out.structures.len(), 1);
        assert_eq!(out.structures[0].ghosts, vec![0x108]);
        assert_eq!(out.structures[0].node_count, 5);
    }

    #[test]
    fn scenario_3_dynamic_list_is_batch_specific() {
        let mut static_nodes: AHashMap<Address, Slots> = AHashMap::default();
        let addrs = [0x100u32, 0x104, 0x108, 0x10C, 0x110, 0x114];
        // Batch 0: A0->A1->...->A5 at offset 0.
        // Batch 1: A0->A2->A4->... (stride 8), which won't chain through the
        // same `getValue` closure reading batch 1's slot.
        static_nodes.insert(addrs[0], slots(&[addrs[1], addrs[2]]));
        static_nodes.insert(addrs[1], slots(&[addrs[2], 0]));
        static_nodes.insert(addrs[2], slots(&[addrs[3], addrs[4]]));
        static_nodes.insert(addrs[3], slots(&[addrs[4], 0]));
        static_nodes.insert(addrs[4], slots(&[addrs[5], 0x9999]));
        static_nodes.insert(addrs[5], slots(&[0x9999, 0]));

        let mut target_nodes = fresh_target_nodes(2);
        let out = detect_dynamic_lists(&static_nodes, 2, 4, &mut target_nodes);
        assert!(out.structures.iter().any(|s| s.batch_idx == Some(0) && s.node_count >= 4));
        assert!(out.structures.iter().all(|s| s.batch_idx != Some(1)));
    }

    #[test]
    fn skip_sticky_leaves_remaining_pool_for_caller_to_discard() {
        let mut pool: AHashMap<Address, PointerValue> = AHashMap::default();
        pool.insert(0x1000, 0x2000); // too short to ever form a static_list
        let mut target_nodes = fresh_target_nodes(1);
        let out = detect_static_lists(&pool, 10, 15, &mut target_nodes);
        assert!(out.structures.is_empty());
        assert_eq!(out.remaining.len(), 1);
        assert_eq!(out.remaining[0], (0x1000, 0x2000));
    }
}
