//! Chain walker (C3, §4.3): the shared offset-following traversal used by
//! both the static and dynamic list detectors. A pure function of
//! `(pool, offset, getValue, opts)`, with no back-references to the caller.

use ahash::{AHashMap, AHashSet};

use crate::types::{Address, PointerValue};

/// Per-call tuning (§4.3). `target_pool` is `None` for the static pass and
/// `Some` for the dynamic pass, where chains terminating in an existing
/// target set become entry points instead of plain chains.
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions<'a> {
    pub min_chain_length: usize,
    pub max_ghost_nodes: usize,
    pub target_pool: Option<&'a AHashSet<Address>>,
}

/// One followed chain: a root address, the nodes visited in order, and any
/// ghost addresses bridged over (§4.3, §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub root: Address,
    pub nodes: Vec<Address>,
    pub ghosts: Vec<Address>,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A chain that terminated inside `target_pool` (§4.3 emit rule 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWalk {
    pub root: Address,
    pub nodes: Vec<Address>,
    pub ghosts: Vec<Address>,
    pub target_hit: Address,
}

#[derive(Debug, Clone, Default)]
pub struct WalkResult {
    pub chains: Vec<Chain>,
    pub entry_points: Vec<EntryWalk>,
}

/// Identify heads: addresses in `pool` that nothing else in `pool` points
/// to via this offset (§4.3 "head identification"). A pool that forms a
/// closed ring has no such address; fall back to every pool address sorted
/// ascending so the cycle still gets walked once, from its smallest node.
fn find_heads(
    pool: &AHashSet<Address>,
    offset: u32,
    get_value: impl Fn(Address) -> Option<PointerValue>,
) -> Vec<Address> {
    let mut pointed_to: AHashSet<Address> = AHashSet::default();
    for &addr in pool.iter() {
        if let Some(value) = get_value(addr) {
            let next = value.wrapping_add(offset);
            if pool.contains(&next) {
                pointed_to.insert(next);
            }
        }
    }
    let mut heads: Vec<Address> = pool
        .iter()
        .copied()
        .filter(|a| !pointed_to.contains(a))
        .collect();
    if heads.is_empty() {
        heads.extend(pool.iter().copied());
    }
    heads.sort_unstable();
    heads
}

enum WalkOutcome {
    HitTarget(Address),
    Chain,
}

/// Walk a single chain from `root`, honoring targetPool termination, pool
/// membership, and a *cumulative* ghost-bridging budget across the whole
/// chain (§4.3 steps 1-5).
fn walk_one(
    root: Address,
    pool: &AHashSet<Address>,
    offset: u32,
    get_value: &impl Fn(Address) -> Option<PointerValue>,
    opts: &WalkOptions,
) -> (Vec<Address>, Vec<Address>, WalkOutcome) {
    let mut nodes = Vec::new();
    let mut ghosts = Vec::new();
    let mut ghost_budget = opts.max_ghost_nodes;
    let mut current = root;
    let mut seen: AHashSet<Address> = AHashSet::default();

    loop {
        if let Some(targets) = opts.target_pool {
            if targets.contains(&current) {
                return (nodes, ghosts, WalkOutcome::HitTarget(current));
            }
        }
        if !pool.contains(&current) {
            break;
        }
        if !seen.insert(current) {
            break; // closed ring: back at an already-visited node
        }
        let Some(value) = get_value(current) else {
            break;
        };
        nodes.push(current);

        let expected = value.wrapping_add(offset);
        if pool.contains(&expected) {
            current = expected;
            continue;
        }
        if let Some(targets) = opts.target_pool {
            if targets.contains(&expected) {
                return (nodes, ghosts, WalkOutcome::HitTarget(expected));
            }
        }

        // Ghost bridging: spend the remaining cumulative budget hopping
        // forward until we land back in the pool. When the ghost address was
        // itself sampled (just never classified into a pool), follow its own
        // recorded value the same way a real node would be followed; a
        // zero `offset` would otherwise never advance (`bridge + 0 == bridge`
        // forever). When nothing was recorded for it at all, fall back to
        // stepping by `offset` (or the minimum 4-byte alignment when `offset`
        // is zero) to probe the next candidate slot.
        let mut bridge = expected;
        let mut bridged_to = None;
        let mut spent = 0usize;
        while spent < ghost_budget {
            spent += 1;
            let after_bridge = match get_value(bridge) {
                Some(v) => v.wrapping_add(offset),
                None => bridge.wrapping_add(offset.max(4)),
            };
            if pool.contains(&after_bridge) {
                bridged_to = Some((bridge, after_bridge));
                break;
            }
            if let Some(targets) = opts.target_pool {
                if targets.contains(&after_bridge) {
                    ghosts.push(bridge);
                    ghost_budget -= spent;
                    return (nodes, ghosts, WalkOutcome::HitTarget(after_bridge));
                }
            }
            bridge = after_bridge;
        }

        match bridged_to {
            Some((last_ghost, landed)) => {
                ghosts.push(last_ghost);
                ghost_budget -= spent;
                current = landed;
            }
            None => break,
        }
    }

    (nodes, ghosts, WalkOutcome::Chain)
}

/// Run one full offset pass over `pool`: find heads, walk each unprocessed
/// head, and partition results into plain chains and entry-point hits
/// (§4.3 "Walk" and "Emit rules").
pub fn walk_chains_at_offset(
    pool: &AHashSet<Address>,
    offset: u32,
    get_value: impl Fn(Address) -> Option<PointerValue>,
    opts: WalkOptions,
) -> WalkResult {
    let heads = find_heads(pool, offset, &get_value);
    let mut processed: AHashSet<Address> = AHashSet::default();
    let mut result = WalkResult::default();

    for head in heads {
        if processed.contains(&head) {
            continue;
        }
        let (nodes, ghosts, outcome) = walk_one(head, pool, offset, &get_value, &opts);
        for &n in &nodes {
            processed.insert(n);
        }
        match outcome {
            WalkOutcome::HitTarget(hit) if !nodes.is_empty() => {
                result.entry_points.push(EntryWalk {
                    root: head,
                    nodes,
                    ghosts,
                    target_hit: hit,
                });
            }
            WalkOutcome::HitTarget(_) => {}
            WalkOutcome::Chain => {
                if nodes.len() >= opts.min_chain_length {
                    result.chains.push(Chain {
                        root: head,
                        nodes,
                        ghosts,
                    });
                }
            }
        }
    }

    result
}

/// Resolve overlapping chains that share at least one node: group by shared
/// membership (union-find), then within each group keep the chain with the
/// greatest node count, breaking ties by the smaller root address (§4.3).
pub fn resolve_chain_conflicts(chains: Vec<Chain>) -> Vec<Chain> {
    if chains.is_empty() {
        return chains;
    }

    let mut parent: Vec<usize> = (0..chains.len()).collect();

    fn find(parent: &mut [usize], x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }

    fn union(parent: &mut [usize], a: usize, b: usize) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            parent[ra] = rb;
        }
    }

    let mut owner: AHashMap<Address, usize> = AHashMap::default();
    for (i, chain) in chains.iter().enumerate() {
        for &node in &chain.nodes {
            if let Some(&first) = owner.get(&node) {
                union(&mut parent, i, first);
            } else {
                owner.insert(node, i);
            }
        }
    }

    let mut groups: AHashMap<usize, Vec<usize>> = AHashMap::default();
    for i in 0..chains.len() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(i);
    }

    let mut winners: Vec<usize> = groups
        .into_values()
        .map(|members| {
            members
                .into_iter()
                .min_by(|&a, &b| {
                    let ca = &chains[a];
                    let cb = &chains[b];
                    cb.len()
                        .cmp(&ca.len())
                        .then_with(|| ca.root.cmp(&cb.root))
                })
                .expect("non-empty group")
        })
        .collect();

    winners.sort_unstable();
    let mut chains = chains;
    let mut result = Vec::with_capacity(winners.len());
    for &idx in &winners {
        result.push(std::mem::replace(
            &mut chains[idx],
            Chain {
                root: 0,
                nodes: Vec::new(),
                ghosts: Vec::new(),
            },
        ));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(addrs: &[Address]) -> AHashSet<Address> {
        addrs.iter().copied().collect()
    }

    #[test]
    fn walk_chain_follows_until_pool_exhausted() {
        let mut values: AHashMap<Address, PointerValue> = AHashMap::default();
        values.insert(0x100, 0x104);
        values.insert(0x104, 0x108);
        values.insert(0x108, 0x200); // 0x200 not a member

        let pool = pool_of(&[0x100, 0x104, 0x108]);
        let opts = WalkOptions {
            min_chain_length: 1,
            max_ghost_nodes: 0,
            target_pool: None,
        };
        let result = walk_chains_at_offset(&pool, 0, |a| values.get(&a).copied(), opts);
        assert_eq!(result.chains.len(), 1);
        assert_eq!(result.chains[0].nodes, vec![0x100, 0x104, 0x108]);
        assert!(result.chains[0].ghosts.is_empty());
    }

    #[test]
    fn walk_chain_bridges_single_gap_within_budget() {
        let mut values: AHashMap<Address, PointerValue> = AHashMap::default();
        values.insert(0x100, 0x200);
        values.insert(0x200, 0x300); // ghost step
        values.insert(0x300, 0x999); // terminal, not a member

        let pool = pool_of(&[0x100, 0x300]);
        let opts = WalkOptions {
            min_chain_length: 1,
            max_ghost_nodes: 2,
            target_pool: None,
        };
        let result = walk_chains_at_offset(&pool, 0, |a| values.get(&a).copied(), opts);
        assert_eq!(result.chains.len(), 1);
        assert_eq!(result.chains[0].nodes, vec![0x100, 0x300]);
        assert_eq!(result.chains[0].ghosts, vec![0x200]);
    }

    #[test]
    fn walk_chain_fails_bridge_beyond_budget() {
        let mut values: AHashMap<Address, PointerValue> = AHashMap::default();
        values.insert(0x100, 0x200);
        values.insert(0x200, 0x300);
        values.insert(0x300, 0x400); // still not a member after 1 ghost hop

        let pool = pool_of(&[0x100, 0x400]);
        let opts = WalkOptions {
            min_chain_length: 1,
            max_ghost_nodes: 1,
            target_pool: None,
        };
        let result = walk_chains_at_offset(&pool, 0, |a| values.get(&a).copied(), opts);
        assert_eq!(result.chains.len(), 1);
        assert_eq!(result.chains[0].nodes, vec![0x100]);
        assert!(result.chains[0].ghosts.is_empty());
    }

    #[test]
    fn target_pool_hit_emits_entry_point_not_chain() {
        let mut values: AHashMap<Address, PointerValue> = AHashMap::default();
        values.insert(0x100, 0x104);
        values.insert(0x104, 0x900); // lands in target pool

        let pool = pool_of(&[0x100, 0x104]);
        let targets = pool_of(&[0x900]);
        let opts = WalkOptions {
            min_chain_length: 1,
            max_ghost_nodes: 0,
            target_pool: Some(&targets),
        };
        let result = walk_chains_at_offset(&pool, 0, |a| values.get(&a).copied(), opts);
        assert!(result.chains.is_empty());
        assert_eq!(result.entry_points.len(), 1);
        assert_eq!(result.entry_points[0].nodes, vec![0x100, 0x104]);
        assert_eq!(result.entry_points[0].target_hit, 0x900);
    }

    #[test]
    fn min_chain_length_filters_short_chains() {
        let mut values: AHashMap<Address, PointerValue> = AHashMap::default();
        values.insert(0x100, 0x999);

        let pool = pool_of(&[0x100]);
        let opts = WalkOptions {
            min_chain_length: 2,
            max_ghost_nodes: 0,
            target_pool: None,
        };
        let result = walk_chains_at_offset(&pool, 0, |a| values.get(&a).copied(), opts);
        assert!(result.chains.is_empty());
    }

    #[test]
    fn idempotent_on_repeated_runs() {
        let mut values: AHashMap<Address, PointerValue> = AHashMap::default();
        values.insert(0x100, 0x104);
        values.insert(0x104, 0x999);

        let pool = pool_of(&[0x100, 0x104]);
        let opts = WalkOptions {
            min_chain_length: 1,
            max_ghost_nodes: 0,
            target_pool: None,
        };
        let first = walk_chains_at_offset(&pool, 0, |a| values.get(&a).copied(), opts);
        let second = walk_chains_at_offset(&pool, 0, |a| values.get(&a).copied(), opts);
        assert_eq!(first.chains, second.chains);
    }

    #[test]
    fn conflict_resolution_keeps_longest_chain_sharing_a_node() {
        let long = Chain {
            root: 0x200,
            nodes: vec![0x200, 0x204, 0x208, 0x20C],
            ghosts: vec![],
        };
        let short = Chain {
            root: 0x100,
            nodes: vec![0x100, 0x204],
            ghosts: vec![],
        };
        let resolved = resolve_chain_conflicts(vec![short, long]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].root, 0x200);
    }

    #[test]
    fn conflict_resolution_breaks_ties_by_smaller_root() {
        let a = Chain {
            root: 0x300,
            nodes: vec![0x300, 0x304],
            ghosts: vec![],
        };
        let b = Chain {
            root: 0x100,
            nodes: vec![0x100, 0x304],
            ghosts: vec![],
        };
        let resolved = resolve_chain_conflicts(vec![a, b]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].root, 0x100);
    }

    #[test]
    fn disjoint_chains_are_all_kept() {
        let a = Chain {
            root: 0x100,
            nodes: vec![0x100, 0x104],
            ghosts: vec![],
        };
        let b = Chain {
            root: 0x200,
            nodes: vec![0x200, 0x204],
            ghosts: vec![],
        };
        let resolved = resolve_chain_conflicts(vec![a, b]);
        assert_eq!(resolved.len(), 2);
    }
}
