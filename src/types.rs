//! Shared data model (§3). The untyped records the source passes around
//! (`structure`, `entryPoint`, ...) become the tagged `StructureKind` +
//! `Structure`/`EntryPoint` pair below, per Design Note 1 (§9): one arena of
//! structures and one of entry points, referenced by small integer ids.

use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;

use crate::config::MAX_BATCHES;

pub type Address = u32;
pub type PointerValue = u32;

/// Per-address slot array: slot `b` is `0` iff the address was absent from
/// batch `b` (§3's node-pool invariant: zero is never a valid post-validation
/// value, so it doubles as an absence sentinel).
pub type Slots = [PointerValue; MAX_BATCHES];

/// A sequence of offsets followed from a base pointer or chain root.
/// `SmallVec` avoids a heap allocation for the common case (`maxDepth` caps
/// at 20, static/dynamic list offsets are single-element paths).
pub type OffsetPath = SmallVec<[u32; 20]>;

/// Per-batch address sets consumed by accepted structures (§3's target-node
/// pools), indexed by batch.
pub type TargetPools = Vec<AHashSet<Address>>;

/// One snapshot of `(address, value)` pairs captured at a distinct game
/// state (§3). Values are stored unmasked; masking is deferred to collapse.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub addresses: Vec<Address>,
    pub values: Vec<PointerValue>,
}

impl Batch {
    pub fn new(addresses: Vec<Address>, values: Vec<PointerValue>) -> Self {
        debug_assert_eq!(addresses.len(), values.len());
        Batch { addresses, values }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Cross-batch classification tiers derived from the node pool (§3). Never
/// stored directly — computed on demand from a node's slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    StaticStatic,
    StaticNode,
    DynamicNode,
}

/// Classify a node's slots over the first `batch_count` entries (§3).
pub fn classify(slots: &Slots, batch_count: usize) -> Classification {
    debug_assert!(batch_count >= 1 && batch_count <= MAX_BATCHES);
    let active = &slots[..batch_count];
    if active.iter().any(|&v| v == 0) {
        return Classification::DynamicNode;
    }
    let first = active[0];
    if active.iter().all(|&v| v == first) {
        Classification::StaticStatic
    } else {
        Classification::StaticNode
    }
}

/// The three disjoint typed pools handed to the detector/scanner after
/// `collapse()` (§3). Values are masked; the preprocessor's map is released.
#[derive(Debug, Clone, Default)]
pub struct CollapsedPools {
    pub batch_count: usize,
    /// address -> single masked value (all non-zero slots agreed).
    pub static_statics: AHashMap<Address, PointerValue>,
    /// address -> per-batch masked value, all non-zero.
    pub static_nodes: AHashMap<Address, Slots>,
    /// address -> per-batch masked value, 0 = absent in that batch.
    pub dynamic_nodes: AHashMap<Address, Slots>,
}

/// Tagged sum type replacing the source's heterogeneous "structure" /
/// "entryPoint" records (§9 Design Note 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    StaticList,
    DynamicList,
}

/// A detected persistent list structure (§3).
#[derive(Debug, Clone)]
pub struct Structure {
    /// Internal identity used for ownership lookups during the forward scan;
    /// distinct from the externally visible finding id bands (§6).
    pub internal_id: u64,
    pub kind: StructureKind,
    pub root: Address,
    pub node_count: usize,
    pub addresses: Vec<Address>,
    pub ghosts: Vec<Address>,
    pub stride: u32,
    pub build_offset: u32,
    /// Set only for `DynamicList` (§3).
    pub batch_idx: Option<usize>,
}

/// A chain that terminates inside an already-known target set (§3).
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub internal_id: u64,
    pub root: Address,
    pub addresses: Vec<Address>,
    pub build_offset: u32,
    pub path: OffsetPath,
    pub batch_idx: Option<usize>,
    pub target_struct: Option<u64>,
    pub claimed: bool,
}

/// A forward-scan hit that reaches an injected target directly (§4.5 step 1).
#[derive(Debug, Clone)]
pub struct TargetPath {
    pub base_pointer: Address,
    pub path: OffsetPath,
    pub target_address: Address,
}

/// The record handed to the external achievement-logic encoder (§6). Opaque
/// to the core beyond its fields.
#[derive(Debug, Clone)]
pub struct Finding {
    pub id: u64,
    pub kind: FindingKind,
    pub root: Address,
    pub node_count: usize,
    pub addresses: Vec<Address>,
    pub ghosts: Option<Vec<Address>>,
    pub stride: Option<u32>,
    pub path: Option<OffsetPath>,
    pub build_offset: Option<u32>,
    pub target_address: Option<Address>,
    pub is_target: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    StaticList,
    DynamicList,
    EntryPoint,
    TargetPath,
}

/// Monotonic id allocator implementing the three bands in §6: static-list
/// findings start at 100000, target-covering findings at 1000, everything
/// else at 10000.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next_static_list: u64,
    next_target_covering: u64,
    next_other: u64,
    next_internal: u64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator {
            next_static_list: 100_000,
            next_target_covering: 1_000,
            next_other: 10_000,
            next_internal: 1,
        }
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_internal_id(&mut self) -> u64 {
        let id = self.next_internal;
        self.next_internal += 1;
        id
    }

    pub fn next_finding_id(&mut self, kind: FindingKind, is_target_covering: bool) -> u64 {
        if matches!(kind, FindingKind::StaticList) {
            let id = self.next_static_list;
            self.next_static_list += 1;
            return id;
        }
        if is_target_covering {
            let id = self.next_target_covering;
            self.next_target_covering += 1;
            return id;
        }
        let id = self.next_other;
        self.next_other += 1;
        id
    }
}
