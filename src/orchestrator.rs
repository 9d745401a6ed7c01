//! Orchestrator (C6, §4.6): owns all mutable pool state, sequences stages,
//! and streams findings to the [`FindingSink`] in bounded batches.

use ahash::{AHashMap, AHashSet};

use crate::catalogue::SystemDescriptor;
use crate::config::RuntimeConfig;
use crate::detector::{detect_dynamic_lists, detect_static_lists};
use crate::error::Result;
use crate::interface::{EventSink, FindingSink, ScanStage, StageStatus};
use crate::preprocessor::Preprocessor;
use crate::runtime::{scan_progress_bar, Ticker};
use crate::scanner::{scan_base_pointer, BatchIndex, BitmapStore, NodeOwner, ScanHit, ScanOptions};
use crate::types::{
    Address, EntryPoint, Finding, FindingKind, IdAllocator, PointerValue, Structure, StructureKind,
    TargetPools,
};

/// Yield every 100 base pointers (§4.5 "Driver loop", §5).
const YIELD_EVERY_BASE_POINTERS: usize = 100;
/// Stream and free accumulated findings every 1000 base pointers (§4.5, §4.6).
const STREAM_EVERY_BASE_POINTERS: usize = 1000;

/// Summary returned at the end of a run: how much survived each stage, for
/// callers that don't need to inspect every streamed [`Finding`] (§4.6).
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub static_lists: usize,
    pub dynamic_lists: usize,
    pub entry_points: usize,
    pub target_paths: usize,
    pub base_pointers_scanned: usize,
    pub cancelled: bool,
}

/// Drives the whole pipeline (§4.6 data flow: ingest -> classify -> static
/// detect -> dynamic detect -> build base pointers/indexes -> precompute ->
/// forward scan -> final streaming).
pub struct Orchestrator {
    system: SystemDescriptor,
    config: RuntimeConfig,
    preprocessor: Preprocessor,
    ids: IdAllocator,
    target_nodes: TargetPools,
    /// User-injected target addresses only (§3, §6 "target-covering"),
    /// kept separate from `target_nodes` since the latter also accumulates
    /// detector-consumed structure/ghost addresses as chains get claimed.
    user_targets: AHashSet<Address>,
    structures: Vec<Structure>,
    node_owner: AHashMap<Address, NodeOwner>,
    processed_base_addrs: AHashSet<Address>,
}

impl Orchestrator {
    pub fn new(system: SystemDescriptor, config: RuntimeConfig) -> Self {
        let warn_threshold = config.warn_base_pointer_threshold;
        Orchestrator {
            system: system.clone(),
            config,
            preprocessor: Preprocessor::new(system, warn_threshold),
            ids: IdAllocator::new(),
            target_nodes: Vec::new(),
            user_targets: AHashSet::default(),
            structures: Vec::new(),
            node_owner: AHashMap::default(),
            processed_base_addrs: AHashSet::default(),
        }
    }

    /// Absorb one batch (§4.2). Delegates straight to the preprocessor.
    pub fn add_batch(&mut self, addresses: &[Address], values: &[PointerValue]) -> Result<()> {
        self.preprocessor.add_batch(addresses, values)?;
        Ok(())
    }

    /// Seed the target-node pools with user-supplied injected targets
    /// (§3 "Target-node pools ... seeded with user-supplied injected
    /// targets"). Must be called after the batch count is known and before
    /// `run`.
    pub fn inject_targets(&mut self, batch_count: usize, targets: &[Address]) {
        if self.target_nodes.len() != batch_count {
            self.target_nodes = (0..batch_count).map(|_| AHashSet::default()).collect();
        }
        for pool in self.target_nodes.iter_mut() {
            pool.extend(targets.iter().copied());
        }
        self.user_targets.extend(targets.iter().copied());
    }

    /// Whether any of `addresses` was supplied by the caller through
    /// `inject_targets` (§6 "target-covering"), as opposed to merely
    /// appearing in a per-batch `target_nodes` pool via detector claims.
    fn is_target_covering(&self, addresses: &[Address]) -> bool {
        addresses.iter().any(|a| self.user_targets.contains(a))
    }

    /// Run the full pipeline to completion, streaming findings through
    /// `sink` and reporting progress/cancellation through `events`.
    pub fn run(
        &mut self,
        sink: &mut dyn FindingSink,
        events: &mut dyn EventSink,
    ) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        let batch_count = self.preprocessor.batch_count();
        if self.target_nodes.len() != batch_count {
            self.target_nodes = (0..batch_count).map(|_| AHashSet::default()).collect();
        }

        events.stage_transition(ScanStage::Static, StageStatus::Active);
        let fresh_preprocessor =
            Preprocessor::new(self.system.clone(), self.config.warn_base_pointer_threshold);
        let outgoing_preprocessor = std::mem::replace(&mut self.preprocessor, fresh_preprocessor);
        let pools = outgoing_preprocessor.collapse()?;
        log::info!(
            "collapsed {} static-statics, {} static-nodes, {} dynamic-nodes across {} batches",
            pools.static_statics.len(),
            pools.static_nodes.len(),
            pools.dynamic_nodes.len(),
            batch_count
        );

        let mut pending: Vec<Finding> = Vec::new();

        let static_pass = detect_static_lists(
            &pools.static_statics,
            self.config.max_ghost_nodes,
            crate::config::STATIC_MIN_CHAIN_LENGTH,
            &mut self.target_nodes,
        );
        report.static_lists = static_pass.structures.len();
        let static_findings: Vec<Finding> =
            static_pass.structures.iter().map(|s| self.structure_finding(s)).collect();
        self.admit_structures(static_pass.structures);
        pending.extend(static_findings);
        events.finding_counts(report.static_lists, 0);
        events.stage_transition(ScanStage::Static, StageStatus::Completed);

        // skipSticky: discard remaining StaticStatics, else promote into
        // StaticNodes so they become base-pointer candidates (§4.4).
        let mut static_nodes = pools.static_nodes.clone();
        if !self.config.skip_sticky_pointers {
            for (addr, value) in static_pass.remaining {
                let mut slots = [0 as PointerValue; crate::config::MAX_BATCHES];
                for slot in slots.iter_mut().take(batch_count) {
                    *slot = value;
                }
                static_nodes.insert(addr, slots);
            }
        }

        events.stage_transition(ScanStage::Dynamic, StageStatus::Active);
        let dynamic_pass = detect_dynamic_lists(
            &static_nodes,
            batch_count,
            self.config.min_chain_length,
            &mut self.target_nodes,
        );
        report.dynamic_lists = dynamic_pass.structures.len();
        report.entry_points += dynamic_pass.entry_points.len();
        let dynamic_findings: Vec<Finding> =
            dynamic_pass.structures.iter().map(|s| self.structure_finding(s)).collect();
        self.admit_structures(dynamic_pass.structures);
        pending.extend(dynamic_findings);
        for ep in dynamic_pass.entry_points {
            self.admit_entry_point(ep);
        }
        events.finding_counts(report.static_lists, report.dynamic_lists);
        events.stage_transition(ScanStage::Dynamic, StageStatus::Completed);

        // Base pointer set: every StaticNode not already consumed by a
        // target-node pool in *any* batch, range-gated (§4.5).
        let mut base_pointers: Vec<(Address, Vec<PointerValue>)> = Vec::new();
        'outer: for (&addr, slots) in static_nodes.iter() {
            for pool in self.target_nodes.iter() {
                if pool.contains(&addr) {
                    continue 'outer;
                }
            }
            if !self.config.enabled_ranges.contains(&self.system.range_index(addr)) {
                continue;
            }
            base_pointers.push((addr, slots[..batch_count].to_vec()));
        }
        base_pointers.sort_unstable_by_key(|(addr, _)| *addr);

        events.stage_transition(ScanStage::Precompute, StageStatus::Active);

        let batch_indexes: Vec<BatchIndex> = (0..batch_count)
            .map(|_| BatchIndex::default())
            .collect();
        let batch_indexes = self.build_batch_indexes(batch_indexes, &pools.dynamic_nodes, &static_nodes);

        let base_set: AHashSet<Address> = base_pointers.iter().map(|(a, _)| *a).collect();
        let mut traversal_nodes: AHashSet<Address> = static_nodes.keys().copied().collect();
        traversal_nodes.extend(pools.dynamic_nodes.keys().copied());
        for b in base_set.iter() {
            traversal_nodes.remove(b);
        }

        let batch_values = |addr: Address, b: usize| -> Option<PointerValue> {
            static_nodes
                .get(&addr)
                .map(|s| s[b])
                .or_else(|| pools.dynamic_nodes.get(&addr).map(|s| s[b]))
                .filter(|&v| v != 0)
        };
        let bitmaps = BitmapStore::precompute(
            &traversal_nodes,
            batch_count,
            self.config.max_breadth_masked(),
            batch_values,
            &batch_indexes,
        );
        events.stage_transition(ScanStage::Precompute, StageStatus::Completed);

        events.stage_transition(ScanStage::Scan, StageStatus::Active);
        let scan_opts = ScanOptions {
            max_breadth: self.config.max_breadth_masked(),
            max_depth: self.config.max_depth_clamped(),
            early_out_target: self.config.early_out_target,
            early_out_base_pointer: self.config.early_out_base_pointer,
        };

        let pb = scan_progress_bar(base_pointers.len() as u64, self.config.show_progress_bar);
        let mut ticker = Ticker::new(YIELD_EVERY_BASE_POINTERS);
        let mut scanned = 0usize;
        'scan: for (root, values) in &base_pointers {
            if events.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let hit = scan_base_pointer(
                *root,
                values,
                &batch_indexes,
                &self.target_nodes,
                &self.node_owner,
                &bitmaps,
                scan_opts,
            );

            match hit {
                ScanHit::TargetPath(tp) => {
                    report.target_paths += 1;
                    let is_target =
                        self.is_target_covering(&[tp.target_address, tp.base_pointer]);
                    pending.push(Finding {
                        id: self.ids.next_finding_id(FindingKind::TargetPath, is_target),
                        kind: FindingKind::TargetPath,
                        root: tp.base_pointer,
                        node_count: 1,
                        addresses: vec![tp.base_pointer],
                        ghosts: None,
                        stride: None,
                        path: Some(tp.path),
                        build_offset: None,
                        target_address: Some(tp.target_address),
                        is_target,
                    });
                    if self.config.early_out_target {
                        scanned += 1;
                        break 'scan;
                    }
                }
                ScanHit::EntryPoint {
                    root,
                    path,
                    structure_id: _,
                    build_offset,
                } => {
                    report.entry_points += 1;
                    let is_target = self.is_target_covering(&[root]);
                    pending.push(Finding {
                        id: self.ids.next_finding_id(FindingKind::EntryPoint, is_target),
                        kind: FindingKind::EntryPoint,
                        root,
                        node_count: 1,
                        addresses: vec![root],
                        ghosts: None,
                        stride: None,
                        path: Some(path.clone()),
                        build_offset: Some(build_offset),
                        target_address: None,
                        is_target,
                    });
                    self.admit_entry_point(EntryPoint {
                        internal_id: 0,
                        root,
                        addresses: vec![root],
                        build_offset,
                        path,
                        batch_idx: None,
                        target_struct: None,
                        claimed: false,
                    });
                }
                ScanHit::MovingEntryPoint {
                    root,
                    path,
                    build_offset,
                } => {
                    report.entry_points += 1;
                    let is_target = self.is_target_covering(&[root]);
                    pending.push(Finding {
                        id: self.ids.next_finding_id(FindingKind::EntryPoint, is_target),
                        kind: FindingKind::EntryPoint,
                        root,
                        node_count: 1,
                        addresses: vec![root],
                        ghosts: None,
                        stride: None,
                        path: Some(path.clone()),
                        build_offset: Some(build_offset),
                        target_address: None,
                        is_target,
                    });
                    self.admit_entry_point(EntryPoint {
                        internal_id: 0,
                        root,
                        addresses: vec![root],
                        build_offset,
                        path,
                        batch_idx: None,
                        target_struct: None,
                        claimed: false,
                    });
                }
                ScanHit::None => {}
            }

            scanned += 1;
            pb.inc(1);
            if self.config.early_out_base_pointer && !pending.is_empty() {
                break 'scan;
            }
            if ticker.tick() {
                let percent = ((scanned * 100) / base_pointers.len().max(1)).min(100) as u8;
                events.progress(percent, "scanning base pointers");
            }
            if scanned % STREAM_EVERY_BASE_POINTERS == 0 {
                self.stream_pending(&mut pending, sink)?;
            }
        }
        report.base_pointers_scanned = scanned;
        self.stream_pending(&mut pending, sink)?;
        pb.finish_and_clear();
        log::info!(
            "scanned {} base pointers, {} target paths, {} entry points",
            report.base_pointers_scanned,
            report.target_paths,
            report.entry_points
        );
        events.stage_transition(ScanStage::Scan, StageStatus::Completed);

        events.stage_transition(ScanStage::Generate, StageStatus::Completed);

        // Free per-batch/per-run state; only the id allocator and the
        // low-volume processed-base set persist across runs (§4.6).
        self.target_nodes.clear();
        self.user_targets.clear();
        self.structures.clear();
        self.node_owner.clear();

        Ok(report)
    }

    /// Convert a detected [`Structure`] into its external [`Finding`] (§4.6
    /// "finding streaming"); id banding and `is_target` both come from a
    /// real intersection test against the caller's injected targets (§6
    /// "target-covering"), not an assumed value.
    fn structure_finding(&mut self, s: &Structure) -> Finding {
        let kind = match s.kind {
            StructureKind::StaticList => FindingKind::StaticList,
            StructureKind::DynamicList => FindingKind::DynamicList,
        };
        let mut covering_addrs = s.addresses.clone();
        covering_addrs.extend(s.ghosts.iter().copied());
        let is_target = self.is_target_covering(&covering_addrs);
        Finding {
            id: self.ids.next_finding_id(kind, is_target),
            kind,
            root: s.root,
            node_count: s.node_count,
            addresses: s.addresses.clone(),
            ghosts: if s.ghosts.is_empty() { None } else { Some(s.ghosts.clone()) },
            stride: Some(s.stride),
            path: None,
            build_offset: Some(s.build_offset),
            target_address: None,
            is_target,
        }
    }

    /// Per-batch `address -> row index` (§4.5, §9 preallocation note):
    /// every StaticNode (present in all batches by definition) plus
    /// whichever DynamicNodes actually carry a non-zero slot in batch `b`.
    fn build_batch_indexes(
        &self,
        mut batch_indexes: Vec<BatchIndex>,
        dynamic_nodes: &AHashMap<Address, crate::types::Slots>,
        static_nodes: &AHashMap<Address, crate::types::Slots>,
    ) -> Vec<BatchIndex> {
        for b in 0..batch_indexes.len() {
            let mut addrs: Vec<Address> = static_nodes.keys().copied().collect();
            addrs.extend(
                dynamic_nodes
                    .iter()
                    .filter(|(_, slots)| slots[b] != 0)
                    .map(|(&addr, _)| addr),
            );
            batch_indexes[b] = BatchIndex::build(&addrs);
        }
        batch_indexes
    }

    fn admit_structures(&mut self, mut structures: Vec<Structure>) {
        for s in structures.iter_mut() {
            s.internal_id = self.ids.next_internal_id();
            for &addr in &s.addresses {
                self.node_owner.insert(
                    addr,
                    NodeOwner {
                        structure_id: s.internal_id,
                        build_offset: s.build_offset,
                    },
                );
            }
        }
        self.structures.extend(structures);
    }

    fn admit_entry_point(&mut self, mut ep: EntryPoint) {
        ep.internal_id = self.ids.next_internal_id();
        for &addr in &ep.addresses {
            self.node_owner.insert(
                addr,
                NodeOwner {
                    structure_id: ep.internal_id,
                    build_offset: ep.build_offset,
                },
            );
        }
    }

    /// Stream unprocessed structures/entry points whose root is not yet in
    /// `processedBaseAddrs`, then clear `pending` (§4.6 "Finding
    /// streaming").
    fn stream_pending(&mut self, pending: &mut Vec<Finding>, sink: &mut dyn FindingSink) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let fresh: Vec<Finding> = pending
            .drain(..)
            .filter(|f| !self.processed_base_addrs.contains(&f.root))
            .collect();
        for f in &fresh {
            self.processed_base_addrs.insert(f.root);
        }
        if !fresh.is_empty() {
            sink.accept(&fresh)?;
        }
        Ok(())
    }
}
