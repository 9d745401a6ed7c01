//! External interface component (C7, §4.7, §6): thin adapters at the
//! pipeline's edges. The CSV parser, achievement-logic encoder, and
//! progress/event sinks themselves are out of scope (§1); only the traits
//! the core consumes/exposes live here.

use crate::error::{PipelineError, Result, Stage};
use crate::types::{Address, Finding, PointerValue};

/// Supplies one already-validated batch of `(address, value)` rows. The CSV
/// parser's row validation (alignment, range membership, dual-region bit
/// tests) happens upstream and is out of scope (§1, §6); the core trusts
/// whatever this trait hands it.
pub trait BatchSource {
    fn next_batch(&mut self) -> Option<(Vec<Address>, Vec<PointerValue>)>;
}

/// Destination for findings ready to hand to the opaque achievement-logic
/// encoder (§6 "Encoder interface"). Each call represents one streamed
/// batch of up-to-1000 findings (§4.6 "Finding streaming").
pub trait FindingSink {
    fn accept(&mut self, findings: &[Finding]) -> Result<()>;
}

/// Stage a pipeline run can be in, reported through [`EventSink::stage`]
/// (§6 "Event sink").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStage {
    Static,
    Dynamic,
    Precompute,
    Scan,
    Generate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Active,
    Completed,
    Skipped,
    Error,
}

/// Host-facing progress/cancellation channel (§5, §6). Distinct from the
/// crate's internal `log` diagnostics: this is the structured protocol a
/// UI or test harness observes, not free-form text.
pub trait EventSink {
    fn progress(&mut self, percent: u8, status: &str);
    fn stage_transition(&mut self, stage: ScanStage, status: StageStatus);
    fn finding_counts(&mut self, static_count: usize, dynamic_count: usize);

    /// Polled at every cooperative yield point (§5). Returning `true` stops
    /// the run cleanly at the next base-pointer boundary.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A no-op sink for tests and callers that don't need host feedback.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn progress(&mut self, _percent: u8, _status: &str) {}
    fn stage_transition(&mut self, _stage: ScanStage, _status: StageStatus) {}
    fn finding_counts(&mut self, _static_count: usize, _dynamic_count: usize) {}
}

/// A recording sink for tests (§9 "mutable global event bus" design note):
/// captures every call so assertions can inspect the sequence.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    pub progress_calls: Vec<(u8, String)>,
    pub stage_transitions: Vec<(ScanStage, StageStatus)>,
    pub finding_counts: Vec<(usize, usize)>,
    pub cancel_after: Option<usize>,
    poll_count: std::cell::Cell<usize>,
}

impl EventSink for RecordingEventSink {
    fn progress(&mut self, percent: u8, status: &str) {
        self.progress_calls.push((percent, status.to_string()));
    }

    fn stage_transition(&mut self, stage: ScanStage, status: StageStatus) {
        self.stage_transitions.push((stage, status));
    }

    fn finding_counts(&mut self, static_count: usize, dynamic_count: usize) {
        self.finding_counts.push((static_count, dynamic_count));
    }

    fn is_cancelled(&self) -> bool {
        let Some(limit) = self.cancel_after else {
            return false;
        };
        let n = self.poll_count.get() + 1;
        self.poll_count.set(n);
        n > limit
    }
}

/// Validate an unknown system id before the preprocessor touches any state
/// (§4.2 "Failure modes"); the CSV/encoder layers call this at the
/// boundary.
pub fn require_known_system(system_id: &str, known: &[&str]) -> Result<()> {
    if known.contains(&system_id) {
        Ok(())
    } else {
        Err(PipelineError::InvalidSystem {
            system_id: system_id.to_string(),
        })
    }
}

pub fn stage_tag(stage: ScanStage) -> Stage {
    match stage {
        ScanStage::Static => Stage::StaticDetect,
        ScanStage::Dynamic => Stage::DynamicDetect,
        ScanStage::Precompute => Stage::Precompute,
        ScanStage::Scan => Stage::Scan,
        ScanStage::Generate => Stage::Generate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_known_system_rejects_unknown_id() {
        let err = require_known_system("ps2", &["ps1", "n64"]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSystem { .. }));
    }

    #[test]
    fn require_known_system_accepts_listed_id() {
        assert!(require_known_system("ps1", &["ps1", "n64"]).is_ok());
    }

    #[test]
    fn recording_sink_captures_calls_in_order() {
        let mut sink = RecordingEventSink::default();
        sink.stage_transition(ScanStage::Static, StageStatus::Active);
        sink.progress(50, "halfway");
        sink.finding_counts(3, 1);
        assert_eq!(sink.stage_transitions, vec![(ScanStage::Static, StageStatus::Active)]);
        assert_eq!(sink.progress_calls, vec![(50, "halfway".to_string())]);
        assert_eq!(sink.finding_counts, vec![(3, 1)]);
    }

    #[test]
    fn recording_sink_signals_cancellation_after_limit() {
        let mut sink = RecordingEventSink {
            cancel_after: Some(2),
            ..Default::default()
        };
        assert!(!sink.is_cancelled());
        assert!(!sink.is_cancelled());
        assert!(sink.is_cancelled());
    }
}
