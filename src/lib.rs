//! Pointer-graph structure discovery over multi-batch memory snapshots.
//!
//! The pipeline ingests batches of `(address, value)` rows from several
//! independent memory snapshots, classifies every address by how its value
//! behaves across batches, follows offset-stride chains to recover
//! linked-list-shaped structures, and performs a forward bitmap-intersection
//! scan from every surviving base pointer to locate paths toward
//! user-supplied targets. See each module for the stage it implements.

pub mod catalogue;
pub mod chain_walker;
pub mod config;
pub mod detector;
pub mod error;
pub mod interface;
pub mod orchestrator;
pub mod preprocessor;
pub mod runtime;
pub mod scanner;
pub mod types;

pub use catalogue::SystemDescriptor;
pub use config::RuntimeConfig;
pub use error::{PipelineError, Result};
pub use interface::{BatchSource, EventSink, FindingSink, NullEventSink, RecordingEventSink, ScanStage, StageStatus};
pub use orchestrator::{Orchestrator, PipelineReport};
pub use types::{Address, Finding, FindingKind, PointerValue};
