use thiserror::Error;

/// Pipeline stage tag attached to fatal errors per the error-handling design (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preprocess,
    StaticDetect,
    DynamicDetect,
    Precompute,
    Scan,
    Generate,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Preprocess => "preprocess",
            Stage::StaticDetect => "static-detect",
            Stage::DynamicDetect => "dynamic-detect",
            Stage::Precompute => "precompute",
            Stage::Scan => "scan",
            Stage::Generate => "generate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown system id {system_id:?}")]
    InvalidSystem { system_id: String },

    #[error("batch limit exceeded: cannot add batch {attempted} (max = {max})")]
    BatchLimitExceeded { attempted: usize, max: usize },

    #[error("invalid batch index {index} (have {count} batches)")]
    InvalidBatchIndex { index: usize, count: usize },

    #[error("internal invariant violated during {stage}: {detail}")]
    InternalInvariantViolation { stage: Stage, detail: String },

    #[error("cancelled during {stage}")]
    Cancelled { stage: Stage },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
