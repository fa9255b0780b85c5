/// Errors from splitting a batch into microbatches or merging output chunks.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("cannot split along axis {axis}: tensor has {ndim} dimensions")]
    AxisOutOfBounds { axis: usize, ndim: usize },
    #[error("cannot split into zero chunks")]
    ZeroChunks,
    #[error("chunk spec has {got} entries but there are {expected} arguments")]
    SpecArityMismatch { expected: usize, got: usize },
    #[error("no output chunks to merge")]
    EmptyMerge,
    #[error("output chunk shapes do not line up: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Errors from schedule construction and input validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("n_microbatches must be at least 1")]
    ZeroMicrobatches,
    #[error("multi-stage schedule expects at least two stages but got {got}")]
    TooFewStages { got: usize },
    #[error(
        "interleaved 1F1B requires n_microbatches ({n_microbatches}) to be \
         a multiple of the pipeline group size ({group_size})"
    )]
    UnevenMicrobatches {
        n_microbatches: usize,
        group_size: usize,
    },
    #[error("expecting {expected} {name} but got {got}")]
    ChunkCountMismatch {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("a loss function is set but no target was provided")]
    MissingTarget,
}

/// Errors from a stage's compute kernels, propagated unchanged.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("forward pass failed for microbatch {micro_batch}: {reason}")]
    ForwardFailed { micro_batch: usize, reason: String },
    #[error("backward pass failed for microbatch {micro_batch}: {reason}")]
    BackwardFailed { micro_batch: usize, reason: String },
    #[error("stage runtime error: {0}")]
    Runtime(String),
}

/// Errors from the point-to-point transport, propagated unchanged.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("batched isend/irecv failed: {0}")]
    Failed(String),
    #[error("transport dropped the completion handle before signalling")]
    Dropped,
}

/// Top-level schedule error.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("microbatch error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("stage error: {0}")]
    Stage(#[from] StageError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("expecting {expected} losses but got {got}")]
    LossCountMismatch { expected: usize, got: usize },
    #[error("loss for microbatch {mb_index} is not available ({available} recorded)")]
    LossUnavailable { mb_index: usize, available: usize },
    #[error("timeline refers to stage {stage_index}, which this rank does not own")]
    UnownedStage { stage_index: usize },
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ScheduleError>;
