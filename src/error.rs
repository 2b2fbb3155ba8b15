use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Submission after the worker pool began shutting down.
    #[error("enqueue on stopped worker pool")]
    PoolStopped,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("worker dropped a task without reporting a result")]
    TaskLost,

    /// A per-sequence E-step failed; `index` is the sequence's submission index.
    #[error("sequence {index}: {message}")]
    InstanceComputation { index: usize, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("non-finite value: {0}")]
    NonFinite(String),

    #[error("model parameters have not been set")]
    ParamsNotSet,

    #[error("two-population emission tables have not been supplied")]
    MissingEmissionTables,

    #[error("no statistics for sequence {0}; run an E-step first")]
    NoStatistics(usize),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::InvalidParameters(message.into())
    }

    pub fn instance(index: usize, message: impl Into<String>) -> Self {
        Self::InstanceComputation {
            index,
            message: message.into(),
        }
    }
}
