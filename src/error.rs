//! Error types for the display pipeline controller

use crate::component::ComponentId;

/// Result alias used across the crate
pub type DpcResult<T> = Result<T, DpcError>;

/// Pipeline controller errors
#[derive(Debug, thiserror::Error)]
pub enum DpcError {
    #[error("component {0} not found")]
    NotFound(ComponentId),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The batch reached its instruction capacity (resource exhaustion)
    #[error("command batch full ({0} instructions)")]
    BatchFull(usize),

    #[error("hardware timeout on client {client} (pc {pc})")]
    Timeout { client: u32, pc: usize },

    #[error("component {comp} already armed on mutex {mutex}")]
    MutexConflict { comp: ComponentId, mutex: usize },

    #[error("component {comp} owned by display {owner}")]
    ComponentBusy { comp: ComponentId, owner: usize },

    #[error("no free sync mutex")]
    MutexExhausted,

    #[error("hardware loop still active")]
    LoopActive,

    #[error("display {0} not enabled")]
    NotEnabled(usize),

    #[error("command engine stopped")]
    EngineStopped,

    #[error("worker '{0}' stopped")]
    WorkerStopped(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DpcError {
    /// Configuration-class errors are skipped inside a commit rather than
    /// failing the frame.
    pub fn is_config_class(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::InvalidGeometry(_) | Self::InvalidArgument(_)
        )
    }
}
