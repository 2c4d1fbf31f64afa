use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    /// The semantic miss: the backend answered and holds no such record.
    #[error("service not found")]
    NotFound,

    #[error("registry transport error: {0}")]
    Transport(String),

    #[error("registry operation timed out")]
    Timeout,

    #[error("invalid registration: {0}")]
    Invalid(String),

    #[error("registry record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("watcher stopped")]
    WatcherStopped,
}

impl RegistryError {
    /// Errors worth retrying: the backend could not be reached in time.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transport(_) | RegistryError::Timeout)
    }
}
