use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommError>;
