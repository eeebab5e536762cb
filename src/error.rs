//! Error types for Sonara

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SonaraError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Entity already disposed")]
    Disposed,

    #[error("Generator is exclusive and already attached to a voice")]
    GeneratorBusy,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, SonaraError>;
