use std::io;

use thiserror::Error;

use crate::store::{AttributeType, ElementId};

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid element {id:?}")]
    InvalidElement { id: ElementId },
    #[error("Attribute {attribute:?} cannot be stored on {id:?}")]
    InvalidAttribute { id: ElementId, attribute: AttributeType },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid temperament value '{text}' at field {index}")]
    InvalidTemperament { text: String, index: usize },
    #[error("Buffer size must be greater than zero")]
    ZeroBufferSize,
    #[error("Tuning fork must be a positive frequency, got {0} Hz")]
    InvalidTuningFork(i32),
}
