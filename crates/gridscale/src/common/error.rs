use thiserror::Error;

use crate::pipeline::ApiError;

#[derive(Debug, Error)]
pub enum GridScaleError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Cloud Pipeline API error: {0}")]
    ApiError(#[from] ApiError),
    #[error(transparent)]
    EngineError(#[from] gridcore::Error),
    #[error("Host storage error: {0}")]
    HostStorageError(#[from] gridcore::host::HostStorageError),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<anyhow::Error> for GridScaleError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<String> for GridScaleError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}
