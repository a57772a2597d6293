use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("Cannot update hosts file {path}: {source}")]
    HostsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ScaleError {
    pub fn hosts_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::HostsFile {
            path: path.into(),
            source,
        }
    }
}
