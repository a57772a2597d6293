//! Persistent set of hosts that were launched by the autoscaler.
//!
//! Only hosts stored here are ever scaled down or validated, hosts added to the cluster by
//! other means are left alone.
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::NamedTempFile;

use crate::common::Set;

#[derive(Debug, thiserror::Error)]
pub enum HostStorageError {
    #[error("Host {0} is already stored")]
    AlreadyExists(String),
    #[error("Host {0} is not stored")]
    NotFound(String),
    #[error("Cannot access host storage {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type HostStorageResult<T> = Result<T, HostStorageError>;

pub trait HostStorage {
    fn add_host(&self, host: &str) -> HostStorageResult<()>;

    fn remove_host(&self, host: &str) -> HostStorageResult<()>;

    /// Stored hosts, sorted by name.
    fn load_hosts(&self) -> HostStorageResult<Vec<String>>;

    fn clear(&self) -> HostStorageResult<()>;
}

pub type SharedHostStorage = Arc<dyn HostStorage + Send + Sync>;

fn sorted(hosts: &Set<String>) -> Vec<String> {
    let mut hosts: Vec<String> = hosts.iter().cloned().collect();
    hosts.sort_unstable();
    hosts
}

#[derive(Default)]
pub struct MemoryHostStorage {
    hosts: Mutex<Set<String>>,
}

impl MemoryHostStorage {
    fn hosts(&self) -> MutexGuard<'_, Set<String>> {
        self.hosts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostStorage for MemoryHostStorage {
    fn add_host(&self, host: &str) -> HostStorageResult<()> {
        if !self.hosts().insert(host.to_string()) {
            return Err(HostStorageError::AlreadyExists(host.to_string()));
        }
        Ok(())
    }

    fn remove_host(&self, host: &str) -> HostStorageResult<()> {
        if !self.hosts().remove(host) {
            return Err(HostStorageError::NotFound(host.to_string()));
        }
        Ok(())
    }

    fn load_hosts(&self) -> HostStorageResult<Vec<String>> {
        Ok(sorted(&self.hosts()))
    }

    fn clear(&self) -> HostStorageResult<()> {
        self.hosts().clear();
        Ok(())
    }
}

/// Stores one host per line.
///
/// Every modification rewrites the whole file through a temporary file in the same directory,
/// so a crash never leaves a partially written storage behind. This type does not synchronize
/// concurrent writers, wrap it into [`ThreadSafeHostStorage`] if it is shared.
pub struct FileSystemHostStorage {
    path: PathBuf,
}

impl FileSystemHostStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> HostStorageError {
        HostStorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> HostStorageResult<Set<String>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Set::default());
            }
            Err(error) => return Err(self.io_error(error)),
        };
        let mut hosts = Set::default();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| self.io_error(e))?;
            let host = line.trim();
            if !host.is_empty() {
                hosts.insert(host.to_string());
            }
        }
        Ok(hosts)
    }

    fn write(&self, hosts: &Set<String>) -> HostStorageResult<()> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(directory).map_err(|e| self.io_error(e))?;
        let mut file = NamedTempFile::new_in(directory).map_err(|e| self.io_error(e))?;
        for host in sorted(hosts) {
            writeln!(file, "{host}").map_err(|e| self.io_error(e))?;
        }
        file.flush().map_err(|e| self.io_error(e))?;
        file.persist(&self.path)
            .map_err(|e| self.io_error(e.error))?;
        Ok(())
    }
}

impl HostStorage for FileSystemHostStorage {
    fn add_host(&self, host: &str) -> HostStorageResult<()> {
        let mut hosts = self.read()?;
        if !hosts.insert(host.to_string()) {
            return Err(HostStorageError::AlreadyExists(host.to_string()));
        }
        self.write(&hosts)
    }

    fn remove_host(&self, host: &str) -> HostStorageResult<()> {
        let mut hosts = self.read()?;
        if !hosts.remove(host) {
            return Err(HostStorageError::NotFound(host.to_string()));
        }
        self.write(&hosts)
    }

    fn load_hosts(&self) -> HostStorageResult<Vec<String>> {
        Ok(sorted(&self.read()?))
    }

    fn clear(&self) -> HostStorageResult<()> {
        self.write(&Set::default())
    }
}

/// Serializes all operations of the inner storage.
pub struct ThreadSafeHostStorage<S> {
    inner: Mutex<S>,
}

impl<S: HostStorage> ThreadSafeHostStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn inner(&self) -> MutexGuard<'_, S> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: HostStorage> HostStorage for ThreadSafeHostStorage<S> {
    fn add_host(&self, host: &str) -> HostStorageResult<()> {
        self.inner().add_host(host)
    }

    fn remove_host(&self, host: &str) -> HostStorageResult<()> {
        self.inner().remove_host(host)
    }

    fn load_hosts(&self) -> HostStorageResult<Vec<String>> {
        self.inner().load_hosts()
    }

    fn clear(&self) -> HostStorageResult<()> {
        self.inner().clear()
    }
}

/// Host storage backed by `path`, safe to share between threads.
pub fn file_host_storage(path: impl Into<PathBuf>) -> SharedHostStorage {
    Arc::new(ThreadSafeHostStorage::new(FileSystemHostStorage::new(path)))
}
