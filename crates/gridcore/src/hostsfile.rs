use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::Result;
use crate::common::error::ScaleError;

/// Cluster-wide host lists that workers are registered in.
///
/// `hosts_file` has the `/etc/hosts` format (`<ip> <host> [aliases...]`), `default_hostfile`
/// lists one host per line (used by MPI launchers).
#[derive(Debug, Clone, Default)]
pub struct ClusterHosts {
    pub hosts_file: Option<PathBuf>,
    pub default_hostfile: Option<PathBuf>,
}

impl ClusterHosts {
    pub fn new(hosts_file: Option<PathBuf>, default_hostfile: Option<PathBuf>) -> Self {
        Self {
            hosts_file,
            default_hostfile,
        }
    }

    pub fn add_to_hosts_file(&self, host: &str, ip: &str) -> Result<()> {
        let Some(path) = &self.hosts_file else {
            return Ok(());
        };
        let mut lines = read_lines(path)?;
        if lines.iter().any(|line| hosts_line_names(line).any(|name| name == host)) {
            log::debug!("Host {host} is already present in {}", path.display());
            return Ok(());
        }
        lines.push(format!("{ip} {host}"));
        write_lines(path, &lines)
    }

    pub fn add_to_default_hostfile(&self, host: &str) -> Result<()> {
        let Some(path) = &self.default_hostfile else {
            return Ok(());
        };
        let mut lines = read_lines(path)?;
        if lines.iter().any(|line| line.trim() == host) {
            return Ok(());
        }
        lines.push(host.to_string());
        write_lines(path, &lines)
    }

    pub fn remove_from_hosts_file(&self, host: &str) -> Result<()> {
        let Some(path) = &self.hosts_file else {
            return Ok(());
        };
        let lines = read_lines(path)?;
        let retained: Vec<String> = lines
            .iter()
            .filter(|line| !hosts_line_names(line).any(|name| name == host))
            .cloned()
            .collect();
        if retained.len() != lines.len() {
            write_lines(path, &retained)?;
        }
        Ok(())
    }

    pub fn remove_from_default_hostfile(&self, host: &str) -> Result<()> {
        let Some(path) = &self.default_hostfile else {
            return Ok(());
        };
        let lines = read_lines(path)?;
        let retained: Vec<String> = lines
            .iter()
            .filter(|line| line.trim() != host)
            .cloned()
            .collect();
        if retained.len() != lines.len() {
            write_lines(path, &retained)?;
        }
        Ok(())
    }
}

/// Host names of a hosts file line, comments are ignored.
fn hosts_line_names(line: &str) -> impl Iterator<Item = &str> {
    let content = line.split('#').next().unwrap_or_default();
    content.split_whitespace().skip(1)
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(|line| line.to_string()).collect()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
        Err(error) => Err(ScaleError::hosts_file(path, error)),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let error = |source| ScaleError::hosts_file(path, source);
    let mut file = NamedTempFile::new_in(directory).map_err(error)?;
    for line in lines {
        writeln!(file, "{line}").map_err(error)?;
    }
    file.flush().map_err(error)?;
    file.persist(path).map_err(|e| error(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ClusterHosts;
    use tempfile::TempDir;

    fn create_hosts(dir: &TempDir) -> ClusterHosts {
        ClusterHosts::new(
            Some(dir.path().join("hosts")),
            Some(dir.path().join("default_hostfile")),
        )
    }

    #[test]
    fn add_and_remove_host() {
        let dir = TempDir::new().unwrap();
        let hosts_path = dir.path().join("hosts");
        std::fs::write(&hosts_path, "127.0.0.1 localhost\n10.0.0.1 master # head node\n").unwrap();
        let hosts = create_hosts(&dir);

        hosts.add_to_hosts_file("pipeline-1", "10.0.0.2").unwrap();
        hosts.add_to_hosts_file("pipeline-1", "10.0.0.2").unwrap();
        hosts.add_to_default_hostfile("pipeline-1").unwrap();
        hosts.add_to_default_hostfile("pipeline-1").unwrap();
        assert_eq!(
            std::fs::read_to_string(&hosts_path).unwrap(),
            "127.0.0.1 localhost\n10.0.0.1 master # head node\n10.0.0.2 pipeline-1\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("default_hostfile")).unwrap(),
            "pipeline-1\n"
        );

        hosts.remove_from_hosts_file("pipeline-1").unwrap();
        hosts.remove_from_default_hostfile("pipeline-1").unwrap();
        assert_eq!(
            std::fs::read_to_string(&hosts_path).unwrap(),
            "127.0.0.1 localhost\n10.0.0.1 master # head node\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("default_hostfile")).unwrap(),
            ""
        );
    }

    #[test]
    fn remove_missing_host_is_noop() {
        let dir = TempDir::new().unwrap();
        let hosts = create_hosts(&dir);
        hosts.remove_from_hosts_file("pipeline-1").unwrap();
        hosts.remove_from_default_hostfile("pipeline-1").unwrap();
        assert!(!dir.path().join("hosts").exists());
    }

    #[test]
    fn host_names_do_not_match_by_prefix() {
        let dir = TempDir::new().unwrap();
        let hosts = create_hosts(&dir);
        hosts.add_to_hosts_file("pipeline-10", "10.0.0.10").unwrap();
        hosts.add_to_hosts_file("pipeline-1", "10.0.0.1").unwrap();
        hosts.remove_from_hosts_file("pipeline-1").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hosts")).unwrap(),
            "10.0.0.10 pipeline-10\n"
        );
    }

    #[test]
    fn disabled_files_are_ignored() {
        let hosts = ClusterHosts::default();
        hosts.add_to_hosts_file("pipeline-1", "10.0.0.1").unwrap();
        hosts.remove_from_default_hostfile("pipeline-1").unwrap();
    }
}
