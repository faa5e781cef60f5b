//! Daemon registry (§6, consumed collaborator): where the Connector looks
//! up and evicts candidate daemons. Persistence format and discovery policy
//! are out of scope for the core; this module provides a minimal, genuinely
//! working implementation so the crate is runnable end to end, not just a
//! trait stub.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::daemon::{DaemonId, DaemonInfo};

/// Where the Connector finds and evicts daemon candidates.
pub trait DaemonRegistry: Send + Sync {
    fn list(&self) -> Result<Vec<DaemonInfo>>;
    fn remove(&self, id: DaemonId) -> Result<()>;
    fn register(&self, info: DaemonInfo) -> Result<()>;
}

/// An in-process registry, used by tests and by single-invocation callers
/// that spawn their own daemon rather than discovering an existing one.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: Mutex<Vec<DaemonInfo>>,
}

impl DaemonRegistry for InMemoryRegistry {
    fn list(&self) -> Result<Vec<DaemonInfo>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    fn remove(&self, id: DaemonId) -> Result<()> {
        self.entries.lock().unwrap().retain(|d| d.id != id);
        Ok(())
    }

    fn register(&self, info: DaemonInfo) -> Result<()> {
        self.entries.lock().unwrap().push(info);
        Ok(())
    }
}

/// A registry backed by one JSON file per daemon under `dir`, the simplest
/// format that survives across separate client invocations (the real
/// registry persistence format is out of scope; this is deliberately small).
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating registry directory {}", dir.display()))?;
        Ok(FileRegistry { dir })
    }

    fn entry_path(&self, id: DaemonId) -> PathBuf {
        self.dir.join(format!("{}.json", id.0))
    }
}

impl DaemonRegistry for FileRegistry {
    fn list(&self) -> Result<Vec<DaemonInfo>> {
        let mut entries = Vec::new();
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e).context("listing registry directory"),
        };
        for entry in read_dir {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(entry.path())
                .with_context(|| format!("reading registry entry {}", entry.path().display()))?;
            match serde_json::from_str(&contents) {
                Ok(info) => entries.push(info),
                Err(e) => {
                    tracing::warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "ignoring malformed registry entry"
                    );
                }
            }
        }
        Ok(entries)
    }

    fn remove(&self, id: DaemonId) -> Result<()> {
        let path = self.entry_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing registry entry {}", path.display())),
        }
    }

    fn register(&self, info: DaemonInfo) -> Result<()> {
        let path = self.entry_path(info.id);
        let contents = serde_json::to_string_pretty(&info)?;
        fs::write(&path, contents)
            .with_context(|| format!("writing registry entry {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{DaemonAddress, DaemonState, PROTOCOL_VERSION};
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn sample(id: DaemonId) -> DaemonInfo {
        DaemonInfo {
            id,
            pid: 1234,
            address: DaemonAddress::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)),
            protocol_version: PROTOCOL_VERSION,
            locale: "en_US".to_string(),
            working_dir: PathBuf::from("/tmp"),
            registered_at: Utc::now(),
            state: DaemonState::Idle,
        }
    }

    #[test]
    fn in_memory_registry_register_list_remove() {
        let registry = InMemoryRegistry::default();
        let id = DaemonId::new();
        registry.register(sample(id)).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
        registry.remove(id).unwrap();
        assert_eq!(registry.list().unwrap().len(), 0);
    }

    #[test]
    fn file_registry_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let id = DaemonId::new();
        {
            let registry = FileRegistry::new(dir.path()).unwrap();
            registry.register(sample(id)).unwrap();
        }
        let registry = FileRegistry::new(dir.path()).unwrap();
        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);

        registry.remove(id).unwrap();
        assert!(registry.list().unwrap().is_empty());
    }
}
