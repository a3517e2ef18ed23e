//! Durable process records, one small file per server name.
//!
//! Each record file contains exactly the textual PID of the server process.
//! Writes go through a temp-file-then-rename so a concurrent reader never
//! observes a partially written PID. Storage failures degrade to "no record"
//! rather than propagating: the port locator is the designed fallback, and
//! losing supervision state must never crash a start/stop command.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::warn;

use crate::server::ServerName;

/// File-backed store mapping server name to recorded PID.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Creates a store over the given state directory.
    ///
    /// The directory is created lazily on the first save.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Writes or overwrites the record for `name`.
    ///
    /// Returns `false` if the record could not be persisted; the failure is
    /// logged and the caller proceeds without a durable record.
    pub fn save(&self, name: ServerName, pid: u32) -> bool {
        match self.try_save(name, pid) {
            Ok(()) => true,
            Err(err) => {
                warn!(server = %name, pid, error = %err, "failed to persist process record");
                false
            }
        }
    }

    /// Returns the recorded PID for `name`, or `None` if no record exists or
    /// the file is unreadable or corrupt.
    pub fn load(&self, name: ServerName) -> Option<u32> {
        let path = self.record_path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(server = %name, error = %err, "failed to read process record");
                return None;
            }
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) => Some(pid),
            Err(_) => {
                warn!(server = %name, "process record is corrupt, treating as absent");
                None
            }
        }
    }

    /// Removes the record for `name`. A missing record is not an error.
    pub fn delete(&self, name: ServerName) {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(server = %name, error = %err, "failed to delete process record");
            }
        }
    }

    /// Enumerates the servers that currently have a record on disk.
    pub fn list(&self) -> Vec<ServerName> {
        ServerName::ALL
            .into_iter()
            .filter(|name| self.record_path(*name).exists())
            .collect()
    }

    fn try_save(&self, name: ServerName, pid: u32) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let final_path = self.record_path(name);
        let temp_path = self.dir.join(format!("{}.pid.tmp", name.label()));
        fs::write(&temp_path, format!("{}\n", pid))?;
        // Rename is atomic on the same filesystem.
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    fn record_path(&self, name: ServerName) -> PathBuf {
        self.dir.join(format!("{}.pid", name.label()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, RecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[test]
    fn save_load_delete_round_trip() {
        let (_dir, store) = store();
        assert!(store.save(ServerName::Backend, 4242));
        assert_eq!(store.load(ServerName::Backend), Some(4242));
        store.delete(ServerName::Backend);
        assert_eq!(store.load(ServerName::Backend), None);
        // Second delete is a no-op.
        store.delete(ServerName::Backend);
    }

    #[test]
    fn save_overwrites_existing_record() {
        let (_dir, store) = store();
        store.save(ServerName::Frontend, 100);
        store.save(ServerName::Frontend, 200);
        assert_eq!(store.load(ServerName::Frontend), Some(200));
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let (dir, store) = store();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join("backend.pid"), "not a pid\n").unwrap();
        assert_eq!(store.load(ServerName::Backend), None);
    }

    #[test]
    fn list_reports_only_recorded_servers() {
        let (_dir, store) = store();
        assert!(store.list().is_empty());
        store.save(ServerName::Backend, 1);
        store.save(ServerName::Dashboard, 2);
        assert_eq!(store.list(), vec![ServerName::Backend, ServerName::Dashboard]);
    }

    #[test]
    fn missing_directory_loads_as_absent() {
        let store = RecordStore::new(PathBuf::from("/nonexistent/devrack-test"));
        assert_eq!(store.load(ServerName::Backend), None);
        assert!(store.list().is_empty());
    }
}
