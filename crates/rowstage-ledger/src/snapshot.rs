use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;

/// Where a ledger keeps its persisted copy. A snapshot is one opaque text
/// blob; the ledger owns its format.
pub trait SnapshotStore: Send {
    /// `Ok(None)` when nothing has been written (or it was erased).
    fn read(&self) -> anyhow::Result<Option<String>>;
    fn write(&mut self, data: &str) -> anyhow::Result<()>;
    fn erase(&mut self) -> anyhow::Result<()>;
}

// ── File-backed ──

/// Snapshot stored as a single file, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    path: PathBuf,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshot {
    fn read(&self) -> anyhow::Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading snapshot: {}", self.path.display()))?;
        Ok(Some(content))
    }

    fn write(&mut self, data: &str) -> anyhow::Result<()> {
        rowstage_store::write_atomic(&self.path, data.as_bytes())
            .with_context(|| format!("writing snapshot: {}", self.path.display()))
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        rowstage_store::remove_if_exists(&self.path)
    }
}

// ── In-memory ──

#[derive(Debug, Default)]
struct MemoryCell {
    data: Option<String>,
    fail_writes: bool,
}

/// In-process snapshot. Clones share the same cell, so a test can keep a
/// handle after giving one to a ledger.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    cell: Arc<Mutex<MemoryCell>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: impl Into<String>) -> Self {
        let snap = Self::default();
        snap.lock().data = Some(data.into());
        snap
    }

    /// Current contents.
    pub fn contents(&self) -> Option<String> {
        self.lock().data.clone()
    }

    /// Make subsequent writes fail, to exercise persistence-failure paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryCell> {
        self.cell.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for MemorySnapshot {
    fn read(&self) -> anyhow::Result<Option<String>> {
        Ok(self.lock().data.clone())
    }

    fn write(&mut self, data: &str) -> anyhow::Result<()> {
        let mut cell = self.lock();
        if cell.fail_writes {
            anyhow::bail!("snapshot storage unavailable");
        }
        cell.data = Some(data.to_string());
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        self.lock().data = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_snapshot_write_read_erase() {
        let tmp = tempfile::tempdir().unwrap();
        let mut snap = FileSnapshot::new(tmp.path().join("s").join("draft.json"));
        assert_eq!(snap.read().unwrap(), None);
        snap.write("[]").unwrap();
        assert_eq!(snap.read().unwrap().as_deref(), Some("[]"));
        snap.erase().unwrap();
        assert_eq!(snap.read().unwrap(), None);
        snap.erase().unwrap();
    }

    #[test]
    fn memory_clones_share_contents() {
        let handle = MemorySnapshot::new();
        let mut owned = handle.clone();
        owned.write("[1]").unwrap();
        assert_eq!(handle.contents().as_deref(), Some("[1]"));
        handle.set_fail_writes(true);
        assert!(owned.write("[2]").is_err());
        assert_eq!(handle.contents().as_deref(), Some("[1]"));
    }
}
