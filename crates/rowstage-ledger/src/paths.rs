use std::path::{Path, PathBuf};

/// Files inside one session directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub draft_json: PathBuf,
    pub session_json: PathBuf,
}

impl SessionPaths {
    /// Derive all paths from a session directory. Pure computation, no I/O.
    pub fn discover(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            draft_json: dir.join("draft.json"),
            session_json: dir.join("session.json"),
            dir,
        }
    }

    /// Session id is the directory name.
    pub fn session_id(&self) -> Option<&str> {
        self.dir.file_name().and_then(|n| n.to_str())
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn in_store(store: &rowstage_store::StorePaths, session_id: &str) -> Self {
        Self::discover(store.session_dir(session_id))
    }
}

impl AsRef<Path> for SessionPaths {
    fn as_ref(&self) -> &Path {
        &self.dir
    }
}
