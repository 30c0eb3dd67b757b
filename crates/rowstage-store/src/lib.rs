pub mod config;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub use config::Config;

/// Environment variable that overrides the store root.
pub const HOME_ENV: &str = "ROWSTAGE_HOME";

/// Return the per-user store root.
/// `$ROWSTAGE_HOME` wins; otherwise `<data_dir>/rowstage`, falling back to
/// `~/.rowstage`.
pub fn store_root() -> PathBuf {
    store_root_from(std::env::var_os(HOME_ENV).map(PathBuf::from))
}

fn store_root_from(override_dir: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }
    if let Some(data_dir) = dirs::data_dir() {
        data_dir.join("rowstage")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".rowstage")
    } else {
        PathBuf::from(".rowstage")
    }
}

/// Well-known paths under the store root. Pure computation, no I/O.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub root: PathBuf,
    pub config_json: PathBuf,
    pub sessions_dir: PathBuf,
}

impl StorePaths {
    pub fn discover(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_json: root.join("config.json"),
            sessions_dir: root.join("sessions"),
            root,
        }
    }

    /// `<root>/sessions/<session_id>/`
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    /// Create the sessions directory. Idempotent.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.sessions_dir)?;
        Ok(())
    }
}

/// Fresh session id: `ses_<ulid>`.
pub fn new_session_id() -> String {
    format!("ses_{}", ulid::Ulid::new().to_string().to_lowercase())
}

/// Atomic write: write to temp file in same dir, then rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::anyhow!("cannot remove {}: {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_dir_wins() {
        let root = store_root_from(Some(PathBuf::from("/tmp/rowstage-home")));
        assert_eq!(root, PathBuf::from("/tmp/rowstage-home"));
    }

    #[test]
    fn empty_override_is_ignored() {
        let root = store_root_from(Some(PathBuf::new()));
        assert!(!root.as_os_str().is_empty());
        assert!(root.to_string_lossy().contains("rowstage"));
    }

    #[test]
    fn discover_builds_paths() {
        let p = StorePaths::discover("/tmp/rs");
        assert_eq!(p.config_json, PathBuf::from("/tmp/rs/config.json"));
        assert_eq!(p.sessions_dir, PathBuf::from("/tmp/rs/sessions"));
        assert_eq!(
            p.session_dir("ses_1"),
            PathBuf::from("/tmp/rs/sessions/ses_1")
        );
    }

    #[test]
    fn session_ids_are_prefixed_and_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert!(a.starts_with("ses_"));
        assert_eq!(a.len(), 4 + 26);
        assert_ne!(a, b);
    }

    #[test]
    fn write_atomic_creates_parents_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a").join("b").join("draft.json");
        write_atomic(&path, b"[]").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[]");
        write_atomic(&path, b"[1]").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]");
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gone.json");
        remove_if_exists(&path).unwrap();
        fs::write(&path, "x").unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
