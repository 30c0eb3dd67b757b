use anyhow::{Context, Result};
use rowstage_core::WorkContext;
use serde::{Deserialize, Serialize};

use crate::paths::SessionPaths;

/// `session.json`: identity and last context of a persisted session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMeta {
    pub session_id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub context: WorkContext,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>, context: WorkContext) -> Self {
        let now = now_rfc3339();
        Self {
            session_id: session_id.into(),
            created_at: now.clone(),
            updated_at: now,
            context,
        }
    }

    /// Record a new context and bump `updated_at`.
    pub fn touch(&mut self, context: &WorkContext) {
        self.context = context.clone();
        self.updated_at = now_rfc3339();
    }

    /// Returns None if the file doesn't exist.
    pub fn load(paths: &SessionPaths) -> Result<Option<Self>> {
        if !paths.session_json.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&paths.session_json)
            .with_context(|| format!("reading session: {}", paths.session_json.display()))?;
        let meta = serde_json::from_str(&content)
            .with_context(|| format!("parsing session: {}", paths.session_json.display()))?;
        Ok(Some(meta))
    }

    pub fn save(&self, paths: &SessionPaths) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        rowstage_store::write_atomic(&paths.session_json, data.as_bytes())
            .with_context(|| format!("saving session: {}", paths.session_json.display()))
    }
}

/// All sessions under the store, most recently updated first. Directories
/// without a readable `session.json` are skipped.
pub fn list_sessions(store: &rowstage_store::StorePaths) -> Result<Vec<SessionMeta>> {
    if !store.sessions_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&store.sessions_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let paths = SessionPaths::discover(entry.path());
        match SessionMeta::load(&paths) {
            Ok(Some(meta)) => out.push(meta),
            Ok(None) => {}
            Err(e) => tracing::warn!("skipping session {}: {e:#}", entry.path().display()),
        }
    }
    // RFC 3339 UTC strings sort chronologically.
    out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(out)
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
