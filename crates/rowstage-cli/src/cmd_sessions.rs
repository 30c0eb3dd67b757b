use rowstage_ledger::{list_sessions, SessionPaths};
use rowstage_store::StorePaths;

/// `rowstage sessions`
pub fn execute(store: &StorePaths) -> anyhow::Result<()> {
    let sessions = list_sessions(store)?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for meta in sessions {
        let paths = SessionPaths::in_store(store, &meta.session_id);
        let ops = match crate::cmd_draft::read_ops(&paths) {
            Ok(ops) => format!("{} ops", ops.len()),
            Err(e) => {
                tracing::warn!("{e:#}");
                "draft unreadable".to_string()
            }
        };
        println!(
            "{}  {}  {ops}  (updated {})",
            meta.session_id, meta.context, meta.updated_at
        );
    }
    Ok(())
}
