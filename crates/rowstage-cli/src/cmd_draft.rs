use anyhow::Context;
use clap::Subcommand;
use rowstage_core::CommitOp;
use rowstage_ledger::{DraftLedger, FileSnapshot, SessionMeta, SessionPaths, SnapshotStore};
use rowstage_store::StorePaths;

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum DraftCmd {
    /// Show the staged ops of a session
    Show {
        /// Session id
        session: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Throw away every staged op of a session
    Discard {
        /// Session id
        session: String,
    },
}

// ── Dispatch ──

pub fn run(cmd: DraftCmd, store: &StorePaths) -> anyhow::Result<()> {
    match cmd {
        DraftCmd::Show { session, json } => show(store, &session, json),
        DraftCmd::Discard { session } => discard(store, &session),
    }
}

fn session_paths(store: &StorePaths, session_id: &str) -> anyhow::Result<SessionPaths> {
    let paths = SessionPaths::in_store(store, session_id);
    if !paths.exists() {
        anyhow::bail!("no session {session_id}; see `rowstage sessions`");
    }
    Ok(paths)
}

/// Decode the persisted draft without touching it. Unlike
/// `DraftLedger::load`, a corrupt snapshot is reported and left in place.
pub fn read_ops(paths: &SessionPaths) -> anyhow::Result<Vec<CommitOp>> {
    let Some(raw) = FileSnapshot::new(&paths.draft_json).read()? else {
        return Ok(Vec::new());
    };
    serde_json::from_str(&raw)
        .with_context(|| format!("corrupt draft snapshot: {}", paths.draft_json.display()))
}

// ── Command Implementations ──

/// `rowstage draft show <session>`
pub fn show(store: &StorePaths, session_id: &str, json: bool) -> anyhow::Result<()> {
    let paths = session_paths(store, session_id)?;
    let ops = read_ops(&paths)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ops)?);
        return Ok(());
    }
    if let Some(meta) = SessionMeta::load(&paths)? {
        println!("Session {} on {}", meta.session_id, meta.context);
    }
    if ops.is_empty() {
        println!("Draft is empty.");
    } else {
        print!("{}", crate::shell::ui::render_ops(&ops));
    }
    Ok(())
}

/// `rowstage draft discard <session>`
pub fn discard(store: &StorePaths, session_id: &str) -> anyhow::Result<()> {
    let paths = session_paths(store, session_id)?;
    let mut ledger = DraftLedger::load(Box::new(FileSnapshot::new(&paths.draft_json)));
    let n = ledger.len();
    ledger.clear();
    println!("Discarded {n} ops from {session_id}");
    Ok(())
}
