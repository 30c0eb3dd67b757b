//! `rowstage shell`: one process, one session.

pub mod app;
pub mod command;
pub mod ui;

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use rowstage_core::WorkContext;
use rowstage_ledger::{DraftLedger, FileSnapshot, SessionMeta, SessionPaths};
use rowstage_remote::{HttpRemote, MemoryRemote, Remote};
use rowstage_session::Session;
use rowstage_store::{Config, StorePaths};

use app::App;

pub struct ShellOptions {
    pub session: Option<String>,
    pub offline: bool,
    pub target: Option<String>,
    pub database: Option<String>,
    pub branch: Option<String>,
}

/// Context from config defaults, or from the resumed session.
fn base_context(config: &Config, resumed: Option<&SessionMeta>) -> WorkContext {
    match resumed {
        Some(meta) => meta.context.clone(),
        None => WorkContext::new(
            config.default_target.clone().unwrap_or_default(),
            config.default_database.clone().unwrap_or_default(),
            config.default_branch.clone().unwrap_or_default(),
        ),
    }
}

/// Command-line selections override the base context piecewise.
fn requested_context(base: &WorkContext, opts: &ShellOptions) -> WorkContext {
    let mut ctx = base.clone();
    if let Some(t) = &opts.target {
        ctx = ctx.with_target(t.as_str());
    }
    if let Some(d) = &opts.database {
        ctx = ctx.with_database(d.as_str());
    }
    if let Some(b) = &opts.branch {
        ctx = ctx.with_branch(b.as_str());
    }
    // A bare --target keeps the base database and branch when they are
    // still meaningful for it.
    if opts.target.as_deref() == Some(base.target_id.as_str()) && opts.database.is_none() {
        ctx.db_name = base.db_name.clone();
        if opts.branch.is_none() {
            ctx.branch_name = base.branch_name.clone();
        }
    }
    if opts.database.as_deref() == Some(base.db_name.as_str()) && opts.branch.is_none() {
        ctx.branch_name = base.branch_name.clone();
    }
    ctx
}

fn open_session(
    store: &StorePaths,
    session_id: Option<&str>,
) -> anyhow::Result<(SessionPaths, Option<SessionMeta>)> {
    match session_id {
        Some(id) => {
            let paths = SessionPaths::in_store(store, id);
            if !paths.exists() {
                anyhow::bail!("no session {id}; see `rowstage sessions`");
            }
            let meta = SessionMeta::load(&paths)?;
            Ok((paths, meta))
        }
        None => {
            let id = rowstage_store::new_session_id();
            let paths = SessionPaths::in_store(store, &id);
            paths.ensure_layout()?;
            Ok((paths, None))
        }
    }
}

pub fn run(opts: ShellOptions, store: &StorePaths, config: &Config) -> anyhow::Result<()> {
    store.ensure_layout()?;
    let (paths, resumed) = open_session(store, opts.session.as_deref())?;
    let session_id = paths
        .session_id()
        .context("session directory has no name")?
        .to_string();

    let base = base_context(config, resumed.as_ref());
    let meta = resumed.unwrap_or_else(|| SessionMeta::new(&*session_id, base.clone()));
    let ledger = DraftLedger::load(Box::new(FileSnapshot::new(&paths.draft_json)));
    let mut session = Session::new(base.clone(), ledger, config.protected_branch.clone());

    let wanted = requested_context(&base, &opts);
    if wanted != base {
        let dropped = session.ops().len();
        session.switch_context(wanted);
        if dropped > 0 {
            println!("Context changed; discarded {dropped} staged ops from {base}.");
        }
    }

    let (remote, offline): (Arc<dyn Remote>, Option<Arc<MemoryRemote>>) = if opts.offline {
        let mem = Arc::new(MemoryRemote::with_protected_branch(
            config.protected_branch.clone(),
        ));
        let remote: Arc<dyn Remote> = mem.clone();
        (remote, Some(mem))
    } else {
        let remote: Arc<dyn Remote> = Arc::new(HttpRemote::from_config(config));
        (remote, None)
    };

    let mut app = App::new(session, remote, offline, meta, paths);
    app.on_context_changed();

    println!(
        "rowstage session {} ({})",
        app.session_id(),
        if opts.offline {
            "offline".to_string()
        } else {
            config.base_url.clone()
        }
    );
    if !app.session().ops().is_empty() {
        println!("Resumed draft with {} ops.", app.session().ops().len());
    }
    println!("Type `help` for commands.");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut line = String::new();
    loop {
        for msg in app.drain() {
            println!("{msg}");
        }
        print!("{}", app.prompt());
        stdout.flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            break;
        }
        match command::parse_line(&line) {
            Ok(None) => {}
            Ok(Some(cmd)) => {
                let out = app.execute(cmd);
                if !out.is_empty() {
                    println!("{out}");
                }
            }
            Err(e) => println!("{e}"),
        }
        if app.should_quit {
            break;
        }
    }
    Ok(())
}
