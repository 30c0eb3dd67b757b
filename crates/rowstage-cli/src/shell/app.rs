use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use rowstage_core::{ApiError, CommitOp, Row, TableInfo, WorkContext};
use rowstage_ledger::{SessionMeta, SessionPaths};
use rowstage_remote::{MemoryRemote, Remote};
use rowstage_session::{ContextToken, Outcome, PreviewTemplate, Session};

use super::command::{parse_assignment, parse_assignments, parse_cell, ShellCommand};
use super::ui;

/// A background read, tagged with the context it was issued under.
pub enum Refresh {
    Head(ContextToken, Result<String, ApiError>),
    Tables(ContextToken, Result<Vec<TableInfo>, ApiError>),
}

/// Shell state: the session plus everything around it that is not part of
/// the protocol (remote handle, persisted metadata, refresh channel).
pub struct App {
    session: Session,
    remote: Arc<dyn Remote>,
    /// Set in offline mode; branches are created on first use.
    offline: Option<Arc<MemoryRemote>>,
    meta: SessionMeta,
    paths: SessionPaths,
    tx: Sender<Refresh>,
    rx: Receiver<Refresh>,
    pub should_quit: bool,
}

impl App {
    pub fn new(
        session: Session,
        remote: Arc<dyn Remote>,
        offline: Option<Arc<MemoryRemote>>,
        meta: SessionMeta,
        paths: SessionPaths,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            session,
            remote,
            offline,
            meta,
            paths,
            tx,
            rx,
            should_quit: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.meta.session_id
    }

    pub fn prompt(&self) -> String {
        let n = self.session.ops().len();
        let draft = if n > 0 { format!(" +{n}") } else { String::new() };
        format!("{} [{}{draft}]> ", self.session.context(), self.session.state())
    }

    /// Persist metadata for the current context and kick off a head and
    /// table read for it.
    pub fn on_context_changed(&mut self) {
        let ctx = self.session.context().clone();
        self.meta.touch(&ctx);
        if let Err(e) = self.meta.save(&self.paths) {
            tracing::warn!("session metadata not saved: {e:#}");
        }
        if !ctx.is_complete() {
            return;
        }
        if let Some(mem) = &self.offline {
            seed_offline_branch(mem, &ctx, self.session.protected_branch());
        }
        self.spawn_refresh();
    }

    fn spawn_refresh(&self) {
        let token = self.session.token();
        let remote = Arc::clone(&self.remote);
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            let head = remote.get_head(token.context());
            if tx.send(Refresh::Head(token.clone(), head)).is_err() {
                return;
            }
            let tables = remote.list_tables(token.context());
            let _ = tx.send(Refresh::Tables(token, tables));
        });
    }

    /// Apply every background result that has arrived. Results for a
    /// context the user has since left are dropped by the session.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            let outcome = match msg {
                Refresh::Head(token, result) => self.session.complete_head_refresh(&token, result),
                Refresh::Tables(token, result) => {
                    self.session.complete_tables_refresh(&token, result)
                }
            };
            if let Outcome::Applied {
                message: Some(m), ..
            } = outcome
            {
                out.push(m);
            }
        }
        out
    }

    #[cfg(test)]
    fn sender(&self) -> Sender<Refresh> {
        self.tx.clone()
    }

    /// Run one command and return its output.
    pub fn execute(&mut self, cmd: ShellCommand) -> String {
        let generation = self.session.token().generation();
        let out = self.dispatch(cmd);
        if self.session.token().generation() != generation {
            self.on_context_changed();
        }
        out
    }

    fn dispatch(&mut self, cmd: ShellCommand) -> String {
        let remote = Arc::clone(&self.remote);
        let remote: &dyn Remote = &*remote;
        let s = &mut self.session;

        match cmd {
            ShellCommand::Status => ui::render_status(s),
            ShellCommand::Use {
                target,
                database,
                branch,
            } => show(s.switch_context(WorkContext::new(target, database, branch))),
            ShellCommand::Target { id } => show(s.set_target(&id)),
            ShellCommand::Database { name } => show(s.set_database(&name)),
            ShellCommand::Branch { name } => show(s.set_branch(&name)),
            ShellCommand::Refresh => {
                let head = s.refresh_head(remote);
                let tables = s.refresh_tables(remote);
                match (ui::render_outcome(&head), ui::render_outcome(&tables)) {
                    (None, None) => format!(
                        "head {} ({} tables)",
                        s.head().unwrap_or("(unknown)"),
                        s.tables().len()
                    ),
                    (a, b) => [a, b].into_iter().flatten().collect::<Vec<_>>().join("\n"),
                }
            }
            ShellCommand::Tables => {
                if s.tables().is_empty() {
                    if let Some(m) = ui::render_outcome(&s.refresh_tables(remote)) {
                        return m;
                    }
                }
                if s.tables().is_empty() {
                    "No tables.".to_string()
                } else {
                    s.tables().join("\n")
                }
            }
            ShellCommand::Insert { table, values } => match parse_assignments(&values) {
                Ok(values) => show(s.stage(CommitOp::insert(table, values))),
                Err(e) => e,
            },
            ShellCommand::Update { table, pk, values } => {
                match (parse_assignments(&pk), parse_assignments(&values)) {
                    (Ok(key), Ok(values)) => show(s.stage(CommitOp::update(table, key, values))),
                    (Err(e), _) | (_, Err(e)) => e,
                }
            }
            ShellCommand::Delete { table, pk } => match parse_assignments(&pk) {
                Ok(key) => show(s.stage(CommitOp::delete(table, key))),
                Err(e) => e,
            },
            ShellCommand::Ops => {
                if s.ops().is_empty() {
                    "Draft is empty.".to_string()
                } else {
                    ui::render_ops(s.ops()).trim_end().to_string()
                }
            }
            ShellCommand::Remove { index } => show(s.unstage(index)),
            ShellCommand::Discard => show(s.discard_draft()),
            ShellCommand::Commit { message } => {
                show(s.commit(remote, message.as_deref().unwrap_or("")))
            }
            ShellCommand::Sync => {
                let mut out = show(s.sync(remote));
                if s.state().is_conflicted() {
                    out.push('\n');
                    out.push_str(ui::render_conflicts(s.conflicts()).trim_end());
                }
                out
            }
            ShellCommand::Conflicts => match ui::render_outcome(&s.refresh_conflicts(remote)) {
                Some(m) => m,
                None => ui::render_conflicts(s.conflicts()).trim_end().to_string(),
            },
            ShellCommand::Resolve { table, strategy } => show(s.resolve(remote, &table, strategy)),
            ShellCommand::Recheck => show(s.recheck(remote)),
            ShellCommand::Clone {
                table,
                template,
                new_pks,
                set,
            } => {
                let template_pk = match parse_key(&template) {
                    Ok(pk) => pk,
                    Err(e) => return e,
                };
                let (change_column, change_value) = match set.as_deref().map(parse_assignment) {
                    None => (None, None),
                    Some(Ok((c, v))) => (Some(c), Some(v)),
                    Some(Err(e)) => return e,
                };
                run_preview(
                    s,
                    remote,
                    PreviewTemplate::Clone {
                        table,
                        template_pk,
                        new_pks: new_pks.iter().map(|p| parse_cell(p)).collect(),
                        change_column,
                        change_value,
                    },
                )
            }
            ShellCommand::Batch {
                table,
                template,
                new_pks,
                column,
                values,
            } => {
                let template_pk = match parse_key(&template) {
                    Ok(pk) => pk,
                    Err(e) => return e,
                };
                let change_values = if values.is_empty() {
                    None
                } else {
                    Some(values.iter().map(|v| parse_cell(v)).collect())
                };
                run_preview(
                    s,
                    remote,
                    PreviewTemplate::BatchGenerate {
                        table,
                        template_pk,
                        new_pks: new_pks.iter().map(|p| parse_cell(p)).collect(),
                        change_column: column,
                        change_values,
                    },
                )
            }
            ShellCommand::Bulk { table, file } => match std::fs::read_to_string(&file) {
                Ok(tsv) => run_preview(s, remote, PreviewTemplate::BulkUpdate { table, tsv }),
                Err(e) => format!("cannot read {}: {e}", file.display()),
            },
            ShellCommand::Preview => match s.staged_preview() {
                Some(p) => ui::render_preview(p).trim_end().to_string(),
                None => "No preview staged.".to_string(),
            },
            ShellCommand::Apply => show(s.apply_preview()),
            ShellCommand::DropPreview => match ui::render_outcome(&s.discard_preview()) {
                Some(m) => m,
                None => "No preview staged.".to_string(),
            },
            ShellCommand::Submit { summary } => show(s.submit(remote, &summary.join(" "))),
            ShellCommand::Requests => match s.list_requests(remote) {
                Ok(list) => ui::render_requests(&list).trim_end().to_string(),
                Err(o) => show(o),
            },
            ShellCommand::Approve {
                request_id,
                message,
            } => show(s.approve(remote, &request_id, message.as_deref())),
            ShellCommand::Reject { request_id } => show(s.reject(remote, &request_id)),
            ShellCommand::Help => ui::HELP.trim_end().to_string(),
            ShellCommand::Quit => {
                self.should_quit = true;
                String::new()
            }
        }
    }
}

fn show(outcome: Outcome) -> String {
    ui::render_outcome(&outcome).unwrap_or_default()
}

fn parse_key(pair: &str) -> Result<Row, String> {
    let (col, value) = parse_assignment(pair)?;
    let mut key = Row::new();
    key.insert(col, value);
    Ok(key)
}

fn run_preview(s: &mut Session, remote: &dyn Remote, template: PreviewTemplate) -> String {
    let outcome = s.preview(remote, template);
    let mut out = show(outcome);
    if let Some(p) = s.staged_preview() {
        out.push('\n');
        out.push_str(ui::render_preview(p).trim_end());
    }
    out
}

/// Offline branches spring into existence, along with the protected branch
/// they would be merged into.
fn seed_offline_branch(mem: &MemoryRemote, ctx: &WorkContext, protected: &str) {
    let main = ctx.with_branch(protected);
    for c in [&main, ctx] {
        if mem.head(c).is_none() {
            let head = mem.advance_head(c);
            tracing::debug!("offline: created {c} at {head}");
        }
    }
}
