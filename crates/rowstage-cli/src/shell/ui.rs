//! Plain-text rendering for the shell. Every function returns a string so
//! the output can be checked without a terminal.

use std::fmt::Write;

use rowstage_core::{CommitOp, ConflictSummaryEntry, RequestSummary};
use rowstage_session::{Outcome, Session, StagedPreview};

pub fn render_status(session: &Session) -> String {
    let mut out = String::new();
    let ctx = session.context();
    let _ = writeln!(
        out,
        "context  {}",
        if ctx.is_complete() {
            ctx.to_string()
        } else {
            format!("{ctx} (incomplete)")
        }
    );
    let _ = writeln!(out, "state    {}", session.state());
    let _ = writeln!(out, "head     {}", session.head().unwrap_or("(unknown)"));
    let _ = writeln!(out, "draft    {} ops", session.ops().len());
    if let Some(p) = session.staged_preview() {
        let _ = writeln!(
            out,
            "preview  {} on {}: {} ops, {} errors",
            p.kind,
            p.table,
            p.candidates.len(),
            p.errors.len()
        );
    }
    if let Some(op) = session.in_flight() {
        let _ = writeln!(out, "running  {op}");
    }
    if let Some(sub) = session.submitted() {
        let _ = writeln!(out, "request  {} (pending)", sub.request_id);
    }
    if ctx.is_on_branch(session.protected_branch()) {
        let _ = writeln!(out, "note     {} is read-only", ctx.branch_name);
    }
    if let Some(err) = session.last_error() {
        let _ = writeln!(out, "error    {err}");
    }
    out
}

pub fn render_ops(ops: &[CommitOp]) -> String {
    let mut out = String::new();
    for (i, op) in ops.iter().enumerate() {
        let _ = writeln!(out, "{i:>3}  {}", op.summary());
    }
    out
}

pub fn render_conflicts(entries: &[ConflictSummaryEntry]) -> String {
    if entries.is_empty() {
        return "No conflicts.\n".to_string();
    }
    let mut out = String::from("table                schema  data  constraint\n");
    for e in entries {
        let _ = writeln!(
            out,
            "{:<20} {:>6}  {:>4}  {:>10}",
            e.table, e.schema_conflicts, e.data_conflicts, e.constraint_violations
        );
    }
    out
}

pub fn render_preview(p: &StagedPreview) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} preview on {}", p.kind, p.table);
    out.push_str(&render_ops(&p.candidates));
    for w in &p.warnings {
        let _ = writeln!(out, "warning: {w}");
    }
    for e in &p.errors {
        let _ = writeln!(out, "error: row {}: {} {}", e.row_index, e.code, e.message);
    }
    if !p.errors.is_empty() {
        out.push_str("Fix the input and preview again; `drop-preview` to discard.\n");
    } else if !p.candidates.is_empty() {
        out.push_str("`apply` to add to the draft.\n");
    }
    out
}

pub fn render_requests(requests: &[RequestSummary]) -> String {
    if requests.is_empty() {
        return "No pending requests.\n".to_string();
    }
    let mut out = String::new();
    for r in requests {
        let _ = writeln!(
            out,
            "{}  {}  {}{}",
            r.request_id,
            r.work_branch,
            r.summary_ja,
            r.submitted_at
                .as_deref()
                .map(|t| format!("  ({t})"))
                .unwrap_or_default()
        );
    }
    out
}

/// One line for an operation's result, or nothing.
pub fn render_outcome(outcome: &Outcome) -> Option<String> {
    match outcome {
        Outcome::Applied { message, .. } => message.clone(),
        Outcome::Rejected(e) => Some(format!("rejected: {e}")),
        Outcome::Discarded => Some("result dropped: context changed".to_string()),
    }
}

pub const HELP: &str = "\
context    status | use <target> <db> <branch> | target <id> | database <name> | branch <name>
           refresh | tables
draft      insert <table> col=v... | update <table> --pk col=v col=v... | delete <table> col=v...
           ops | remove <index> | discard | commit [-m <message>]
merge      sync | conflicts | resolve <table> ours|theirs | recheck
preview    clone <table> --template col=v --new-pk a,b [--set col=v]
           batch <table> --template col=v --new-pk a,b --column c --value x,y
           bulk <table> <file.tsv> | preview | apply | drop-preview
approval   submit <summary...> | requests | approve <id> [-m <message>] | reject <id>
           help | quit
";
