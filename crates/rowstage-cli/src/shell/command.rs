//! Shell line parsing: a quote-aware splitter in front of a clap parser.

use clap::{Parser, Subcommand};
use rowstage_core::{ResolveStrategy, Row};
use serde_json::Value;

// ── Line schema ──

#[derive(Parser, Debug)]
#[command(
    no_binary_name = true,
    disable_help_flag = true,
    disable_help_subcommand = true,
    disable_version_flag = true
)]
pub struct ShellLine {
    #[command(subcommand)]
    pub cmd: ShellCommand,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ShellCommand {
    /// Show context, state, head, and draft size
    Status,
    /// Select target, database, and branch at once
    Use {
        target: String,
        database: String,
        branch: String,
    },
    /// Select a target (clears database and branch)
    Target { id: String },
    /// Select a database (clears branch)
    Database { name: String },
    /// Select a work branch
    Branch { name: String },
    /// Re-read the branch head and table list
    Refresh,
    /// List tables of the current database
    Tables,
    /// Stage an insert: insert <table> col=value...
    Insert {
        table: String,
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Stage an update: update <table> --pk col=value col=value...
    Update {
        table: String,
        #[arg(long = "pk", required = true)]
        pk: Vec<String>,
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Stage a delete: delete <table> col=value...
    Delete {
        table: String,
        #[arg(required = true)]
        pk: Vec<String>,
    },
    /// List staged ops
    Ops,
    /// Remove one staged op by index
    Remove { index: usize },
    /// Throw away the whole draft
    Discard,
    /// Commit the draft to the work branch
    Commit {
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Merge the protected branch into the work branch
    Sync,
    /// Show the conflict summary
    Conflicts,
    /// Resolve data conflicts of one table with ours or theirs
    Resolve {
        table: String,
        strategy: ResolveStrategy,
    },
    /// Re-read the conflict summary
    Recheck,
    /// Preview copies of one row under new keys
    Clone {
        table: String,
        /// Template key, col=value
        #[arg(long)]
        template: String,
        /// New key values (repeatable or comma separated)
        #[arg(long = "new-pk", required = true, value_delimiter = ',')]
        new_pks: Vec<String>,
        /// Override one column in every copy, col=value
        #[arg(long)]
        set: Option<String>,
    },
    /// Preview copies with one change value per new key
    Batch {
        table: String,
        #[arg(long)]
        template: String,
        #[arg(long = "new-pk", required = true, value_delimiter = ',')]
        new_pks: Vec<String>,
        #[arg(long)]
        column: Option<String>,
        #[arg(long = "value", value_delimiter = ',')]
        values: Vec<String>,
    },
    /// Preview updates from a TSV file (key column first)
    Bulk {
        table: String,
        file: std::path::PathBuf,
    },
    /// Show the staged preview
    Preview,
    /// Move the staged preview into the draft
    Apply,
    /// Drop the staged preview
    #[command(name = "drop-preview")]
    DropPreview,
    /// Submit the work branch for approval
    Submit {
        #[arg(required = true, num_args = 1..)]
        summary: Vec<String>,
    },
    /// List pending approval requests
    Requests,
    /// Approve a request and merge it into the protected branch
    Approve {
        request_id: String,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Reject a request
    Reject { request_id: String },
    /// Show commands
    Help,
    /// Leave the shell
    #[command(alias = "exit")]
    Quit,
}

/// Parse one input line. `Ok(None)` for blank lines and comments.
pub fn parse_line(line: &str) -> Result<Option<ShellCommand>, String> {
    let words = split_words(line)?;
    if words.is_empty() || words[0].starts_with('#') {
        return Ok(None);
    }
    ShellLine::try_parse_from(words)
        .map(|l| Some(l.cmd))
        .map_err(|e| e.to_string().trim_end().to_string())
}

// ── Word splitting ──

/// Split on whitespace, honoring single quotes, double quotes, and
/// backslash escapes outside single quotes.
pub fn split_words(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => cur.push(c),
            (_, '\\') => match chars.next() {
                Some(n) => {
                    cur.push(n);
                    in_word = true;
                }
                None => return Err("trailing backslash".to_string()),
            },
            (Some('"'), '"') => quote = None,
            (Some(_), _) => cur.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            (None, _) => {
                cur.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(cur);
    }
    Ok(words)
}

// ── Cell values ──

/// `true`/`false`/`null`, integers, and floats become JSON scalars;
/// everything else stays a string.
pub fn parse_cell(raw: &str) -> Value {
    rowstage_store::config::parse_value(raw)
}

/// Parse a single `col=value` pair.
pub fn parse_assignment(pair: &str) -> Result<(String, Value), String> {
    let (col, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("expected col=value, got {pair:?}"))?;
    let col = col.trim();
    if col.is_empty() {
        return Err(format!("empty column name in {pair:?}"));
    }
    Ok((col.to_string(), parse_cell(value)))
}

/// Parse `col=value` pairs into a row.
pub fn parse_assignments(pairs: &[String]) -> Result<Row, String> {
    let mut row = Row::new();
    for pair in pairs {
        let (col, value) = parse_assignment(pair)?;
        if row.contains_key(&col) {
            return Err(format!("column {col} given twice"));
        }
        row.insert(col, value);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_handles_quotes_and_escapes() {
        assert_eq!(
            split_words(r#"insert items name="blue bolt" note='it\'s' a\ b"#).unwrap_err(),
            "unterminated quote"
        );
        assert_eq!(
            split_words(r#"insert items name="blue bolt" note='x y' a\ b"#).unwrap(),
            vec!["insert", "items", "name=blue bolt", "note=x y", "a b"]
        );
        assert_eq!(split_words(r#"submit """#).unwrap(), vec!["submit", ""]);
        assert!(split_words("   ").unwrap().is_empty());
    }

    #[test]
    fn parses_update_with_key() {
        let cmd = parse_line("update items --pk id=3 name=nut price=1.5")
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            ShellCommand::Update {
                table: "items".into(),
                pk: vec!["id=3".into()],
                values: vec!["name=nut".into(), "price=1.5".into()],
            }
        );
    }

    #[test]
    fn parses_resolve_strategy() {
        assert_eq!(
            parse_line("resolve orders theirs").unwrap().unwrap(),
            ShellCommand::Resolve {
                table: "orders".into(),
                strategy: ResolveStrategy::Theirs
            }
        );
        assert!(parse_line("resolve orders both").is_err());
    }

    #[test]
    fn clone_accepts_comma_separated_keys() {
        let cmd = parse_line("clone items --template id=1 --new-pk 7,8 --new-pk 9")
            .unwrap()
            .unwrap();
        match cmd {
            ShellCommand::Clone { new_pks, .. } => assert_eq!(new_pks, vec!["7", "8", "9"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("# note to self").unwrap(), None);
        assert_eq!(parse_line("exit").unwrap(), Some(ShellCommand::Quit));
    }

    #[test]
    fn assignments_become_typed_cells() {
        let row = parse_assignments(&["id=3".into(), "name=nut".into(), "gone=null".into()])
            .unwrap();
        assert_eq!(row["id"], json!(3));
        assert_eq!(row["name"], json!("nut"));
        assert_eq!(row["gone"], json!(null));
        assert!(parse_assignments(&["id".into()]).is_err());
        assert!(parse_assignments(&["id=1".into(), "id=2".into()]).is_err());
    }
}
