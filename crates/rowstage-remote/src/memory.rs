//! In-process remote authority. Keeps branch heads, rows, conflict
//! summaries, and approval requests in memory and enforces the same
//! expected-head and protected-branch rules as the server.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use rowstage_core::{
    ApiError, ApproveRequest, ApproveResponse, CommitOp, CommitRequest, ConflictSummaryEntry,
    ErrorKind, HashResponse, OpKind, PreviewBatchGenerateRequest, PreviewBulkUpdateRequest,
    PreviewCloneRequest, PreviewError, PreviewRequest, PreviewResponse, RejectRequest,
    RejectResponse, RequestSummary, ResolveConflictsRequest, Row, SubmitRequestRequest,
    SubmitRequestResponse, SyncRequest, TableInfo, WorkContext,
};
use serde_json::{json, Value};

use crate::Remote;

const DEFAULT_PK: &str = "id";

/// Names each remote operation, for scripted failures and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Head,
    Tables,
    Commit,
    Sync,
    Preview,
    Conflicts,
    Resolve,
    Submit,
    ListRequests,
    Approve,
    Reject,
}

#[derive(Debug, Default)]
struct MemoryState {
    protected_branch: String,
    /// Keyed by the context's display form, `target/db@branch`.
    heads: BTreeMap<String, String>,
    head_counter: u64,
    /// Keyed by `target/db`.
    tables: BTreeMap<String, Vec<String>>,
    primary_keys: BTreeMap<String, String>,
    /// Keyed by (context key, table).
    rows: BTreeMap<(String, String), Vec<Row>>,
    conflicts: BTreeMap<String, Vec<ConflictSummaryEntry>>,
    /// Keyed by `target/db`, then request id.
    requests: BTreeMap<String, BTreeMap<String, RequestSummary>>,
    commits: Vec<CommitRequest>,
    scripted: Vec<(Endpoint, ApiError)>,
    calls: Vec<Endpoint>,
}

impl MemoryState {
    fn next_head(&mut self) -> String {
        self.head_counter += 1;
        format!("mem{:04}", self.head_counter)
    }

    fn record(&mut self, endpoint: Endpoint) -> Result<(), ApiError> {
        self.calls.push(endpoint);
        if let Some(pos) = self.scripted.iter().position(|(e, _)| *e == endpoint) {
            let (_, err) = self.scripted.remove(pos);
            return Err(err);
        }
        Ok(())
    }

    fn head_of(&self, ctx: &WorkContext) -> Result<String, ApiError> {
        self.heads
            .get(&ctx.to_string())
            .cloned()
            .ok_or_else(|| ApiError::new(ErrorKind::NotFound, format!("branch not found: {ctx}")))
    }

    fn check_writable(&self, branch: &str) -> Result<(), ApiError> {
        if branch == self.protected_branch {
            return Err(ApiError::new(
                ErrorKind::Forbidden,
                format!("write operations on {branch} branch are forbidden"),
            ));
        }
        Ok(())
    }

    fn check_head(&self, ctx: &WorkContext, expected: &str) -> Result<(), ApiError> {
        let actual = self.head_of(ctx)?;
        if actual != expected {
            return Err(ApiError::new(ErrorKind::StaleHead, "expected_head mismatch")
                .with_details(json!({"expected_head": expected, "actual_head": actual})));
        }
        Ok(())
    }

    fn pk_column(&self, table: &str) -> String {
        self.primary_keys
            .get(table)
            .cloned()
            .unwrap_or_else(|| DEFAULT_PK.to_string())
    }

    fn rows_of(&self, ctx: &WorkContext, table: &str) -> Vec<Row> {
        self.rows
            .get(&(ctx.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Copy every table of `from` onto `to`.
    fn copy_rows(&mut self, from: &WorkContext, to: &WorkContext) {
        let from_key = from.to_string();
        let to_key = to.to_string();
        self.rows.retain(|(ctx, _), _| *ctx != to_key);
        let copied: Vec<_> = self
            .rows
            .iter()
            .filter(|((ctx, _), _)| *ctx == from_key)
            .map(|((_, table), rows)| ((to_key.clone(), table.clone()), rows.clone()))
            .collect();
        self.rows.extend(copied);
    }

    fn drop_branch(&mut self, ctx: &WorkContext) {
        let key = ctx.to_string();
        self.heads.remove(&key);
        self.conflicts.remove(&key);
        self.rows.retain(|(c, _), _| *c != key);
    }
}

/// In-memory [`Remote`]. Cheap to construct; all state sits behind one
/// mutex so it can be shared across threads.
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_protected_branch("main")
    }

    pub fn with_protected_branch(branch: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                protected_branch: branch.into(),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Setup ──

    /// Create (or move) a branch to `head`.
    pub fn set_head(&self, ctx: &WorkContext, head: impl Into<String>) {
        self.lock().heads.insert(ctx.to_string(), head.into());
    }

    /// Move a branch as another writer would. Returns the new head.
    pub fn advance_head(&self, ctx: &WorkContext) -> String {
        let mut st = self.lock();
        let head = st.next_head();
        st.heads.insert(ctx.to_string(), head.clone());
        head
    }

    pub fn head(&self, ctx: &WorkContext) -> Option<String> {
        self.lock().heads.get(&ctx.to_string()).cloned()
    }

    pub fn set_tables(&self, target_id: &str, db_name: &str, tables: &[&str]) {
        self.lock().tables.insert(
            db_key(target_id, db_name),
            tables.iter().map(|t| t.to_string()).collect(),
        );
    }

    pub fn set_primary_key(&self, table: &str, column: &str) {
        self.lock()
            .primary_keys
            .insert(table.to_string(), column.to_string());
    }

    pub fn insert_row(&self, ctx: &WorkContext, table: &str, row: Row) {
        self.lock()
            .rows
            .entry((ctx.to_string(), table.to_string()))
            .or_default()
            .push(row);
    }

    pub fn rows(&self, ctx: &WorkContext, table: &str) -> Vec<Row> {
        self.lock().rows_of(ctx, table)
    }

    pub fn set_conflicts(&self, ctx: &WorkContext, entries: Vec<ConflictSummaryEntry>) {
        self.lock().conflicts.insert(ctx.to_string(), entries);
    }

    /// Make the next call to `endpoint` fail with `err`.
    pub fn fail_next(&self, endpoint: Endpoint, err: ApiError) {
        self.lock().scripted.push((endpoint, err));
    }

    // ── Inspection ──

    pub fn calls(&self) -> Vec<Endpoint> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, endpoint: Endpoint) -> usize {
        self.lock().calls.iter().filter(|e| **e == endpoint).count()
    }

    /// Every accepted commit, oldest first.
    pub fn committed(&self) -> Vec<CommitRequest> {
        self.lock().commits.clone()
    }
}

fn db_key(target_id: &str, db_name: &str) -> String {
    format!("{target_id}/{db_name}")
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorKind::InvalidArgument, message)
}

/// Split `wi/<item>/<NN>` into its item and round.
pub(crate) fn parse_work_branch(branch: &str) -> Option<(&str, u32)> {
    let rest = branch.strip_prefix("wi/")?;
    let (item, round) = rest.rsplit_once('/')?;
    let item_ok = !item.is_empty()
        && item
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !item_ok || round.len() != 2 || !round.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((item, round.parse().ok()?))
}

fn now_rfc3339() -> Option<String> {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}

// ── Row application ──

fn row_matches(row: &Row, key: &Row) -> bool {
    key.iter().all(|(c, v)| row.get(c) == Some(v))
}

fn apply_op(rows: &mut Vec<Row>, op: &CommitOp, pk_col: &str, index: usize) -> Result<(), ApiError> {
    op.validate()
        .map_err(|e| invalid(format!("op {index}: {e}")))?;
    match op.kind {
        OpKind::Insert => {
            let pk = op
                .values
                .get(pk_col)
                .ok_or_else(|| invalid(format!("op {index}: insert is missing {pk_col}")))?;
            if rows.iter().any(|r| r.get(pk_col) == Some(pk)) {
                return Err(invalid(format!(
                    "op {index}: duplicate primary key {}",
                    value_text(pk)
                )));
            }
            rows.push(op.values.clone());
        }
        OpKind::Update => {
            let key = op.key.as_ref().ok_or_else(|| invalid("update requires pk"))?;
            let row = rows
                .iter_mut()
                .find(|r| row_matches(r, key))
                .ok_or_else(|| ApiError::new(ErrorKind::NotFound, format!("op {index}: row not found")))?;
            for (c, v) in &op.values {
                row.insert(c.clone(), v.clone());
            }
        }
        OpKind::Delete => {
            let key = op.key.as_ref().ok_or_else(|| invalid("delete requires pk"))?;
            let pos = rows
                .iter()
                .position(|r| row_matches(r, key))
                .ok_or_else(|| ApiError::new(ErrorKind::NotFound, format!("op {index}: row not found")))?;
            rows.remove(pos);
        }
    }
    Ok(())
}

// ── Previews ──

struct CloneSpec<'a> {
    ctx: WorkContext,
    table: &'a str,
    template_pk: &'a Row,
    new_pks: &'a [Value],
    change_column: Option<&'a str>,
}

fn clone_ops(
    st: &MemoryState,
    spec: &CloneSpec<'_>,
    change_value_at: impl Fn(usize) -> Option<Value>,
) -> Result<PreviewResponse, ApiError> {
    if spec.template_pk.len() != 1 {
        return Err(invalid("single primary key required"));
    }
    if spec.new_pks.is_empty() {
        return Err(invalid("at least one new_pk is required"));
    }
    let (pk_col, pk_val) = spec
        .template_pk
        .iter()
        .next()
        .ok_or_else(|| invalid("single primary key required"))?;
    let rows = st.rows_of(&spec.ctx, spec.table);
    let template = rows
        .iter()
        .find(|r| r.get(pk_col) == Some(pk_val))
        .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "template row not found"))?;

    let collisions = spec
        .new_pks
        .iter()
        .filter(|pk| rows.iter().any(|r| r.get(pk_col) == Some(*pk)))
        .count();
    if collisions > 0 {
        return Err(invalid(format!("{collisions} new PKs already exist in table")));
    }

    let mut resp = PreviewResponse::default();
    for (i, new_pk) in spec.new_pks.iter().enumerate() {
        let mut values = template.clone();
        values.insert(pk_col.clone(), new_pk.clone());
        if let Some(col) = spec.change_column {
            if col == pk_col.as_str() {
                resp.warnings
                    .push(format!("row {i}: change column {col} is the primary key, ignored"));
            } else if let Some(v) = change_value_at(i) {
                if !template.contains_key(col) {
                    resp.errors.push(PreviewError {
                        row_index: i,
                        code: ErrorKind::InvalidArgument.code().to_string(),
                        message: format!("unknown column: {col}"),
                        details: None,
                    });
                    continue;
                }
                values.insert(col.to_string(), v);
            }
        }
        resp.ops.push(CommitOp::insert(spec.table, values));
    }
    Ok(resp)
}

fn preview_clone(st: &MemoryState, req: &PreviewCloneRequest) -> Result<PreviewResponse, ApiError> {
    let spec = CloneSpec {
        ctx: WorkContext::new(&*req.target_id, &*req.db_name, &*req.branch_name),
        table: &req.table,
        template_pk: &req.template_pk,
        new_pks: &req.new_pks,
        change_column: req.change_column.as_deref(),
    };
    clone_ops(st, &spec, |_| req.change_value.clone())
}

fn preview_batch(
    st: &MemoryState,
    req: &PreviewBatchGenerateRequest,
) -> Result<PreviewResponse, ApiError> {
    if let Some(values) = &req.change_values {
        if values.len() != req.new_pks.len() {
            return Err(invalid(format!(
                "change_values has {} entries, expected {}",
                values.len(),
                req.new_pks.len()
            )));
        }
    }
    let spec = CloneSpec {
        ctx: WorkContext::new(&*req.target_id, &*req.db_name, &*req.branch_name),
        table: &req.table,
        template_pk: &req.template_pk,
        new_pks: &req.new_pks,
        change_column: req.change_column.as_deref(),
    };
    clone_ops(st, &spec, |i| {
        req.change_values.as_ref().and_then(|v| v.get(i).cloned())
    })
}

/// Header row names the key column then the update columns; each data row
/// becomes one update op. Unknown keys are row-indexed errors.
fn preview_bulk(
    st: &MemoryState,
    req: &PreviewBulkUpdateRequest,
) -> Result<PreviewResponse, ApiError> {
    let ctx = WorkContext::new(&*req.target_id, &*req.db_name, &*req.branch_name);
    let mut lines = req.tsv_data.trim().lines();
    let header: Vec<&str> = lines
        .next()
        .map(|h| h.split('\t').map(str::trim).collect())
        .unwrap_or_default();
    if header.len() < 2 {
        return Err(invalid("TSV must have PK column and at least one update column"));
    }
    let pk_col = st.pk_column(&req.table);
    if header[0] != pk_col {
        return Err(invalid(format!(
            "first TSV column '{}' must match PK column '{pk_col}'",
            header[0]
        )));
    }
    let rows = st.rows_of(&ctx, &req.table);

    let mut resp = PreviewResponse::default();
    let mut seen = std::collections::BTreeSet::new();
    let mut data_rows = 0usize;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row_index = data_rows;
        data_rows += 1;
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if fields.len() != header.len() {
            return Err(invalid(format!(
                "TSV row {} has {} fields, expected {}",
                row_index + 1,
                fields.len(),
                header.len()
            )));
        }
        if !seen.insert(fields[0].to_string()) {
            return Err(invalid(format!("duplicate PK in TSV: {}", fields[0])));
        }
        let Some(existing) = rows
            .iter()
            .find(|r| r.get(&pk_col).map(value_text).as_deref() == Some(fields[0]))
        else {
            resp.errors.push(PreviewError {
                row_index,
                code: ErrorKind::NotFound.code().to_string(),
                message: format!("{pk_col}={} not found in {}", fields[0], req.table),
                details: None,
            });
            continue;
        };

        let mut key = Row::new();
        key.insert(pk_col.clone(), existing.get(&pk_col).cloned().unwrap_or(Value::Null));
        let mut values = Row::new();
        for (col, field) in header[1..].iter().zip(&fields[1..]) {
            values.insert(col.to_string(), Value::String(field.to_string()));
        }
        let unchanged = values
            .iter()
            .all(|(c, v)| existing.get(c).map(value_text).as_deref() == v.as_str());
        if unchanged {
            resp.warnings
                .push(format!("row {row_index}: {pk_col}={} has no changes", fields[0]));
        }
        resp.ops.push(CommitOp::update(&*req.table, key, values));
    }
    if data_rows == 0 {
        return Err(invalid("no data rows in TSV"));
    }
    Ok(resp)
}

impl Remote for MemoryRemote {
    fn get_head(&self, ctx: &WorkContext) -> Result<String, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Head)?;
        st.head_of(ctx)
    }

    fn list_tables(&self, ctx: &WorkContext) -> Result<Vec<TableInfo>, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Tables)?;
        st.head_of(ctx)?;
        Ok(st
            .tables
            .get(&db_key(&ctx.target_id, &ctx.db_name))
            .map(|ts| ts.iter().map(|name| TableInfo { name: name.clone() }).collect())
            .unwrap_or_default())
    }

    fn commit(&self, req: &CommitRequest) -> Result<HashResponse, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Commit)?;
        let ctx = WorkContext::new(&*req.target_id, &*req.db_name, &*req.branch_name);
        st.check_writable(&ctx.branch_name)?;
        st.check_head(&ctx, &req.expected_head)?;
        if req.ops.is_empty() {
            return Err(invalid("ops must not be empty"));
        }

        // Apply in ledger order against scratch copies; nothing lands unless
        // every op succeeds.
        let mut scratch: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for (index, op) in req.ops.iter().enumerate() {
            let pk_col = st.pk_column(&op.table);
            let rows = scratch
                .entry(op.table.clone())
                .or_insert_with(|| st.rows_of(&ctx, &op.table));
            apply_op(rows, op, &pk_col, index)?;
        }
        let key = ctx.to_string();
        for (table, rows) in scratch {
            st.rows.insert((key.clone(), table), rows);
        }

        let head = st.next_head();
        st.heads.insert(key, head.clone());
        st.commits.push(req.clone());
        Ok(HashResponse { hash: head })
    }

    fn sync(&self, req: &SyncRequest) -> Result<HashResponse, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Sync)?;
        let ctx = WorkContext::new(&*req.target_id, &*req.db_name, &*req.branch_name);
        st.check_writable(&ctx.branch_name)?;
        st.check_head(&ctx, &req.expected_head)?;

        let entries = st.conflicts.get(&ctx.to_string()).cloned().unwrap_or_default();
        if let Some(e) = entries.iter().find(|e| e.schema_conflicts > 0) {
            return Err(ApiError::new(ErrorKind::SchemaConflictsPresent, "schema conflicts detected")
                .with_details(json!({"tables": [e.table]})));
        }
        if let Some(e) = entries.iter().find(|e| e.data_conflicts > 0) {
            return Err(ApiError::new(ErrorKind::MergeConflictsPresent, "merge conflicts detected")
                .with_details(json!({"conflicts": [{"table_name": e.table, "data_conflicts": e.data_conflicts}]})));
        }
        if entries.iter().any(|e| e.constraint_violations > 0) {
            return Err(ApiError::new(
                ErrorKind::ConstraintViolationsPresent,
                "constraint violations detected after merge",
            ));
        }

        let head = st.next_head();
        st.heads.insert(ctx.to_string(), head.clone());
        Ok(HashResponse { hash: head })
    }

    fn preview(&self, req: &PreviewRequest) -> Result<PreviewResponse, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Preview)?;
        st.head_of(&req.context())?;
        match req {
            PreviewRequest::Clone(r) => preview_clone(&st, r),
            PreviewRequest::BatchGenerate(r) => preview_batch(&st, r),
            PreviewRequest::BulkUpdate(r) => preview_bulk(&st, r),
        }
    }

    fn get_conflicts(&self, ctx: &WorkContext) -> Result<Vec<ConflictSummaryEntry>, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Conflicts)?;
        st.head_of(ctx)?;
        Ok(st.conflicts.get(&ctx.to_string()).cloned().unwrap_or_default())
    }

    fn resolve_conflicts(&self, req: &ResolveConflictsRequest) -> Result<HashResponse, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Resolve)?;
        let ctx = WorkContext::new(&*req.target_id, &*req.db_name, &*req.branch_name);
        st.check_writable(&ctx.branch_name)?;
        st.check_head(&ctx, &req.expected_head)?;

        let key = ctx.to_string();
        let entries = st.conflicts.entry(key.clone()).or_default();
        let entry = entries
            .iter_mut()
            .find(|e| e.table == req.table)
            .ok_or_else(|| {
                ApiError::new(
                    ErrorKind::PreconditionFailed,
                    format!("no conflicts recorded for table {}", req.table),
                )
            })?;
        if entry.schema_conflicts > 0 {
            return Err(ApiError::new(
                ErrorKind::SchemaConflictsPresent,
                format!("table {} has schema conflicts", req.table),
            ));
        }
        if entry.constraint_violations > 0 {
            return Err(ApiError::new(
                ErrorKind::ConstraintViolationsPresent,
                format!("table {} has constraint violations", req.table),
            ));
        }
        entry.data_conflicts = 0;
        entries.retain(|e| !e.is_clear());
        if entries.is_empty() {
            st.conflicts.remove(&key);
        }

        let head = st.next_head();
        st.heads.insert(key, head.clone());
        Ok(HashResponse { hash: head })
    }

    fn submit_request(
        &self,
        req: &SubmitRequestRequest,
    ) -> Result<SubmitRequestResponse, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Submit)?;
        let ctx = WorkContext::new(&*req.target_id, &*req.db_name, &*req.branch_name);
        if ctx.branch_name == st.protected_branch {
            return Err(ApiError::new(
                ErrorKind::Forbidden,
                format!("cannot submit request from {} branch", st.protected_branch),
            ));
        }
        if parse_work_branch(&ctx.branch_name).is_none() {
            return Err(invalid("branch name must match pattern wi/<WorkItem>/<Round>"));
        }
        st.check_head(&ctx, &req.expected_head)?;
        if st
            .conflicts
            .get(&ctx.to_string())
            .is_some_and(|es| es.iter().any(|e| !e.is_clear()))
        {
            return Err(ApiError::new(
                ErrorKind::MergeConflictsPresent,
                "conflicts with the protected branch must be resolved before submitting",
            ));
        }

        let main = ctx.with_branch(st.protected_branch.clone());
        let submitted_main_hash = st.heads.get(&main.to_string()).cloned().unwrap_or_default();
        let submitted_work_hash = st.head_of(&ctx)?;
        let request_id = format!(
            "req/{}",
            ctx.branch_name.strip_prefix("wi/").unwrap_or(&ctx.branch_name)
        );
        let summary = RequestSummary {
            request_id: request_id.clone(),
            work_branch: ctx.branch_name.clone(),
            submitted_main_hash: submitted_main_hash.clone(),
            submitted_work_hash: submitted_work_hash.clone(),
            summary_ja: req.summary_ja.clone(),
            submitted_at: now_rfc3339(),
        };
        st.requests
            .entry(db_key(&ctx.target_id, &ctx.db_name))
            .or_default()
            .insert(request_id.clone(), summary);
        Ok(SubmitRequestResponse {
            request_id,
            submitted_main_hash,
            submitted_work_hash,
        })
    }

    fn list_requests(
        &self,
        target_id: &str,
        db_name: &str,
    ) -> Result<Vec<RequestSummary>, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::ListRequests)?;
        Ok(st
            .requests
            .get(&db_key(target_id, db_name))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn approve_request(&self, req: &ApproveRequest) -> Result<ApproveResponse, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Approve)?;
        let dbk = db_key(&req.target_id, &req.db_name);
        let summary = st
            .requests
            .get(&dbk)
            .and_then(|m| m.get(&req.request_id))
            .cloned()
            .ok_or_else(|| ApiError::new(ErrorKind::NotFound, "request not found"))?;

        let work = WorkContext::new(&*req.target_id, &*req.db_name, &*summary.work_branch);
        let current = st.head_of(&work)?;
        if current != summary.submitted_work_hash {
            return Err(ApiError::new(
                ErrorKind::PreconditionFailed,
                "work branch has changed since submission",
            )
            .with_details(json!({
                "submitted_work_hash": summary.submitted_work_hash,
                "current_work_hash": current,
            })));
        }

        let main = work.with_branch(st.protected_branch.clone());
        st.copy_rows(&work, &main);
        let hash = st.next_head();
        st.heads.insert(main.to_string(), hash.clone());
        if let Some(m) = st.requests.get_mut(&dbk) {
            m.remove(&req.request_id);
        }
        st.drop_branch(&work);

        let next_branch = parse_work_branch(&summary.work_branch)
            .map(|(item, round)| format!("wi/{item}/{:02}", round + 1));
        if let Some(next) = &next_branch {
            let next_ctx = work.with_branch(next.clone());
            st.copy_rows(&main, &next_ctx);
            st.heads.insert(next_ctx.to_string(), hash.clone());
        }
        Ok(ApproveResponse { hash, next_branch })
    }

    fn reject_request(&self, req: &RejectRequest) -> Result<RejectResponse, ApiError> {
        let mut st = self.lock();
        st.record(Endpoint::Reject)?;
        let removed = st
            .requests
            .get_mut(&db_key(&req.target_id, &req.db_name))
            .and_then(|m| m.remove(&req.request_id));
        match removed {
            Some(_) => Ok(RejectResponse {
                status: "rejected".to_string(),
            }),
            None => Err(ApiError::new(ErrorKind::NotFound, "request not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowstage_core::ResolveStrategy;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn work() -> WorkContext {
        WorkContext::new("local", "shop", "wi/ProjectA/01")
    }

    fn seeded() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.set_head(&work(), "h1");
        remote.set_head(&work().with_branch("main"), "m1");
        remote.insert_row(&work(), "items", row(json!({"id": 1, "name": "bolt", "qty": 5})));
        remote.insert_row(&work(), "items", row(json!({"id": 2, "name": "nut", "qty": 9})));
        remote
    }

    fn commit_req(head: &str, ops: Vec<CommitOp>) -> CommitRequest {
        let ctx = work();
        CommitRequest {
            target_id: ctx.target_id,
            db_name: ctx.db_name,
            branch_name: ctx.branch_name,
            expected_head: head.into(),
            commit_message: "test".into(),
            ops,
        }
    }

    #[test]
    fn parse_work_branch_accepts_only_round_pattern() {
        assert_eq!(parse_work_branch("wi/ProjectA/01"), Some(("ProjectA", 1)));
        assert_eq!(parse_work_branch("wi/a.b-c/12"), Some(("a.b-c", 12)));
        assert_eq!(parse_work_branch("wi/ProjectA/1"), None);
        assert_eq!(parse_work_branch("feature/x/01"), None);
        assert_eq!(parse_work_branch("wi//01"), None);
    }

    #[test]
    fn commit_applies_ops_in_order_and_moves_head() {
        let remote = seeded();
        let key = row(json!({"id": 1}));
        let resp = remote
            .commit(&commit_req(
                "h1",
                vec![
                    CommitOp::update("items", key.clone(), row(json!({"name": "a"}))),
                    CommitOp::update("items", key, row(json!({"name": "b"}))),
                    CommitOp::insert("items", row(json!({"id": 3, "name": "washer"}))),
                ],
            ))
            .unwrap();
        assert_ne!(resp.hash, "h1");
        assert_eq!(remote.head(&work()), Some(resp.hash));
        let rows = remote.rows(&work(), "items");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["name"], "b");
    }

    #[test]
    fn commit_with_stale_head_changes_nothing() {
        let remote = seeded();
        let err = remote
            .commit(&commit_req("h0", vec![CommitOp::delete("items", row(json!({"id": 1})))]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StaleHead);
        assert_eq!(err.details.unwrap()["actual_head"], "h1");
        assert_eq!(remote.rows(&work(), "items").len(), 2);
        assert!(remote.committed().is_empty());
    }

    #[test]
    fn failing_op_rolls_back_whole_commit() {
        let remote = seeded();
        let err = remote
            .commit(&commit_req(
                "h1",
                vec![
                    CommitOp::delete("items", row(json!({"id": 1}))),
                    CommitOp::delete("items", row(json!({"id": 99}))),
                ],
            ))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(remote.rows(&work(), "items").len(), 2);
        assert_eq!(remote.head(&work()).as_deref(), Some("h1"));
    }

    #[test]
    fn protected_branch_rejects_writes() {
        let remote = seeded();
        let mut req = commit_req("m1", vec![CommitOp::delete("items", row(json!({"id": 1})))]);
        req.branch_name = "main".into();
        assert_eq!(remote.commit(&req).unwrap_err().kind, ErrorKind::Forbidden);
    }

    #[test]
    fn sync_reports_schema_before_data_before_constraint() {
        let remote = seeded();
        remote.set_conflicts(
            &work(),
            vec![
                ConflictSummaryEntry {
                    table: "a".into(),
                    data_conflicts: 1,
                    constraint_violations: 1,
                    ..Default::default()
                },
                ConflictSummaryEntry {
                    table: "b".into(),
                    schema_conflicts: 1,
                    ..Default::default()
                },
            ],
        );
        let err = remote.sync(&SyncRequest::new(&work(), "h1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaConflictsPresent);
    }

    #[test]
    fn resolve_clears_data_conflicts_and_blocks_schema() {
        let remote = seeded();
        remote.set_conflicts(
            &work(),
            vec![
                ConflictSummaryEntry {
                    table: "items".into(),
                    data_conflicts: 2,
                    ..Default::default()
                },
                ConflictSummaryEntry {
                    table: "orders".into(),
                    schema_conflicts: 1,
                    ..Default::default()
                },
            ],
        );
        let resolve = |table: &str, head: &str| ResolveConflictsRequest {
            target_id: "local".into(),
            db_name: "shop".into(),
            branch_name: "wi/ProjectA/01".into(),
            expected_head: head.into(),
            table: table.into(),
            strategy: ResolveStrategy::Ours,
        };
        let err = remote.resolve_conflicts(&resolve("orders", "h1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaConflictsPresent);

        let resp = remote.resolve_conflicts(&resolve("items", "h1")).unwrap();
        let left = remote.get_conflicts(&work()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].table, "orders");
        assert_eq!(remote.head(&work()), Some(resp.hash));
    }

    #[test]
    fn clone_preview_builds_inserts_and_detects_collisions() {
        let remote = seeded();
        let mut req = PreviewCloneRequest {
            target_id: "local".into(),
            db_name: "shop".into(),
            branch_name: "wi/ProjectA/01".into(),
            table: "items".into(),
            template_pk: row(json!({"id": 1})),
            new_pks: vec![json!(10), json!(11)],
            change_column: Some("name".into()),
            change_value: Some(json!("copy")),
        };
        let resp = remote.preview(&PreviewRequest::Clone(req.clone())).unwrap();
        assert_eq!(resp.ops.len(), 2);
        assert_eq!(resp.ops[1].values["id"], 11);
        assert_eq!(resp.ops[1].values["name"], "copy");
        assert_eq!(resp.ops[1].values["qty"], 5);
        assert!(remote.rows(&work(), "items").len() == 2);

        req.new_pks = vec![json!(2)];
        let err = remote.preview(&PreviewRequest::Clone(req)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn batch_preview_applies_values_per_row() {
        let remote = seeded();
        let req = PreviewBatchGenerateRequest {
            target_id: "local".into(),
            db_name: "shop".into(),
            branch_name: "wi/ProjectA/01".into(),
            table: "items".into(),
            template_pk: row(json!({"id": 2})),
            new_pks: vec![json!(20), json!(21)],
            change_column: Some("qty".into()),
            change_values: Some(vec![json!(1), json!(2)]),
        };
        let resp = remote.preview(&PreviewRequest::BatchGenerate(req)).unwrap();
        assert_eq!(resp.ops[0].values["qty"], 1);
        assert_eq!(resp.ops[1].values["qty"], 2);
    }

    #[test]
    fn bulk_preview_reports_unknown_keys_by_row() {
        let remote = seeded();
        let req = PreviewBulkUpdateRequest {
            target_id: "local".into(),
            db_name: "shop".into(),
            branch_name: "wi/ProjectA/01".into(),
            table: "items".into(),
            tsv_data: "id\tname\n1\tbolt\n7\tghost\n2\tnut2\n".into(),
        };
        let resp = remote.preview(&PreviewRequest::BulkUpdate(req)).unwrap();
        assert_eq!(resp.ops.len(), 2);
        assert_eq!(resp.ops[1].key.as_ref().unwrap()["id"], 2);
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].row_index, 1);
        assert_eq!(resp.warnings.len(), 1);
    }

    #[test]
    fn submit_then_approve_creates_next_round() {
        let remote = seeded();
        let submitted = remote
            .submit_request(&SubmitRequestRequest {
                target_id: "local".into(),
                db_name: "shop".into(),
                branch_name: "wi/ProjectA/01".into(),
                expected_head: "h1".into(),
                summary_ja: "在庫更新".into(),
            })
            .unwrap();
        assert_eq!(submitted.request_id, "req/ProjectA/01");
        assert_eq!(submitted.submitted_main_hash, "m1");
        assert_eq!(remote.list_requests("local", "shop").unwrap().len(), 1);

        let approved = remote
            .approve_request(&ApproveRequest {
                target_id: "local".into(),
                db_name: "shop".into(),
                request_id: "req/ProjectA/01".into(),
                merge_message_ja: "承認マージ: req/ProjectA/01".into(),
            })
            .unwrap();
        assert_eq!(approved.next_branch(), Some("wi/ProjectA/02"));
        let next = work().with_branch("wi/ProjectA/02");
        assert_eq!(remote.head(&next), Some(approved.hash.clone()));
        assert_eq!(remote.rows(&next, "items").len(), 2);
        assert_eq!(remote.head(&work()), None);
        assert!(remote.list_requests("local", "shop").unwrap().is_empty());
    }

    #[test]
    fn approve_after_work_branch_moved_is_precondition_failure() {
        let remote = seeded();
        remote
            .submit_request(&SubmitRequestRequest {
                target_id: "local".into(),
                db_name: "shop".into(),
                branch_name: "wi/ProjectA/01".into(),
                expected_head: "h1".into(),
                summary_ja: "x".into(),
            })
            .unwrap();
        remote.advance_head(&work());
        let err = remote
            .approve_request(&ApproveRequest {
                target_id: "local".into(),
                db_name: "shop".into(),
                request_id: "req/ProjectA/01".into(),
                merge_message_ja: "ok".into(),
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    }

    #[test]
    fn reject_unknown_request_is_not_found() {
        let remote = seeded();
        let err = remote
            .reject_request(&RejectRequest {
                target_id: "local".into(),
                db_name: "shop".into(),
                request_id: "req/nope/01".into(),
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn scripted_failure_fires_once() {
        let remote = seeded();
        remote.fail_next(Endpoint::Head, ApiError::transport("connection reset"));
        assert_eq!(remote.get_head(&work()).unwrap_err().kind, ErrorKind::Transport);
        assert_eq!(remote.get_head(&work()).unwrap(), "h1");
        assert_eq!(remote.call_count(Endpoint::Head), 2);
    }
}
