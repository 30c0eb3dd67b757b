use rowstage_core::CommitOp;
use thiserror::Error;

use crate::snapshot::SnapshotStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("no staged op at index {index} (ledger has {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Ordered log of staged ops for one work context.
///
/// Every mutation rewrites the snapshot so that it matches `ops`. A failed
/// write is logged and the in-memory change stands; the next successful
/// write brings the snapshot back in line.
pub struct DraftLedger {
    ops: Vec<CommitOp>,
    store: Box<dyn SnapshotStore>,
}

impl std::fmt::Debug for DraftLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftLedger").field("ops", &self.ops).finish()
    }
}

impl DraftLedger {
    /// Hydrate from the snapshot. A snapshot that cannot be read or does not
    /// parse is erased and the ledger starts empty.
    pub fn load(store: Box<dyn SnapshotStore>) -> Self {
        let mut ledger = Self {
            ops: Vec::new(),
            store,
        };
        match ledger.store.read() {
            Ok(None) => {}
            Ok(Some(raw)) => match serde_json::from_str::<Vec<CommitOp>>(&raw) {
                Ok(ops) => ledger.ops = ops,
                Err(e) => {
                    tracing::warn!("discarding corrupt draft snapshot: {e}");
                    ledger.erase_snapshot();
                }
            },
            Err(e) => {
                tracing::warn!("discarding unreadable draft snapshot: {e:#}");
                ledger.erase_snapshot();
            }
        }
        ledger
    }

    fn erase_snapshot(&mut self) {
        if let Err(e) = self.store.erase() {
            tracing::warn!("failed to erase draft snapshot: {e:#}");
        }
    }

    pub fn ops(&self) -> &[CommitOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CommitOp> {
        self.ops.get(index)
    }

    pub fn append(&mut self, op: CommitOp) {
        self.ops.push(op);
        self.persist();
    }

    /// Append several ops with a single snapshot write.
    pub fn extend(&mut self, ops: impl IntoIterator<Item = CommitOp>) {
        let before = self.ops.len();
        self.ops.extend(ops);
        if self.ops.len() != before {
            self.persist();
        }
    }

    /// Remove the op at `index`; later ops shift down by one.
    pub fn remove(&mut self, index: usize) -> Result<CommitOp, LedgerError> {
        if index >= self.ops.len() {
            return Err(LedgerError::IndexOutOfRange {
                index,
                len: self.ops.len(),
            });
        }
        let op = self.ops.remove(index);
        self.persist();
        Ok(op)
    }

    /// Empty the ledger and erase the snapshot.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.erase_snapshot();
    }

    /// What the snapshot currently holds, decoded. `None` when erased.
    pub fn persisted(&self) -> anyhow::Result<Option<Vec<CommitOp>>> {
        match self.store.read()? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn persist(&mut self) {
        let data = match serde_json::to_string(&self.ops) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("failed to encode draft: {e}");
                return;
            }
        };
        if let Err(e) = self.store.write(&data) {
            tracing::warn!("failed to persist draft ({} ops): {e:#}", self.ops.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{FileSnapshot, MemorySnapshot};
    use proptest::prelude::*;
    use rowstage_core::Row;
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn insert(id: i64) -> CommitOp {
        CommitOp::insert("items", row(json!({"id": id, "name": "x"})))
    }

    fn persisted_or_empty(ledger: &DraftLedger) -> Vec<CommitOp> {
        ledger.persisted().unwrap().unwrap_or_default()
    }

    #[test]
    fn append_persists_every_op() {
        let snap = MemorySnapshot::new();
        let mut ledger = DraftLedger::load(Box::new(snap.clone()));
        ledger.append(insert(1));
        ledger.append(insert(2));
        assert_eq!(ledger.len(), 2);
        let stored: Vec<CommitOp> = serde_json::from_str(&snap.contents().unwrap()).unwrap();
        assert_eq!(stored, ledger.ops());
    }

    #[test]
    fn duplicate_edits_keep_append_order() {
        let mut ledger = DraftLedger::load(Box::new(MemorySnapshot::new()));
        let key = row(json!({"id": 7}));
        ledger.append(CommitOp::update("items", key.clone(), row(json!({"name": "a"}))));
        ledger.append(CommitOp::update("items", key, row(json!({"name": "b"}))));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.ops()[1].values["name"], "b");
    }

    #[test]
    fn remove_reindexes_and_persists() {
        let mut ledger = DraftLedger::load(Box::new(MemorySnapshot::new()));
        for id in 1..=3 {
            ledger.append(insert(id));
        }
        let removed = ledger.remove(1).unwrap();
        assert_eq!(removed.values["id"], 2);
        assert_eq!(ledger.ops()[1].values["id"], 3);
        assert_eq!(persisted_or_empty(&ledger), ledger.ops());
    }

    #[test]
    fn remove_out_of_range_is_rejected_without_mutation() {
        let snap = MemorySnapshot::new();
        let mut ledger = DraftLedger::load(Box::new(snap.clone()));
        ledger.append(insert(1));
        let before = snap.contents();
        let err = ledger.remove(5).unwrap_err();
        assert_eq!(err, LedgerError::IndexOutOfRange { index: 5, len: 1 });
        assert_eq!(ledger.len(), 1);
        assert_eq!(snap.contents(), before);
    }

    #[test]
    fn clear_erases_snapshot() {
        let snap = MemorySnapshot::new();
        let mut ledger = DraftLedger::load(Box::new(snap.clone()));
        ledger.append(insert(1));
        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(snap.contents(), None);
    }

    #[test]
    fn load_hydrates_existing_snapshot() {
        let snap = MemorySnapshot::with_data(
            r#"[{"type":"delete","table":"items","values":{},"pk":{"id":3}}]"#,
        );
        let ledger = DraftLedger::load(Box::new(snap));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.ops()[0].key.as_ref().unwrap()["id"], 3);
    }

    #[test]
    fn corrupt_snapshot_is_discarded() {
        let snap = MemorySnapshot::with_data("{not a list");
        let ledger = DraftLedger::load(Box::new(snap.clone()));
        assert!(ledger.is_empty());
        assert_eq!(snap.contents(), None);
    }

    #[test]
    fn non_utf8_snapshot_file_is_erased() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("draft.json");
        std::fs::write(&path, [0xff, 0xfe, b'[', b']']).unwrap();
        let ledger = DraftLedger::load(Box::new(FileSnapshot::new(&path)));
        assert!(ledger.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn persist_failure_keeps_in_memory_append() {
        let snap = MemorySnapshot::new();
        let mut ledger = DraftLedger::load(Box::new(snap.clone()));
        ledger.append(insert(1));
        snap.set_fail_writes(true);
        ledger.append(insert(2));
        assert_eq!(ledger.len(), 2);
        snap.set_fail_writes(false);
        ledger.append(insert(3));
        assert_eq!(persisted_or_empty(&ledger), ledger.ops());
    }

    #[test]
    fn file_snapshot_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("draft.json");
        {
            let mut ledger = DraftLedger::load(Box::new(FileSnapshot::new(&path)));
            ledger.append(insert(1));
            ledger.append(insert(2));
            ledger.remove(0).unwrap();
        }
        let reloaded = DraftLedger::load(Box::new(FileSnapshot::new(&path)));
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.ops()[0].values["id"], 2);
    }

    #[test]
    fn extend_writes_once_and_skips_empty() {
        let snap = MemorySnapshot::new();
        let mut ledger = DraftLedger::load(Box::new(snap.clone()));
        ledger.extend(Vec::new());
        assert_eq!(snap.contents(), None);
        ledger.extend(vec![insert(1), insert(2)]);
        assert_eq!(persisted_or_empty(&ledger).len(), 2);
    }

    #[derive(Debug, Clone)]
    enum Action {
        Append(i64),
        Remove(usize),
        Clear,
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            4 => (0i64..100).prop_map(Action::Append),
            2 => (0usize..8).prop_map(Action::Remove),
            1 => Just(Action::Clear),
        ]
    }

    proptest! {
        #[test]
        fn snapshot_matches_memory_after_every_mutation(actions in prop::collection::vec(action(), 0..40)) {
            let mut ledger = DraftLedger::load(Box::new(MemorySnapshot::new()));
            let mut model: Vec<CommitOp> = Vec::new();
            for a in actions {
                match a {
                    Action::Append(id) => {
                        ledger.append(insert(id));
                        model.push(insert(id));
                    }
                    Action::Remove(i) => {
                        let res = ledger.remove(i);
                        if i < model.len() {
                            prop_assert!(res.is_ok());
                            model.remove(i);
                        } else {
                            prop_assert!(res.is_err());
                        }
                    }
                    Action::Clear => {
                        ledger.clear();
                        model.clear();
                    }
                }
                prop_assert_eq!(ledger.ops(), model.as_slice());
                prop_assert_eq!(persisted_or_empty(&ledger), model.clone());
            }
        }
    }
}
