use crate::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Persistence contract for chunk statuses.
///
/// Writes are keyed by chunk, so writers for different chunks never conflict and a
/// second write to the same chunk simply overwrites the first.
pub trait ChunkStatusStore: Send + Sync {
    /// Create or overwrite the status record of a chunk
    fn save(&self, record: ChunkStatusRecord) -> Result<(), StoreError>;

    /// Read the current status record of a chunk
    fn get(&self, chunk: &ChunkKey) -> Result<Option<ChunkStatusRecord>, StoreError>;

    /// All status records of a ballot box, ordered by chunk id
    fn list(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
    ) -> Result<Vec<ChunkStatusRecord>, StoreError>;

    /// Count the chunk records of a ballot box, optionally only those with the given status
    fn count_by_status(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
        status: Option<ChunkStatus>,
    ) -> Result<u64, StoreError> {
        let count = self
            .list(election_event_id, ballot_box_id)?
            .iter()
            .filter(|record| status.map_or(true, |s| record.status == s))
            .count();
        Ok(count as u64)
    }

    /// Reduce the chunk records of a ballot box to its aggregate status
    fn aggregate_status(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
    ) -> Result<AggregateStatus, StoreError> {
        let total = self.count_by_status(election_event_id, ballot_box_id, None)?;
        if total == 0 {
            return Ok(AggregateStatus::NotFound);
        }
        let errored =
            self.count_by_status(election_event_id, ballot_box_id, Some(ChunkStatus::Error))?;
        let mixed =
            self.count_by_status(election_event_id, ballot_box_id, Some(ChunkStatus::Mixed))?;

        Ok(AggregateStatus::reduce(total, errored, mixed))
    }
}

/// Result of inserting a node output
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An output with the same key already exists and was left untouched
    Duplicate,
}

/// Opaque output of one node for one chunk
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutput {
    pub key: NodeOutputKey,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Persistence contract for node outputs
pub trait NodeOutputStore: Send + Sync {
    /// Insert an output. A second insert under the same key is a no-op, not an error.
    fn insert(&self, output: NodeOutput) -> Result<InsertOutcome, StoreError>;

    /// All outputs of a ballot box, ordered by chunk and then by node index
    fn list(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
    ) -> Result<Vec<NodeOutput>, StoreError>;
}

/// A simple chunk status store that uses an in-memory BTreeMap.
///
/// Only the latest record of each chunk is kept, unless the store is built with
/// [`MemChunkStatusStore::recording`].
#[derive(Default)]
pub struct MemChunkStatusStore {
    inner: Mutex<BTreeMap<ChunkKey, ChunkStatusRecord>>,
    history: Mutex<Vec<ChunkStatusRecord>>,
    record_history: bool,
    writes: AtomicUsize,
    unreachable: AtomicBool,
}

impl MemChunkStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that also keeps every saved record, for inspection in tests
    pub fn recording() -> Self {
        MemChunkStatusStore {
            record_history: true,
            ..Self::default()
        }
    }

    /// Simulate an infrastructure outage
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every record ever saved, in write order. Empty unless the store is recording.
    pub fn history(&self) -> Vec<ChunkStatusRecord> {
        self.history.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("chunk status store".to_owned()));
        }
        Ok(())
    }
}

impl ChunkStatusStore for MemChunkStatusStore {
    fn save(&self, record: ChunkStatusRecord) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.record_history {
            self.history.lock().push(record.clone());
        }
        self.inner.lock().insert(record.chunk.clone(), record);
        Ok(())
    }

    fn get(&self, chunk: &ChunkKey) -> Result<Option<ChunkStatusRecord>, StoreError> {
        self.check_reachable()?;
        Ok(self.inner.lock().get(chunk).cloned())
    }

    fn list(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
    ) -> Result<Vec<ChunkStatusRecord>, StoreError> {
        self.check_reachable()?;
        let start = ChunkKey::new(election_event_id, ballot_box_id, 0);
        let records = self
            .inner
            .lock()
            .range(start..)
            .take_while(|(key, _)| key.belongs_to(election_event_id, ballot_box_id))
            .map(|(_, record)| record.clone())
            .collect();
        Ok(records)
    }
}

/// A simple node output store that uses an in-memory BTreeMap
#[derive(Default)]
pub struct MemNodeOutputStore {
    inner: Mutex<BTreeMap<NodeOutputKey, NodeOutput>>,
    duplicates: AtomicUsize,
    unreachable: AtomicBool,
}

impl MemNodeOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of inserts that hit an existing key
    pub fn duplicate_count(&self) -> usize {
        self.duplicates.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl NodeOutputStore for MemNodeOutputStore {
    fn insert(&self, output: NodeOutput) -> Result<InsertOutcome, StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("node output store".to_owned()));
        }

        let mut inner = self.inner.lock();
        if inner.contains_key(&output.key) {
            self.duplicates.fetch_add(1, Ordering::SeqCst);
            return Ok(InsertOutcome::Duplicate);
        }
        inner.insert(output.key.clone(), output);
        Ok(InsertOutcome::Inserted)
    }

    fn list(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
    ) -> Result<Vec<NodeOutput>, StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("node output store".to_owned()));
        }

        let start = NodeOutputKey {
            chunk: ChunkKey::new(election_event_id, ballot_box_id, 0),
            node_index: 0,
        };
        let outputs = self
            .inner
            .lock()
            .range(start..)
            .take_while(|(key, _)| key.chunk.belongs_to(election_event_id, ballot_box_id))
            .map(|(_, output)| output.clone())
            .collect();
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(chunk_id: u32, node_index: u32, payload: &[u8]) -> NodeOutput {
        NodeOutput {
            key: NodeOutputKey {
                chunk: ChunkKey::new("ee", "bb", chunk_id),
                node_index,
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn duplicate_node_output_is_a_no_op() {
        let store = MemNodeOutputStore::new();

        assert_eq!(
            store.insert(output(0, 1, b"first")).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert(output(0, 1, b"second")).unwrap(),
            InsertOutcome::Duplicate
        );

        let outputs = store.list("ee", "bb").unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].payload, b"first");
        assert_eq!(store.duplicate_count(), 1);
    }

    #[test]
    fn outputs_are_listed_per_ballot_box_in_stage_order() {
        let store = MemNodeOutputStore::new();
        store.insert(output(1, 0, b"c")).unwrap();
        store.insert(output(0, 1, b"b")).unwrap();
        store.insert(output(0, 0, b"a")).unwrap();
        store
            .insert(NodeOutput {
                key: NodeOutputKey {
                    chunk: ChunkKey::new("ee", "other", 0),
                    node_index: 0,
                },
                payload: b"x".to_vec(),
            })
            .unwrap();

        let payloads: Vec<Vec<u8>> = store
            .list("ee", "bb")
            .unwrap()
            .into_iter()
            .map(|o| o.payload)
            .collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn status_is_overwritten_not_appended() {
        let store = MemChunkStatusStore::new();
        let chunk = ChunkKey::new("ee", "bb", 0);

        store
            .save(ChunkStatusRecord::new(chunk.clone(), ChunkStatus::Processing, None))
            .unwrap();
        store
            .save(ChunkStatusRecord::new(
                chunk.clone(),
                ChunkStatus::Error,
                Some("boom".to_owned()),
            ))
            .unwrap();

        assert_eq!(store.count_by_status("ee", "bb", None).unwrap(), 1);
        let record = store.get(&chunk).unwrap().unwrap();
        assert_eq!(record.status, ChunkStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert_eq!(store.write_count(), 2);
        assert!(store.history().is_empty());
    }

    #[test]
    fn only_a_recording_store_keeps_history() {
        let store = MemChunkStatusStore::recording();
        let chunk = ChunkKey::new("ee", "bb", 0);

        for status in [ChunkStatus::Processing, ChunkStatus::Mixed] {
            store
                .save(ChunkStatusRecord::new(chunk.clone(), status, None))
                .unwrap();
        }

        let history: Vec<ChunkStatus> = store.history().iter().map(|r| r.status).collect();
        assert_eq!(history, vec![ChunkStatus::Processing, ChunkStatus::Mixed]);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn aggregate_status_reduces_chunk_records() {
        let store = MemChunkStatusStore::new();
        assert_eq!(
            store.aggregate_status("ee", "bb").unwrap(),
            AggregateStatus::NotFound
        );

        for (chunk_id, status) in [ChunkStatus::Mixed, ChunkStatus::Processing]
            .iter()
            .enumerate()
        {
            store
                .save(ChunkStatusRecord::new(
                    ChunkKey::new("ee", "bb", chunk_id as u32),
                    *status,
                    None,
                ))
                .unwrap();
        }
        assert_eq!(
            store.aggregate_status("ee", "bb").unwrap(),
            AggregateStatus::Processing
        );
        assert_eq!(
            store.aggregate_status("ee", "other").unwrap(),
            AggregateStatus::NotFound
        );
    }

    #[test]
    fn unreachable_store_is_an_error() {
        let store = MemChunkStatusStore::new();
        store.set_unreachable(true);
        assert!(matches!(
            store.aggregate_status("ee", "bb"),
            Err(StoreError::Unreachable(_))
        ));
    }
}
