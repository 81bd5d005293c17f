use crate::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Payload handed to the first node of the pipeline for one chunk
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitialPayload {
    pub election_event_id: String,
    pub ballot_box_id: String,
    pub offset: u64,
    #[serde(with = "base64_votes")]
    pub votes: Vec<Vec<u8>>,
}

mod base64_votes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(votes: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(votes.iter().map(|vote| STANDARD.encode(vote)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|vote| STANDARD.decode(vote).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Read access to the encrypted votes of a closed ballot box
pub trait VoteSource: Send + Sync {
    /// Number of votes in the ballot box.
    ///
    /// Fails with [`VoteSourceError::NotReady`] while the ballot box is still open.
    fn vote_count(&self, ballot_box: &BallotBoxId) -> Result<u64, VoteSourceError>;

    /// A slice of the encrypted votes
    fn votes(
        &self,
        ballot_box: &BallotBoxId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<Vec<u8>>, VoteSourceError>;

    /// Build the serialized payload of the first pipeline stage for one slice
    fn initial_payload(
        &self,
        ballot_box: &BallotBoxId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, Error> {
        let payload = InitialPayload {
            election_event_id: ballot_box.election_event_id.clone(),
            ballot_box_id: ballot_box.ballot_box_id.clone(),
            offset,
            votes: self.votes(ballot_box, offset, size)?,
        };
        Ok(serde_json::to_vec(&payload).map_err(CodecError::from)?)
    }
}

struct StoredBallotBox {
    closed: bool,
    votes: Vec<Vec<u8>>,
}

/// A vote source over ballot boxes registered in memory
#[derive(Default)]
pub struct MemVoteSource {
    boxes: Mutex<HashMap<(String, String), StoredBallotBox>>,
    unavailable: AtomicBool,
}

impl MemVoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ballot box with its votes
    pub fn insert(&self, ballot_box: &BallotBoxId, votes: Vec<Vec<u8>>, closed: bool) {
        self.boxes.lock().insert(
            Self::key(ballot_box),
            StoredBallotBox { closed, votes },
        );
    }

    pub fn close(&self, ballot_box: &BallotBoxId) {
        if let Some(stored) = self.boxes.lock().get_mut(&Self::key(ballot_box)) {
            stored.closed = true;
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn key(ballot_box: &BallotBoxId) -> (String, String) {
        (
            ballot_box.election_event_id.clone(),
            ballot_box.ballot_box_id.clone(),
        )
    }

    fn with_closed<T>(
        &self,
        ballot_box: &BallotBoxId,
        f: impl FnOnce(&StoredBallotBox) -> T,
    ) -> Result<T, VoteSourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VoteSourceError::Unavailable("vote repository".to_owned()));
        }
        let boxes = self.boxes.lock();
        let stored = boxes
            .get(&Self::key(ballot_box))
            .ok_or_else(|| VoteSourceError::NotFound(ballot_box.ballot_box_id.clone()))?;
        if !stored.closed {
            return Err(VoteSourceError::NotReady(ballot_box.ballot_box_id.clone()));
        }
        Ok(f(stored))
    }
}

impl VoteSource for MemVoteSource {
    fn vote_count(&self, ballot_box: &BallotBoxId) -> Result<u64, VoteSourceError> {
        self.with_closed(ballot_box, |stored| stored.votes.len() as u64)
    }

    fn votes(
        &self,
        ballot_box: &BallotBoxId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<Vec<u8>>, VoteSourceError> {
        self.with_closed(ballot_box, |stored| {
            stored
                .votes
                .iter()
                .skip(offset as usize)
                .take(size as usize)
                .cloned()
                .collect()
        })
    }
}
