use crate::*;
use std::fmt;

/// Persisted status of one chunk
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Processing,
    Mixed,
    Error,
}

impl ChunkStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkStatus::Processing => "PROCESSING",
            ChunkStatus::Mixed => "MIXED",
            ChunkStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One status record per chunk. Overwritten on every transition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatusRecord {
    pub chunk: ChunkKey,
    pub status: ChunkStatus,
    pub error_message: Option<String>,
}

impl ChunkStatusRecord {
    pub fn new(chunk: ChunkKey, status: ChunkStatus, error_message: Option<String>) -> Self {
        ChunkStatusRecord {
            chunk,
            status,
            error_message,
        }
    }
}

/// Status of a whole ballot box, reduced from its chunk records on demand.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateStatus {
    NotFound,
    NotClosed,
    Processing,
    Error,
    Mixed,
}

impl AggregateStatus {
    /// Reduce chunk counts to an aggregate status.
    ///
    /// No records means NOT_FOUND, any error dominates, and the ballot box is MIXED
    /// only once every chunk is.
    pub fn reduce(total: u64, errored: u64, mixed: u64) -> Self {
        if total == 0 {
            AggregateStatus::NotFound
        } else if errored > 0 {
            AggregateStatus::Error
        } else if mixed < total {
            AggregateStatus::Processing
        } else {
            AggregateStatus::Mixed
        }
    }

    /// Reduce a set of chunk statuses
    pub fn from_chunks<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a ChunkStatus>,
    {
        let (mut total, mut errored, mut mixed) = (0, 0, 0);
        for status in statuses {
            total += 1;
            match status {
                ChunkStatus::Error => errored += 1,
                ChunkStatus::Mixed => mixed += 1,
                ChunkStatus::Processing => {}
            }
        }
        AggregateStatus::reduce(total, errored, mixed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateStatus::NotFound => "NOT_FOUND",
            AggregateStatus::NotClosed => "NOT_CLOSED",
            AggregateStatus::Processing => "PROCESSING",
            AggregateStatus::Error => "ERROR",
            AggregateStatus::Mixed => "MIXED",
        }
    }
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per ballot box result of a submission or status query
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BallotBoxStatus {
    pub ballot_box_id: String,
    pub process_status: AggregateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BallotBoxStatus {
    pub fn new(ballot_box_id: &str, process_status: AggregateStatus) -> Self {
        BallotBoxStatus {
            ballot_box_id: ballot_box_id.to_owned(),
            process_status,
            error_message: None,
        }
    }

    pub fn with_error(ballot_box_id: &str, error_message: impl Into<String>) -> Self {
        BallotBoxStatus {
            ballot_box_id: ballot_box_id.to_owned(),
            process_status: AggregateStatus::Error,
            error_message: Some(error_message.into()),
        }
    }
}
