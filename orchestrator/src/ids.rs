use crate::*;
use std::fmt;
use uuid::Uuid;

/// Stable identity of a ballot box.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct BallotBoxId {
    pub tenant_id: String,
    pub election_event_id: String,
    pub ballot_box_id: String,
}

impl BallotBoxId {
    pub fn new(tenant_id: &str, election_event_id: &str, ballot_box_id: &str) -> Self {
        BallotBoxId {
            tenant_id: tenant_id.to_owned(),
            election_event_id: election_event_id.to_owned(),
            ballot_box_id: ballot_box_id.to_owned(),
        }
    }

    /// Key of one chunk of this ballot box
    pub fn chunk(&self, chunk_id: u32) -> ChunkKey {
        ChunkKey {
            election_event_id: self.election_event_id.clone(),
            ballot_box_id: self.ballot_box_id.clone(),
            chunk_id,
        }
    }
}

impl fmt::Display for BallotBoxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.election_event_id, self.ballot_box_id)
    }
}

/// Identity of one chunk of a ballot box.
///
/// Ordering sorts by election event, then ballot box, then chunk, so a range over a
/// `BTreeMap<ChunkKey, _>` visits all chunks of one ballot box contiguously.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ChunkKey {
    pub election_event_id: String,
    pub ballot_box_id: String,
    pub chunk_id: u32,
}

impl ChunkKey {
    pub fn new(election_event_id: &str, ballot_box_id: &str, chunk_id: u32) -> Self {
        ChunkKey {
            election_event_id: election_event_id.to_owned(),
            ballot_box_id: ballot_box_id.to_owned(),
            chunk_id,
        }
    }

    /// Whether this chunk belongs to the given ballot box
    pub fn belongs_to(&self, election_event_id: &str, ballot_box_id: &str) -> bool {
        self.election_event_id == election_event_id && self.ballot_box_id == ballot_box_id
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}-{}#{}",
            self.election_event_id, self.ballot_box_id, self.chunk_id
        )
    }
}

/// Key of one stored node output: a chunk plus the zero-based pipeline stage.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutputKey {
    pub chunk: ChunkKey,
    pub node_index: u32,
}

impl fmt::Display for NodeOutputKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.chunk, self.node_index)
    }
}

/// Check that an identifier is a UUID, either hyphenated or in 32-hex simple form
pub fn validate_id(id: &str) -> Result<(), Error> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| Error::InvalidIdentifier(id.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_simple_and_hyphenated_uuids() {
        assert!(validate_id("0d31a1148f95488fae6827391425dc08").is_ok());
        assert!(validate_id("f8ba3dd3-844a-4815-af39-c63570c12006").is_ok());
        assert!(matches!(
            validate_id("not-a-ballot-box"),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(validate_id("").is_err());
    }

    #[test]
    fn chunk_keys_of_one_ballot_box_sort_together() {
        let a = ChunkKey::new("ee", "bb1", 9);
        let b = ChunkKey::new("ee", "bb2", 0);
        let c = ChunkKey::new("ee", "bb1", 10);
        let mut keys = vec![b.clone(), a.clone(), c.clone()];
        keys.sort();
        assert_eq!(keys, vec![a, c, b]);
    }
}
