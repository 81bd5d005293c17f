use crate::*;

/// Frame type byte that precedes every serialized [`MixnetState`]
pub const MIXNET_STATE_FRAME: u8 = 0;

/// Retries granted to a chunk at each node unless configured otherwise
pub const DEFAULT_RETRY_COUNT: u32 = 5;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BallotBoxDetails {
    pub ballot_box_id: String,
    pub election_event_id: String,
    #[serde(default)]
    pub chunk_id: u32,
}

impl BallotBoxDetails {
    pub fn new(election_event_id: &str, ballot_box_id: &str, chunk_id: u32) -> Self {
        BallotBoxDetails {
            ballot_box_id: ballot_box_id.to_owned(),
            election_event_id: election_event_id.to_owned(),
            chunk_id,
        }
    }
}

/// The unit of work that travels through the node pipeline.
///
/// `node_to_visit` is the one-based id of the node the state is addressed to (0
/// before the first send). Nodes answer with the same state, either with their
/// output in `payload` or with `mixnet_error` set and the input payload untouched.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MixnetState {
    pub ballot_box_details: BallotBoxDetails,
    pub node_to_visit: u32,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixnet_error: Option<String>,
}

impl MixnetState {
    pub fn new(ballot_box_details: BallotBoxDetails, payload: Vec<u8>, retry_count: u32) -> Self {
        MixnetState {
            ballot_box_details,
            node_to_visit: 0,
            payload,
            retry_count,
            mixnet_error: None,
        }
    }

    pub fn increment_node_to_visit(&mut self) {
        self.node_to_visit += 1;
    }

    /// Zero-based pipeline stage of the node this state is addressed to
    pub fn node_index(&self) -> Option<u32> {
        self.node_to_visit.checked_sub(1)
    }

    pub fn chunk_key(&self) -> ChunkKey {
        ChunkKey::new(
            &self.ballot_box_details.election_event_id,
            &self.ballot_box_details.ballot_box_id,
            self.ballot_box_details.chunk_id,
        )
    }

    /// Serialize into a wire frame: one frame type byte followed by JSON
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(self)?;
        let mut frame = Vec::with_capacity(json.len() + 1);
        frame.push(MIXNET_STATE_FRAME);
        frame.extend_from_slice(&json);
        Ok(frame)
    }

    /// Deserialize a wire frame produced by [`MixnetState::to_frame`]
    pub fn from_frame(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes.split_first() {
            None => Err(CodecError::EmptyMessage),
            Some((&MIXNET_STATE_FRAME, json)) => Ok(serde_json::from_slice(json)?),
            Some((&other, _)) => Err(CodecError::UnknownFrameType(other)),
        }
    }
}
