use crate::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};

/// Error text returned for a ballot box that was submitted again after mixing
pub const MIXING_ALREADY_STARTED: &str = "Ballot box mixing has already started";

pub const DEFAULT_NODE_COUNT: u32 = 4;
pub const DEFAULT_CHUNK_SIZE: u64 = 4096;
pub const DEFAULT_TENANT_ID: &str = "100";

/// Topology and limits of the mixing pipeline
#[derive(Clone, Debug)]
pub struct MixingConfig {
    /// Request queue of each node, `#nodeId#` is replaced by the one-based node id
    pub request_queue_template: QueueTemplate,
    /// Queues the nodes answer on
    pub response_queues: Vec<Destination>,
    pub node_count: u32,
    /// Retries granted at each stage
    pub retry_count: u32,
    pub chunk_size: u64,
    pub tenant_id: String,
}

impl MixingConfig {
    pub fn new(request_queue_template: QueueTemplate, response_queues: Vec<Destination>) -> Self {
        MixingConfig {
            request_queue_template,
            response_queues,
            node_count: DEFAULT_NODE_COUNT,
            retry_count: DEFAULT_RETRY_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            tenant_id: DEFAULT_TENANT_ID.to_owned(),
        }
    }

    pub fn with_node_count(mut self, node_count: u32) -> Self {
        self.node_count = node_count;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: &str) -> Self {
        self.tenant_id = tenant_id.to_owned();
        self
    }

    /// Request queue of a node, by one-based node id
    pub fn request_queue(&self, node_id: u32) -> Destination {
        self.request_queue_template.resolve(node_id)
    }
}

/// What [`MixingCoordinator::on_node_response`] did with a node's answer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeResponseOutcome {
    /// The output was stored and the state sent on to the next node
    Forwarded { next_node: u32 },
    /// The last node answered, the chunk is MIXED
    Completed,
    /// The node reported an error and the state was sent back to it
    Retrying { node: u32, retries_left: u32 },
    /// The node reported an error with no retries left, the chunk stays in ERROR
    RetriesExhausted { node: u32 },
    /// The chunk was already MIXED, a redelivered answer
    AlreadyMixed,
    /// A redelivered answer for a chunk in ERROR; nothing was written or sent
    Stale { node: u32 },
}

/// Drives ballot box chunks through the fixed sequence of mixing nodes.
///
/// No per-chunk state is kept in memory: every node answer re-reads the chunk status,
/// so answers for the same chunk may be handled on any task.
pub struct MixingCoordinator {
    config: MixingConfig,
    statuses: Arc<dyn ChunkStatusStore>,
    outputs: Arc<dyn NodeOutputStore>,
    votes: Arc<dyn VoteSource>,
    fabric: Arc<dyn MessagingFabric>,
    receivers: Mutex<Option<Vec<(Destination, ReceiverId)>>>,
}

impl MixingCoordinator {
    pub fn new(
        config: MixingConfig,
        statuses: Arc<dyn ChunkStatusStore>,
        outputs: Arc<dyn NodeOutputStore>,
        votes: Arc<dyn VoteSource>,
        fabric: Arc<dyn MessagingFabric>,
    ) -> Self {
        MixingCoordinator {
            config,
            statuses,
            outputs,
            votes,
            fabric,
            receivers: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MixingConfig {
        &self.config
    }

    /// Attach a consumer to every response queue
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.receivers.lock().is_some() {
            return Err(Error::AlreadyStarted);
        }

        let mut attached = Vec::with_capacity(self.config.response_queues.len());
        for queue in &self.config.response_queues {
            let listener = Arc::new(MixingResponseListener {
                coordinator: Arc::downgrade(self),
            });
            let id = self.fabric.create_receiver(queue, listener).await?;
            attached.push((queue.clone(), id));
        }

        info!(queues = attached.len(), "mixing coordinator started");
        *self.receivers.lock() = Some(attached);
        Ok(())
    }

    /// Detach every consumer attached by [`MixingCoordinator::start`]
    pub async fn stop(&self) -> Result<(), Error> {
        let attached = self.receivers.lock().take().ok_or(Error::NotStarted)?;
        for (queue, id) in attached {
            self.fabric.destroy_receiver(&queue, id).await?;
        }
        info!("mixing coordinator stopped");
        Ok(())
    }

    /// Start mixing a list of ballot boxes of one election event.
    ///
    /// Every id is validated before anything is written. Ballot boxes that are already
    /// MIXED are reported as errors and left untouched.
    #[instrument(skip(self, ballot_box_ids), fields(count = ballot_box_ids.len()))]
    pub async fn process_ballot_boxes(
        &self,
        election_event_id: &str,
        ballot_box_ids: &[String],
        tracking_id: &str,
    ) -> Result<Vec<BallotBoxStatus>, Error> {
        validate_id(election_event_id)?;
        for id in ballot_box_ids {
            validate_id(id)?;
        }

        let mut results = Vec::with_capacity(ballot_box_ids.len());
        for id in ballot_box_ids {
            if self.statuses.aggregate_status(election_event_id, id)? == AggregateStatus::Mixed {
                warn!(ballot_box_id = %id, "{}", MIXING_ALREADY_STARTED);
                results.push(BallotBoxStatus::with_error(id, MIXING_ALREADY_STARTED));
                continue;
            }

            let ballot_box = BallotBoxId::new(&self.config.tenant_id, election_event_id, id);
            results.push(self.process_ballot_box(&ballot_box).await?);
        }
        Ok(results)
    }

    /// Split a ballot box into chunks and send every chunk to the first node
    #[instrument(skip(self), fields(ballot_box_id = %ballot_box.ballot_box_id))]
    pub async fn process_ballot_box(&self, ballot_box: &BallotBoxId) -> Result<BallotBoxStatus, Error> {
        let id = &ballot_box.ballot_box_id;

        let vote_count = match self.votes.vote_count(ballot_box) {
            Ok(count) => count,
            Err(VoteSourceError::NotReady(_)) => {
                info!("ballot box is not closed yet");
                return Ok(BallotBoxStatus::new(id, AggregateStatus::NotClosed));
            }
            Err(VoteSourceError::NotFound(_)) => {
                info!("ballot box not found");
                return Ok(BallotBoxStatus::new(id, AggregateStatus::NotFound));
            }
            Err(e) => {
                error!(error = %e, "cannot read ballot box");
                return Ok(BallotBoxStatus::with_error(id, e.to_string()));
            }
        };

        if vote_count == 0 {
            let chunk = ballot_box.chunk(0);
            self.save_status(&chunk, ChunkStatus::Processing, None)?;
            self.save_status(&chunk, ChunkStatus::Mixed, None)?;
            info!("empty ballot box, nothing to mix");
            return Ok(BallotBoxStatus::new(id, AggregateStatus::Mixed));
        }

        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = (vote_count + chunk_size - 1) / chunk_size;
        for index in 0..chunk_count {
            let chunk = ballot_box.chunk(index as u32);
            self.save_status(&chunk, ChunkStatus::Processing, None)?;

            let offset = index * chunk_size;
            let size = chunk_size.min(vote_count - offset);
            if let Err(e) = self.send_first_stage(ballot_box, &chunk, offset, size).await {
                error!(chunk = %chunk, error = %e, "failed to send chunk for mixing");
                self.save_status(&chunk, ChunkStatus::Error, Some(e.to_string()))?;
            }
        }
        info!(votes = vote_count, chunks = chunk_count, "ballot box sent for mixing");

        let status = self
            .statuses
            .aggregate_status(&ballot_box.election_event_id, id)?;
        if status == AggregateStatus::Error {
            return Ok(BallotBoxStatus::with_error(
                id,
                format!("Error sending ballot box {} for mixing", id),
            ));
        }
        Ok(BallotBoxStatus::new(id, status))
    }

    async fn send_first_stage(
        &self,
        ballot_box: &BallotBoxId,
        chunk: &ChunkKey,
        offset: u64,
        size: u64,
    ) -> Result<(), Error> {
        let payload = self.votes.initial_payload(ballot_box, offset, size)?;
        let details = BallotBoxDetails::new(
            &chunk.election_event_id,
            &chunk.ballot_box_id,
            chunk.chunk_id,
        );
        let mut state = MixnetState::new(details, payload, self.config.retry_count);
        state.increment_node_to_visit();
        self.publish(&state).await
    }

    /// React to a node's answer for one chunk
    #[instrument(skip(self, state), fields(chunk = %state.chunk_key(), node = state.node_to_visit))]
    pub async fn on_node_response(&self, mut state: MixnetState) -> Result<NodeResponseOutcome, Error> {
        let node = state.node_to_visit;
        let node_index = state
            .node_index()
            .filter(|index| *index < self.config.node_count)
            .ok_or(Error::UnexpectedNode(node))?;

        let chunk = state.chunk_key();
        let current = self
            .statuses
            .get(&chunk)?
            .ok_or_else(|| StoreError::ChunkNotFound(chunk.clone()))?;
        if current.status == ChunkStatus::Mixed {
            warn!("chunk is already mixed, ignoring redelivered response");
            return Ok(NodeResponseOutcome::AlreadyMixed);
        }

        if let Some(message) = state.mixnet_error.take() {
            warn!(error = %message, retries_left = state.retry_count, "node reported an error");
            self.save_status(&chunk, ChunkStatus::Error, Some(message))?;

            if state.retry_count == 0 {
                error!("retries exhausted, chunk stays in error");
                return Ok(NodeResponseOutcome::RetriesExhausted { node });
            }
            state.retry_count -= 1;
            self.publish(&state).await?;
            return Ok(NodeResponseOutcome::Retrying {
                node,
                retries_left: state.retry_count,
            });
        }

        let output = NodeOutput {
            key: NodeOutputKey {
                chunk: chunk.clone(),
                node_index,
            },
            payload: state.payload.clone(),
        };
        let inserted = self.outputs.insert(output)?;
        match inserted {
            InsertOutcome::Inserted => debug!("node output stored"),
            InsertOutcome::Duplicate => warn!("node output already stored, redelivered response"),
        }
        // A later stage failed since this answer was first handled
        if inserted == InsertOutcome::Duplicate && current.status == ChunkStatus::Error {
            warn!("chunk is in error, ignoring redelivered response");
            return Ok(NodeResponseOutcome::Stale { node });
        }

        if node == self.config.node_count {
            self.save_status(&chunk, ChunkStatus::Mixed, None)?;
            info!("chunk mixed");
            return Ok(NodeResponseOutcome::Completed);
        }
        if current.status == ChunkStatus::Error {
            self.save_status(&chunk, ChunkStatus::Processing, None)?;
        }

        state.increment_node_to_visit();
        state.retry_count = self.config.retry_count;
        if let Err(e) = self.publish(&state).await {
            error!(error = %e, "failed to forward chunk to the next node");
            self.save_status(&chunk, ChunkStatus::Error, Some(e.to_string()))?;
            return Err(e);
        }
        debug!(next_node = state.node_to_visit, "chunk forwarded");
        Ok(NodeResponseOutcome::Forwarded {
            next_node: state.node_to_visit,
        })
    }

    /// Aggregate status of a ballot box, reduced from its chunk records
    pub fn get_mix_dec_ballot_box_status(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
    ) -> Result<AggregateStatus, Error> {
        Ok(self
            .statuses
            .aggregate_status(election_event_id, ballot_box_id)?)
    }

    pub fn get_mix_dec_ballot_box_statuses(
        &self,
        election_event_id: &str,
        ballot_box_ids: &[String],
    ) -> Result<Vec<BallotBoxStatus>, Error> {
        ballot_box_ids
            .iter()
            .map(|id| {
                let status = self.get_mix_dec_ballot_box_status(election_event_id, id)?;
                Ok(BallotBoxStatus::new(id, status))
            })
            .collect()
    }

    /// Every stored node output of a ballot box, whatever its status
    pub fn get_ballot_box_payload_list(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
    ) -> Result<Vec<NodeOutput>, Error> {
        Ok(self.outputs.list(election_event_id, ballot_box_id)?)
    }

    /// Node outputs of a ballot box, only once it is MIXED
    pub fn get_mixed_payload_list(
        &self,
        election_event_id: &str,
        ballot_box_id: &str,
    ) -> Result<Vec<NodeOutput>, Error> {
        let status = self.get_mix_dec_ballot_box_status(election_event_id, ballot_box_id)?;
        if status != AggregateStatus::Mixed {
            return Err(Error::NotMixed(status));
        }
        self.get_ballot_box_payload_list(election_event_id, ballot_box_id)
    }

    async fn publish(&self, state: &MixnetState) -> Result<(), Error> {
        let destination = self.config.request_queue(state.node_to_visit);
        let frame = state.to_frame()?;
        self.fabric.send(&destination, frame).await?;
        Ok(())
    }

    fn save_status(
        &self,
        chunk: &ChunkKey,
        status: ChunkStatus,
        error_message: Option<String>,
    ) -> Result<(), Error> {
        self.statuses
            .save(ChunkStatusRecord::new(chunk.clone(), status, error_message))?;
        Ok(())
    }
}

/// Consumer of the mixing response queues
struct MixingResponseListener {
    coordinator: Weak<MixingCoordinator>,
}

#[async_trait]
impl MessageListener for MixingResponseListener {
    async fn on_message(&self, source: &Destination, body: Vec<u8>) {
        let coordinator = match self.coordinator.upgrade() {
            Some(coordinator) => coordinator,
            None => return,
        };

        let state = match MixnetState::from_frame(&body) {
            Ok(state) => state,
            Err(e) => {
                error!(%source, error = %e, "dropping malformed mixing response");
                return;
            }
        };

        if let Err(e) = coordinator.on_node_response(state).await {
            error!(%source, error = %e, "failed to handle mixing response");
        }
    }
}
