use super::*;
use std::sync::Arc;

const ELECTION_EVENT: &str = "f8ba3dd3844a4815af39c63570c12006";
const BALLOT_BOX: &str = "0d31a1148f95488fae6827391425dc08";

struct Fixture {
    coordinator: Arc<MixingCoordinator>,
    statuses: Arc<MemChunkStatusStore>,
    outputs: Arc<MemNodeOutputStore>,
    votes: Arc<MemVoteSource>,
    fabric: Arc<InMemoryFabric>,
}

impl Fixture {
    fn new(config: MixingConfig) -> Self {
        let statuses = Arc::new(MemChunkStatusStore::recording());
        let outputs = Arc::new(MemNodeOutputStore::new());
        let votes = Arc::new(MemVoteSource::new());
        let fabric = Arc::new(InMemoryFabric::recording());
        let coordinator = Arc::new(MixingCoordinator::new(
            config,
            statuses.clone(),
            outputs.clone(),
            votes.clone(),
            fabric.clone(),
        ));
        Fixture {
            coordinator,
            statuses,
            outputs,
            votes,
            fabric,
        }
    }

    fn ballot_box(&self) -> BallotBoxId {
        BallotBoxId::new("100", ELECTION_EVENT, BALLOT_BOX)
    }

    fn with_votes(self, count: u8) -> Self {
        let votes = (0..count).map(|v| vec![v]).collect();
        self.votes.insert(&self.ballot_box(), votes, true);
        self
    }

    /// The last frame sent to a node, decoded
    fn last_request(&self, node_id: u32) -> MixnetState {
        let frames = self
            .fabric
            .sent_to(&self.coordinator.config().request_queue(node_id));
        MixnetState::from_frame(frames.last().unwrap()).unwrap()
    }
}

fn config() -> MixingConfig {
    MixingConfig::new(
        QueueTemplate::new("md-mixdec-#nodeId#-req").unwrap(),
        vec![Destination::queue("md-mixdec-res")],
    )
}

fn mixed_by(mut state: MixnetState, node_id: u32) -> MixnetState {
    state.payload.extend_from_slice(&simulator::mix_marker(node_id));
    state
}

fn failed(mut state: MixnetState) -> MixnetState {
    state.mixnet_error = Some("Node failed to mix".to_owned());
    state
}

#[tokio::test]
async fn empty_ballot_box_is_mixed_without_contacting_nodes() {
    let fixture = Fixture::new(config()).with_votes(0);

    let results = fixture
        .coordinator
        .process_ballot_boxes(ELECTION_EVENT, &[BALLOT_BOX.to_owned()], "tracking")
        .await
        .unwrap();

    assert_eq!(results[0].process_status, AggregateStatus::Mixed);
    assert_eq!(fixture.fabric.send_count(), 0);
    let history: Vec<ChunkStatus> = fixture
        .statuses
        .history()
        .into_iter()
        .map(|record| record.status)
        .collect();
    assert_eq!(history, vec![ChunkStatus::Processing, ChunkStatus::Mixed]);
}

#[tokio::test]
async fn chunk_walks_every_node_in_order() {
    let fixture = Fixture::new(config()).with_votes(3);
    let status = fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();
    assert_eq!(status.process_status, AggregateStatus::Processing);

    for node_id in 1..=4 {
        let request = fixture.last_request(node_id);
        assert_eq!(request.node_to_visit, node_id);
        assert_eq!(request.retry_count, DEFAULT_RETRY_COUNT);

        let outcome = fixture
            .coordinator
            .on_node_response(mixed_by(request, node_id))
            .await
            .unwrap();
        if node_id < 4 {
            assert_eq!(
                outcome,
                NodeResponseOutcome::Forwarded {
                    next_node: node_id + 1
                }
            );
        } else {
            assert_eq!(outcome, NodeResponseOutcome::Completed);
        }
    }

    let outputs = fixture
        .coordinator
        .get_mixed_payload_list(ELECTION_EVENT, BALLOT_BOX)
        .unwrap();
    let stages: Vec<u32> = outputs.iter().map(|o| o.key.node_index).collect();
    assert_eq!(stages, vec![0, 1, 2, 3]);
    assert!(outputs[3].payload.ends_with(&simulator::mix_marker(4)));
}

#[tokio::test]
async fn redelivered_success_is_absorbed() {
    let fixture = Fixture::new(config().with_node_count(2)).with_votes(1);
    fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();

    let answer = mixed_by(fixture.last_request(1), 1);
    for _ in 0..2 {
        assert_eq!(
            fixture
                .coordinator
                .on_node_response(answer.clone())
                .await
                .unwrap(),
            NodeResponseOutcome::Forwarded { next_node: 2 }
        );
    }
    assert_eq!(fixture.outputs.len(), 1);
    assert_eq!(fixture.outputs.duplicate_count(), 1);

    let last = mixed_by(fixture.last_request(2), 2);
    assert_eq!(
        fixture
            .coordinator
            .on_node_response(last.clone())
            .await
            .unwrap(),
        NodeResponseOutcome::Completed
    );
    let writes = fixture.statuses.write_count();
    assert_eq!(
        fixture.coordinator.on_node_response(last).await.unwrap(),
        NodeResponseOutcome::AlreadyMixed
    );
    assert_eq!(fixture.statuses.write_count(), writes);
    assert_eq!(fixture.outputs.len(), 2);
}

#[tokio::test]
async fn node_errors_are_retried_at_the_same_stage_until_exhausted() {
    let fixture = Fixture::new(config().with_retry_count(2)).with_votes(1);
    fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();
    let first = fixture.last_request(1);
    let first = mixed_by(first, 1);
    fixture.coordinator.on_node_response(first).await.unwrap();

    let mut expected_retries = vec![
        NodeResponseOutcome::Retrying {
            node: 2,
            retries_left: 1,
        },
        NodeResponseOutcome::Retrying {
            node: 2,
            retries_left: 0,
        },
    ]
    .into_iter();
    loop {
        let request = fixture.last_request(2);
        assert_eq!(request.node_to_visit, 2);
        assert!(request.mixnet_error.is_none());

        let outcome = fixture
            .coordinator
            .on_node_response(failed(request))
            .await
            .unwrap();
        match expected_retries.next() {
            Some(expected) => assert_eq!(outcome, expected),
            None => {
                assert_eq!(outcome, NodeResponseOutcome::RetriesExhausted { node: 2 });
                break;
            }
        }
    }

    let sends = fixture.fabric.send_count();
    assert_eq!(sends, 4);
    assert_eq!(
        fixture
            .coordinator
            .get_mix_dec_ballot_box_status(ELECTION_EVENT, BALLOT_BOX)
            .unwrap(),
        AggregateStatus::Error
    );
    let record = fixture
        .statuses
        .get(&fixture.ballot_box().chunk(0))
        .unwrap()
        .unwrap();
    assert_eq!(record.error_message.as_deref(), Some("Node failed to mix"));
    assert!(fixture.fabric.sent_to(&Destination::queue("md-mixdec-3-req")).is_empty());
}

#[tokio::test]
async fn redelivered_success_does_not_revive_an_exhausted_chunk() {
    let fixture = Fixture::new(config().with_retry_count(0)).with_votes(1);
    fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();
    let answer = mixed_by(fixture.last_request(1), 1);
    assert_eq!(
        fixture
            .coordinator
            .on_node_response(answer.clone())
            .await
            .unwrap(),
        NodeResponseOutcome::Forwarded { next_node: 2 }
    );
    assert_eq!(
        fixture
            .coordinator
            .on_node_response(failed(fixture.last_request(2)))
            .await
            .unwrap(),
        NodeResponseOutcome::RetriesExhausted { node: 2 }
    );

    let writes = fixture.statuses.write_count();
    let sends = fixture.fabric.send_count();
    let outcome = fixture.coordinator.on_node_response(answer).await.unwrap();

    assert_eq!(outcome, NodeResponseOutcome::Stale { node: 1 });
    assert_eq!(fixture.statuses.write_count(), writes);
    assert_eq!(fixture.fabric.send_count(), sends);
    let record = fixture
        .statuses
        .get(&fixture.ballot_box().chunk(0))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ChunkStatus::Error);
    assert_eq!(record.error_message.as_deref(), Some("Node failed to mix"));
    assert_eq!(
        fixture
            .coordinator
            .get_mix_dec_ballot_box_status(ELECTION_EVENT, BALLOT_BOX)
            .unwrap(),
        AggregateStatus::Error
    );
}

#[tokio::test]
async fn success_after_retry_resumes_processing() {
    let fixture = Fixture::new(config()).with_votes(1);
    fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();

    fixture
        .coordinator
        .on_node_response(failed(fixture.last_request(1)))
        .await
        .unwrap();
    assert_eq!(
        fixture
            .coordinator
            .get_mix_dec_ballot_box_status(ELECTION_EVENT, BALLOT_BOX)
            .unwrap(),
        AggregateStatus::Error
    );

    let retried = fixture.last_request(1);
    assert_eq!(retried.retry_count, DEFAULT_RETRY_COUNT - 1);
    fixture
        .coordinator
        .on_node_response(mixed_by(retried, 1))
        .await
        .unwrap();
    assert_eq!(
        fixture
            .coordinator
            .get_mix_dec_ballot_box_status(ELECTION_EVENT, BALLOT_BOX)
            .unwrap(),
        AggregateStatus::Processing
    );
    assert_eq!(fixture.last_request(2).retry_count, DEFAULT_RETRY_COUNT);
}

#[tokio::test]
async fn already_mixed_ballot_box_is_not_processed_again() {
    let fixture = Fixture::new(config()).with_votes(0);
    let ids = vec![BALLOT_BOX.to_owned()];
    fixture
        .coordinator
        .process_ballot_boxes(ELECTION_EVENT, &ids, "first")
        .await
        .unwrap();
    let writes = fixture.statuses.write_count();

    let results = fixture
        .coordinator
        .process_ballot_boxes(ELECTION_EVENT, &ids, "second")
        .await
        .unwrap();

    assert_eq!(results[0].process_status, AggregateStatus::Error);
    assert_eq!(
        results[0].error_message.as_deref(),
        Some(MIXING_ALREADY_STARTED)
    );
    assert_eq!(fixture.statuses.write_count(), writes);
    assert_eq!(fixture.fabric.send_count(), 0);
}

#[tokio::test]
async fn readiness_failures_write_nothing() {
    let fixture = Fixture::new(config());
    let status = fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();
    assert_eq!(status.process_status, AggregateStatus::NotFound);

    fixture.votes.insert(&fixture.ballot_box(), vec![vec![1]], false);
    let status = fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();
    assert_eq!(status.process_status, AggregateStatus::NotClosed);

    fixture.votes.set_unavailable(true);
    let status = fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();
    assert_eq!(status.process_status, AggregateStatus::Error);

    assert_eq!(fixture.statuses.write_count(), 0);
}

#[tokio::test]
async fn invalid_identifiers_fail_before_any_side_effect() {
    let fixture = Fixture::new(config()).with_votes(1);
    let ids = vec![BALLOT_BOX.to_owned(), "not-a-uuid".to_owned()];

    let result = fixture
        .coordinator
        .process_ballot_boxes(ELECTION_EVENT, &ids, "tracking")
        .await;

    assert!(matches!(result, Err(Error::InvalidIdentifier(id)) if id == "not-a-uuid"));
    assert_eq!(fixture.statuses.write_count(), 0);
    assert_eq!(fixture.fabric.send_count(), 0);
}

#[tokio::test]
async fn large_ballot_box_is_split_into_chunks() {
    let fixture = Fixture::new(config().with_chunk_size(4)).with_votes(10);
    fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();

    let requests = fixture.fabric.sent_to(&Destination::queue("md-mixdec-1-req"));
    let mut chunks: Vec<(u32, usize)> = requests
        .iter()
        .map(|frame| {
            let state = MixnetState::from_frame(frame).unwrap();
            let payload: InitialPayload = serde_json::from_slice(&state.payload).unwrap();
            (state.ballot_box_details.chunk_id, payload.votes.len())
        })
        .collect();
    chunks.sort();
    assert_eq!(chunks, vec![(0, 4), (1, 4), (2, 2)]);
    assert_eq!(
        fixture
            .statuses
            .count_by_status(ELECTION_EVENT, BALLOT_BOX, Some(ChunkStatus::Processing))
            .unwrap(),
        3
    );
}

#[tokio::test]
async fn publish_failure_is_recorded_as_error() {
    let fixture = Fixture::new(config()).with_votes(1);
    fixture.fabric.fail_sends(true);

    let status = fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();

    assert_eq!(status.process_status, AggregateStatus::Error);
    assert_eq!(
        status.error_message,
        Some(format!("Error sending ballot box {} for mixing", BALLOT_BOX))
    );
    let record = fixture
        .statuses
        .get(&fixture.ballot_box().chunk(0))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ChunkStatus::Error);
    assert!(record.error_message.unwrap().contains("broker unavailable"));
}

#[tokio::test]
async fn forwarding_failure_marks_the_chunk_as_error() {
    let fixture = Fixture::new(config()).with_votes(1);
    fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();
    let answer = mixed_by(fixture.last_request(1), 1);

    fixture.fabric.fail_sends(true);
    let result = fixture.coordinator.on_node_response(answer).await;

    assert!(matches!(result, Err(Error::Messaging(_))));
    assert_eq!(
        fixture
            .coordinator
            .get_mix_dec_ballot_box_status(ELECTION_EVENT, BALLOT_BOX)
            .unwrap(),
        AggregateStatus::Error
    );
}

#[tokio::test]
async fn payload_list_is_gated_on_mixed_status() {
    let fixture = Fixture::new(config()).with_votes(1);
    fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();
    fixture
        .coordinator
        .on_node_response(mixed_by(fixture.last_request(1), 1))
        .await
        .unwrap();

    assert!(matches!(
        fixture
            .coordinator
            .get_mixed_payload_list(ELECTION_EVENT, BALLOT_BOX),
        Err(Error::NotMixed(AggregateStatus::Processing))
    ));
    assert_eq!(
        fixture
            .coordinator
            .get_ballot_box_payload_list(ELECTION_EVENT, BALLOT_BOX)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn responses_for_unknown_chunks_or_nodes_are_rejected() {
    let fixture = Fixture::new(config());
    let mut state = MixnetState::new(
        BallotBoxDetails::new(ELECTION_EVENT, BALLOT_BOX, 0),
        vec![1],
        1,
    );

    assert!(matches!(
        fixture.coordinator.on_node_response(state.clone()).await,
        Err(Error::UnexpectedNode(0))
    ));

    state.increment_node_to_visit();
    assert!(matches!(
        fixture.coordinator.on_node_response(state.clone()).await,
        Err(Error::Store(StoreError::ChunkNotFound(_)))
    ));

    state.node_to_visit = 5;
    assert!(matches!(
        fixture.coordinator.on_node_response(state).await,
        Err(Error::UnexpectedNode(5))
    ));
}

#[tokio::test]
async fn batch_status_query_and_unreachable_store() {
    let fixture = Fixture::new(config()).with_votes(0);
    fixture
        .coordinator
        .process_ballot_box(&fixture.ballot_box())
        .await
        .unwrap();

    let other = "9a0d3f0e43b5442b9b0c0b1d26b1e6e1".to_owned();
    let statuses = fixture
        .coordinator
        .get_mix_dec_ballot_box_statuses(ELECTION_EVENT, &[BALLOT_BOX.to_owned(), other])
        .unwrap();
    let names: Vec<&str> = statuses.iter().map(|s| s.process_status.name()).collect();
    assert_eq!(names, vec!["MIXED", "NOT_FOUND"]);

    fixture.statuses.set_unreachable(true);
    assert!(matches!(
        fixture
            .coordinator
            .get_mix_dec_ballot_box_status(ELECTION_EVENT, BALLOT_BOX),
        Err(Error::Store(StoreError::Unreachable(_)))
    ));
}

#[tokio::test]
async fn lifecycle_is_explicit() {
    let fixture = Fixture::new(config());
    let queue = Destination::queue("md-mixdec-res");

    assert!(matches!(
        fixture.coordinator.stop().await,
        Err(Error::NotStarted)
    ));
    fixture.coordinator.start().await.unwrap();
    assert_eq!(fixture.fabric.receiver_count(&queue), 1);
    assert!(matches!(
        fixture.coordinator.start().await,
        Err(Error::AlreadyStarted)
    ));

    fixture.coordinator.stop().await.unwrap();
    assert_eq!(fixture.fabric.receiver_count(&queue), 0);
}
