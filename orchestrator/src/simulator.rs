//! Stand-ins for control-component nodes, driven through a [`MessagingFabric`].
//!
//! Mix nodes append a marker to the payload they receive and answer on the response
//! queue. Key nodes answer every key creation request with two signed public keys.

use crate::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Marker a simulated mix node appends to the payload it mixes
pub fn mix_marker(node_id: u32) -> Vec<u8> {
    format!("|mixed-by-{}", node_id).into_bytes()
}

pub struct SimulatedMixNode {
    node_id: u32,
    fabric: Weak<dyn MessagingFabric>,
    response_queue: Destination,
    failures_left: AtomicU32,
    requests: AtomicUsize,
}

impl SimulatedMixNode {
    pub fn new(
        node_id: u32,
        fabric: &Arc<dyn MessagingFabric>,
        response_queue: Destination,
    ) -> Self {
        SimulatedMixNode {
            node_id,
            fabric: Arc::downgrade(fabric),
            response_queue,
            failures_left: AtomicU32::new(0),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Answer the next `count` requests with an error
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of requests received so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageListener for SimulatedMixNode {
    async fn on_message(&self, _source: &Destination, body: Vec<u8>) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let fabric = match self.fabric.upgrade() {
            Some(fabric) => fabric,
            None => return,
        };

        let mut state = match MixnetState::from_frame(&body) {
            Ok(state) => state,
            Err(e) => {
                error!(node = self.node_id, error = %e, "mix node got a malformed request");
                return;
            }
        };

        if state.node_to_visit != self.node_id {
            state.mixnet_error = Some(format!(
                "Request for node {} delivered to node {}",
                state.node_to_visit, self.node_id
            ));
        } else if self.take_failure() {
            state.mixnet_error = Some(format!("Node {} failed to mix", self.node_id));
        } else {
            state.payload.extend_from_slice(&mix_marker(self.node_id));
        }

        let frame = match state.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(node = self.node_id, error = %e, "mix node cannot encode its answer");
                return;
            }
        };
        debug!(node = self.node_id, chunk = %state.chunk_key(), "mix node answering");
        if let Err(e) = fabric.send(&self.response_queue, frame).await {
            error!(node = self.node_id, error = %e, "mix node cannot answer");
        }
    }
}

/// Attach one simulated mix node per pipeline stage, answering on the first response queue
pub async fn spawn_mix_nodes(
    fabric: &Arc<dyn MessagingFabric>,
    config: &MixingConfig,
) -> Result<Vec<Arc<SimulatedMixNode>>, Error> {
    let response_queue = config
        .response_queues
        .first()
        .cloned()
        .ok_or(ConfigError::NoQueues(MIX_DEC_ACTION))?;

    let mut nodes = Vec::with_capacity(config.node_count as usize);
    for node_id in 1..=config.node_count {
        let node = Arc::new(SimulatedMixNode::new(
            node_id,
            fabric,
            response_queue.clone(),
        ));
        fabric
            .create_receiver(&config.request_queue(node_id), node.clone())
            .await?;
        nodes.push(node);
    }
    Ok(nodes)
}

pub struct SimulatedKeyNode {
    name: String,
    fabric: Weak<dyn MessagingFabric>,
    response_queue: Destination,
    results_ready_topic: Option<Destination>,
    cbor: bool,
    silent: AtomicBool,
}

impl SimulatedKeyNode {
    pub fn new(name: &str, fabric: &Arc<dyn MessagingFabric>, response_queue: Destination) -> Self {
        SimulatedKeyNode {
            name: name.to_owned(),
            fabric: Arc::downgrade(fabric),
            response_queue,
            results_ready_topic: None,
            cbor: false,
            silent: AtomicBool::new(false),
        }
    }

    /// Answer in CBOR instead of JSON
    pub fn with_cbor(mut self) -> Self {
        self.cbor = true;
        self
    }

    /// Announce every answer on the results-ready topic
    pub fn with_results_ready_topic(mut self, topic: Destination) -> Self {
        self.results_ready_topic = Some(topic);
        self
    }

    /// Stop answering requests
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn contribution(&self, request: &KeyCreationRequest) -> KeyContribution {
        let key = |kind: &str| CcPublicKey {
            public_key: format!(
                "{{\"{}\":\"{}\",\"resource\":\"{}\"}}",
                kind, self.name, request.resource_id
            ),
            key_signature: format!("{}:{}:{}", self.name, kind, request.correlation_id).into_bytes(),
            signer_certificate: format!(
                "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
                self.name
            ),
            node_ca_certificate:
                "-----BEGIN CERTIFICATE-----\nnode-ca\n-----END CERTIFICATE-----\n".to_owned(),
        };

        KeyContribution {
            correlation_id: request.correlation_id,
            election_event_id: request.election_event_id.clone(),
            resource_id: request.resource_id.clone(),
            node_id: Some(self.name.clone()),
            public_keys: vec![key("generation"), key("decryption")],
        }
    }
}

#[async_trait]
impl MessageListener for SimulatedKeyNode {
    async fn on_message(&self, _source: &Destination, body: Vec<u8>) {
        if self.silent.load(Ordering::SeqCst) {
            return;
        }
        let fabric = match self.fabric.upgrade() {
            Some(fabric) => fabric,
            None => return,
        };

        let request: KeyCreationRequest = match decode_message(&body) {
            Ok(request) => request,
            Err(e) => {
                error!(node = %self.name, error = %e, "key node got a malformed request");
                return;
            }
        };

        let contribution = self.contribution(&request);
        let encoded = if self.cbor {
            serde_cbor::to_vec(&contribution).map_err(CodecError::from)
        } else {
            serde_json::to_vec(&contribution).map_err(CodecError::from)
        };
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(node = %self.name, error = %e, "key node cannot encode its answer");
                return;
            }
        };

        if let Err(e) = fabric.send(&self.response_queue, encoded).await {
            error!(node = %self.name, error = %e, "key node cannot answer");
            return;
        }
        if let Some(topic) = &self.results_ready_topic {
            let hint = request.correlation_id.to_string().into_bytes();
            if let Err(e) = fabric.send(topic, hint).await {
                error!(node = %self.name, error = %e, "key node cannot announce results");
            }
        }
    }
}

/// Attach one simulated key node per request queue, each answering on the matching
/// response queue. Every second node answers in CBOR.
pub async fn spawn_key_nodes(
    fabric: &Arc<dyn MessagingFabric>,
    config: &KeyGenerationConfig,
) -> Result<Vec<Arc<SimulatedKeyNode>>, Error> {
    let mut nodes = Vec::with_capacity(config.request_queues.len());
    for (index, (request_queue, response_queue)) in config
        .request_queues
        .iter()
        .zip(&config.response_queues)
        .enumerate()
    {
        let mut node = SimulatedKeyNode::new(
            &format!("node{}", index + 1),
            fabric,
            response_queue.clone(),
        )
        .with_results_ready_topic(config.results_ready_topic.clone());
        if index % 2 == 1 {
            node = node.with_cbor();
        }

        let node = Arc::new(node);
        fabric.create_receiver(request_queue, node.clone()).await?;
        nodes.push(node);
    }
    Ok(nodes)
}
