use crate::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_RESULTS_READY_TOPIC: &str = "or-ha";
pub const DEFAULT_KEY_GENERATION_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Packaged contributions per resource id
pub type ContributionsByResource = BTreeMap<String, Vec<String>>;

/// Which keys the nodes are asked to generate
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum KeyFamily {
    /// Mixing and decryption keys, one per electoral authority
    MixDec,
    /// Choice code generation and decryption keys, one pair per verification card set
    ChoiceCodes,
}

impl KeyFamily {
    /// Action name of the family's queues in `CC_QUEUE_NAMES`
    pub fn action(&self) -> &'static str {
        match self {
            KeyFamily::MixDec => "md-keygen",
            KeyFamily::ChoiceCodes => "cg-keygen",
        }
    }
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.action())
    }
}

#[derive(Clone, Debug)]
pub struct KeyGenerationConfig {
    /// One request queue per node, every request goes to all of them
    pub request_queues: Vec<Destination>,
    /// One response queue per node, one contribution is expected on each
    pub response_queues: Vec<Destination>,
    /// Broadcast hint that results are ready to be collected
    pub results_ready_topic: Destination,
    /// How long to wait for all contributions of one resource
    pub timeout: Duration,
}

impl KeyGenerationConfig {
    pub fn new(request_queues: Vec<Destination>, response_queues: Vec<Destination>) -> Self {
        KeyGenerationConfig {
            request_queues,
            response_queues,
            results_ready_topic: Destination::topic(DEFAULT_RESULTS_READY_TOPIC),
            timeout: DEFAULT_KEY_GENERATION_TIMEOUT,
        }
    }

    pub fn with_results_ready_topic(mut self, topic: &str) -> Self {
        self.results_ready_topic = Destination::topic(topic);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A request for keys for a list of resources of one election event
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyGenerationRequest {
    pub tracking_id: String,
    pub tenant_id: String,
    pub election_event_id: String,
    /// Electoral authority ids or verification card set ids
    pub resource_ids: Vec<String>,
    pub validity: ValidityWindow,
    /// Serialized encryption parameters, passed through to the nodes
    pub encryption_parameters: String,
}

/// Both key maps of a choice codes key generation
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceCodesKeys {
    pub generation_keys: ContributionsByResource,
    pub decryption_keys: ContributionsByResource,
}

/// Broadcasts key creation requests and collects one contribution per node.
///
/// Resources are handled one after the other. A resource either gets every node's
/// contribution or fails as a whole; partial key material is never returned.
pub struct KeyGenerationCoordinator {
    family: KeyFamily,
    config: KeyGenerationConfig,
    fabric: Arc<dyn MessagingFabric>,
    aggregator: ResultAggregator,
    receivers: Mutex<Option<Vec<(Destination, ReceiverId)>>>,
}

impl KeyGenerationCoordinator {
    pub fn new(
        family: KeyFamily,
        config: KeyGenerationConfig,
        fabric: Arc<dyn MessagingFabric>,
    ) -> Self {
        KeyGenerationCoordinator {
            family,
            config,
            fabric,
            aggregator: ResultAggregator::new(),
            receivers: Mutex::new(None),
        }
    }

    pub fn family(&self) -> KeyFamily {
        self.family
    }

    pub fn aggregator(&self) -> &ResultAggregator {
        &self.aggregator
    }

    /// Attach consumers to every response queue and to the results-ready topic.
    ///
    /// Requests are refused until this has been called.
    pub async fn start(&self) -> Result<(), Error> {
        if self.receivers.lock().is_some() {
            return Err(Error::AlreadyStarted);
        }

        let mut attached = Vec::with_capacity(self.config.response_queues.len() + 1);
        for queue in &self.config.response_queues {
            let listener = Arc::new(ContributionListener {
                aggregator: self.aggregator.clone(),
            });
            let id = self.fabric.create_receiver(queue, listener).await?;
            attached.push((queue.clone(), id));
        }

        let topic = &self.config.results_ready_topic;
        let listener = Arc::new(ResultsReadyListener {
            aggregator: self.aggregator.clone(),
        });
        let id = self.fabric.create_receiver(topic, listener).await?;
        attached.push((topic.clone(), id));

        info!(family = %self.family, receivers = attached.len(), "key generation coordinator started");
        *self.receivers.lock() = Some(attached);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), Error> {
        let attached = self.receivers.lock().take().ok_or(Error::NotStarted)?;
        for (destination, id) in attached {
            self.fabric.destroy_receiver(&destination, id).await?;
        }
        info!(family = %self.family, "key generation coordinator stopped");
        Ok(())
    }

    /// Generate keys for every resource, packaging the first public key of each node
    #[instrument(skip(self, request), fields(family = %self.family, tracking_id = %request.tracking_id))]
    pub async fn request_key_generation(
        &self,
        request: &KeyGenerationRequest,
    ) -> Result<ContributionsByResource, Error> {
        let mut keys = ContributionsByResource::new();
        for resource_id in &request.resource_ids {
            let contributions = self.collect_contributions(request, resource_id).await?;
            keys.insert(resource_id.clone(), package_all(&contributions, 0)?);
        }
        Ok(keys)
    }

    /// Generate choice code keys for every verification card set.
    ///
    /// One round per resource yields both the generation key (first public key) and the
    /// decryption key (second public key) of every node.
    #[instrument(skip(self, request), fields(family = %self.family, tracking_id = %request.tracking_id))]
    pub async fn request_choice_codes_keys(
        &self,
        request: &KeyGenerationRequest,
    ) -> Result<ChoiceCodesKeys, Error> {
        let mut keys = ChoiceCodesKeys::default();
        for resource_id in &request.resource_ids {
            let contributions = self.collect_contributions(request, resource_id).await?;
            keys.generation_keys
                .insert(resource_id.clone(), package_all(&contributions, 0)?);
            keys.decryption_keys
                .insert(resource_id.clone(), package_all(&contributions, 1)?);
        }
        Ok(keys)
    }

    /// One scatter/gather round for a single resource
    async fn collect_contributions(
        &self,
        request: &KeyGenerationRequest,
        resource_id: &str,
    ) -> Result<Vec<KeyContribution>, Error> {
        if self.receivers.lock().is_none() {
            return Err(Error::NotStarted);
        }

        let creation = KeyCreationRequest::new(
            &request.election_event_id,
            resource_id,
            request.validity,
            &request.encryption_parameters,
            &request.tracking_id,
        );
        let correlation_id = creation.correlation_id;
        let body = creation.to_bytes()?;

        // Register before publishing so that no early reply is dropped
        let pending = self.aggregator.begin(
            correlation_id,
            self.config.response_queues.len(),
            self.config.timeout,
        )?;

        for queue in &self.config.request_queues {
            if let Err(e) = self.fabric.send(queue, body.clone()).await {
                error!(%resource_id, %correlation_id, error = %e, "failed to publish key creation request");
                return Err(Error::ResourceNotFound(resource_id.to_owned()));
            }
        }
        debug!(%resource_id, %correlation_id, nodes = self.config.request_queues.len(), "key creation request published");

        let results = match pending.wait().await {
            Ok(results) => results,
            Err(e) => {
                error!(%resource_id, error = %e, "key generation did not complete");
                return Err(Error::ResourceNotFound(resource_id.to_owned()));
            }
        };

        let contributions = results
            .iter()
            .map(|bytes| KeyContribution::from_bytes(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        info!(%resource_id, contributions = contributions.len(), "keys generated");
        Ok(contributions)
    }
}

fn package_all(contributions: &[KeyContribution], index: usize) -> Result<Vec<String>, Error> {
    contributions
        .iter()
        .map(|contribution| Ok(contribution.package(index)?.to_json()?))
        .collect()
}

/// Consumer of the key generation response queues
struct ContributionListener {
    aggregator: ResultAggregator,
}

#[async_trait]
impl MessageListener for ContributionListener {
    async fn on_message(&self, source: &Destination, body: Vec<u8>) {
        let header: ContributionHeader = match decode_message(&body) {
            Ok(header) => header,
            Err(e) => {
                error!(%source, error = %e, "dropping malformed key contribution");
                return;
            }
        };

        match self.aggregator.offer(header.correlation_id, body) {
            OfferOutcome::Accepted { received, expected } => {
                debug!(%source, correlation_id = %header.correlation_id, received, expected, "contribution received")
            }
            OfferOutcome::Unknown => {
                warn!(%source, correlation_id = %header.correlation_id, "contribution for no pending request")
            }
            OfferOutcome::Duplicate | OfferOutcome::Surplus => {}
        }
    }
}

/// Consumer of the results-ready topic.
///
/// The body is at most a correlation id; waiters re-check their own state on wake.
struct ResultsReadyListener {
    aggregator: ResultAggregator,
}

#[async_trait]
impl MessageListener for ResultsReadyListener {
    async fn on_message(&self, _source: &Destination, body: Vec<u8>) {
        let correlation_id = std::str::from_utf8(&body)
            .ok()
            .and_then(|text| Uuid::parse_str(text.trim()).ok());
        debug!(?correlation_id, "results ready");
        self.aggregator.notify_ready(correlation_id);
    }
}
