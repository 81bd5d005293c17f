use crate::*;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

/// Action name of the mixing and decryption queues in `CC_QUEUE_NAMES`
pub const MIX_DEC_ACTION: &str = "md-mixdec";

/// Every action a control component may list queues for
pub const KNOWN_ACTIONS: [&str; 6] = [
    MIX_DEC_ACTION,
    "md-keygen",
    "cg-keygen",
    "cg-comp",
    "cv-comp",
    "cv-dec",
];

#[derive(Deserialize, Debug)]
struct QueuePair {
    req: String,
    res: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ActionQueues {
    requests: BTreeSet<String>,
    responses: BTreeSet<String>,
}

/// Request and response queues of every control component, per action.
///
/// Parsed from a document of the form
/// `{"<node>": {"<action>": {"req": "...", "res": "..."}}}`.
/// Queue lists are sorted by name, which fixes the node order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueuesConfig {
    actions: BTreeMap<&'static str, ActionQueues>,
}

impl QueuesConfig {
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let nodes: BTreeMap<String, BTreeMap<String, QueuePair>> = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid {
                name: "CC_QUEUE_NAMES",
                reason: e.to_string(),
            })?;

        let mut config = QueuesConfig::default();
        for (node, actions) in nodes {
            for (action, pair) in actions {
                let known = KNOWN_ACTIONS
                    .iter()
                    .find(|known| **known == action)
                    .ok_or_else(|| ConfigError::UnknownAction {
                        node: node.clone(),
                        action: action.clone(),
                    })?;
                let queues = config.actions.entry(*known).or_default();
                queues.requests.insert(pair.req);
                queues.responses.insert(pair.res);
            }
        }
        Ok(config)
    }

    /// Request queues of an action, sorted by name
    pub fn requests(&self, action: &str) -> Vec<Destination> {
        self.list(action, |queues| &queues.requests)
    }

    /// Response queues of an action, sorted by name
    pub fn responses(&self, action: &str) -> Vec<Destination> {
        self.list(action, |queues| &queues.responses)
    }

    /// Queue configuration of a key generation family
    pub fn key_generation(&self, family: KeyFamily) -> Result<KeyGenerationConfig, ConfigError> {
        let requests = self.requests(family.action());
        let responses = self.responses(family.action());
        if requests.is_empty() || responses.is_empty() {
            return Err(ConfigError::NoQueues(family.action()));
        }
        Ok(KeyGenerationConfig::new(requests, responses))
    }

    fn list(
        &self,
        action: &str,
        side: impl Fn(&ActionQueues) -> &BTreeSet<String>,
    ) -> Vec<Destination> {
        self.actions
            .get(action)
            .map(|queues| side(queues).iter().map(Destination::queue).collect())
            .unwrap_or_default()
    }
}

/// Everything the orchestrator process needs
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub queues: QueuesConfig,
    pub mixing: MixingConfig,
    pub mix_dec_keys: KeyGenerationConfig,
    pub choice_codes_keys: KeyGenerationConfig,
}

impl OrchestratorConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through a variable lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_names =
            lookup("CC_QUEUE_NAMES").ok_or(ConfigError::MissingVariable("CC_QUEUE_NAMES"))?;
        let queues = QueuesConfig::parse(&queue_names)?;

        let pattern = lookup("MIXING_DECRYPT_REQUEST_QUEUE_PATTERN")
            .ok_or(ConfigError::MissingVariable("MIXING_DECRYPT_REQUEST_QUEUE_PATTERN"))?;
        let response_queues = queues.responses(MIX_DEC_ACTION);
        if response_queues.is_empty() {
            return Err(ConfigError::NoQueues(MIX_DEC_ACTION));
        }

        let mut mixing = MixingConfig::new(QueueTemplate::new(pattern)?, response_queues)
            .with_node_count(parse_or(&lookup, "MIXING_NODE_COUNT", DEFAULT_NODE_COUNT)?)
            .with_retry_count(parse_or(&lookup, "MIXING_RETRY_COUNT", DEFAULT_RETRY_COUNT)?)
            .with_chunk_size(parse_or(&lookup, "MIXING_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?);
        if let Some(tenant_id) = lookup("TENANT_ID") {
            mixing = mixing.with_tenant_id(&tenant_id);
        }
        if mixing.node_count == 0 || mixing.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                name: "MIXING_NODE_COUNT",
                reason: "node count and chunk size must be positive".to_owned(),
            });
        }

        let topic = lookup("HA_TOPIC").unwrap_or_else(|| DEFAULT_RESULTS_READY_TOPIC.to_owned());
        let timeout = Duration::from_millis(parse_or(
            &lookup,
            "KEY_GENERATION_TIMEOUT_MS",
            DEFAULT_KEY_GENERATION_TIMEOUT.as_millis() as u64,
        )?);
        let key_generation = |family| -> Result<KeyGenerationConfig, ConfigError> {
            Ok(queues
                .key_generation(family)?
                .with_results_ready_topic(&topic)
                .with_timeout(timeout))
        };
        let mix_dec_keys = key_generation(KeyFamily::MixDec)?;
        let choice_codes_keys = key_generation(KeyFamily::ChoiceCodes)?;

        Ok(OrchestratorConfig {
            queues,
            mixing,
            mix_dec_keys,
            choice_codes_keys,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
