use crate::Orchestrator;
use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, Utc};
use orchestrator::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct DemoOptions {
    pub votes: u32,
    pub chunk_size: u64,
    pub nodes: u32,
    pub flaky_node: Option<u32>,
}

/// `CC_QUEUE_NAMES` document for `nodes` control components
pub(crate) fn queue_names(nodes: u32) -> serde_json::Value {
    let mut document = serde_json::Map::new();
    for node in 1..=nodes {
        document.insert(
            node.to_string(),
            json!({
                "md-mixdec": {"req": format!("md-mixdec-{}-req", node), "res": "md-mixdec-res"},
                "md-keygen": {"req": format!("md-keygen-{}-req", node), "res": format!("md-keygen-{}-res", node)},
                "cg-keygen": {"req": format!("cg-keygen-{}-req", node), "res": format!("cg-keygen-{}-res", node)},
            }),
        );
    }
    serde_json::Value::Object(document)
}

pub async fn run(options: DemoOptions) -> Result<()> {
    let env: HashMap<&str, String> = [
        ("CC_QUEUE_NAMES", queue_names(options.nodes).to_string()),
        (
            "MIXING_DECRYPT_REQUEST_QUEUE_PATTERN",
            "md-mixdec-#nodeId#-req".to_owned(),
        ),
        ("MIXING_NODE_COUNT", options.nodes.to_string()),
        ("MIXING_CHUNK_SIZE", options.chunk_size.to_string()),
        ("KEY_GENERATION_TIMEOUT_MS", "5000".to_owned()),
    ]
    .into_iter()
    .collect();
    let config = OrchestratorConfig::from_lookup(|name| env.get(name).cloned())?;

    let election_event_id = Uuid::new_v4().simple().to_string();
    let ballot_box_id = Uuid::new_v4().simple().to_string();
    let ballot_box = BallotBoxId::new(&config.mixing.tenant_id, &election_event_id, &ballot_box_id);

    let votes = Arc::new(MemVoteSource::new());
    votes.insert(
        &ballot_box,
        (0..options.votes)
            .map(|v| format!("vote-{}", v).into_bytes())
            .collect(),
        true,
    );

    let fabric: Arc<dyn MessagingFabric> = Arc::new(InMemoryFabric::new());
    let orchestrator = Orchestrator::new(config, fabric, votes);
    let mix_nodes = orchestrator.simulate_nodes().await?;
    if let Some(node) = options
        .flaky_node
        .and_then(|id| mix_nodes.iter().find(|node| node.node_id() == id))
    {
        node.fail_next(1);
    }
    orchestrator.start().await?;

    let submitted = orchestrator
        .mixing
        .process_ballot_boxes(&election_event_id, &[ballot_box_id.clone()], "e2e")
        .await?;
    info!(status = %submitted[0].process_status, "ballot box submitted");

    let status = wait_until_settled(&orchestrator, &election_event_id, &ballot_box_id).await?;
    if status != AggregateStatus::Mixed {
        orchestrator.stop().await?;
        bail!("ballot box ended in {}", status);
    }
    let outputs = orchestrator
        .mixing
        .get_mixed_payload_list(&election_event_id, &ballot_box_id)?;

    let validity = ValidityWindow {
        from: Utc::now(),
        to: Utc::now() + ChronoDuration::days(365),
    };
    let request = |resource_id: String| KeyGenerationRequest {
        tracking_id: "e2e".to_owned(),
        tenant_id: orchestrator.config.mixing.tenant_id.clone(),
        election_event_id: election_event_id.clone(),
        resource_ids: vec![resource_id],
        validity,
        encryption_parameters: "{}".to_owned(),
    };
    let mix_dec_keys = orchestrator
        .mix_dec_keys
        .request_key_generation(&request(Uuid::new_v4().simple().to_string()))
        .await?;
    let choice_codes_keys = orchestrator
        .choice_codes_keys
        .request_choice_codes_keys(&request(Uuid::new_v4().simple().to_string()))
        .await?;

    orchestrator.stop().await?;

    let summary = json!({
        "electionEventId": election_event_id,
        "ballotBoxId": ballot_box_id,
        "status": status,
        "nodeOutputs": outputs.len(),
        "mixNodeRequests": mix_nodes.iter().map(|node| node.requests()).collect::<Vec<_>>(),
        "mixDecKeys": mix_dec_keys,
        "choiceCodesKeys": choice_codes_keys,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn wait_until_settled(
    orchestrator: &Orchestrator,
    election_event_id: &str,
    ballot_box_id: &str,
) -> Result<AggregateStatus> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = orchestrator
            .mixing
            .get_mix_dec_ballot_box_status(election_event_id, ballot_box_id)?;
        match status {
            AggregateStatus::Mixed => return Ok(status),
            AggregateStatus::Processing | AggregateStatus::Error
                if tokio::time::Instant::now() < deadline =>
            {
                tokio::time::sleep(Duration::from_millis(10)).await
            }
            _ => return Ok(status),
        }
    }
}
