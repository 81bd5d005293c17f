use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::simulator::{spawn_key_nodes, spawn_mix_nodes};
use orchestrator::*;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Parser)]
#[command(name = "orchestratord")]
#[command(about = "Drives control-component nodes through ballot box mixing and key generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinators with configuration from the environment and wait for Ctrl-C
    Run {
        /// Attach simulated nodes to the in-process transport
        #[arg(long)]
        simulate_nodes: bool,
    },

    /// Mix a generated ballot box and generate keys against simulated nodes
    E2e {
        /// Number of votes in the ballot box
        #[arg(long, default_value = "10")]
        votes: u32,

        /// Votes per chunk
        #[arg(long, default_value = "4")]
        chunk_size: u64,

        /// Number of control-component nodes
        #[arg(short = 'n', long, default_value = "4")]
        nodes: u32,

        /// One-based id of a mix node that fails its first attempt
        #[arg(long)]
        flaky_node: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run { simulate_nodes } => run(simulate_nodes).await,
        Commands::E2e {
            votes,
            chunk_size,
            nodes,
            flaky_node,
        } => {
            demo::run(demo::DemoOptions {
                votes,
                chunk_size,
                nodes,
                flaky_node,
            })
            .await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// The coordinators of one orchestrator process, wired to a shared transport
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub fabric: Arc<dyn MessagingFabric>,
    pub mixing: Arc<MixingCoordinator>,
    pub mix_dec_keys: KeyGenerationCoordinator,
    pub choice_codes_keys: KeyGenerationCoordinator,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        fabric: Arc<dyn MessagingFabric>,
        votes: Arc<dyn VoteSource>,
    ) -> Self {
        let mixing = Arc::new(MixingCoordinator::new(
            config.mixing.clone(),
            Arc::new(MemChunkStatusStore::new()),
            Arc::new(MemNodeOutputStore::new()),
            votes,
            fabric.clone(),
        ));
        let mix_dec_keys = KeyGenerationCoordinator::new(
            KeyFamily::MixDec,
            config.mix_dec_keys.clone(),
            fabric.clone(),
        );
        let choice_codes_keys = KeyGenerationCoordinator::new(
            KeyFamily::ChoiceCodes,
            config.choice_codes_keys.clone(),
            fabric.clone(),
        );

        Orchestrator {
            config,
            fabric,
            mixing,
            mix_dec_keys,
            choice_codes_keys,
        }
    }

    /// Attach simulated nodes for every pipeline stage and key family
    pub async fn simulate_nodes(&self) -> Result<Vec<Arc<simulator::SimulatedMixNode>>> {
        let mix_nodes = spawn_mix_nodes(&self.fabric, &self.config.mixing).await?;
        spawn_key_nodes(&self.fabric, &self.config.mix_dec_keys).await?;
        spawn_key_nodes(&self.fabric, &self.config.choice_codes_keys).await?;
        Ok(mix_nodes)
    }

    /// Start every coordinator. If one fails, those already started are stopped again.
    pub async fn start(&self) -> Result<()> {
        self.mixing.start().await.context("starting mixing")?;

        if let Err(e) = self.mix_dec_keys.start().await {
            self.stop_after_failed_start(false).await;
            return Err(e).context("starting mixing key generation");
        }
        if let Err(e) = self.choice_codes_keys.start().await {
            self.stop_after_failed_start(true).await;
            return Err(e).context("starting choice codes key generation");
        }
        Ok(())
    }

    async fn stop_after_failed_start(&self, mix_dec_keys_started: bool) {
        if mix_dec_keys_started {
            if let Err(e) = self.mix_dec_keys.stop().await {
                warn!(error = %e, "failed to stop mixing key generation");
            }
        }
        if let Err(e) = self.mixing.stop().await {
            warn!(error = %e, "failed to stop mixing");
        }
    }

    pub async fn stop(&self) -> Result<()> {
        self.mixing.stop().await?;
        self.mix_dec_keys.stop().await?;
        self.choice_codes_keys.stop().await?;
        Ok(())
    }
}

async fn run(simulate_nodes: bool) -> Result<()> {
    let config = OrchestratorConfig::from_env().context("reading configuration")?;
    info!(
        nodes = config.mixing.node_count,
        template = config.mixing.request_queue_template.pattern(),
        "configuration loaded"
    );

    warn!("using the in-process transport, only local nodes can be reached");
    let fabric: Arc<dyn MessagingFabric> = Arc::new(InMemoryFabric::new());
    let orchestrator = Orchestrator::new(config, fabric, Arc::new(MemVoteSource::new()));

    if simulate_nodes {
        let nodes = orchestrator.simulate_nodes().await?;
        info!(mix_nodes = nodes.len(), "simulated nodes attached");
    }

    orchestrator.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutting down");
    orchestrator.stop().await
}
