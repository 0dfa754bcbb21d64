//! Miner entry point for the CESS storage network.
//!
//! The miner certifies idle space through TEE-verified accumulator proofs,
//! tags the user fragments it stores, and answers the chain's periodic idle
//! and service challenges.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::short_hex;
use miner::chain::{ChainClient, HttpChainClient};
use miner::config::MinerConfig;
use miner::context::MinerContext;
use miner::helpers::load_keypair;
use miner::registry::TeeRegistry;
use miner::state::ProofRecordStore;
use miner::supervisor::Supervisor;
use miner::tee::HttpTeeClient;
use miner::workspace::Workspace;
use pois::{AccKey, LocalProver};
use podr2::RsaKey;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "MINER_CONFIG")]
    config: Option<String>,

    /// Override the workspace directory
    #[arg(long, env = "MINER_DATA_DIR")]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = MinerConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }

    let ctx = Arc::new(build_context(config).await?);
    info!(
        account = %short_hex(&ctx.account()),
        front = ctx.prover.front(),
        rear = ctx.prover.rear(),
        tees = ctx.registry.len(),
        "Miner started"
    );

    let supervisor = Supervisor::with_protocols(ctx);
    tokio::select! {
        res = supervisor.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    }
}

async fn build_context(config: MinerConfig) -> Result<MinerContext> {
    let workspace = Workspace::create(Path::new(&config.node.data_dir))
        .with_context(|| format!("cannot create workspace at {}", config.node.data_dir))?;
    let signer = load_keypair(&config.node.keypair_path()).await?;
    let account = signer.verifying_key().to_bytes();

    let chain: Arc<dyn ChainClient> = Arc::new(HttpChainClient::new(
        &config.chain.gateway_url,
        &account,
        config.chain.insecure_tls,
    ));
    let tee = Arc::new(HttpTeeClient::new(
        &config.tee.endpoint_scheme,
        config.chain.insecure_tls,
    ));

    // The chain's key wins once the miner is registered
    let key = match chain.query_space_proof_info().await? {
        Some(info) => AccKey::from_chain(&info.pois_key)?,
        None => {
            warn!("No certified space yet, using the configured accumulator key");
            config.pois.acc_key()?
        }
    };
    let prover = LocalProver::open(&workspace.idle_dir(), &account, key, config.pois.params())
        .context("cannot open the accumulator prover")?;

    let der = chain.query_podr2_public_key().await?;
    let podr2_key = RsaKey::from_pkcs1_der(&der).context("invalid podr2 public key on chain")?;

    let registry = Arc::new(TeeRegistry::new());
    let (upserted, removed) = registry.replace_all(chain.query_tee_workers().await?);
    info!(upserted, removed, "Loaded TEE registry");

    let records = Arc::new(ProofRecordStore::open(&workspace.record_db())?);

    Ok(MinerContext {
        config: Arc::new(config),
        signer,
        chain,
        tee,
        prover: Arc::new(prover),
        podr2_key,
        registry,
        records,
        workspace,
    })
}
