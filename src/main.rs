use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use basalt::config::ClusterConfig;
use basalt::hcloud::{HcloudManager, HetznerCloudClient};
use basalt::pipeline::{Context, Pipeline};
use basalt::talos::{GrpcTalos, TalosctlProducer};

#[derive(Parser)]
#[command(name = "basalt")]
#[command(about = "Provision Talos Linux Kubernetes clusters on Hetzner Cloud", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "cluster.yaml")]
    config: PathBuf,

    /// Hetzner Cloud API token (falls back to HCLOUD_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Test isolation ID, stamped onto every created resource
    #[arg(long)]
    test_id: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the cluster towards the configuration
    Apply,

    /// Remove every resource belonging to the cluster
    Destroy,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("basalt={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Apply => apply(&cli).await,
        Commands::Destroy => destroy(&cli).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn build_context(cli: &Cli) -> Result<Context> {
    let mut config =
        ClusterConfig::from_file(&cli.config).context("Failed to load configuration")?;
    if let Some(token) = &cli.token {
        config.hcloud.token = Some(token.clone());
    }
    if cli.test_id.is_some() {
        config.test_id = cli.test_id.clone();
    }

    let token = config.get_hcloud_token()?;
    let client = HetznerCloudClient::new(token)?;

    // One token for the whole run: phases, polls, and talosctl all stop
    // on the same signal.
    let cancel = CancellationToken::new();
    let producer = Arc::new(
        TalosctlProducer::new(
            config.cluster_name.clone(),
            config.talos.kubernetes_version.clone(),
        )
        .with_cancellation(cancel.clone()),
    );

    let timeouts = basalt::pipeline::Timeouts::default();
    let mut ctx = Context::new(
        config,
        Arc::new(HcloudManager::new(client)),
        producer,
        Arc::new(GrpcTalos::new(timeouts.dial)),
    );
    ctx.cancel = cancel;
    Ok(ctx)
}

async fn apply(cli: &Cli) -> Result<()> {
    TalosctlProducer::check_talosctl_installed()
        .await
        .context("talosctl is required")?;

    let mut ctx = build_context(cli)?;
    info!("Applying cluster: {}", ctx.config.cluster_name);

    Pipeline::provision().run(&mut ctx).await?;

    info!("");
    info!("Cluster details:");
    info!("  Name: {}", ctx.config.cluster_name);
    if let Some(lb) = &ctx.state.load_balancer {
        if let Some(ip) = lb.public_ipv4() {
            info!("  Endpoint: https://{}:6443", ip);
        }
    }
    info!("  Control planes: {}", ctx.state.control_plane_ips.len());
    info!("  Workers: {}", ctx.state.worker_ips.len());

    write_artifact(&cli.config, "talosconfig", &ctx.state.talos_config).await?;
    write_artifact(&cli.config, "kubeconfig", &ctx.state.kubeconfig).await?;

    Ok(())
}

async fn destroy(cli: &Cli) -> Result<()> {
    let mut ctx = build_context(cli)?;
    info!("Destroying cluster: {}", ctx.config.cluster_name);

    Pipeline::destroy().run(&mut ctx).await
}

/// Drop client configs next to the cluster configuration file.
async fn write_artifact(config_path: &std::path::Path, name: &str, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    let path = config_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join(name);
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("  {}: {}", name, path.display());
    Ok(())
}
