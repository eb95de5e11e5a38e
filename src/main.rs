use anyhow::{bail, Context};
use butler::bootstrap::{vm_names, EnvTokenSource, ProgressTracker, Provisioner};
use butler::exec::Toolbox;
use butler::provider::build_provider;
use butler::server::{create_metrics, run_status_server};
use butler::{BootstrapConfig, BootstrapError, BootstrapService, ConfigError, StepError};
use clap::{Args, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code for configuration errors
const EXIT_CONFIG: u8 = 2;
/// Exit code after an operator abort (128 + SIGINT)
const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "butler", version, about = "Bootstrap a Kubernetes management cluster")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision VMs and bootstrap the management cluster
    Bootstrap(BootstrapArgs),
    /// Load and validate the configuration, then exit
    Validate(ConfigArgs),
    /// Print the VM names the configuration derives
    Names(ConfigArgs),
    /// Delete every VM the configuration derives
    Destroy(DestroyArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Path to the bootstrap configuration file
    #[arg(short, long, env = "BUTLER_CONFIG", default_value = "butler.yaml")]
    pub config: PathBuf,
}

#[derive(Debug, Args)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Serve /healthz, /readyz, /status and /metrics on this port
    #[arg(long)]
    pub status_port: Option<u16>,

    /// Apply OS configs over the authenticated channel instead of maintenance mode
    #[arg(long)]
    pub secure: bool,

    /// Never prompt for the repository token
    #[arg(long)]
    pub non_interactive: bool,
}

#[derive(Debug, Args)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Confirm deletion
    #[arg(long)]
    pub yes: bool,
}

/// Map a failed run to the process exit code
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<BootstrapError>() {
        return match err {
            BootstrapError::Config(_) => EXIT_CONFIG,
            _ if err.is_cancelled() => EXIT_CANCELLED,
            _ => 1,
        };
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    if let Some(StepError::Cancelled) = err.downcast_ref::<StepError>() {
        return EXIT_CANCELLED;
    }
    1
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            trigger.cancel();
        }
    });
    cancel
}

async fn bootstrap(args: BootstrapArgs) -> anyhow::Result<()> {
    let config = BootstrapConfig::load(&args.config.config)?;
    let spec = config.management_cluster;
    let provider = build_provider(&spec)?;
    let tools = Toolbox::system(spec.timings.tool_timeout());
    let interactive = !args.non_interactive && std::io::stdin().is_terminal();
    let tokens = Arc::new(EnvTokenSource::new(interactive));

    let mut progress = ProgressTracker::new(&spec.name);
    if let Some(port) = args.status_port {
        let metrics = create_metrics().context("failed to create metrics registry")?;
        progress = progress.with_metrics(metrics);
        let server_progress = progress.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(port, server_progress).await {
                warn!(error = %e, "Status server failed");
            }
        });
        info!(port, "Status server task spawned");
    }

    let service = BootstrapService::new(spec, provider, tools, tokens)
        .with_progress(progress)
        .insecure(!args.secure);

    let cancel = cancel_on_ctrl_c();
    let summary = service.provision_management_cluster(&cancel).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn validate(args: ConfigArgs) -> anyhow::Result<()> {
    let config = BootstrapConfig::load(&args.config)?;
    let spec = &config.management_cluster;
    build_provider(spec)?;
    info!(cluster = %spec.name, vms = vm_names(spec).len(), "Configuration is valid");
    Ok(())
}

fn names(args: ConfigArgs) -> anyhow::Result<()> {
    let config = BootstrapConfig::load(&args.config)?;
    for name in vm_names(&config.management_cluster) {
        println!("{}", name);
    }
    Ok(())
}

async fn destroy(args: DestroyArgs) -> anyhow::Result<()> {
    if !args.yes {
        bail!("refusing to delete VMs without --yes");
    }

    let config = BootstrapConfig::load(&args.config.config)?;
    let spec = config.management_cluster;
    let provider = build_provider(&spec)?;

    let cancel = cancel_on_ctrl_c();
    let removed = Provisioner::new(provider)
        .destroy_vms(&cancel, &spec)
        .await
        .context("failed to delete VMs")?;
    info!(cluster = %spec.name, deleted = removed.len(), "VM cleanup finished");
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Bootstrap(args) => bootstrap(args).await,
        Command::Validate(args) => validate(args),
        Command::Names(args) => names(args),
        Command::Destroy(args) => destroy(args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Butler failed");
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
