use anyhow::{Context, Result};
use clap::Parser;
use redirect_core::{
    spawn_poller, AutoRedirect, CallbackRegistry, CompanionFirewall, CompanionKind,
    ConfigLoader, ErrorKind, Firewall4, MemoryBackend, NftBackend, NftCli, NoCompanion,
    RedirectError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "auto-redirect")]
#[command(about = "Redirect host traffic into a local transparent proxy with nftables")]
struct Args {
    /// Config file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// TUN interface name, overrides the config file
    #[arg(long, short = 't')]
    tun: Option<String>,

    /// Redirect port, overrides the config file
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Path to the nft binary
    #[arg(long, env = "AUTO_REDIRECT_NFT", default_value = "nft")]
    nft: PathBuf,

    /// Print the nft JSON batches instead of applying them
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = if args.verbose {
        EnvFilter::from_default_env()
            .add_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into())
    } else {
        EnvFilter::from_default_env()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config =
        ConfigLoader::load_or_default(args.config).context("Failed to load configuration")?;
    if let Some(tun) = args.tun {
        config.redirect.tun_name = tun;
    }
    if let Some(port) = args.port {
        config.redirect.redirect_port = port;
    }

    let memory = MemoryBackend::new();
    let backend: Arc<dyn NftBackend> = if args.dry_run {
        Arc::new(memory.clone())
    } else {
        Arc::new(NftCli::with_program(args.nft))
    };

    let companion: Box<dyn CompanionFirewall> = match config.runtime.companion {
        CompanionKind::None => Box::new(NoCompanion),
        CompanionKind::Firewall4 => Box::new(Firewall4::new(&config.redirect.tun_name)),
    };

    let registry = CallbackRegistry::new();
    let redirect = AutoRedirect::builder(config.redirect)
        .map_err(explain)
        .context("Invalid redirect policy")?
        .backend(backend)
        .monitor(registry.clone())
        .companion(companion)
        .build();

    let policy = redirect.policy();
    info!(
        "Redirecting via {} to port {} ({:?} mode)",
        policy.tun_name,
        policy.redirect_port,
        policy.mode()
    );

    redirect
        .start()
        .map_err(explain)
        .context("Failed to install redirect rules")?;

    if args.dry_run {
        for document in memory.committed_documents() {
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        return redirect
            .stop()
            .map_err(explain)
            .context("Failed to remove redirect rules");
    }

    let poller = spawn_poller(
        registry,
        Duration::from_secs(config.runtime.poll_interval_secs.max(1)),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Shutting down");
    poller.abort();

    redirect
        .stop()
        .map_err(explain)
        .context("Failed to remove redirect rules")
}

/// Attach a remediation hint matching the failure class
fn explain(err: RedirectError) -> anyhow::Error {
    let hint = match err.kind() {
        ErrorKind::Policy | ErrorKind::Config => "fix the configuration and retry",
        ErrorKind::Transport => "check that nftables is available and that we run as root",
        ErrorKind::NotInitialized => "the redirect table is missing; restart to reinstall",
        ErrorKind::Companion => "the platform firewall may be inconsistent; reload it",
    };
    anyhow::Error::new(err).context(hint)
}
