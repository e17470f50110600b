//! Command-line interface and component wiring.

use std::{io::BufRead, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use scribe_api::{
    AuthClient, RemoteClient, RestClient, TokenStore, UrlRewriter,
};
use scribe_render::{
    ocr::{OcrEngine, PdftoppmRasterizer, VisionModelBackend},
    page::{BlankStrokeRenderer, PageRenderer},
};
use scribe_sync::{
    daemon::{Daemon, DaemonConfig, SyncRunner},
    Orchestrator, SyncSettings,
};
use scribe_tokio::{NamedTask, ShutdownChannel};
use tracing::{info, warn};

use crate::config::{parse_labels, Config};

/// Sync tablet notebooks to searchable PDFs.
#[derive(Debug, FromArgs)]
pub struct Args {
    #[argh(subcommand)]
    cmd: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Auth(AuthCommand),
    Sync(SyncCommand),
    Daemon(DaemonCommand),
    Version(VersionCommand),
}

/// Register this install with the cloud (interactive).
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "auth")]
struct AuthCommand {
    #[argh(option)]
    /// path to the config file
    config: Option<PathBuf>,

    #[argh(option, default = "String::from(\"info\")")]
    /// log level: debug, info, warn or error
    log_level: String,
}

/// Run one sync and exit.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "sync")]
struct SyncCommand {
    #[argh(option)]
    /// directory the rendered PDFs are written to
    output: Option<PathBuf>,

    #[argh(option)]
    /// comma-separated tag filter; only matching notebooks are synced
    labels: Option<String>,

    #[argh(switch)]
    /// skip OCR and the searchable text layer
    no_ocr: bool,

    #[argh(switch)]
    /// ignore recorded versions and re-sync everything
    force: bool,

    #[argh(option, default = "String::from(\"info\")")]
    /// log level: debug, info, warn or error
    log_level: String,

    #[argh(option)]
    /// path to the config file
    config: Option<PathBuf>,
}

/// Run the long-lived sync daemon.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "daemon")]
struct DaemonCommand {
    #[argh(option)]
    /// directory the rendered PDFs are written to
    output: Option<PathBuf>,

    #[argh(option)]
    /// comma-separated tag filter; only matching notebooks are synced
    labels: Option<String>,

    #[argh(switch)]
    /// skip OCR and the searchable text layer
    no_ocr: bool,

    #[argh(switch)]
    /// ignore recorded versions and re-sync everything
    force: bool,

    #[argh(option, default = "String::from(\"info\")")]
    /// log level: debug, info, warn or error
    log_level: String,

    #[argh(option)]
    /// path to the config file
    config: Option<PathBuf>,

    #[argh(option)]
    /// sync interval, e.g. "10m" or "1h30m"
    interval: Option<String>,

    #[argh(option)]
    /// bind address of the health/control API, e.g. 127.0.0.1:8787
    health_addr: Option<std::net::SocketAddr>,

    #[argh(option)]
    /// write the daemon pid to this file
    pid_file: Option<PathBuf>,

    #[argh(switch)]
    /// run one sync immediately at startup
    initial_sync: bool,
}

/// Print the version.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

// -- impl Args -- //

impl Args {
    pub fn run(self) -> Result<()> {
        match self.cmd {
            Command::Version(_) => {
                println!("scribe {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
            Command::Auth(cmd) => {
                init_logger(&cmd.log_level)?;
                let config = Config::load(cmd.config.as_deref())?;
                runtime()?.block_on(run_auth(config))
            }
            Command::Sync(cmd) => {
                init_logger(&cmd.log_level)?;
                runtime()?.block_on(run_sync(cmd))
            }
            Command::Daemon(cmd) => {
                init_logger(&cmd.log_level)?;
                runtime()?.block_on(run_daemon(cmd))
            }
        }
    }
}

fn init_logger(level: &str) -> Result<()> {
    let level = level
        .parse::<tracing::Level>()
        .with_context(|| format!("unknown log level {level:?}"))?;
    scribe_logger::init(level);
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

/// Everything a run needs, wired from config.
struct Components {
    auth: Arc<AuthClient>,
    orchestrator: Arc<Orchestrator>,
}

fn build_auth(config: &Config) -> Result<(Arc<AuthClient>, RestClient)> {
    let rewriter = UrlRewriter::new(
        config.rewrite_host_from.clone(),
        config.rewrite_host_to.clone(),
    )?;
    let user_agent = format!("scribe/{}", env!("CARGO_PKG_VERSION"));
    let rest = RestClient::new(&user_agent, Some(rewriter));
    let store = TokenStore::new(&config.token_path);
    let auth_base = config
        .auth_base
        .parse::<reqwest::Url>()
        .with_context(|| format!("bad auth-base {:?}", config.auth_base))?;
    let auth = Arc::new(AuthClient::new(store, rest.clone(), auth_base));
    Ok((auth, rest))
}

fn build_components(
    config: &Config,
    no_ocr: bool,
    force: bool,
) -> Result<Components> {
    let (auth, rest) = build_auth(config)?;
    let storage_base = config
        .storage_base
        .parse::<reqwest::Url>()
        .with_context(|| {
            format!("bad storage-base {:?}", config.storage_base)
        })?;
    let remote =
        RemoteClient::new(Arc::clone(&auth), rest.clone(), storage_base);

    let ocr = if config.ocr.enabled && !no_ocr {
        let backend = VisionModelBackend::from_env(
            rest,
            config.ocr.base_url.clone(),
            config.ocr.model.clone(),
        )?;
        Some(OcrEngine::new(
            Arc::new(PdftoppmRasterizer),
            Arc::new(backend),
        ))
    } else {
        None
    };

    let settings = SyncSettings {
        output_dir: config.output_dir.clone(),
        state_path: config.state_path.clone(),
        labels: config.labels.clone(),
        force,
    };
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&auth),
        remote,
        PageRenderer::new(Arc::new(BlankStrokeRenderer)),
        ocr,
        settings,
    ));
    Ok(Components { auth, orchestrator })
}

async fn run_auth(config: Config) -> Result<()> {
    let (auth, _rest) = build_auth(&config)?;
    if auth.is_authenticated() {
        println!("Already registered; nothing to do.");
        return Ok(());
    }

    println!("Pair this install with your tablet account:");
    println!("  1. Open the vendor's device pairing page in a browser.");
    println!("  2. Request a one-time code for a desktop app.");
    println!("  3. Enter the 8-character code below.");
    print!("Code: ");
    use std::io::Write;
    std::io::stdout().flush().ok();

    let mut code = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut code)
        .context("reading one-time code from stdin")?;

    auth.register(code.trim()).await?;
    auth.ensure_valid_token().await?;
    println!("Registered. Credentials stored in {}.", config.token_path.display());
    Ok(())
}

async fn run_sync(cmd: SyncCommand) -> Result<()> {
    let mut config = Config::load(cmd.config.as_deref())?;
    if let Some(output) = cmd.output {
        config.output_dir = output;
    }
    if let Some(labels) = &cmd.labels {
        config.labels = parse_labels(labels);
    }
    let components = build_components(&config, cmd.no_ocr, cmd.force)?;

    // Ctrl-C cancels cooperatively; the run finalizes and reports.
    let cancel = ShutdownChannel::new();
    spawn_signal_listener(cancel.clone()).detach();

    let outcome = components.orchestrator.sync(cancel).await?;
    if outcome.cancelled {
        warn!("Sync cancelled before completion");
    }
    if outcome.failure_count > 0 {
        bail!(
            "{} of {} documents failed to sync",
            outcome.failure_count,
            outcome.total_documents
        );
    }
    info!(
        success = outcome.success_count,
        skipped = outcome.skipped_count,
        "Sync complete"
    );
    Ok(())
}

async fn run_daemon(cmd: DaemonCommand) -> Result<()> {
    let mut config = Config::load(cmd.config.as_deref())?;
    if let Some(output) = cmd.output {
        config.output_dir = output;
    }
    if let Some(labels) = &cmd.labels {
        config.labels = parse_labels(labels);
    }
    if let Some(interval) = &cmd.interval {
        config.interval = humantime::parse_duration(interval)
            .with_context(|| format!("bad --interval {interval:?}"))?;
    }
    if let Some(addr) = cmd.health_addr {
        config.health_addr = Some(addr);
    }

    let components = build_components(&config, cmd.no_ocr, cmd.force)?;
    if !components.auth.is_authenticated() {
        bail!("not registered; run `scribe auth` first");
    }

    let pid_file = cmd.pid_file;
    if let Some(path) = &pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| {
                format!("writing pid file {}", path.display())
            })?;
    }

    let daemon = Daemon::new(
        components.orchestrator as Arc<dyn SyncRunner>,
        DaemonConfig {
            interval: config.interval,
            health_addr: config.health_addr,
            initial_sync: cmd.initial_sync,
        },
    );

    let shutdown = ShutdownChannel::new();
    spawn_signal_listener(shutdown.clone()).detach();

    let result = daemon.run(shutdown).await;

    if let Some(path) = &pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove pid file: {e:#}");
        }
    }
    result
}

/// SIGINT/SIGTERM both fire the shutdown signal.
fn spawn_signal_listener(shutdown: ShutdownChannel) -> NamedTask<()> {
    NamedTask::spawn("signal-listener", async move {
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e:#}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        shutdown.send();
    })
}
