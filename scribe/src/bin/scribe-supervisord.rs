//! Operator-side supervisor for the scribe daemon.
//!
//! Runs `scribe daemon` as a child process and keeps it alive: a
//! dedicated wait task reaps the child and fans its death out through a
//! one-shot channel; unexpected deaths restart the daemon after a delay,
//! bounded by a consecutive-attempt limit. An intentional stop sets the
//! `stopping` flag before any signal is sent, so the monitor never races
//! a restart against a shutdown.
//!
//! This split keeps daemon crashes from taking down the always-on
//! control surface.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use nix::{sys::signal, unistd::Pid};
use scribe_tokio::{NamedTask, ShutdownChannel};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Delay before restarting a crashed daemon.
const RESTART_DELAY: Duration = Duration::from_secs(5);
/// Consecutive restart attempts before giving up.
const MAX_RESTART_ATTEMPTS: u32 = 5;
/// A child that stayed up at least this long counts as a successful
/// start; the attempt counter resets.
const HEALTHY_UPTIME: Duration = Duration::from_secs(30);
/// How long a stop waits for graceful exit before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Supervise the scribe sync daemon.
#[derive(Debug, FromArgs)]
struct Options {
    /// path to the scribe binary; defaults to a PATH search, then a
    /// sibling of this executable
    #[argh(option)]
    daemon_bin: Option<PathBuf>,

    /// health/control API address injected into the daemon
    #[argh(option, default = "String::from(\"127.0.0.1:8787\")")]
    health_addr: String,

    /// config file passed through to the daemon
    #[argh(option)]
    config: Option<PathBuf>,

    /// sync interval passed through to the daemon, e.g. "10m"
    #[argh(option)]
    interval: Option<String>,
}

fn main() -> Result<()> {
    scribe_logger::init(tracing::Level::INFO);
    let opts = argh::from_env::<Options>();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(supervise(opts))
}

/// Find the daemon binary: explicit flag, then PATH, then next to this
/// executable.
fn locate_daemon_bin(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path);
        }
        bail!("daemon binary {} does not exist", path.display());
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join("scribe");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    let sibling = std::env::current_exe()
        .context("resolving supervisor executable path")?
        .with_file_name("scribe");
    if sibling.is_file() {
        return Ok(sibling);
    }
    bail!("could not locate the scribe binary on PATH or next to the supervisor")
}

enum KillCmd {
    Term,
    Kill,
}

/// One running child: its pid, the death signal, and the kill channel
/// owned by the wait task.
struct RunningChild {
    pid: Option<u32>,
    died: ShutdownChannel,
    kill_tx: mpsc::Sender<KillCmd>,
    wait_task: NamedTask<()>,
}

fn spawn_daemon(opts: &Options, bin: &PathBuf) -> Result<RunningChild> {
    let mut command = tokio::process::Command::new(bin);
    command
        .arg("daemon")
        .args(["--health-addr", &opts.health_addr])
        .stdin(Stdio::null());
    if let Some(config) = &opts.config {
        command.arg("--config").arg(config);
    }
    if let Some(interval) = &opts.interval {
        command.args(["--interval", interval]);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {}", bin.display()))?;
    let pid = child.id();
    info!(?pid, "Daemon started");

    let died = ShutdownChannel::new();
    let (kill_tx, mut kill_rx) = mpsc::channel::<KillCmd>(2);

    // The wait task owns the child. Nothing else touches the handle; kill
    // requests arrive over the channel.
    let wait_task = NamedTask::spawn("daemon-wait", {
        let died = died.clone();
        async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) =>
                                info!("Daemon exited with {status}"),
                            Err(e) =>
                                warn!("Failed waiting on daemon: {e:#}"),
                        }
                        died.send();
                        return;
                    }
                    Some(cmd) = kill_rx.recv() => match cmd {
                        KillCmd::Term => {
                            if let Some(pid) = pid {
                                let _ = signal::kill(
                                    Pid::from_raw(pid as i32),
                                    signal::Signal::SIGTERM,
                                );
                            }
                        }
                        KillCmd::Kill => {
                            let _ = child.start_kill();
                        }
                    },
                }
            }
        }
    });

    Ok(RunningChild {
        pid,
        died,
        kill_tx,
        wait_task,
    })
}

async fn supervise(opts: Options) -> Result<()> {
    let bin = locate_daemon_bin(opts.daemon_bin.clone())?;
    info!("Supervising {}", bin.display());

    // Must be set before any stop signal reaches the child, so the
    // monitor below never mistakes an intentional stop for a crash.
    let stopping = Arc::new(AtomicBool::new(false));
    let stop = ShutdownChannel::new();
    {
        let stopping = Arc::clone(&stopping);
        let stop = stop.clone();
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
            stopping.store(true, Ordering::SeqCst);
            stop.send();
        })
        .detach();
    }

    let mut attempts = 0u32;
    loop {
        // A stop that arrived during the restart delay ends the loop
        // before another child is spawned.
        if stop.try_recv() {
            break;
        }
        let started = Instant::now();
        let child = spawn_daemon(&opts, &bin)?;
        let mut died = child.died.clone();
        let mut stop_rx = stop.clone();

        tokio::select! {
            () = died.recv() => {
                if stopping.load(Ordering::SeqCst) {
                    child.wait_task.await.ok();
                    break;
                }
                if started.elapsed() >= HEALTHY_UPTIME {
                    attempts = 0;
                }
                attempts += 1;
                if attempts > MAX_RESTART_ATTEMPTS {
                    error!(
                        "Daemon died {attempts} times in a row; giving up"
                    );
                    child.wait_task.await.ok();
                    bail!("daemon keeps crashing");
                }
                warn!(
                    attempt = attempts,
                    "Daemon died unexpectedly; restarting in {}",
                    humantime::format_duration(RESTART_DELAY)
                );
                child.wait_task.await.ok();
                tokio::time::sleep(RESTART_DELAY).await;
            }
            () = stop_rx.recv() => {
                stop_child(child).await;
                break;
            }
        }
    }

    info!("Supervisor stopped");
    Ok(())
}

/// Graceful stop: SIGTERM, wait up to [`STOP_GRACE`], then SIGKILL.
async fn stop_child(child: RunningChild) {
    info!(pid = ?child.pid, "Stopping daemon");
    let _ = child.kill_tx.send(KillCmd::Term).await;

    let mut died = child.died.clone();
    if tokio::time::timeout(STOP_GRACE, died.recv()).await.is_err() {
        warn!("Daemon ignored SIGTERM; killing");
        let _ = child.kill_tx.send(KillCmd::Kill).await;
        let mut died = child.died.clone();
        died.recv().await;
    }
    child.wait_task.await.ok();
}
