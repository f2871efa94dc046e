// radiolink Linux host: one node on the emulated air (UDP multicast), files stored on disk.

mod air;
mod config;
mod storage;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use radiolink_core::wire::FILE_OVERHEAD;
use radiolink_core::{
    integrity, MacAddr, Node, Opcode, Progress, ScanTarget, System, SystemClock, TransferReport,
    MAX_FRAME_LEN,
};
use tokio::task::JoinError;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::storage::DirStorage;

/// Exit status after a reboot request; the service manager restarts us.
const REBOOT_EXIT_CODE: i32 = 75;

type HostNode = Node<air::UdpRadio, DirStorage, HostSystem, SystemClock>;

#[derive(Parser, Debug)]
#[command(name = "radiolink-linux")]
#[command(about = "Peer-to-peer radio link node on the emulated air", long_about = None)]
#[command(version)]
struct Cli {
    /// Defaults to `listen`
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Serve the radio: answer discovery, receive files
    Listen,
    /// Find a peer by channel scan, then serve
    Scan,
    /// Send an application payload
    Send {
        peer: MacAddr,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Transfer a file
    SendFile { peer: MacAddr, path: PathBuf },
    /// Reset and stop the peer, then transfer a file
    SyncFile { peer: MacAddr, path: PathBuf },
    /// Reboot the peer and wait for it to come back
    Reset { peer: MacAddr },
    /// Stop the peer's application
    Stop { peer: MacAddr },
    /// Move the peer to another channel
    Channel { peer: MacAddr, channel: u8 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Listen);

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg, command));
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cfg: Config, command: Command) -> Result<()> {
    let local = cfg.mac.unwrap_or_else(random_mac);
    let (radio, link) = air::open(local, cfg.port, cfg.channel).context("joining emulated air")?;
    let (node, inbox) = Node::new(
        radio,
        DirStorage::new(&cfg.storage_dir),
        HostSystem,
        SystemClock,
        cfg.link_config(),
    );
    let air::AirTasks {
        send: air_send,
        recv: mut air_recv,
    } = link.spawn(inbox);
    tracing::info!(%local, port = cfg.port, channel = cfg.channel, "node up");

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    // The node, and with it the radio's queue, is dropped when the thread returns.
    let mut worker = tokio::task::spawn_blocking(move || {
        let mut node = node;
        execute(&mut node, &cfg, command, &worker_stop)
    });

    let finished = tokio::select! {
        res = &mut worker => Some(res.context("node thread panicked")?),
        res = &mut air_recv => air_failed(res),
        res = shutdown_signal() => {
            res?;
            None
        }
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            tracing::info!("shutting down");
            stop.store(true, Ordering::Relaxed);
            match tokio::time::timeout(Duration::from_secs(1), worker).await {
                Ok(joined) => joined.context("node thread panicked")?,
                Err(_) => Ok(()),
            }
        }
    };

    if tokio::time::timeout(Duration::from_secs(1), air_send).await.is_err() {
        tracing::warn!("queued frames not flushed before exit");
    }
    air_recv.abort();
    outcome
}

/// The receive side of the air stopped: exit for the supervisor to restart us.
fn air_failed(res: Result<std::io::Result<()>, JoinError>) -> ! {
    match res {
        Ok(Ok(())) => tracing::error!(code = REBOOT_EXIT_CODE, "emulated air closed, exiting"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, code = REBOOT_EXIT_CODE, "emulated air failed, exiting")
        }
        Err(e) => tracing::error!(error = %e, code = REBOOT_EXIT_CODE, "air task panicked, exiting"),
    }
    std::process::exit(REBOOT_EXIT_CODE);
}

fn execute(node: &mut HostNode, cfg: &Config, command: Command, stop: &AtomicBool) -> Result<()> {
    node.on_deliver(|from, payload| {
        println!("{from}: {}", String::from_utf8_lossy(payload));
    });
    let serve = |node: &mut HostNode| node.serve_until(|| stop.load(Ordering::Relaxed));

    match command {
        Command::Listen => serve(node)?,
        Command::Scan => {
            let target = cfg.hub.map_or(ScanTarget::Any, ScanTarget::Hub);
            let peer = node.join_scanning(cfg.retry, target)?;
            println!("joined {} on channel {}", peer.address, peer.channel);
            serve(node)?;
        }
        Command::Send { peer, text } => {
            node.join(peer, cfg.channel)?;
            node.send_payload(peer, text.join(" ").as_bytes())?;
        }
        Command::SendFile { peer, path } => {
            node.join(peer, cfg.channel)?;
            let (name, data, chunk_size) = read_upload(&path, cfg.chunk_size)?;
            let report = node.send_file_with_progress(peer, &name, data, chunk_size, log_progress)?;
            print_report(&report);
        }
        Command::SyncFile { peer, path } => {
            node.join(peer, cfg.channel)?;
            let (name, data, chunk_size) = read_upload(&path, cfg.chunk_size)?;
            node.enter_command_mode(peer)?;
            let report = node.send_file_with_progress(peer, &name, data, chunk_size, log_progress)?;
            print_report(&report);
        }
        Command::Reset { peer } => {
            node.join(peer, cfg.channel)?;
            node.send_command(peer, Opcode::Reset)?;
            println!("{peer} rebooted");
        }
        Command::Stop { peer } => {
            node.join(peer, cfg.channel)?;
            node.send_command(peer, Opcode::Stop)?;
            println!("{peer} stopped");
        }
        Command::Channel { peer, channel } => {
            node.join(peer, cfg.channel)?;
            node.send_channel(peer, channel)?;
        }
    }
    for event in node.take_events() {
        tracing::debug!(?event, "link event");
    }
    Ok(())
}

/// Read a file to upload and fit the chunk size to its name.
fn read_upload(path: &Path, chunk_size: u8) -> Result<(String, Vec<u8>, u8)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let room = MAX_FRAME_LEN.saturating_sub(FILE_OVERHEAD + name.len());
    let fitted = u8::try_from(room.min(usize::from(chunk_size))).unwrap_or(chunk_size);
    if fitted == 0 {
        bail!("file name {name:?} leaves no room for data in a frame");
    }
    if fitted < chunk_size {
        tracing::debug!(requested = chunk_size, fitted, "chunk size reduced to fit frame");
    }
    Ok((name, data, fitted))
}

fn log_progress(p: Progress) {
    tracing::info!(acked = p.acked, total = p.total, "transfer progress");
}

fn print_report(report: &TransferReport) {
    println!(
        "sent {} ({} bytes, {} chunks) to {}, sha256 {}",
        report.filename,
        report.total_length,
        report.chunks,
        report.peer,
        integrity::digest_hex(&report.digest)
    );
}

/// Locally administered unicast address.
fn random_mac() -> MacAddr {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    MacAddr::new(bytes)
}

struct HostSystem;

impl System for HostSystem {
    fn reboot(&mut self) {
        tracing::warn!(code = REBOOT_EXIT_CODE, "reboot requested, exiting");
        std::process::exit(REBOOT_EXIT_CODE);
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
