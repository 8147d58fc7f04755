mod channel;
mod cli;
mod error;
mod progress;
mod protocol;
mod session;
mod shm;
mod transfer;
mod wait;

use anyhow::{Context, Result};
use channel::Channel;
use cli::{Cli, Commands};
use error::{exit, exit_code_of, TransferError};
use indicatif::ProgressBar;
use serde::Serialize;
use session::{Receiver, Sender, TransferStats};
use shm::{Mapping, Segment, Teardown};
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use transfer::{FileChunker, FileWriter};
use wait::{CancelToken, Poller};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse_args() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version land here too.
            let code = if err.use_stderr() { exit::USAGE } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };
    init_tracing(cli.verbose);

    let (interrupt, cancel) = CancelToken::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted");
            interrupt.cancel();
        }
    });

    let result = match &cli.command {
        Commands::Send { path } => send_file(&cli, path, cancel).await,
        Commands::Receive { key_path, output } => {
            receive_file(&cli, key_path, output.as_deref(), cancel).await
        }
        Commands::Status { key_path } => show_status(&cli, key_path),
        Commands::Remove { key_path } => remove_channel(&cli, key_path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_of(&err);
            tracing::debug!(code, "exiting with error");
            eprintln!("Error: {err:#}");
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(io::stderr)
        .init();
}

/// Create (or join) the channel named by `key_path` and map it.
fn open_channel(cli: &Cli, key_path: &Path) -> Result<(Segment, Mapping)> {
    let key = shm::derive_key(key_path, cli.proj_id)?;
    let segment = Segment::create(key, cli.size)?;
    tracing::info!(key, created = segment.created(), "channel ready");
    if segment.size() != cli.size {
        tracing::warn!(
            requested = cli.size,
            actual = segment.size(),
            "channel already exists, using its size"
        );
    }
    let mapping = segment.attach()?;
    segment.reset_if_alone(&mapping)?;
    Ok((segment, mapping))
}

/// Undo `open_channel` for a receiver that cannot start. The segment is
/// only removed if this process created it.
fn release_channel(segment: Segment, mapping: Mapping) {
    if let Err(err) = mapping.detach() {
        tracing::warn!(error = %err, "detach of unused channel");
    }
    if segment.created() {
        if let Err(err) = segment.destroy() {
            tracing::warn!(error = %err, "remove of unused channel");
        }
    }
}

async fn send_file(cli: &Cli, path: &Path, cancel: CancelToken) -> Result<()> {
    let mut source = FileChunker::open(path).map_err(|source| TransferError::Source {
        path: path.to_path_buf(),
        source,
    })?;
    let (segment, mapping) = open_channel(cli, path)?;

    println!("⚡ shmcp - Send File");
    println!("═══════════════════════════════════════");
    println!("IPC key: {}", segment.key());
    println!("Channel: {} bytes, {} per chunk", segment.size(), segment.size().saturating_sub(2));
    println!("Waiting for a receiver...");

    let poller = cli.poller(cancel);
    let bar = progress::transfer_bar("sending", source.total_size(), cli.no_progress)?;
    let outcome = match Sender::new(&mapping, &poller) {
        Ok(mut sender) => {
            sender
                .run(&mut source, |chunk| bar.inc(chunk.len() as u64))
                .await
        }
        Err(e) => Err(e.into()),
    };
    bar.finish_and_clear();

    let stats = match outcome {
        Ok(stats) => stats,
        Err(err) => {
            abandon_channel(segment, mapping);
            return Err(err).context("transfer failed");
        }
    };

    mapping.detach().context("transfer complete, cleanup failed")?;
    segment.destroy().context("transfer complete, cleanup failed")?;

    report(cli, &stats, false)
}

/// Best-effort cleanup after a failed send.
fn abandon_channel(segment: Segment, mapping: Mapping) {
    let key = segment.key();
    match segment.abandon(mapping) {
        Ok(Teardown::Removed) => {}
        Ok(Teardown::LeftInPlace) => eprintln!(
            "Receiver still attached; channel {key} left in place (run `shmcp remove` to delete it)"
        ),
        Err(err) => tracing::warn!(error = %err, "cleanup after failed transfer"),
    }
}

async fn receive_file(
    cli: &Cli,
    key_path: &Path,
    output: Option<&Path>,
    cancel: CancelToken,
) -> Result<()> {
    let poller = cli.poller(cancel);
    let bar = progress::transfer_bar("receiving", None, cli.no_progress)?;

    let stats = match output {
        Some(path) => {
            let destination = |source| TransferError::Destination {
                path: path.to_path_buf(),
                source,
            };
            let (segment, mapping) = open_channel(cli, key_path)?;
            let mut sink = match FileWriter::create(path) {
                Ok(sink) => sink,
                Err(source) => {
                    release_channel(segment, mapping);
                    return Err(destination(source).into());
                }
            };
            announce_waiting(&segment);
            let stats = receive_into(mapping, &poller, &mut sink, &bar).await?;
            let written = sink.bytes_written();
            sink.finalize().map_err(destination)?;
            eprintln!("File saved to: {} ({written} bytes)", path.display());
            stats
        }
        None => {
            let mut sink = FileWriter::new(io::stdout());
            let (segment, mapping) = open_channel(cli, key_path)?;
            announce_waiting(&segment);
            let stats = receive_into(mapping, &poller, &mut sink, &bar).await?;
            sink.into_inner().map_err(TransferError::Io)?;
            stats
        }
    };

    // Stdout may be carrying the file, so the summary goes to stderr then.
    report(cli, &stats, output.is_none())
}

fn announce_waiting(segment: &Segment) {
    eprintln!("⚡ shmcp - Receive File");
    eprintln!("═══════════════════════════════════════");
    eprintln!("IPC key: {}", segment.key());
    eprintln!("Waiting for the sender...");
}

/// Run the receiving half, then detach. The segment itself belongs to the
/// sender, which removes it once we have departed.
async fn receive_into<W: Write>(
    mapping: Mapping,
    poller: &Poller,
    sink: &mut FileWriter<W>,
    bar: &ProgressBar,
) -> Result<TransferStats> {
    let outcome = match Receiver::new(&mapping, poller) {
        Ok(mut receiver) => {
            let outcome = receiver
                .run(sink, |chunk| bar.inc(chunk.len() as u64))
                .await;
            if outcome.is_err() {
                receiver.abandon();
            }
            outcome
        }
        Err(e) => Err(e.into()),
    };
    bar.finish_and_clear();

    match outcome {
        Ok(stats) => {
            mapping.detach().context("transfer complete, cleanup failed")?;
            Ok(stats)
        }
        Err(err) => {
            if let Err(detach) = mapping.detach() {
                tracing::warn!(error = %detach, "detach after failed transfer");
            }
            Err(err).context("transfer failed")
        }
    }
}

fn report(cli: &Cli, stats: &TransferStats, use_stderr: bool) -> Result<()> {
    let line = if cli.json {
        serde_json::to_string(stats)?
    } else {
        format!("✓ Transfer complete: {}", progress::summary_line(stats))
    };
    if use_stderr {
        eprintln!("{line}");
    } else {
        println!("{line}");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ChannelStatus {
    key: shm::Key,
    size: usize,
    attached: u64,
    flags: u8,
    signals: Vec<&'static str>,
}

fn show_status(cli: &Cli, key_path: &Path) -> Result<()> {
    let key = shm::derive_key(key_path, cli.proj_id)?;
    let segment = Segment::open(key)?;
    let info = segment.stat()?;
    let mapping = segment.attach()?;
    let flags = mapping.flags();
    mapping.detach()?;

    let status = ChannelStatus {
        key,
        size: info.size,
        attached: info.attached,
        flags: flags.bits(),
        signals: flags.names(),
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("IPC key:  {}", status.key);
        println!("Size:     {} bytes", status.size);
        println!("Attached: {}", status.attached);
        println!("Flags:    {flags}");
    }
    Ok(())
}

fn remove_channel(cli: &Cli, key_path: &Path) -> Result<()> {
    let key = shm::derive_key(key_path, cli.proj_id)?;
    let segment = Segment::open(key)?;
    let info = segment.stat()?;
    if info.attached > 0 {
        tracing::warn!(attached = info.attached, "removing a channel that is still attached");
    }
    segment.destroy()?;
    println!("✓ Removed channel {key}");
    Ok(())
}
