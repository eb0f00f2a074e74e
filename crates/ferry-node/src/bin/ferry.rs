//! Ferry CLI - send and receive over the direct TCP transport

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ferry_core::error::TransferError;
use ferry_core::manifest::{Manifest, ManifestOptions};
use ferry_core::{code, Config};
use ferry_node::host::{advertise_loop, search_for_peer, Host};
use ferry_node::tcp::TcpHost;
use ferry_node::{Receiver, Sender};

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Peer-to-peer file transfer with verified, resumable streams"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a file or directory tree
    Send {
        path: PathBuf,
        /// Wrap the stream in gzip
        #[arg(long)]
        compress: bool,
        /// Skip hashing (faster start, length-only resume)
        #[arg(long)]
        skip_hash: bool,
        /// Cache the manifest inside the directory root
        #[arg(long)]
        cache_manifest: bool,
        /// Listen address for inbound receivers
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: SocketAddr,
        /// Use a specific code instead of generating one
        #[arg(long)]
        code: Option<String>,
    },
    /// Receive a transfer
    Receive {
        code: String,
        /// Sender address to dial
        #[arg(long)]
        peer: SocketAddr,
        /// Destination directory (default: current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Trust existing file lengths instead of verifying blocks
        #[arg(long)]
        fast_resume: bool,
        /// Accept the transfer without prompting
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load();

    match cli.command {
        Command::Send {
            path,
            compress,
            skip_hash,
            cache_manifest,
            listen,
            code,
        } => send(config, path, compress, skip_hash, cache_manifest, listen, code).await,
        Command::Receive {
            code,
            peer,
            output,
            fast_resume,
            yes,
        } => receive(config, code, peer, output, fast_resume, yes).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn send(
    config: Config,
    path: PathBuf,
    compress: bool,
    skip_hash: bool,
    cache_manifest: bool,
    listen: SocketAddr,
    code_arg: Option<String>,
) -> ExitCode {
    let transfer_code = match code_arg {
        Some(c) if code::validate(&c) => c,
        Some(c) => {
            error!("invalid code format: {c} (expected NNN-NNN)");
            return ExitCode::FAILURE;
        }
        None => code::generate(),
    };

    let opts = ManifestOptions {
        cache: cache_manifest || config.transfer.cache_manifest,
        skip_hash: skip_hash || config.transfer.skip_hash,
    };

    let on_hash = |p: &str, _size: u64| info!("hashing {p}");
    let sender = match Sender::new(&path, &transfer_code, opts, Some(&on_hash)) {
        Ok(sender) => sender,
        Err(e) => {
            error!("failed to scan {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let sender = Arc::new(
        sender
            .compress(compress || config.transfer.compress)
            .on_start_file(|p, i, t| info!("sending {p} ({i}/{t})")),
    );

    info!(
        "sending {} ({} files, {})",
        sender.manifest().folder_name,
        sender.manifest().files.len(),
        format_bytes(sender.manifest().total_size)
    );

    let host = match TcpHost::listen(listen).await {
        Ok(host) => host,
        Err(e) => {
            error!("failed to listen on {listen}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (done_tx, mut done_rx) = mpsc::channel::<Result<(), TransferError>>(1);
    let busy = Arc::new(Mutex::new(false));
    let finished = Arc::new(Mutex::new(false));

    {
        let sender = sender.clone();
        host.set_stream_handler(Arc::new(move |stream, peer| {
            let sender = sender.clone();
            let done_tx = done_tx.clone();
            let busy = busy.clone();
            let finished = finished.clone();
            Box::pin(async move {
                // One transfer owns this node; reject everyone else.
                if *finished.lock() || std::mem::replace(&mut *busy.lock(), true) {
                    warn!("rejecting concurrent stream from {peer}");
                    return;
                }
                info!("peer connected: {peer}");

                let result = sender.run(stream).await;
                match &result {
                    Err(e) if e.is_retryable() => {
                        warn!("connection interrupted: {e}; waiting for the receiver to reconnect");
                        *busy.lock() = false;
                    }
                    _ => {
                        if result.is_ok() {
                            *finished.lock() = true;
                        }
                        let _ = done_tx.send(result).await;
                    }
                }
            })
        }));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let advertiser = {
        let host = host.clone();
        let transfer_code = transfer_code.clone();
        tokio::spawn(async move {
            advertise_loop(host.as_ref(), &transfer_code, stop_rx).await;
        })
    };

    println!();
    println!("  Code:    {transfer_code}");
    println!("  Address: {}", host.local_addr().expect("listener has an address"));
    println!();
    println!("Share both with the receiver:");
    println!("  ferry receive {transfer_code} --peer <address>");
    println!();

    let result = tokio::select! {
        received = done_rx.recv() => received.unwrap_or(Err(TransferError::Aborted)),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Err(TransferError::Aborted)
        }
    };

    let _ = stop_tx.send(true);
    let _ = advertiser.await;
    host.close().await;

    match result {
        Ok(()) => {
            println!("Transfer complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("transfer failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn receive(
    config: Config,
    transfer_code: String,
    peer: SocketAddr,
    output: Option<PathBuf>,
    fast_resume: bool,
    yes: bool,
) -> ExitCode {
    if !code::validate(&transfer_code) {
        error!("invalid code format: {transfer_code} (expected NNN-NNN)");
        return ExitCode::FAILURE;
    }

    let dest = match output {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("cannot determine working directory: {e}");
                return ExitCode::FAILURE;
            }
        },
    };

    let host = TcpHost::dialer(peer);
    if let Err(e) = host.bootstrap().await {
        error!("bootstrap failed: {e}");
        return ExitCode::FAILURE;
    }

    let mut receiver = Receiver::new(&dest, &transfer_code)
        .fast_resume(fast_resume || config.transfer.fast_resume)
        .on_start_file(|p, i, t| info!("receiving {p} ({i}/{t})"));
    if !yes {
        receiver = receiver.on_confirm(prompt_confirmation);
    }

    let max_retries = config.net.max_retries;
    let mut attempt = 0u32;
    loop {
        let peer_id = match search_for_peer(host.as_ref(), &transfer_code).await {
            Ok(peer_id) => peer_id,
            Err(e) => {
                error!("could not find sender: {e}");
                return ExitCode::FAILURE;
            }
        };
        let stream = match host.new_stream(&peer_id).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("could not open stream: {e}");
                return ExitCode::FAILURE;
            }
        };

        match receiver.run(stream).await {
            Ok(()) => {
                println!("Transfer complete");
                host.close().await;
                return ExitCode::SUCCESS;
            }
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                let delay =
                    Duration::from_secs(config.net.retry_base_delay_secs << (attempt - 1));
                warn!("connection interrupted: {e}; retrying ({attempt}/{max_retries}) in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("transfer failed: {e}");
                host.close().await;
                return ExitCode::FAILURE;
            }
        }
    }
}

fn prompt_confirmation(manifest: &Manifest) -> bool {
    println!();
    println!("Incoming transfer:");
    println!("  Name:  {}", manifest.folder_name);
    println!("  Size:  {}", format_bytes(manifest.total_size));
    println!("  Files: {}", manifest.files.len());
    print!("Accept? [y/N]: ");
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y")
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} bytes"),
    }
}
