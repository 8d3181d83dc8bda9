//! Audio Sender Application
//!
//! Captures the default input (or the stdout of a command) as a source and
//! streams its framed chunks to a receiver over UDP.
//!
//! ```text
//! sender [target-addr] [--process <command> [args...]]
//! ```

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synced_audio_streamer::{
    audio::{device::list_devices, framing::encode_frame},
    config::AppConfig,
    constants::*,
    transport::Datagram,
    AudioSource, LocalContext, SourceKind, SystemClock,
};

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

struct Args {
    target: SocketAddr,
    process: Option<(String, Vec<String>)>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1).peekable();
    let mut target = "127.0.0.1:5000".to_string();
    let mut process = None;

    while let Some(arg) = args.next() {
        if arg == "--process" {
            let command = args.next().context("--process needs a command")?;
            process = Some((command, args.by_ref().collect()));
        } else {
            target = arg;
        }
    }

    Ok(Args {
        target: target.parse().context("Invalid target address")?,
        process,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting audio sender");

    let args = parse_args()?;
    let config = AppConfig::load_or_default()?;
    let ctx = LocalContext::from_config(&config, Arc::new(SystemClock::new()));

    let (name, kind) = match args.process {
        Some((command, args)) => (command.clone(), SourceKind::Process { command, args }),
        None => {
            println!("\n=== Available Input Devices ===");
            for device in list_devices().iter().filter(|d| d.is_input) {
                let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
                println!("  {}{}:", device.name, default_marker);
                println!("    ID: {}", device.id);
                println!("    Sample rates: {:?}", device.sample_rates);
                println!("    Channels: {:?}", device.channels);
            }
            println!();
            ("default input".to_string(), SourceKind::Device { device_id: None })
        }
    };

    let source = AudioSource::local(
        ctx.clone(),
        name,
        kind,
        OPUS_ENCODER_RATE,
        config.opus.channels,
        &config,
    );
    let mut handle = source.start().await?;
    tracing::info!(source = %source.uuid(), target = %args.target, "Source started");

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut announce = tokio::time::interval(ANNOUNCE_INTERVAL);
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    let mut frames_sent: u64 = 0;
    let mut bytes_sent: u64 = 0;

    tracing::info!("Streaming - press Ctrl+C to stop");

    loop {
        tokio::select! {
            chunk = handle.recv() => {
                let Some(chunk) = chunk else {
                    tracing::warn!("Source ended");
                    break;
                };
                let datagram = Datagram::Frame {
                    source: source.uuid(),
                    frame: encode_frame(&chunk),
                }
                .encode();
                match socket.send_to(&datagram, args.target).await {
                    Ok(n) => {
                        frames_sent += 1;
                        bytes_sent += n as u64;
                    }
                    Err(e) => tracing::warn!("Failed to send frame: {}", e),
                }
            }
            _ = announce.tick() => {
                let datagram = Datagram::Descriptor(source.to_descriptor()).encode();
                if let Err(e) = socket.send_to(&datagram, args.target).await {
                    tracing::warn!("Failed to announce source: {}", e);
                }
            }
            _ = stats.tick() => {
                tracing::info!(
                    "Stats: {} frames sent, {:.1} KB sent, {} chunks dropped by backpressure",
                    frames_sent,
                    bytes_sent as f64 / 1024.0,
                    handle.lagged()
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    source.close();
    Ok(())
}
