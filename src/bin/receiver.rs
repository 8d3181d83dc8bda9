//! Audio Receiver Application
//!
//! Mirrors sources announced over UDP and plays the first one on an output
//! device, kept in phase with the sender through the shared clock.
//!
//! ```text
//! receiver [bind-addr] [--device <output-id>]
//! ```
//!
//! Both machines are expected to have NTP-disciplined wall clocks; the
//! cluster clock-sync service is not part of this core.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synced_audio_streamer::{
    audio::{device::list_devices, CpalRenderer},
    config::AppConfig,
    context::TimeSyncReady,
    events::SinkEvent,
    registry::Reconciled,
    transport::{run_receiver, UdpFrameRouter},
    AudioSink, LocalContext, Registry, SystemClock,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

struct Args {
    bind: SocketAddr,
    device_id: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut bind = "0.0.0.0:5000".to_string();
    let mut device_id = None;

    while let Some(arg) = args.next() {
        if arg == "--device" {
            device_id = Some(args.next().context("--device needs an output id")?);
        } else {
            bind = arg;
        }
    }

    Ok(Args {
        bind: bind.parse().context("Invalid bind address")?,
        device_id,
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

    tracing::info!("Starting audio receiver");

    let args = parse_args()?;
    let config = AppConfig::load_or_default()?;
    let ctx = LocalContext::from_config(&config, Arc::new(SystemClock::new()));

    println!("\n=== Available Output Devices ===");
    for device in list_devices().iter().filter(|d| !d.is_input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let router = UdpFrameRouter::new();
    let registry = Arc::new(Registry::new(ctx.clone(), config.clone(), router.clone()));

    let renderer = CpalRenderer::new(args.device_id.as_deref()).with_min_skew_ms(config.sink.min_skew_ms);
    let sink = AudioSink::new(ctx.clone(), "output", Box::new(renderer), &config);
    registry.add_sink(sink.clone());
    let mut sink_events = sink.subscribe();

    let socket = UdpSocket::bind(args.bind).await?;
    tracing::info!("Listening on {}", args.bind);

    let (announced_tx, mut announced_rx) = mpsc::unbounded_channel();
    let receive_registry = registry.clone();
    let mut receive_task = tokio::spawn(run_receiver(socket, router, move |descriptor, from| {
        let uuid = descriptor.uuid;
        if receive_registry.apply_source_descriptor(descriptor) == Reconciled::Created {
            tracing::info!(source = %uuid, %from, "New remote source");
        }
        let _ = announced_tx.send(uuid);
    }));

    tracing::info!("Waiting for audio streams...");
    let mut stats = tokio::time::interval(STATS_INTERVAL);

    loop {
        tokio::select! {
            Some(uuid) = announced_rx.recv() => {
                if sink.linked_source().is_some() {
                    continue;
                }
                let Some(source) = registry.source(&uuid) else { continue };
                match sink.link(&source, TimeSyncReady::ready()).await {
                    Ok(()) => tracing::info!(source = %uuid, "Playing remote source"),
                    Err(e) => tracing::warn!("Failed to link source {}: {}", uuid, e),
                }
            }
            Ok(event) = sink_events.recv() => match event {
                SinkEvent::Resynced { delta_ms, lead_ms, last_index, .. } => {
                    tracing::debug!(delta_ms, lead_ms, last_index, "Resynced");
                }
                SinkEvent::Unlinked { source, .. } => {
                    tracing::info!(source = %source, "Stream ended, waiting for the next announcement");
                }
                _ => {}
            },
            _ = stats.tick() => {
                for descriptor in registry.source_descriptors() {
                    tracing::info!(
                        "Source {} ({}): {}ch @ {}Hz, latency {}ms",
                        descriptor.name,
                        descriptor.uuid,
                        descriptor.channels,
                        descriptor.rate,
                        descriptor.latency_ms
                    );
                }
            }
            result = &mut receive_task => {
                result??;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    registry.stop_all();
    Ok(())
}
