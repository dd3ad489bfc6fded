// FieldSync daemon: rendezvous, LAN discovery, shared field console.

mod config;
mod console;
mod resolver;
mod session;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use fieldsync_core::{detect, Descriptor, DeviceSignals};
use tracing_subscriber::EnvFilter;

use crate::session::Session;
use crate::transport::lan::LanTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("fieldsync {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let descriptor = local_descriptor(&cfg);
    tracing::info!(name = %descriptor.name, icon = %descriptor.icon, "local device");

    let rt = tokio::runtime::Runtime::new().context("start runtime")?;
    rt.block_on(async {
        let namespace = resolver::resolve(&cfg).await;
        let transport = Arc::new(LanTransport::new(&cfg));
        let handle = Session::start(transport, namespace, descriptor, cfg.settings())
            .await
            .context("register on the network")?;

        tokio::select! {
            _ = console::run(&handle) => tracing::info!("quit requested"),
            res = shutdown_signal() => res?,
        }
        handle.stop().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Configured name/icon win; otherwise guess from the host platform.
fn local_descriptor(cfg: &config::Config) -> Descriptor {
    let detected = detect(&host_signals());
    Descriptor::new(
        cfg.device_name.clone().unwrap_or(detected.name),
        cfg.device_icon.clone().unwrap_or(detected.icon),
    )
}

fn host_signals() -> DeviceSignals {
    let platform = match std::env::consts::OS {
        "macos" => "MacIntel",
        "windows" => "Win32",
        "linux" => "Linux x86_64",
        other => other,
    };
    DeviceSignals {
        platform: platform.to_string(),
        ..DeviceSignals::default()
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutdown signal received");
    Ok(())
}
