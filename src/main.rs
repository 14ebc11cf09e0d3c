use anyhow::Context;
use sensortag_bridge::domain::settings::{Settings, SettingsService};
use sensortag_bridge::infrastructure::bluez::dbus::DbusBus;
use sensortag_bridge::infrastructure::logging::init_logger;
use sensortag_bridge::infrastructure::sensortag::Fleet;
use sensortag_bridge::infrastructure::shutdown::stop_pair;
use sensortag_bridge::infrastructure::telemetry::udp::UdpSink;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::task::LocalSet;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let settings_path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = SettingsService::new(settings_path)?;
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!(
        "Starting SensorTag bridge with settings from {}",
        settings.path().display()
    );

    // every bus object is Rc-shared, so the whole bridge runs on one thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = LocalSet::new().block_on(&runtime, run(settings.get().clone()));
    if let Err(e) = &result {
        error!("Bridge stopped: {:#}", e);
    }
    result
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let bus = DbusBus::system()
        .await
        .context("connecting to the system bus")?;
    let sink = UdpSink::connect(&settings.telemetry)
        .await
        .with_context(|| {
            format!(
                "resolving telemetry target {}:{}",
                settings.telemetry.host, settings.telemetry.port
            )
        })?;

    let (stop_handle, stop) = stop_pair();
    tokio::task::spawn_local(async move {
        match shutdown_signal().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Signal handler failed, shutting down: {}", e),
        }
        stop_handle.stop();
    });

    let fleet = Fleet::new(Rc::new(bus), settings.fleet);
    fleet.run(sink, stop).await?;
    info!("Bridge stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
