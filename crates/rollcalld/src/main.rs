use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod sheet;
mod store;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::{Engine, EngineChannels, EngineExit};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env().context("loading configuration")?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        groups = ?config.roster.groups,
        subjects = ?config.roster.subjects,
        "configuration loaded"
    );

    let engine = Engine::open(&config).context("opening frame source and models")?;
    let log = sheet::AttendanceLog::open(&config.attendance_db_path())
        .await
        .context("opening attendance log")?;

    let EngineChannels { handle, events, done } = engine.spawn()?;
    let service = AttendanceService::new(handle, log, config.roster.clone());

    let builder = if config.session_bus {
        tracing::info!("using session bus");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;
    tokio::spawn(dbus_interface::forward_events(conn.clone(), events));

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("rollcalld shutting down");
        }
        exit = done => {
            match exit {
                Ok(EngineExit::SourceFailed(reason)) => anyhow::bail!("frame source failed: {reason}"),
                Ok(exit) => tracing::info!(exit = ?exit, "recognition loop ended, shutting down"),
                Err(_) => anyhow::bail!("engine thread ended without reporting"),
            }
        }
    }

    Ok(())
}
