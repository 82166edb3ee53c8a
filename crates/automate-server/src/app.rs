//! Loading a configuration directory into a running system

use anyhow::{Context as _, Result};
use automate_core::events;
use automate_engine::{System, SystemConfig};
use automate_event_bus::SharedEventBus;
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

/// Resolve tags in `file` under `config_dir` and build the system it describes
#[instrument(skip(bus))]
pub fn load_system(config_dir: &Path, file: &Path, bus: SharedEventBus) -> Result<System> {
    let document = automate_config::load_yaml(config_dir, file)
        .with_context(|| format!("cannot load {}", config_dir.join(file).display()))?;
    let config = SystemConfig::from_yaml_value(document)
        .with_context(|| format!("invalid configuration in {}", file.display()))?;
    info!(
        sensors = config.sensors.len(),
        actuators = config.actuators.len(),
        programs = config.programs.len(),
        "Configuration loaded"
    );
    System::from_config_with_bus(&config, bus).context("cannot build the system")
}

/// Log every event published on `bus` until the bus goes away
pub async fn log_events(bus: SharedEventBus) {
    let mut rx = bus.subscribe_all();
    loop {
        match rx.recv().await {
            Ok(event) => match event.event_type.as_str() {
                events::STATUS_CHANGED => debug!(
                    object = %event.data["object"],
                    old = %event.data["old"],
                    new = %event.data["new"],
                    program = %event.data["program"],
                    "status_changed"
                ),
                other => debug!(event = other, data = %event.data, "Event"),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automate_engine::Value;
    use automate_event_bus::EventBus;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_load_system_from_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("secrets.yaml"), "lamp_default: true\n").unwrap();
        fs::write(
            dir.path().join("programs.yaml"),
            "night:\n  active_condition: dark\n  on_activate: { set_status: [lamp, false] }\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("automate.yaml"),
            "sensors:\n  dark: { kind: bool }\n\
             actuators:\n  lamp: { kind: bool, default: !secret lamp_default }\n\
             programs: !include programs.yaml\n",
        )
        .unwrap();

        let system = load_system(
            dir.path(),
            Path::new("automate.yaml"),
            Arc::new(EventBus::new()),
        )
        .unwrap();
        let lamp = system.object("lamp").unwrap();
        assert_eq!(lamp.status(), Value::Bool(true));

        system.object("dark").unwrap().set_status(true).unwrap();
        system.flush();
        assert_eq!(lamp.status(), Value::Bool(false));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = load_system(
            dir.path(),
            Path::new("automate.yaml"),
            Arc::new(EventBus::new()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("automate.yaml"));
    }
}
