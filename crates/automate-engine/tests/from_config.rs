//! Building a whole system from YAML

use automate_engine::{EngineError, Role, System, SystemConfig, Value};
use std::thread::sleep;
use std::time::Duration;

const HALLWAY: &str = r#"
settings:
  history_capacity: 10
sensors:
  motion: { kind: bool, description: "Hall PIR" }
  lux: { kind: float, default: 300, value_min: 0 }
actuators:
  hall_light: { kind: bool, default: false, safety_delay: 0.2, priorities: { manual: 10 } }
  fan: { kind: int, slave: true }
programs:
  dark_motion:
    priority: 2
    active_condition: { and: [motion, { less: [lux, 50] }] }
    on_activate: { set_status: [hall_light, true] }
    tags: [lighting]
  manual:
    priority: 1
    active_condition: { literal: false }
    on_activate: { set_status: [hall_light, false] }
"#;

#[test]
fn test_objects_and_default_programs_are_built() {
    let config = SystemConfig::from_yaml_str(HALLWAY).unwrap();
    let system = System::from_config(&config).unwrap();

    let names: Vec<String> = system
        .objects()
        .iter()
        .map(|o| o.name().to_string())
        .collect();
    assert_eq!(names, vec!["motion", "lux", "hall_light", "fan"]);

    let programs: Vec<String> = system
        .programs()
        .iter()
        .map(|p| p.name().to_string())
        .collect();
    assert_eq!(
        programs,
        vec!["dp_hall_light", "dp_fan", "dark_motion", "manual"]
    );

    let light = system.object("hall_light").unwrap();
    assert_eq!(light.role(), Role::Actuator);
    assert_eq!(light.settings().safety_delay, Duration::from_millis(200));
    assert_eq!(light.priority_overrides()["manual"], 10.0);
    assert!(system.object("fan").unwrap().is_slave());
    assert_eq!(system.object("motion").unwrap().description(), "Hall PIR");
    assert_eq!(system.object("lux").unwrap().status(), Value::Float(300.0));
    assert_eq!(system.settings().history_capacity, 10);
    assert_eq!(system.program("dark_motion").unwrap().tags(), vec!["lighting"]);
}

#[test]
fn test_configured_program_reacts() {
    let config = SystemConfig::from_yaml_str(HALLWAY).unwrap();
    let system = System::from_config(&config).unwrap();
    let light = system.object("hall_light").unwrap();
    let motion = system.object("motion").unwrap();
    let lux = system.object("lux").unwrap();

    motion.set_status(true).unwrap();
    system.flush();
    assert!(!light.status().is_truthy());

    lux.set_status(10).unwrap();
    system.flush();
    assert!(light.status().is_truthy());
    assert_eq!(light.controlling_program().as_deref(), Some("dark_motion"));

    motion.set_status(false).unwrap();
    system.flush();
    assert!(!light.status().is_truthy());
}

#[test]
fn test_snapshot_reflects_the_system() {
    let config = SystemConfig::from_yaml_str(HALLWAY).unwrap();
    let system = System::from_config(&config).unwrap();
    system.object("lux").unwrap().set_status(-5).unwrap();
    system.flush();

    let snapshot = system.snapshot();
    assert!(snapshot.taken_at.is_some());
    let lux = snapshot.object("lux").unwrap();
    assert_eq!(lux.status, Value::Float(0.0));
    assert_eq!(lux.history.len(), 1);
    assert_eq!(
        snapshot.object("hall_light").unwrap().program_stack,
        vec!["dp_hall_light"]
    );

    let program = snapshot.program("dark_motion").unwrap();
    assert!(!program.active);
    assert_eq!(program.actual_targets, vec!["hall_light"]);
    let mut triggers = program.actual_triggers.clone();
    triggers.sort();
    assert_eq!(triggers, vec!["lux", "motion"]);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["objects"][0]["name"], "motion");
}

#[test]
fn test_unknown_node_fails_to_build() {
    let config = SystemConfig::from_yaml_str(
        r#"
        sensors:
          s: { kind: bool }
        programs:
          broken:
            active_condition: { frobnicate: [s] }
        "#,
    )
    .unwrap();

    assert!(matches!(
        System::from_config(&config),
        Err(EngineError::InvalidConfig(_))
    ));
}

#[test]
fn test_invalid_default_is_rejected() {
    let config = SystemConfig::from_yaml_str(
        r#"
        sensors:
          count: { kind: int, default: "many" }
        "#,
    )
    .unwrap();

    assert!(matches!(
        System::from_config(&config),
        Err(EngineError::Validation { .. })
    ));
}

#[test]
fn test_malformed_yaml_is_an_invalid_config() {
    assert!(matches!(
        SystemConfig::from_yaml_str("sensors: [not, a, map]"),
        Err(EngineError::InvalidConfig(_))
    ));
}

#[test]
fn test_event_sensors_interpolation_and_queries_from_yaml() {
    let config = SystemConfig::from_yaml_str(
        r#"
        sensors:
          doorbell: { kind: bool, event: true }
        actuators:
          blinds: { kind: float, default: 0, interpolate: { slave: motor, change_frequency: 20, speed: 10 } }
          motor: { kind: float, default: 0, slave: true }
          porch: { kind: bool, default: false }
        programs:
          greet:
            priority: 3
            active_condition: true
            update_condition: doorbell
            on_update:
              run:
                - { set_status: [{ of_type: { args: [bool], exclude: [doorbell] } }, true] }
                - { set_status: [blinds, 1] }
        "#,
    )
    .unwrap();
    assert!(config.sensors["doorbell"].event);
    let interpolation = config.actuators["blinds"].interpolate.clone().unwrap();
    assert_eq!(interpolation.slave, "motor");
    assert!(interpolation.mode().is_ok());

    let system = System::from_config(&config).unwrap();
    let greet = system.program("greet").unwrap();
    let mut targets: Vec<String> = greet
        .actual_targets()
        .iter()
        .map(|o| o.name().to_string())
        .collect();
    targets.sort();
    assert_eq!(targets, vec!["blinds", "porch"]);

    system.object("doorbell").unwrap().set_status(true).unwrap();
    system.flush();
    sleep(Duration::from_millis(400));
    system.flush();

    assert_eq!(system.object("doorbell").unwrap().status(), Value::Bool(false));
    assert_eq!(system.object("porch").unwrap().status(), Value::Bool(true));
    assert_eq!(system.object("blinds").unwrap().status(), Value::Float(1.0));
    assert_eq!(system.object("motor").unwrap().status(), Value::Float(1.0));
}

#[test]
fn test_interpolation_needs_one_of_speed_and_change_time() {
    let config = SystemConfig::from_yaml_str(
        r#"
        actuators:
          blinds: { kind: float, interpolate: { slave: motor, change_frequency: 20, speed: 1, change_time: 5 } }
          motor: { kind: float, slave: true }
        "#,
    )
    .unwrap();

    assert!(matches!(
        System::from_config(&config),
        Err(EngineError::InvalidConfig(_))
    ));
}
