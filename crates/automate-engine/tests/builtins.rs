//! Event sensors and interpolating actuators

use automate_engine::expr::build::*;
use automate_engine::{
    EngineError, Interpolation, ObjectSpec, Operand, ProgramSpec, StatusObject, System, Value,
    ValueKind,
};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

fn record(object: &StatusObject) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    object.add_listener(move |change| sink.lock().unwrap().push(change.new.clone()));
    seen
}

fn floats(values: &[f64]) -> Vec<Value> {
    values.iter().map(|v| Value::Float(*v)).collect()
}

/// `s` drives `target` to 2.0 through program `p`; `servo` follows `target`
fn interpolated(mode: Interpolation) -> (System, Arc<StatusObject>, Arc<StatusObject>) {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(ObjectSpec::new("s", ValueKind::Bool))
        .unwrap();
    system
        .add_actuator(ObjectSpec::new("target", ValueKind::Float).default_value(0.0))
        .unwrap();
    let servo = system
        .add_actuator(
            ObjectSpec::new("servo", ValueKind::Float)
                .default_value(0.0)
                .slave(true),
        )
        .unwrap();
    system.interpolate("target", "servo", mode, 16.0).unwrap();
    system
        .add_program(
            ProgramSpec::new("p")
                .priority(5.0)
                .active_condition("s")
                .on_activate(set_status("target", 2.0)),
        )
        .unwrap();
    (system, s, servo)
}

#[test]
fn test_event_sensor_drops_back_to_false() {
    let system = System::new().unwrap();
    let button = system
        .add_event_sensor(ObjectSpec::new("button", ValueKind::Bool))
        .unwrap();
    let seen = record(&button);

    for _ in 0..2 {
        button.set_status(true).unwrap();
        system.flush();
    }

    assert_eq!(button.status(), Value::Bool(false));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(true),
            Value::Bool(false)
        ]
    );
}

#[test]
fn test_event_sensor_triggers_programs() {
    let system = System::new().unwrap();
    system
        .add_event_sensor(ObjectSpec::new("button", ValueKind::Bool))
        .unwrap();
    let presses = system
        .add_sensor(ObjectSpec::new("presses", ValueKind::Float))
        .unwrap();
    system
        .add_program(
            ProgramSpec::new("count")
                .active_condition("button")
                .on_activate(set_status(
                    "presses",
                    sum(vec![Operand::from("presses"), Operand::from(1)]),
                )),
        )
        .unwrap();

    let button = system.object("button").unwrap();
    for _ in 0..3 {
        button.set_status(true).unwrap();
        system.flush();
    }

    assert_eq!(presses.status(), Value::Float(3.0));
}

#[test]
fn test_event_sensor_must_be_bool() {
    let system = System::new().unwrap();
    assert!(matches!(
        system.add_event_sensor(ObjectSpec::new("ping", ValueKind::Int)),
        Err(EngineError::InvalidConfig(_))
    ));
    assert!(system.object("ping").is_none());
}

#[test]
fn test_constant_speed_steps_the_slave() {
    let (system, s, servo) = interpolated(Interpolation::ConstantSpeed { speed: 8.0 });
    let seen = record(&servo);

    s.set_status(true).unwrap();
    system.flush();
    assert_eq!(system.object("target").unwrap().status(), Value::Float(2.0));
    sleep(Duration::from_millis(600));
    system.flush();

    assert_eq!(servo.status(), Value::Float(2.0));
    assert_eq!(*seen.lock().unwrap(), floats(&[0.5, 1.0, 1.5, 2.0]));

    // Back to the default
    s.set_status(false).unwrap();
    system.flush();
    sleep(Duration::from_millis(600));
    system.flush();
    assert_eq!(servo.status(), Value::Float(0.0));
    assert_eq!(seen.lock().unwrap().len(), 8);
}

#[test]
fn test_constant_time_takes_the_same_steps_for_any_distance() {
    let (system, s, servo) = interpolated(Interpolation::ConstantTime {
        change_time: Duration::from_millis(250),
    });
    let b = system
        .add_sensor(ObjectSpec::new("b", ValueKind::Bool))
        .unwrap();
    system
        .add_program(
            ProgramSpec::new("far")
                .priority(6.0)
                .active_condition("b")
                .on_activate(set_status("target", 8.0)),
        )
        .unwrap();
    let seen = record(&servo);

    s.set_status(true).unwrap();
    system.flush();
    sleep(Duration::from_millis(600));
    system.flush();
    assert_eq!(*seen.lock().unwrap(), floats(&[0.5, 1.0, 1.5, 2.0]));

    b.set_status(true).unwrap();
    system.flush();
    sleep(Duration::from_millis(600));
    system.flush();
    assert_eq!(
        *seen.lock().unwrap(),
        floats(&[0.5, 1.0, 1.5, 2.0, 3.5, 5.0, 6.5, 8.0])
    );
}

#[test]
fn test_retarget_during_a_walk() {
    let (system, s, servo) = interpolated(Interpolation::ConstantSpeed { speed: 8.0 });

    s.set_status(true).unwrap();
    system.flush();
    sleep(Duration::from_millis(80));
    s.set_status(false).unwrap();
    system.flush();
    sleep(Duration::from_millis(600));
    system.flush();

    assert_eq!(servo.status(), Value::Float(0.0));
    assert!(servo.history().len() >= 2);
}

#[test]
fn test_interpolation_is_validated() {
    let system = System::new().unwrap();
    system
        .add_actuator(ObjectSpec::new("target", ValueKind::Float))
        .unwrap();
    system
        .add_actuator(ObjectSpec::new("plain", ValueKind::Float))
        .unwrap();
    system
        .add_actuator(ObjectSpec::new("servo", ValueKind::Float).slave(true))
        .unwrap();
    system
        .add_actuator(ObjectSpec::new("switch", ValueKind::Bool))
        .unwrap();
    let speed = Interpolation::ConstantSpeed { speed: 1.0 };

    let invalid =
        |result: Result<(), EngineError>| matches!(result, Err(EngineError::InvalidConfig(_)));
    assert!(invalid(system.interpolate("target", "plain", speed, 10.0)));
    assert!(invalid(system.interpolate("switch", "servo", speed, 10.0)));
    assert!(invalid(system.interpolate("target", "servo", speed, 0.0)));
    assert!(invalid(system.interpolate(
        "target",
        "servo",
        Interpolation::ConstantSpeed { speed: 0.0 },
        10.0
    )));
    assert!(matches!(
        system.interpolate("target", "missing", speed, 10.0),
        Err(EngineError::UnknownObject(_))
    ));
    assert!(system.interpolate("target", "servo", speed, 10.0).is_ok());
}
