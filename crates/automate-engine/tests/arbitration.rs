//! Actuator program stacks and default programs

use automate_core::events;
use automate_engine::expr::build::*;
use automate_engine::{
    DelayMode, EngineError, ObjectSpec, ProgramSpec, System, Value, ValueKind,
};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

fn system_with_switches() -> System {
    let system = System::new().unwrap();
    system
        .add_sensor(ObjectSpec::new("s1", ValueKind::Bool))
        .unwrap();
    system
        .add_sensor(ObjectSpec::new("s2", ValueKind::Bool))
        .unwrap();
    system
        .add_actuator(ObjectSpec::new("a", ValueKind::Int).default_value(0))
        .unwrap();
    system
}

fn add_asserting_program(system: &System, name: &str, priority: f64, switch: &str, value: i64) {
    system
        .add_program(
            ProgramSpec::new(name)
                .priority(priority)
                .active_condition(switch)
                .on_activate(set_status("a", value)),
        )
        .unwrap();
}

#[test]
fn test_highest_priority_program_wins() {
    let system = system_with_switches();
    add_asserting_program(&system, "p1", 1.0, "s1", 10);
    add_asserting_program(&system, "p2", 2.0, "s2", 20);
    let a = system.object("a").unwrap();
    let s1 = system.object("s1").unwrap();
    let s2 = system.object("s2").unwrap();

    s1.set_status(true).unwrap();
    s2.set_status(true).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(20));
    assert_eq!(a.program_stack(), vec!["dp_a", "p1", "p2"]);
    assert_eq!(a.controlling_program().as_deref(), Some("p2"));

    s2.set_status(false).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(10));
    assert_eq!(a.program_stack(), vec!["dp_a", "p1"]);

    s1.set_status(false).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(0));
    assert_eq!(a.program_stack(), vec!["dp_a"]);
}

#[test]
fn test_no_flash_of_default_when_top_program_leaves() {
    let system = system_with_switches();
    add_asserting_program(&system, "p1", 1.0, "s1", 10);
    add_asserting_program(&system, "p2", 2.0, "s2", 20);
    let a = system.object("a").unwrap();

    system.object("s1").unwrap().set_status(true).unwrap();
    system.object("s2").unwrap().set_status(true).unwrap();
    system.flush();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    a.add_listener(move |change| sink.lock().unwrap().push(change.new.clone()));

    system.object("s2").unwrap().set_status(false).unwrap();
    system.flush();

    assert_eq!(*seen.lock().unwrap(), vec![Value::Int(10)]);
}

#[test]
fn test_lower_priority_assertion_is_kept_while_shadowed() {
    let system = system_with_switches();
    add_asserting_program(&system, "p2", 2.0, "s2", 20);
    add_asserting_program(&system, "p1", 1.0, "s1", 10);
    let a = system.object("a").unwrap();

    system.object("s2").unwrap().set_status(true).unwrap();
    system.flush();
    system.object("s1").unwrap().set_status(true).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(20));

    let p1 = system.program("p1").unwrap();
    assert_eq!(a.program_status(p1.id()), Some(Value::Int(10)));

    system.object("s2").unwrap().set_status(false).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(10));
}

#[test]
fn test_priority_changes_resort_the_stack() {
    let system = system_with_switches();
    add_asserting_program(&system, "p1", 1.0, "s1", 10);
    add_asserting_program(&system, "p2", 2.0, "s2", 20);
    let a = system.object("a").unwrap();
    system.object("s1").unwrap().set_status(true).unwrap();
    system.object("s2").unwrap().set_status(true).unwrap();
    system.flush();

    system.program("p1").unwrap().set_priority(3.0);
    system.flush();
    assert_eq!(a.status(), Value::Int(10));

    a.set_priority_override("p2", Some(5.0));
    system.flush();
    assert_eq!(a.status(), Value::Int(20));
    assert_eq!(
        a.stack_priorities(),
        vec![
            ("dp_a".to_string(), 0.0),
            ("p1".to_string(), 3.0),
            ("p2".to_string(), 5.0)
        ]
    );

    a.set_priority_override("p2", None);
    system.flush();
    assert_eq!(a.status(), Value::Int(10));
}

#[test]
fn test_equal_priorities_keep_activation_order() {
    let system = system_with_switches();
    add_asserting_program(&system, "p1", 1.0, "s1", 10);
    add_asserting_program(&system, "p2", 1.0, "s2", 20);
    let a = system.object("a").unwrap();

    system.object("s2").unwrap().set_status(true).unwrap();
    system.flush();
    system.object("s1").unwrap().set_status(true).unwrap();
    system.flush();

    assert_eq!(a.program_stack(), vec!["dp_a", "p2", "p1"]);
    assert_eq!(a.status(), Value::Int(10));
}

#[test]
fn test_set_status_outside_the_stack_is_rejected() {
    let system = system_with_switches();
    let a = system.object("a").unwrap();

    let err = a.set_status(5).unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }));
    system.flush();
    assert_eq!(a.status(), Value::Int(0));
}

#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_rejected_status_is_logged() {
    let system = system_with_switches();
    let a = system.object("a").unwrap();
    let logs = LogCapture::default();
    let sink = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .finish();

    let err = tracing::subscriber::with_default(subscriber, || a.set_status(5).unwrap_err());

    assert!(matches!(err, EngineError::Unauthorized { .. }));
    let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(text.contains("Rejecting status from a program outside the stack"));
    assert!(text.contains("object=a"));
}

#[test]
fn test_slave_actuator_accepts_anyone() {
    let system = System::new().unwrap();
    let relay = system
        .add_actuator(
            ObjectSpec::new("relay", ValueKind::Bool)
                .default_value(false)
                .slave(true),
        )
        .unwrap();

    relay.set_status(true).unwrap();
    system.flush();
    assert!(relay.status().is_truthy());
    assert_eq!(
        system.program("dp_relay").unwrap().conditions().on_activate.to_string(),
        "empty()"
    );
}

#[test]
fn test_default_program_is_installed() {
    let system = system_with_switches();
    let dp = system.program("dp_a").unwrap();

    assert!(dp.is_active());
    assert_eq!(dp.priority(), 0.0);
    assert_eq!(dp.description(), "Default program of a");
    let targets: Vec<String> = dp
        .actual_targets()
        .iter()
        .map(|o| o.name().to_string())
        .collect();
    assert_eq!(targets, vec!["a"]);
}

#[test]
fn test_invalid_value_is_dropped() {
    let system = System::new().unwrap();
    let level = system
        .add_sensor(ObjectSpec::new("level", ValueKind::Int).default_value(3))
        .unwrap();

    level.set_status("not a number").unwrap();
    system.flush();
    assert_eq!(level.status(), Value::Int(3));
    assert!(level.history().is_empty());
}

#[test]
fn test_sensor_values_are_clipped() {
    let system = System::new().unwrap();
    let temp = system
        .add_sensor(ObjectSpec::new("temp", ValueKind::Float).configure(|s| {
            s.value_min = Some(-10.0);
            s.value_max = Some(40.0);
        }))
        .unwrap();

    temp.set_status(55.5).unwrap();
    system.flush();
    assert_eq!(temp.status(), Value::Float(40.0));

    temp.set_status(-30).unwrap();
    system.flush();
    assert_eq!(temp.status(), Value::Float(-10.0));
}

#[test]
fn test_removed_program_leaves_the_stack() {
    let system = system_with_switches();
    add_asserting_program(&system, "p1", 1.0, "s1", 10);
    let a = system.object("a").unwrap();
    system.object("s1").unwrap().set_status(true).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(10));

    system.remove_program("p1").unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(0));
    assert!(system.program("p1").is_none());
    assert!(matches!(
        system.remove_program("p1"),
        Err(EngineError::UnknownObject(_))
    ));
}

#[test]
fn test_duplicate_names_are_rejected() {
    let system = system_with_switches();
    let err = system
        .add_sensor(ObjectSpec::new("a", ValueKind::Bool))
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(_)));

    let err = system.add_program(ProgramSpec::new("s1")).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(_)));
}

#[test]
fn test_activation_events_are_published() {
    let system = system_with_switches();
    let mut rx = system.events().subscribe_all();
    add_asserting_program(&system, "p1", 1.0, "s1", 10);

    system.object("s1").unwrap().set_status(true).unwrap();
    system.flush();
    system.object("s1").unwrap().set_status(false).unwrap();
    system.flush();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        let program = event.data.get("program").and_then(|p| p.as_str());
        if event.event_type.as_str().starts_with("program_") && program == Some("p1") {
            seen.push(event.event_type.as_str().to_string());
        }
    }
    assert_eq!(
        seen,
        vec![events::PROGRAM_ACTIVATED, events::PROGRAM_DEACTIVATED]
    );
}

#[test]
fn test_shutdown_drops_later_requests() {
    let system = system_with_switches();
    let s1 = system.object("s1").unwrap();

    system.shutdown();
    assert!(!system.is_running());
    s1.set_status(true).unwrap();
    assert!(!s1.status().is_truthy());
    system.shutdown();
}

#[test]
fn test_random_activation_order_settles_on_highest_priority() {
    use rand::seq::SliceRandom;
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let system = System::new().unwrap();
    system
        .add_actuator(ObjectSpec::new("a", ValueKind::Int).default_value(0))
        .unwrap();

    let mut priorities: Vec<f64> = (1..=8).map(|p| p as f64).collect();
    priorities.shuffle(&mut rng);
    for (i, priority) in priorities.iter().enumerate() {
        let switch = format!("s{i}");
        system
            .add_sensor(ObjectSpec::new(switch.clone(), ValueKind::Bool))
            .unwrap();
        add_asserting_program(&system, &format!("p{i}"), *priority, &switch, *priority as i64 * 10);
    }

    let mut order: Vec<usize> = (0..priorities.len()).collect();
    order.shuffle(&mut rng);
    for i in order {
        system
            .object(&format!("s{i}"))
            .unwrap()
            .set_status(true)
            .unwrap();
        if rng.gen_bool(0.5) {
            system.flush();
        }
    }
    system.flush();

    let a = system.object("a").unwrap();
    assert_eq!(a.status(), Value::Int(80));
    let stack = a.stack_priorities();
    assert_eq!(stack.len(), priorities.len() + 1);
    assert!(stack.windows(2).all(|w| w[0].1 <= w[1].1));
}

#[test]
fn test_delayed_assertion_of_a_shadowed_program_never_lands() {
    let system = system_with_switches();
    system
        .add_actuator(
            ObjectSpec::new("slow", ValueKind::Int)
                .default_value(0)
                .configure(|c| {
                    c.change_delay = Duration::from_millis(150);
                    c.change_mode = DelayMode::Both;
                }),
        )
        .unwrap();
    let low = system
        .add_program(
            ProgramSpec::new("low")
                .priority(1.0)
                .active_condition("s1")
                .on_activate(set_status("slow", 10)),
        )
        .unwrap();
    system
        .add_program(
            ProgramSpec::new("high")
                .priority(2.0)
                .active_condition("s2")
                .targets(vec!["slow"]),
        )
        .unwrap();
    let slow = system.object("slow").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    slow.add_listener(move |change| sink.lock().unwrap().push(change.new.clone()));

    system.object("s1").unwrap().set_status(true).unwrap();
    system.flush();
    assert!(slow.changing());

    system.object("s2").unwrap().set_status(true).unwrap();
    system.flush();
    assert_eq!(slow.controlling_program().as_deref(), Some("high"));

    sleep(Duration::from_millis(350));
    system.flush();
    assert_eq!(slow.status(), Value::Int(0));
    assert!(seen.lock().unwrap().is_empty());
    assert!(!slow.changing());
    assert_eq!(slow.program_status(low.id()), Some(Value::Int(10)));

    // Once the shadowing program leaves, the remembered value applies
    system.object("s2").unwrap().set_status(false).unwrap();
    system.flush();
    sleep(Duration::from_millis(350));
    system.flush();
    assert_eq!(slow.status(), Value::Int(10));
    assert_eq!(*seen.lock().unwrap(), vec![Value::Int(10)]);
}
