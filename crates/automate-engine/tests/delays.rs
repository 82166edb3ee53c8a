//! Change delays, safety delays, forced refreshes and reset delays

use automate_engine::{DelayMode, ObjectSpec, StatusObject, System, Value, ValueKind};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

fn record_changes(object: &StatusObject) -> Arc<Mutex<Vec<(Instant, Value, bool)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    object.add_listener(move |change| {
        sink.lock()
            .unwrap()
            .push((Instant::now(), change.new.clone(), change.changed));
    });
    seen
}

#[test]
fn test_change_delay_suppresses_short_toggles() {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(ObjectSpec::new("s", ValueKind::Bool).configure(|c| {
            c.change_delay = Duration::from_millis(300);
            c.change_mode = DelayMode::Both;
        }))
        .unwrap();
    let seen = record_changes(&s);

    for value in [true, false, true, false] {
        s.set_status(value).unwrap();
        sleep(Duration::from_millis(40));
    }
    system.flush();
    sleep(Duration::from_millis(400));
    system.flush();

    assert_eq!(s.status(), Value::Bool(false));
    assert!(seen.lock().unwrap().is_empty());
    assert!(s.history().is_empty());
}

#[test]
fn test_change_delay_commits_the_last_value() {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(ObjectSpec::new("s", ValueKind::Bool).configure(|c| {
            c.change_delay = Duration::from_millis(200);
            c.change_mode = DelayMode::Both;
        }))
        .unwrap();
    let seen = record_changes(&s);

    for value in [true, false, true] {
        s.set_status(value).unwrap();
        sleep(Duration::from_millis(30));
    }
    assert!(s.changing());
    assert!(s.next_scheduled_action().is_some());
    assert_eq!(s.status(), Value::Bool(false));

    sleep(Duration::from_millis(300));
    system.flush();
    assert_eq!(s.status(), Value::Bool(true));
    assert!(!s.changing());
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, Value::Bool(true));
}

#[test]
fn test_randomised_toggling_converges_without_intermediate_values() {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(ObjectSpec::new("s", ValueKind::Bool).configure(|c| {
            c.change_delay = Duration::from_millis(250);
            c.change_mode = DelayMode::Both;
        }))
        .unwrap();
    let seen = record_changes(&s);

    let mut rng = rand::thread_rng();
    let mut last = false;
    for _ in 0..20 {
        last = rng.gen_bool(0.5);
        s.set_status(last).unwrap();
        sleep(Duration::from_millis(rng.gen_range(1..10)));
    }
    sleep(Duration::from_millis(350));
    system.flush();

    assert_eq!(s.status(), Value::Bool(last));
    let seen = seen.lock().unwrap();
    if last {
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, Value::Bool(true));
    } else {
        assert!(seen.is_empty());
    }
}

#[test]
fn test_change_delay_in_one_direction_only() {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(ObjectSpec::new("s", ValueKind::Int).configure(|c| {
            c.change_delay = Duration::from_millis(200);
            c.change_mode = DelayMode::Rising;
        }))
        .unwrap();

    s.set_status(5).unwrap();
    system.flush();
    assert_eq!(s.status(), Value::Int(0));

    sleep(Duration::from_millis(300));
    system.flush();
    assert_eq!(s.status(), Value::Int(5));

    s.set_status(1).unwrap();
    system.flush();
    assert_eq!(s.status(), Value::Int(1));
}

#[test]
fn test_safety_delay_gates_rising_changes() {
    let system = System::new().unwrap();
    let a = system
        .add_actuator(
            ObjectSpec::new("a", ValueKind::Int)
                .default_value(0)
                .slave(true)
                .configure(|c| {
                    c.safety_delay = Duration::from_millis(400);
                    c.safety_mode = DelayMode::Rising;
                }),
        )
        .unwrap();
    let seen = record_changes(&a);
    let start = Instant::now();

    a.set_status(1).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(1));

    sleep(Duration::from_millis(20));
    a.set_status(0).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(0));

    sleep(Duration::from_millis(20));
    a.set_status(1).unwrap();
    system.flush();
    assert_eq!(a.status(), Value::Int(0));
    assert!(a.changing());

    sleep(Duration::from_millis(150));
    assert_eq!(a.status(), Value::Int(0));

    sleep(Duration::from_millis(400));
    system.flush();
    assert_eq!(a.status(), Value::Int(1));

    let seen = seen.lock().unwrap();
    let rising: Vec<Instant> = seen
        .iter()
        .filter(|(_, v, _)| *v == Value::Int(1))
        .map(|(t, _, _)| *t)
        .collect();
    assert_eq!(rising.len(), 2);
    assert!(rising[1].duration_since(rising[0]) >= Duration::from_millis(400));
    assert!(rising[1].duration_since(start) >= Duration::from_millis(400));
}

#[test]
fn test_newest_request_supersedes_a_pending_one() {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(ObjectSpec::new("s", ValueKind::Int).configure(|c| {
            c.change_delay = Duration::from_millis(150);
            c.change_mode = DelayMode::Both;
        }))
        .unwrap();

    s.set_status(1).unwrap();
    sleep(Duration::from_millis(50));
    s.set_status(2).unwrap();
    sleep(Duration::from_millis(250));
    system.flush();

    assert_eq!(s.status(), Value::Int(2));
    let values: Vec<Value> = s.history().into_iter().map(|e| e.value).collect();
    assert_eq!(values, vec![Value::Int(2)]);
}

#[test]
fn test_unchanged_request_is_idempotent() {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(ObjectSpec::new("s", ValueKind::Int).default_value(7))
        .unwrap();
    let seen = record_changes(&s);

    s.set_status(7).unwrap();
    system.flush();
    assert!(seen.lock().unwrap().is_empty());
    assert!(s.history().is_empty());

    s.force_status(7).unwrap();
    system.flush();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, Value::Int(7));
    assert!(!seen[0].2);
    assert!(s.history().is_empty());
}

#[test]
fn test_reset_delay_returns_to_default() {
    let system = System::new().unwrap();
    let motion = system
        .add_sensor(ObjectSpec::new("motion", ValueKind::Bool).configure(|c| {
            c.reset_delay = Duration::from_millis(100);
        }))
        .unwrap();

    motion.set_status(true).unwrap();
    system.flush();
    assert!(motion.status().is_truthy());

    sleep(Duration::from_millis(60));
    motion.set_status(true).unwrap();
    sleep(Duration::from_millis(60));
    system.flush();
    assert!(motion.status().is_truthy());

    sleep(Duration::from_millis(150));
    system.flush();
    assert!(!motion.status().is_truthy());
}

#[test]
fn test_hook_runs_after_commit() {
    let system = System::new().unwrap();
    let pin = system
        .add_actuator(ObjectSpec::new("pin", ValueKind::Bool).slave(true))
        .unwrap();
    let writes = Arc::new(Mutex::new(Vec::new()));
    let sink = writes.clone();
    pin.set_hook(move |object: &StatusObject, old: &Value, new: &Value| {
        sink.lock()
            .unwrap()
            .push(format!("{} {} -> {}", object.name(), old, new));
    });

    pin.set_status(true).unwrap();
    pin.set_status(true).unwrap();
    system.flush();

    assert_eq!(*writes.lock().unwrap(), vec!["pin false -> true"]);
}

#[test]
fn test_history_records_commits_in_order() {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(ObjectSpec::new("s", ValueKind::Int))
        .unwrap();

    for value in [1, 2, 3] {
        s.set_status(value).unwrap();
        system.flush();
    }

    let values: Vec<Value> = s.history().into_iter().map(|e| e.value).collect();
    assert_eq!(values, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn test_forced_refresh_survives_a_change_delay() {
    let system = System::new().unwrap();
    let s = system
        .add_sensor(
            ObjectSpec::new("s", ValueKind::Int)
                .default_value(7)
                .configure(|c| {
                    c.change_delay = Duration::from_millis(100);
                    c.change_mode = DelayMode::Both;
                }),
        )
        .unwrap();
    let seen = record_changes(&s);

    s.force_status(7).unwrap();
    assert!(s.changing());
    sleep(Duration::from_millis(300));
    system.flush();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, Value::Int(7));
    assert!(!seen[0].2);
    assert!(!s.changing());
    assert!(s.history().is_empty());
}
