//! Interpolating actuators
//!
//! An interpolating actuator is an ordinary numeric actuator whose committed
//! status is not applied directly. Instead a slave actuator is walked towards
//! it, one step every `1 / change_frequency` seconds. The walk either moves at
//! a constant speed or, for [`Interpolation::ConstantTime`], at whatever speed
//! makes it take a fixed time.
//!
//! A change arriving during a walk only retargets it.

use automate_core::sync::lock;
use automate_core::{Value, ValueKind};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{EngineError, EngineResult};
use crate::status::{StatusHook, StatusObject};

/// How a slave follows its interpolating actuator
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Interpolation {
    /// Units per second
    ConstantSpeed { speed: f64 },
    /// Every change takes this long, whatever its size
    ConstantTime { change_time: Duration },
}

struct Walk {
    speed: f64,
    running: bool,
}

/// Status hook driving the slave of one interpolating actuator
pub(crate) struct Interpolator {
    slave: Arc<StatusObject>,
    mode: Interpolation,
    frequency: f64,
    walk: Arc<Mutex<Walk>>,
}

impl Interpolator {
    pub(crate) fn new(
        master: &StatusObject,
        slave: Arc<StatusObject>,
        mode: Interpolation,
        frequency: f64,
    ) -> EngineResult<Self> {
        let invalid = |reason: &str| {
            EngineError::InvalidConfig(format!(
                "cannot interpolate {} onto {}: {}",
                master.name(),
                slave.name(),
                reason
            ))
        };
        if !master.is_actuator() || !matches!(master.kind(), ValueKind::Float | ValueKind::Int) {
            return Err(invalid("only numeric actuators interpolate"));
        }
        if !slave.is_slave() {
            return Err(invalid("the slave must be a slave actuator"));
        }
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(invalid("change_frequency must be positive"));
        }
        let speed = match mode {
            Interpolation::ConstantSpeed { speed } if speed.is_finite() && speed > 0.0 => speed,
            Interpolation::ConstantSpeed { .. } => return Err(invalid("speed must be positive")),
            Interpolation::ConstantTime { .. } => 0.0,
        };
        Ok(Self {
            slave,
            mode,
            frequency,
            walk: Arc::new(Mutex::new(Walk {
                speed,
                running: false,
            })),
        })
    }
}

impl StatusHook for Interpolator {
    fn status_changed(&self, object: &StatusObject, _old: &Value, new: &Value) {
        let Ok(target) = new.number() else {
            return;
        };
        let mut walk = lock(&self.walk);
        if let Interpolation::ConstantTime { change_time } = self.mode {
            let distance = (number_of(&self.slave) - target).abs();
            walk.speed = distance / change_time.as_secs_f64();
        }
        if walk.running {
            trace!(object = %object.name(), to = target, "Retargeting interpolation");
            return;
        }
        let Ok(ctx) = object.context() else {
            return;
        };
        walk.running = true;
        debug!(
            object = %object.name(),
            slave = %self.slave.name(),
            to = target,
            speed = walk.speed,
            "Starting interpolation"
        );

        let master = ctx.registry.object(object.name()).map(|o| Arc::downgrade(&o));
        let state = self.walk.clone();
        let slave = self.slave.clone();
        let frequency = self.frequency;
        let spawned = ctx.spawn(async move {
            run_walk(master.unwrap_or_default(), slave, state, frequency).await;
        });
        if spawned.is_none() {
            walk.running = false;
        }
    }
}

fn number_of(object: &StatusObject) -> f64 {
    object.status().number().unwrap_or(0.0)
}

/// Step the slave until it reaches the master's status
async fn run_walk(
    master: Weak<StatusObject>,
    slave: Arc<StatusObject>,
    state: Arc<Mutex<Walk>>,
    frequency: f64,
) {
    let period = Duration::from_secs_f64(1.0 / frequency);
    let mut position = number_of(&slave);
    loop {
        let (target, speed) = {
            let mut walk = lock(&state);
            let target = master.upgrade().and_then(|m| m.status().number().ok());
            match target {
                Some(target) if target != position => (target, walk.speed),
                _ => {
                    walk.running = false;
                    return;
                }
            }
        };

        let step = speed / frequency;
        let next = if !(step.is_finite() && step > 0.0) || (target - position).abs() <= step {
            target
        } else {
            position + step.copysign(target - position)
        };
        if let Err(e) = slave.set_status(next) {
            warn!(slave = %slave.name(), error = %e, "Interpolation step failed");
            lock(&state).running = false;
            return;
        }
        position = next;
        tokio::time::sleep(period).await;
    }
}
