//! The system: owner of every object, program and the runtime behind them

use automate_core::{ObjectName, Value, ValueKind};
use automate_event_bus::{EventBus, SharedEventBus};
use chrono::Utc;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{ActuatorConfig, SensorConfig, SystemConfig, SystemSettings};
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::expr::build::{empty, set_status, value};
use crate::expr::{Expr, ExprKind};
use crate::interpolate::{Interpolation, Interpolator};
use crate::program::{Program, ProgramSpec};
use crate::registry::Entity;
use crate::snapshot::{ProgramSnapshot, StatusObjectSnapshot, SystemSnapshot};
use crate::status::{ObjectSettings, Role, StatusChange, StatusObject};

/// Builder for a sensor or an actuator
#[derive(Debug, Clone)]
pub struct ObjectSpec {
    name: String,
    kind: ValueKind,
    default: Option<Value>,
    settings: ObjectSettings,
    slave: bool,
    priorities: IndexMap<String, f64>,
}

impl ObjectSpec {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            settings: ObjectSettings::default(),
            slave: false,
            priorities: IndexMap::new(),
        }
    }

    /// Initial status and the value the default program asserts
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn settings(mut self, settings: ObjectSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut ObjectSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    /// Actuators only
    pub fn slave(mut self, slave: bool) -> Self {
        self.slave = slave;
        self
    }

    /// Actuators only: override a program's priority on this actuator
    pub fn priority_override(mut self, program: impl Into<String>, priority: f64) -> Self {
        self.priorities.insert(program.into(), priority);
        self
    }
}

impl SensorConfig {
    pub fn to_spec(&self, name: &str) -> ObjectSpec {
        ObjectSpec {
            name: name.to_string(),
            kind: self.object.kind,
            default: self.object.default.clone(),
            settings: self.settings(),
            slave: false,
            priorities: IndexMap::new(),
        }
    }
}

impl ActuatorConfig {
    pub fn to_spec(&self, name: &str) -> ObjectSpec {
        ObjectSpec {
            name: name.to_string(),
            kind: self.object.kind,
            default: self.object.default.clone(),
            settings: self.object.settings(),
            slave: self.slave,
            priorities: self.priorities.clone(),
        }
    }
}

/// A running automation system
///
/// Dropping the system shuts it down.
pub struct System {
    ctx: Arc<Context>,
}

impl System {
    pub fn new() -> EngineResult<Self> {
        Self::with_settings(SystemSettings::default())
    }

    pub fn with_settings(settings: SystemSettings) -> EngineResult<Self> {
        Self::with_event_bus(settings, Arc::new(EventBus::new()))
    }

    /// Publish events on an existing bus
    pub fn with_event_bus(settings: SystemSettings, bus: SharedEventBus) -> EngineResult<Self> {
        let ctx = Context::new(settings, bus)?;
        debug!("System created");
        Ok(Self { ctx: Arc::new(ctx) })
    }

    pub fn from_config(config: &SystemConfig) -> EngineResult<Self> {
        Self::from_config_with_bus(config, Arc::new(EventBus::new()))
    }

    /// Build everything in dependency order: objects, then default programs,
    /// then user programs
    #[instrument(skip_all, fields(sensors = config.sensors.len(), actuators = config.actuators.len(), programs = config.programs.len()))]
    pub fn from_config_with_bus(config: &SystemConfig, bus: SharedEventBus) -> EngineResult<Self> {
        let system = Self::with_event_bus(config.settings.clone(), bus)?;

        for (name, sensor) in &config.sensors {
            if sensor.event {
                system.add_event_sensor(sensor.to_spec(name))?;
            } else {
                system.add_sensor(sensor.to_spec(name))?;
            }
        }
        let mut actuators = Vec::with_capacity(config.actuators.len());
        for (name, actuator) in &config.actuators {
            actuators.push(system.create_object(actuator.to_spec(name), Role::Actuator)?);
        }
        for actuator in &actuators {
            system.install_default_program(actuator)?;
        }
        for (name, actuator) in &config.actuators {
            if let Some(interpolation) = &actuator.interpolate {
                system.interpolate(
                    name,
                    &interpolation.slave,
                    interpolation.mode()?,
                    interpolation.change_frequency,
                )?;
            }
        }
        for (name, program) in &config.programs {
            system.add_program(program.to_spec(name)?)?;
        }

        info!(
            objects = system.objects().len(),
            programs = system.programs().len(),
            "System loaded from configuration"
        );
        Ok(system)
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.ctx.settings
    }

    pub fn add_sensor(&self, spec: ObjectSpec) -> EngineResult<Arc<StatusObject>> {
        self.create_object(spec, Role::Sensor)
    }

    /// Create an actuator together with its default program
    pub fn add_actuator(&self, spec: ObjectSpec) -> EngineResult<Arc<StatusObject>> {
        let actuator = self.create_object(spec, Role::Actuator)?;
        self.install_default_program(&actuator)?;
        Ok(actuator)
    }

    /// A Bool sensor that drops back to false right after every true
    ///
    /// Listeners still see the true status; the reset follows as a separate
    /// change.
    pub fn add_event_sensor(&self, spec: ObjectSpec) -> EngineResult<Arc<StatusObject>> {
        if spec.kind != ValueKind::Bool {
            return Err(EngineError::InvalidConfig(format!(
                "event sensor {} must be bool, not {}",
                spec.name, spec.kind
            )));
        }
        let sensor = self.create_object(spec.default_value(false), Role::Sensor)?;
        sensor.add_listener(|change: &StatusChange| {
            if !change.new.is_truthy() {
                return;
            }
            if let Err(e) = change.object.set_status(false) {
                warn!(object = %change.object.name(), error = %e, "Cannot reset event sensor");
            }
        });
        Ok(sensor)
    }

    /// Walk `slave` towards every status `actuator` commits
    ///
    /// Replaces any hook already installed on `actuator`.
    pub fn interpolate(
        &self,
        actuator: &str,
        slave: &str,
        mode: Interpolation,
        change_frequency: f64,
    ) -> EngineResult<()> {
        let master = self
            .object(actuator)
            .ok_or_else(|| EngineError::UnknownObject(actuator.to_string()))?;
        let slave = self
            .object(slave)
            .ok_or_else(|| EngineError::UnknownObject(slave.to_string()))?;
        let interpolator = Interpolator::new(&master, slave, mode, change_frequency)?;
        master.set_hook(interpolator);
        debug!(object = %master.name(), ?mode, change_frequency, "Interpolation installed");
        Ok(())
    }

    fn create_object(&self, spec: ObjectSpec, role: Role) -> EngineResult<Arc<StatusObject>> {
        let name = ObjectName::new(spec.name)?;
        let slave = role == Role::Actuator && spec.slave;
        let object = StatusObject::new(
            &self.ctx,
            name,
            role,
            spec.kind,
            spec.default,
            slave,
            spec.settings,
        )?;
        for (program, priority) in spec.priorities {
            object.set_priority_override(&program, Some(priority));
        }
        self.ctx.registry.insert(Entity::Object(object.clone()))?;
        debug!(object = %object.name(), role = %role, kind = %object.kind(), "Status object created");
        self.refresh_queries();
        Ok(object)
    }

    /// Programs selecting objects by type see a new object as soon as it exists
    fn refresh_queries(&self) {
        self.ctx.invalidate_deps();
        for program in self.programs() {
            if !program.uses_kind(ExprKind::OfType) {
                continue;
            }
            if let Err(e) = program.update_dependencies() {
                warn!(program = %program.name(), error = %e, "Cannot update dependencies");
            }
        }
    }

    /// The permanent bottom of an actuator's stack, asserting its default
    fn install_default_program(&self, actuator: &Arc<StatusObject>) -> EngineResult<Arc<Program>> {
        let on_activate: Arc<Expr> = if actuator.is_slave() {
            empty()
        } else {
            set_status(actuator, actuator.default_value().clone())
        };
        let spec = ProgramSpec::new(actuator.object_name().default_program_of().to_string())
            .priority(self.ctx.settings.default_program_priority)
            .active_condition(value(true))
            .on_activate(on_activate)
            .description(format!("Default program of {}", actuator.name()));
        self.add_program(spec)
    }

    /// Register and attach a program
    pub fn add_program(&self, spec: ProgramSpec) -> EngineResult<Arc<Program>> {
        let program = Program::new(&self.ctx, spec)?;
        self.ctx.registry.insert(Entity::Program(program.clone()))?;
        if let Err(e) = program.attach() {
            self.ctx.registry.remove(program.name());
            program.detach();
            return Err(e);
        }
        Ok(program)
    }

    /// Detach a program and forget its name
    pub fn remove_program(&self, name: &str) -> EngineResult<()> {
        let program = self
            .ctx
            .registry
            .program(name)
            .ok_or_else(|| EngineError::UnknownObject(name.to_string()))?;
        self.ctx.registry.remove(name);
        program.detach();
        info!(program = %name, "Program removed");
        Ok(())
    }

    /// Bind a standalone expression to this system so it can be evaluated
    pub fn resolve(&self, expr: &Arc<Expr>) {
        expr.resolve(&self.ctx);
    }

    pub fn lookup(&self, name: &str) -> Option<Entity> {
        self.ctx.registry.lookup(name)
    }

    pub fn object(&self, name: &str) -> Option<Arc<StatusObject>> {
        self.ctx.registry.object(name)
    }

    pub fn program(&self, name: &str) -> Option<Arc<Program>> {
        self.ctx.registry.program(name)
    }

    /// All status objects in creation order
    pub fn objects(&self) -> Vec<Arc<StatusObject>> {
        self.ctx.registry.objects()
    }

    /// All programs in creation order
    pub fn programs(&self) -> Vec<Arc<Program>> {
        self.ctx.registry.programs()
    }

    /// Block until every queued status change has been applied
    pub fn flush(&self) {
        self.ctx.worker.flush();
    }

    pub fn events(&self) -> SharedEventBus {
        self.ctx.bus.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.ctx.is_stopping()
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            taken_at: Some(Utc::now()),
            objects: self
                .objects()
                .iter()
                .map(|o| StatusObjectSnapshot::from(o.as_ref()))
                .collect(),
            programs: self
                .programs()
                .iter()
                .map(|p| ProgramSnapshot::from(p.as_ref()))
                .collect(),
        }
    }

    /// Drain the queue, stop timers and the worker, then detach programs
    ///
    /// Changes requested after this point are dropped. Idempotent.
    pub fn shutdown(&self) {
        if self.ctx.is_stopping() {
            return;
        }
        info!("Shutting down");
        self.ctx.stop();
        for program in self.programs() {
            program.detach();
        }
        for object in self.objects() {
            object.cancel_pending();
        }
        debug!("Shutdown complete");
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("objects", &self.ctx.registry.objects().len())
            .field("programs", &self.ctx.registry.programs().len())
            .field("running", &self.is_running())
            .finish()
    }
}
