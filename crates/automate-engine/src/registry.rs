//! Name lookup for status objects and programs

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::program::Program;
use crate::status::StatusObject;

/// Anything that can be looked up by name
#[derive(Clone)]
pub enum Entity {
    Object(Arc<StatusObject>),
    Program(Arc<Program>),
}

impl Entity {
    pub fn name(&self) -> &str {
        match self {
            Entity::Object(o) => o.name(),
            Entity::Program(p) => p.name(),
        }
    }

    fn order_key(&self) -> u64 {
        match self {
            Entity::Object(o) => o.id().0,
            Entity::Program(p) => p.id().0,
        }
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Object(o) => write!(f, "Object({})", o.name()),
            Entity::Program(p) => write!(f, "Program({})", p.name()),
        }
    }
}

/// One namespace shared by status objects and programs
pub(crate) struct Registry {
    entries: DashMap<String, Entity>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Bind a name; names are never silently replaced
    pub fn insert(&self, entity: Entity) -> EngineResult<()> {
        let name = entity.name().to_string();
        match self.entries.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::DuplicateName(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(name = %name, "Registered {:?}", entity);
                slot.insert(entity);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Entity> {
        let found = self.entries.get(name).map(|e| e.clone());
        trace!(name = %name, found = found.is_some(), "Registry lookup");
        found
    }

    pub fn object(&self, name: &str) -> Option<Arc<StatusObject>> {
        match self.lookup(name)? {
            Entity::Object(o) => Some(o),
            Entity::Program(_) => None,
        }
    }

    pub fn program(&self, name: &str) -> Option<Arc<Program>> {
        match self.lookup(name)? {
            Entity::Program(p) => Some(p),
            Entity::Object(_) => None,
        }
    }

    pub fn remove(&self, name: &str) -> Option<Entity> {
        self.entries.remove(name).map(|(_, e)| e)
    }

    /// All status objects in creation order
    pub fn objects(&self) -> Vec<Arc<StatusObject>> {
        self.sorted()
            .into_iter()
            .filter_map(|e| match e {
                Entity::Object(o) => Some(o),
                Entity::Program(_) => None,
            })
            .collect()
    }

    /// All programs in creation order
    pub fn programs(&self) -> Vec<Arc<Program>> {
        self.sorted()
            .into_iter()
            .filter_map(|e| match e {
                Entity::Program(p) => Some(p),
                Entity::Object(_) => None,
            })
            .collect()
    }

    fn sorted(&self) -> Vec<Entity> {
        let mut all: Vec<Entity> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(Entity::order_key);
        all
    }
}
