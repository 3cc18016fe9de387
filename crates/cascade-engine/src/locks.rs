use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use cascade_core::error::{CascadeError, Result};

/// One cascade per entity at a time, within this process.
#[derive(Clone, Default)]
pub struct EntityLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Releases the entity when dropped.
pub struct EntityGuard {
    entity_id: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, entity_id: &str) -> Result<EntityGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|e| CascadeError::Database(format!("entity lock poisoned: {}", e)))?;
        if !held.insert(entity_id.to_string()) {
            return Err(CascadeError::EntityBusy(entity_id.to_string()));
        }
        debug!(entity_id, "Entity lock acquired");
        Ok(EntityGuard {
            entity_id: entity_id.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_locked(&self, entity_id: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(entity_id))
            .unwrap_or(false)
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.entity_id);
        }
    }
}
