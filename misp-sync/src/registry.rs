//! Holds the set of configured MISP instances for the process lifetime
//! (spec §4.1, §3 ownership). Immutable after construction.

use crate::error::{SyncError, SyncResult};
use crate::model::InstanceConfig;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    instances: HashMap<String, InstanceConfig>,
}

impl InstanceRegistry {
    pub fn new(instances: Vec<InstanceConfig>) -> Self {
        Self {
            instances: instances.into_iter().map(|i| (i.name.clone(), i)).collect(),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &InstanceConfig> {
        self.instances.values()
    }

    pub fn get(&self, name: &str) -> SyncResult<&InstanceConfig> {
        self.instances
            .get(name)
            .ok_or_else(|| SyncError::Config(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
