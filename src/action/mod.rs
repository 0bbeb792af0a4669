//! Named actions that peers can invoke, and the bookkeeping for invocations this side initiated.

use std::collections::hash_map::Entry;
use std::sync::Arc;
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

pub mod action_definition;
pub mod invocation;
pub mod outcome;

pub use action_definition::{ActionCall, ActionDefinition, ActionHandler, Authorization};

/// Metadata of an `action-invoke` message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeMetadata {
    pub name: String,
    pub iid: String,
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<FxHashMap<String, Arc<ActionDefinition>>>,
}

impl ActionRegistry {
    /// Registering a name twice is an error, and the first registration stays in effect
    pub async fn register(&self, name: &str, authorization: Authorization, handler: Arc<dyn ActionHandler>) -> anyhow::Result<()> {
        match self.actions.write().await
            .entry(name.to_string())
        {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second action named {:?}, keeping the first", name))
            }
            Entry::Vacant(e) => {
                debug!("registering action {:?} with {:?}", name, authorization);
                e.insert(Arc::new(ActionDefinition {
                    name: name.to_string(),
                    authorization,
                    handler,
                }));
                Ok(())
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ActionDefinition>> {
        self.actions.read().await
            .get(name)
            .cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.actions.read().await
            .contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names = self.actions.read().await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}
