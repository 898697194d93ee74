//! The `CoreContext` handle threaded through every component: stores, broker,
//! activities, secrets and configuration. There is no global mutable state;
//! each worker owns its own handle.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::activities::ActivityHandler;
use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::descriptors::RuntimeDescriptor;
use crate::outbox::OutboxStore;
use crate::store::DefinitionStore;

#[derive(Debug, Clone)]
pub struct CoreContext {
    pub definitions: Arc<dyn DefinitionStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub broker: Arc<dyn Broker>,
    pub activities: Arc<dyn ActivityHandler>,
    /// All secrets known to this worker; workflows only see the names they
    /// declare under `use.secrets`. Never logged.
    pub secrets: Value,
    pub runtime: RuntimeDescriptor,
    pub config: EngineConfig,
}

impl CoreContext {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        activities: Arc<dyn ActivityHandler>,
        secrets: Value,
        config: EngineConfig,
    ) -> Self {
        CoreContext {
            definitions,
            outbox,
            broker,
            activities,
            secrets,
            runtime: RuntimeDescriptor::current(),
            config,
        }
    }

    /// The secrets object visible to one workflow: only the declared names.
    #[must_use]
    pub fn secrets_for(&self, declared: &[String]) -> Value {
        let mut visible = Map::new();
        if let Some(all) = self.secrets.as_object() {
            for name in declared {
                if let Some(value) = all.get(name) {
                    visible.insert(name.clone(), value.clone());
                }
            }
        }
        Value::Object(visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::HttpActivities;
    use crate::broker::InMemoryBroker;
    use crate::outbox::MemoryOutboxStore;
    use crate::store::MemoryDefinitionStore;
    use serde_json::json;

    fn core(secrets: Value) -> CoreContext {
        CoreContext::new(
            Arc::new(MemoryDefinitionStore::new()),
            Arc::new(MemoryOutboxStore::new()),
            Arc::new(InMemoryBroker::new()),
            Arc::new(HttpActivities::new()),
            secrets,
            EngineConfig::default(),
        )
    }

    #[test]
    fn secrets_are_scoped_to_declared_names() {
        let core = core(json!({"apiToken": "abc", "dbPassword": "hidden"}));
        let visible = core.secrets_for(&["apiToken".to_string()]);
        assert_eq!(visible, json!({"apiToken": "abc"}));
    }

    #[test]
    fn undeclared_secrets_resolve_to_nothing() {
        let core = core(json!({"apiToken": "abc"}));
        let visible = core.secrets_for(&["missing".to_string()]);
        assert_eq!(visible, json!({}));
    }
}
