use std::sync::Arc;

use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::activities::HttpActivities;
use crate::broker::InMemoryBroker;
use crate::config::EngineConfig;
use crate::context::CoreContext;
use crate::outbox::{MemoryOutboxStore, OutboxStore, PostgresOutboxStore};
use crate::store::{DefinitionStore, MemoryDefinitionStore, PostgresDefinitionStore};

pub mod list;
pub mod serve;
pub mod start;
pub mod upload;

pub use list::{handle_list, ListArgs};
pub use serve::{handle_serve, ServeArgs};
pub use start::{handle_start, StartArgs};
pub use upload::{handle_upload, UploadArgs};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unknown db kind {kind:?} (expected \"postgres\" or \"memory\")"))]
    UnknownDbKind { kind: String },

    #[snafu(display("definition store error: {source}"))]
    Definitions { source: crate::store::Error },

    #[snafu(display("outbox store error: {source}"))]
    Outbox { source: crate::outbox::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variables prefixed with this are exposed to workflows that
/// declare the matching name under `use.secrets`.
const SECRET_ENV_PREFIX: &str = "SHRIKE_SECRET_";

fn secrets_from_env() -> Value {
    let mut secrets = Map::new();
    for (key, value) in std::env::vars() {
        if let Some(name) = key.strip_prefix(SECRET_ENV_PREFIX) {
            secrets.insert(name.to_string(), Value::String(value));
        }
    }
    Value::Object(secrets)
}

/// Wire up stores and broker per configuration and assemble the core handle.
pub async fn build_core(config: EngineConfig) -> Result<CoreContext> {
    let (definitions, outbox): (Arc<dyn DefinitionStore>, Arc<dyn OutboxStore>) =
        match config.db.kind.as_str() {
            "memory" => (
                Arc::new(MemoryDefinitionStore::new()),
                Arc::new(MemoryOutboxStore::new()),
            ),
            "postgres" => (
                Arc::new(
                    PostgresDefinitionStore::new(&config.db.url)
                        .await
                        .context(DefinitionsSnafu)?,
                ),
                Arc::new(
                    PostgresOutboxStore::new(&config.db.url)
                        .await
                        .context(OutboxSnafu)?,
                ),
            ),
            other => {
                return UnknownDbKindSnafu { kind: other }.fail();
            }
        };

    Ok(CoreContext::new(
        definitions,
        outbox,
        Arc::new(InMemoryBroker::new()),
        Arc::new(HttpActivities::new()),
        secrets_from_env(),
        config,
    ))
}
