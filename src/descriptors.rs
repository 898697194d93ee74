//! Descriptor objects surfaced to expressions through the scope bundle:
//! `$workflow`, `$task`, `$runtime` and `$authorization`. These are plain
//! data carriers; serialisation into the scope is their only consumer, so
//! they hold exactly what the DSL's runtime-expression arguments expose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `$runtime`: the engine executing the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub name: String,
    pub version: String,
}

impl RuntimeDescriptor {
    #[must_use]
    pub fn current() -> Self {
        RuntimeDescriptor {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A timestamp as expressions see it: the RFC 3339 rendering alongside both
/// epoch granularities, so filters can compare instants without parsing
/// dates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamp {
    pub iso8601: String,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    pub seconds: i64,
    pub milliseconds: i64,
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(instant: DateTime<Utc>) -> Self {
        Timestamp {
            iso8601: instant.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            epoch: Epoch {
                seconds: instant.timestamp(),
                milliseconds: instant.timestamp_millis(),
            },
        }
    }
}

/// `$workflow`: identity and raw input of the running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescriptor {
    /// Instance id, unique per execution.
    pub id: String,
    /// The definition document as parsed JSON.
    pub definition: Value,
    /// Input as delivered, before the workflow-level `input.from` ran.
    pub input: Value,
    pub started_at: Timestamp,
}

/// `$task`: the node whose expression is currently being evaluated.
/// `reference` is the node's position, which doubles as a JSON pointer into
/// the definition document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub name: String,
    pub reference: String,
    pub definition: Value,
    /// Input before `input.from`.
    pub input: Value,
    /// Output before `output.as`; absent until the body has run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub started_at: Timestamp,
}

/// `$authorization`: the resolved auth scheme for the current call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationDescriptor {
    /// The scheme in use, e.g. "Bearer" or "Basic"
    pub scheme: String,
    /// The scheme's parameter (token, encoded credentials, ...)
    pub parameter: String,
}
