//! Workflow definition store: immutable `(name, version)`-keyed documents,
//! uploaded out-of-band and read by the parser.

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::prelude::*;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Database error: {message}"))]
    Database { message: String },

    #[snafu(display("definition {name} {version} already exists"))]
    Duplicate { name: String, version: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionRecord {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub definition: String,
}

#[async_trait]
pub trait DefinitionStore: Send + Sync + std::fmt::Debug {
    /// Insert a new definition; definitions are never mutated.
    async fn insert(&self, name: &str, version: &str, definition: &str)
        -> Result<DefinitionRecord>;
    async fn get(&self, name: &str, version: &str) -> Result<Option<DefinitionRecord>>;
    async fn list(&self) -> Result<Vec<(String, String)>>;
}

/// In-memory store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryDefinitionStore {
    inner: Mutex<HashMap<(String, String), DefinitionRecord>>,
}

impl MemoryDefinitionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn insert(
        &self,
        name: &str,
        version: &str,
        definition: &str,
    ) -> Result<DefinitionRecord> {
        let mut inner = self.inner.lock().await;
        let key = (name.to_string(), version.to_string());
        ensure!(
            !inner.contains_key(&key),
            DuplicateSnafu { name, version }
        );
        let record = DefinitionRecord {
            id: Uuid::now_v7(),
            name: name.to_string(),
            version: version.to_string(),
            definition: definition.to_string(),
        };
        inner.insert(key, record.clone());
        Ok(record)
    }

    async fn get(&self, name: &str, version: &str) -> Result<Option<DefinitionRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(&(name.to_string(), version.to_string()))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<(String, String)>> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<_> = inner.keys().cloned().collect();
        entries.sort();
        Ok(entries)
    }
}

#[derive(Debug)]
pub struct PostgresDefinitionStore {
    pool: PgPool,
}

impl PostgresDefinitionStore {
    /// Connect and initialise the schema. Statements are executed
    /// individually since PostgreSQL prepared statements don't support
    /// multiple statements.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to connect to PostgreSQL: {e}"),
            })?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: PgPool) -> Result<Self> {
        let schema_sql = include_str!("./sql/definitions_postgres.sql");
        for statement in schema_sql.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| Error::Database {
                    message: format!("Failed to execute schema statement: {e}"),
                })?;
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl DefinitionStore for PostgresDefinitionStore {
    async fn insert(
        &self,
        name: &str,
        version: &str,
        definition: &str,
    ) -> Result<DefinitionRecord> {
        let id = Uuid::now_v7();
        let result = sqlx::query(
            "INSERT INTO definitions (id, name, version, definition) VALUES ($1, $2, $3, $4)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(version)
        .bind(definition)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(DefinitionRecord {
                id,
                name: name.to_string(),
                version: version.to_string(),
                definition: definition.to_string(),
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                DuplicateSnafu { name, version }.fail()
            }
            Err(e) => Err(Error::Database {
                message: format!("Failed to insert definition: {e}"),
            }),
        }
    }

    async fn get(&self, name: &str, version: &str) -> Result<Option<DefinitionRecord>> {
        let row = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT id, name, version, definition FROM definitions WHERE name = $1 AND version = $2",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database {
            message: format!("Failed to get definition: {e}"),
        })?;

        match row {
            Some((id, name, version, definition)) => Ok(Some(DefinitionRecord {
                id: id.parse().map_err(|e| Error::Database {
                    message: format!("Malformed definition id: {e}"),
                })?,
                name,
                version,
                definition,
            })),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT name, version FROM definitions ORDER BY name, version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database {
            message: format!("Failed to list definitions: {e}"),
        })?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_inserts_and_gets() {
        let store = MemoryDefinitionStore::new();
        store.insert("hello", "0.1.0", "do: []").await.unwrap();

        let record = store.get("hello", "0.1.0").await.unwrap().unwrap();
        assert_eq!(record.definition, "do: []");
        assert!(store.get("hello", "9.9.9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_name_version_is_rejected() {
        let store = MemoryDefinitionStore::new();
        store.insert("hello", "0.1.0", "a").await.unwrap();
        let err = store.insert("hello", "0.1.0", "b").await.unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let store = MemoryDefinitionStore::new();
        store.insert("b", "1", "x").await.unwrap();
        store.insert("a", "2", "x").await.unwrap();
        store.insert("a", "1", "x").await.unwrap();
        let entries = store.list().await.unwrap();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "1".to_string()),
            ]
        );
    }
}
