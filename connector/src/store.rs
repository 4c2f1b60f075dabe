use crate::model::NormalizedPulse;
use async_trait::async_trait;
use connector_core::config::StorageConfig;
use connector_core::Result;
use metrics::counter;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Identity of a stored pulse. Two records with the same key are the same
/// document; loading the second replaces the first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    Identity { id: String, revision: Option<String> },
    /// Content hash, for records the feed sent without an id.
    Fingerprint(String),
}

impl NaturalKey {
    pub fn for_pulse(pulse: &NormalizedPulse) -> Result<Self> {
        match pulse.id() {
            Some(id) => Ok(NaturalKey::Identity {
                id: scalar_text(id),
                revision: pulse.revision().map(scalar_text),
            }),
            None => {
                let canonical = serde_json::to_vec(&canonical_map(&pulse.body))?;
                Ok(NaturalKey::Fingerprint(format!(
                    "{:x}",
                    Sha256::digest(&canonical)
                )))
            }
        }
    }

    pub fn pulse_id(&self) -> Option<&str> {
        match self {
            NaturalKey::Identity { id, .. } => Some(id),
            NaturalKey::Fingerprint(_) => None,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::Identity { id, revision } => {
                write!(f, "id:{id}|rev:{}", revision.as_deref().unwrap_or("-"))
            }
            NaturalKey::Fingerprint(hash) => write!(f, "fingerprint:{hash}"),
        }
    }
}

/// Key-sorted copy, whatever map ordering serde_json was built with.
fn canonical_map(map: &Map<String, Value>) -> Map<String, Value> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(key, value)| (key.clone(), canonical(value)))
        .collect()
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(canonical_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Destination for normalized pulses.
#[async_trait]
pub trait PulseSink: Send + Sync {
    /// Insert the pulse, or replace whatever is stored under `key`.
    async fn upsert(&self, key: &NaturalKey, pulse: &NormalizedPulse) -> Result<()>;

    fn describe(&self) -> String;
}

/// Document collection kept in Postgres: `database` is a schema, `collection`
/// a table holding one JSONB document per natural key.
pub struct PgStore {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PgStore {
    #[instrument(skip(config), fields(database = %config.database, collection = %config.collection))]
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        let store = Self {
            pool,
            schema: config.database.clone(),
            table: config.collection.clone(),
        };

        store.health_check().await?;
        store.ensure_collection().await?;
        store.ensure_indexes().await;

        info!(collection = %store.describe(), "Storage ready");
        Ok(store)
    }

    // Names were validated as plain identifiers when the config was loaded.
    fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_collection(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                natural_key TEXT PRIMARY KEY,
                pulse_id TEXT,
                revision TEXT,
                source TEXT NOT NULL,
                run_id UUID NOT NULL,
                page_no INTEGER NOT NULL,
                ingested_at TIMESTAMPTZ NOT NULL,
                document JSONB NOT NULL
            )
            "#,
            self.qualified()
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Index failures are tolerated; upserts still work without them.
    async fn ensure_indexes(&self) {
        for column in ["pulse_id", "ingested_at"] {
            let statement = format!(
                "CREATE INDEX IF NOT EXISTS \"{table}_{column}_idx\" ON {qualified} ({column})",
                table = self.table,
                qualified = self.qualified(),
            );

            match sqlx::query(&statement).execute(&self.pool).await {
                Ok(_) => debug!(column, "Index ensured"),
                Err(e) => warn!(column, error = %e, "Index creation failed"),
            }
        }
    }
}

#[async_trait]
impl PulseSink for PgStore {
    async fn upsert(&self, key: &NaturalKey, pulse: &NormalizedPulse) -> Result<()> {
        let revision = match key {
            NaturalKey::Identity { revision, .. } => revision.as_deref(),
            NaturalKey::Fingerprint(_) => None,
        };

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                natural_key, pulse_id, revision, source, run_id, page_no, ingested_at, document
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (natural_key) DO UPDATE SET
                pulse_id = EXCLUDED.pulse_id,
                revision = EXCLUDED.revision,
                source = EXCLUDED.source,
                run_id = EXCLUDED.run_id,
                page_no = EXCLUDED.page_no,
                ingested_at = EXCLUDED.ingested_at,
                document = EXCLUDED.document
            "#,
            self.qualified()
        ))
        .bind(key.to_string())
        .bind(key.pulse_id())
        .bind(revision)
        .bind(&pulse.envelope.source)
        .bind(pulse.envelope.run_id)
        .bind(i32::try_from(pulse.envelope.page_no).unwrap_or(i32::MAX))
        .bind(pulse.envelope.ingested_at)
        .bind(sqlx::types::Json(pulse.to_document()))
        .execute(&self.pool)
        .await?;

        counter!("connector_pulses_upserted").increment(1);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}
