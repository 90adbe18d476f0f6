//! SQLite storage layer -- schema, datapoint history, classifications and
//! entity metadata.

pub mod alerts;
pub mod schema;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::model::{AttributeKey, AttributeUpdate, Classification, Datapoint, DatapointPeriod};
use crate::ports::{ClassificationSink, HistoryStore, WatchSource};
use crate::watch::{AttributeMeta, Entity, LifecycleEvent};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).with_context(|| format!("failed to open database at {}", path))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// History, classification and entity store over one pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Store a raw reading. A second reading at the same timestamp replaces
    /// the first.
    pub fn record_datapoint(&self, key: &AttributeKey, timestamp: i64, value: impl Into<Option<f64>>) -> Result<()> {
        let value = value.into();
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO datapoints (entity_id, attribute_name, timestamp, value)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_id, attribute_name, timestamp) DO UPDATE SET value = excluded.value",
            params![key.entity_id, key.attribute_name, timestamp, value],
        )?;
        Ok(())
    }

    /// Store the reading carried by an update. Non-numeric values are kept
    /// as a timestamp with a NULL value; updates without a value are not
    /// stored. Returns whether anything was written.
    pub fn record_update(&self, update: &AttributeUpdate) -> Result<bool> {
        match &update.value {
            None | Some(serde_json::Value::Null) => Ok(false),
            Some(_) => {
                self.record_datapoint(&update.key(), update.timestamp, update.numeric_value())?;
                Ok(true)
            }
        }
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, name, attributes_json FROM entities WHERE id = ?1",
                [id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;
        row.map(|(id, name, json)| decode_entity(id, name, &json)).transpose()
    }

    /// Insert or replace an entity, returning the lifecycle event the change
    /// amounts to.
    pub fn upsert_entity(&self, entity: &Entity) -> Result<LifecycleEvent> {
        let previous = self.get_entity(&entity.id)?;
        let attributes_json = serde_json::to_string(&entity.attributes)?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO entities (id, name, attributes_json, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                attributes_json = excluded.attributes_json,
                updated_at = excluded.updated_at",
            params![entity.id, entity.name, attributes_json],
        )?;

        Ok(match previous {
            Some(previous) => LifecycleEvent::Updated {
                entity_id: entity.id.clone(),
                previous: Some(previous.attributes),
                current: entity.attributes.clone(),
            },
            None => LifecycleEvent::Created(entity.clone()),
        })
    }

    pub fn delete_entity(&self, id: &str) -> Result<Option<LifecycleEvent>> {
        let Some(entity) = self.get_entity(id)? else {
            return Ok(None);
        };
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM entities WHERE id = ?1", [id])?;
        Ok(Some(LifecycleEvent::Deleted(entity)))
    }
}

fn decode_entity(id: String, name: String, attributes_json: &str) -> Result<Entity> {
    let attributes: Vec<AttributeMeta> = serde_json::from_str(attributes_json)
        .with_context(|| format!("corrupt attribute metadata for entity {}", id))?;
    Ok(Entity { id, name, attributes })
}

impl HistoryStore for SqliteStore {
    fn period(&self, key: &AttributeKey) -> Result<DatapointPeriod> {
        let conn = self.pool.get()?;
        let (oldest, latest) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM datapoints
             WHERE entity_id = ?1 AND attribute_name = ?2",
            params![key.entity_id, key.attribute_name],
            |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?)),
        )?;
        Ok(DatapointPeriod { oldest, latest })
    }

    fn query_points(&self, key: &AttributeKey, from: i64, to: i64) -> Result<Vec<Datapoint>> {
        if from >= to {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, value FROM datapoints
             WHERE entity_id = ?1 AND attribute_name = ?2 AND timestamp >= ?3 AND timestamp < ?4
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![key.entity_id, key.attribute_name, from, to], |row| {
            Ok(Datapoint {
                timestamp: row.get(0)?,
                value: row.get(1)?,
            })
        })?;
        let points = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    fn query_classifications(&self, key: &AttributeKey, from: i64, to: i64) -> Result<Vec<(i64, Classification)>> {
        if from >= to {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, classification FROM classifications
             WHERE entity_id = ?1 AND attribute_name = ?2 AND timestamp >= ?3 AND timestamp < ?4
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![key.entity_id, key.attribute_name, from, to], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (timestamp, label) = row?;
            match label.parse::<Classification>() {
                Ok(classification) => out.push((timestamp, classification)),
                Err(e) => tracing::warn!(%key, timestamp, error = %e, "skipping unreadable classification"),
            }
        }
        Ok(out)
    }
}

impl ClassificationSink for SqliteStore {
    fn record_classification(&self, key: &AttributeKey, classification: Classification, timestamp: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO classifications (entity_id, attribute_name, timestamp, classification)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_id, attribute_name, timestamp) DO UPDATE SET
                classification = excluded.classification,
                recorded_at = datetime('now')",
            params![key.entity_id, key.attribute_name, timestamp, classification.as_str()],
        )?;
        Ok(())
    }
}

impl WatchSource for SqliteStore {
    fn list_watched_entities(&self) -> Result<Vec<Entity>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT id, name, attributes_json FROM entities ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut entities = Vec::new();
        for row in rows {
            let (id, name, json) = row?;
            match decode_entity(id, name, &json) {
                Ok(entity) => entities.push(entity),
                Err(e) => tracing::warn!(error = %e, "skipping entity"),
            }
        }
        Ok(entities)
    }
}
