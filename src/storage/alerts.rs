//! Persistent alert log backing the alert sink.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use super::Pool;
use crate::detect::Severity;
use crate::ports::AlertSink;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AlertManager {
    pool: Pool,
}

impl AlertManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Most recent alerts first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, message, severity, assignee, created_at FROM alerts
             ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut alerts = Vec::new();
        for row in rows {
            let (id, title, message, severity, assignee, created_at) = row?;
            alerts.push(Alert {
                id: Uuid::parse_str(&id)?,
                title,
                message,
                severity: parse_severity(&severity),
                assignee,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            });
        }
        Ok(alerts)
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "high" => Severity::High,
        "medium" => Severity::Medium,
        _ => Severity::Low,
    }
}

impl AlertSink for AlertManager {
    fn create_alert(&self, title: &str, message: &str, severity: Severity) -> Result<Uuid> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO alerts (id, title, message, severity, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.to_string(), title, message, severity.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    fn assign_alert(&self, id: Uuid, assignee: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE alerts SET assignee = ?1 WHERE id = ?2",
            params![assignee, id.to_string()],
        )?;
        if changed == 0 {
            bail!("alert {} not found", id);
        }
        Ok(())
    }
}
