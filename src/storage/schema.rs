//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            attributes_json TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS datapoints (
            entity_id TEXT NOT NULL,
            attribute_name TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            value REAL,
            PRIMARY KEY (entity_id, attribute_name, timestamp)
        );

        CREATE TABLE IF NOT EXISTS classifications (
            entity_id TEXT NOT NULL,
            attribute_name TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            classification TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (entity_id, attribute_name, timestamp)
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            severity TEXT NOT NULL,
            assignee TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);",
    )?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;

    // v2: non-numeric updates are stored with a NULL value.
    let value_not_null: bool = conn
        .query_row(
            "SELECT \"notnull\" FROM pragma_table_info('datapoints') WHERE name = 'value'",
            [],
            |row| row.get(0),
        )?;
    if value_not_null {
        conn.execute_batch(
            "BEGIN;
            ALTER TABLE datapoints RENAME TO datapoints_v1;
            CREATE TABLE datapoints (
                entity_id TEXT NOT NULL,
                attribute_name TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                value REAL,
                PRIMARY KEY (entity_id, attribute_name, timestamp)
            );
            INSERT INTO datapoints SELECT entity_id, attribute_name, timestamp, value FROM datapoints_v1;
            DROP TABLE datapoints_v1;
            COMMIT;",
        )?;
    }
    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (2)", [])?;
    Ok(())
}
