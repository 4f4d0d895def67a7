use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

/// Opens (creating if needed) the SQLite store and brings its schema up to
/// date.
pub fn bootstrap<P: AsRef<Path>>(database_path: P) -> AppResult<DatabaseContext> {
    let db_path = database_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;
    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "attribute store ready"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

/// In-memory store with the full schema, for tests and dry runs.
pub fn open_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    configure(&connection)?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            geoname_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            name_normalized TEXT NOT NULL,
            country_code TEXT NOT NULL DEFAULT '',
            country_name TEXT,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            population INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS city_attributes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            city_id INTEGER NOT NULL,
            attribute_name TEXT NOT NULL,
            normalized_score REAL NOT NULL DEFAULT 0,
            FOREIGN KEY (city_id) REFERENCES cities(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS ingest_progress (
            job TEXT NOT NULL,
            geoname_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            PRIMARY KEY (job, geoname_id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_city_attributes_city_name
            ON city_attributes(city_id, attribute_name);
        CREATE INDEX IF NOT EXISTS idx_city_attributes_name
            ON city_attributes(attribute_name);
        CREATE INDEX IF NOT EXISTS idx_cities_name_normalized
            ON cities(name_normalized);
        "#,
    )?;

    ensure_column(connection, "city_attributes", "raw_value REAL")?;
    ensure_column(connection, "city_attributes", "updated_at TEXT")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("nested").join("test.db")).unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('cities','city_attributes','ingest_progress')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 3);
        assert!(ctx.path.ends_with("test.db"));
        assert!(column_exists(&ctx.connection, "city_attributes", "raw_value").unwrap());
        assert!(column_exists(&ctx.connection, "city_attributes", "updated_at").unwrap());
    }

    #[test]
    fn migrations_are_repeatable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("again.db");
        drop(bootstrap(&path).unwrap());
        let ctx = bootstrap(&path).unwrap();
        run_migrations(&ctx.connection).unwrap();
    }
}
