//! SQLite persistence for request status and the issued-certificate inventory.
//!
//! Holds no key material: secrets live in the configured secret store.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};

use crate::core::error::ErrorKind;
use crate::core::types::{IssuedCertificate, RequestPhase, RequestStatus};

/// One row of the issued-certificate inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedRecord {
    pub request_name: String,
    pub serial: String,
    pub domains: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StatusStore {
    conn: Arc<Mutex<Connection>>,
}

impl StatusStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_context(|| format!("failed to open SQLite database at {}", path.display()))?;
        Self::configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set SQLite busy timeout")?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS request_status (
                name TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_error_kind TEXT,
                last_error TEXT,
                serial TEXT,
                not_after TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS issued_certificates (
                serial TEXT NOT NULL,
                request_name TEXT NOT NULL,
                domains TEXT NOT NULL,
                not_before TEXT NOT NULL,
                not_after TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                PRIMARY KEY (request_name, serial)
            );

            CREATE INDEX IF NOT EXISTS idx_issued_certificates_request
                ON issued_certificates (request_name, issued_at);
            "#,
        )
        .context("failed to initialize status schema")?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|err| anyhow!("SQLite connection poisoned: {err}"))
    }

    pub fn upsert(&self, status: &RequestStatus) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO request_status (
                name, phase, consecutive_failures, last_error_kind, last_error, serial, not_after, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(name) DO UPDATE SET
                phase = excluded.phase,
                consecutive_failures = excluded.consecutive_failures,
                last_error_kind = excluded.last_error_kind,
                last_error = excluded.last_error,
                serial = excluded.serial,
                not_after = excluded.not_after,
                updated_at = excluded.updated_at
            "#,
            params![
                status.name,
                status.phase.as_str(),
                status.consecutive_failures,
                status.last_error_kind.map(|kind| kind.as_str()),
                status.last_error,
                status.serial,
                status.not_after.map(|at| at.to_rfc3339()),
                status.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("failed to store status for {}", status.name))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<RequestStatus>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT name, phase, consecutive_failures, last_error_kind, last_error, serial, not_after, updated_at
            FROM request_status
            WHERE name = ?1
            "#,
        )?;
        stmt.query_row(params![name], Self::row_to_status)
            .optional()
            .with_context(|| format!("failed to load status for {name}"))
    }

    pub fn list(&self) -> Result<Vec<RequestStatus>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT name, phase, consecutive_failures, last_error_kind, last_error, serial, not_after, updated_at
            FROM request_status
            ORDER BY name
            "#,
        )?;
        let rows = stmt.query_map([], Self::row_to_status)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list request status")
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM request_status WHERE name = ?1", params![name])?;
        Ok(())
    }

    pub fn record_issued(&self, request_name: &str, certificate: &IssuedCertificate) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO issued_certificates (
                serial, request_name, domains, not_before, not_after, fingerprint, issued_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                certificate.serial,
                request_name,
                serde_json::to_string(&certificate.domains)?,
                certificate.not_before.to_rfc3339(),
                certificate.not_after.to_rfc3339(),
                certificate.fingerprint,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("failed to record certificate for {request_name}"))?;
        Ok(())
    }

    /// Inventory for one request, newest first.
    pub fn issued_for(&self, request_name: &str) -> Result<Vec<IssuedRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT request_name, serial, domains, not_before, not_after, fingerprint, issued_at
            FROM issued_certificates
            WHERE request_name = ?1
            ORDER BY issued_at DESC
            "#,
        )?;
        let rows = stmt.query_map(params![request_name], |row| {
            let domains: String = row.get(2)?;
            Ok(IssuedRecord {
                request_name: row.get(0)?,
                serial: row.get(1)?,
                domains: serde_json::from_str(&domains).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?,
                not_before: parse_time(row, 3)?,
                not_after: parse_time(row, 4)?,
                fingerprint: row.get(5)?,
                issued_at: parse_time(row, 6)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list issued certificates")
    }

    fn row_to_status(row: &Row<'_>) -> rusqlite::Result<RequestStatus> {
        let phase: String = row.get(1)?;
        let kind: Option<String> = row.get(3)?;
        let not_after: Option<String> = row.get(6)?;
        Ok(RequestStatus {
            name: row.get(0)?,
            phase: RequestPhase::parse(&phase).unwrap_or(RequestPhase::Pending),
            consecutive_failures: row.get(2)?,
            last_error_kind: kind.as_deref().and_then(ErrorKind::parse),
            last_error: row.get(4)?,
            serial: row.get(5)?,
            not_after: not_after
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|at| at.with_timezone(&Utc)),
            updated_at: parse_time(row, 7)?,
        })
    }
}

fn parse_time(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
        })
}
