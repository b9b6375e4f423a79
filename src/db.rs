use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{ffi, params, Connection, ErrorCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::parser::Item;

/// Rating stored for items the source gave no score for.
const DEFAULT_RATING: u8 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot create database directory {path:?}: {source}")]
    Dir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot open database {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("storage failure: {0}")]
    Fatal(#[from] rusqlite::Error),
}

pub fn connect(path: &Path) -> Result<Connection, StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Dir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let conn = Connection::open(path).map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS reviews (
            id          TEXT PRIMARY KEY,
            source      TEXT NOT NULL,
            external_id TEXT UNIQUE NOT NULL,
            id_origin   TEXT NOT NULL CHECK(id_origin IN ('source','content_hash')),
            author      TEXT NOT NULL,
            content     TEXT NOT NULL,
            rating      INTEGER NOT NULL CHECK(rating BETWEEN 1 AND 5),
            date        TEXT NOT NULL,
            date_raw    TEXT,
            option_text TEXT,
            images      TEXT NOT NULL DEFAULT '[]',
            answer      TEXT,
            status      TEXT,
            product_url TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reviews_product ON reviews(product_url);
        CREATE INDEX IF NOT EXISTS idx_reviews_created ON reviews(created_at);
        ",
    )?;
    Ok(())
}

// ── Saving ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub inserted: usize,
    /// Includes `failed`.
    pub skipped: usize,
    pub total: usize,
    pub failed: usize,
}

enum Failure {
    /// Row with this key already exists.
    Conflict,
    /// The database itself is unusable; abort the batch.
    Fatal,
    /// Only this row is bad.
    Item,
}

fn classify(e: &rusqlite::Error) -> Failure {
    let rusqlite::Error::SqliteFailure(err, _) = e else {
        return Failure::Item;
    };
    match err.code {
        ErrorCode::ConstraintViolation
            if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            Failure::Conflict
        }
        ErrorCode::DatabaseCorrupt
        | ErrorCode::NotADatabase
        | ErrorCode::SystemIoFailure
        | ErrorCode::DiskFull
        | ErrorCode::CannotOpen
        | ErrorCode::ReadOnly
        | ErrorCode::DatabaseBusy
        | ErrorCode::DatabaseLocked => Failure::Fatal,
        _ => Failure::Item,
    }
}

/// Insert every item in one transaction. Existing keys are skipped, never
/// updated; a fatal storage error rolls the whole batch back.
pub fn save(
    conn: &Connection,
    items: &[Item],
    product_url: Option<&str>,
    source: &str,
) -> Result<SaveReport, StoreError> {
    let now = Utc::now();
    let mut report = SaveReport {
        total: items.len(),
        ..Default::default()
    };

    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO reviews (
                id, source, external_id, id_origin, author, content, rating,
                date, date_raw, option_text, images, answer, status, product_url,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        )?;
        for item in items {
            match insert_one(&mut stmt, item, product_url, source, now) {
                Ok(()) => report.inserted += 1,
                Err(e) => match classify(&e) {
                    Failure::Conflict => {
                        debug!("Duplicate {}, skipped", item.identity_key());
                        report.skipped += 1;
                    }
                    Failure::Fatal => return Err(StoreError::Fatal(e)),
                    Failure::Item => {
                        warn!("Could not store {}: {}", item.identity_key(), e);
                        report.skipped += 1;
                        report.failed += 1;
                    }
                },
            }
        }
    }
    tx.commit()?;

    info!(
        "Saved {} of {} items ({} skipped, {} failed)",
        report.inserted, report.total, report.skipped, report.failed
    );
    Ok(report)
}

fn insert_one(
    stmt: &mut rusqlite::Statement,
    item: &Item,
    product_url: Option<&str>,
    source: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let origin = if item.source_id().is_some() {
        "source"
    } else {
        "content_hash"
    };
    let images = serde_json::to_string(&item.media_refs)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    stmt.execute(params![
        row_id(),
        source,
        item.identity_key(),
        origin,
        item.author,
        item.body,
        item.rating.unwrap_or(DEFAULT_RATING),
        stamp(item.timestamp(now)),
        item.date,
        item.option_text,
        images,
        item.answer,
        item.status,
        product_url,
        stamp(now),
    ])?;
    Ok(())
}

/// `c` followed by 24 hex characters.
fn row_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("c{}", &hex[..24])
}

fn stamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Stats ──

#[derive(Debug, Serialize)]
pub struct Stats {
    pub total: usize,
    pub by_source: BTreeMap<String, usize>,
    /// Rows keyed by a source-assigned id rather than a content hash.
    pub with_source_id: usize,
    pub products: usize,
    pub latest: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats, StoreError> {
    let total: usize = conn.query_row("SELECT COUNT(*) FROM reviews", [], |r| r.get(0))?;
    let with_source_id: usize = conn.query_row(
        "SELECT COUNT(*) FROM reviews WHERE id_origin = 'source'",
        [],
        |r| r.get(0),
    )?;
    let products: usize = conn.query_row(
        "SELECT COUNT(DISTINCT product_url) FROM reviews",
        [],
        |r| r.get(0),
    )?;
    let latest: Option<String> =
        conn.query_row("SELECT MAX(created_at) FROM reviews", [], |r| r.get(0))?;

    let mut stmt = conn.prepare("SELECT source, COUNT(*) FROM reviews GROUP BY source")?;
    let by_source = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, usize>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(Stats {
        total,
        by_source,
        with_source_id,
        products,
        latest,
    })
}
