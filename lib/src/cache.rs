//! TTL cache for remote metadata queries.
//!
//! Search results are memoized per package id in a small SQLite database
//! under the user cache directory, so repeated `search`/`query` calls within
//! the validity window skip the network round trip. Installs always bypass
//! this cache.

use std::sync::Mutex;

use anyhow::{Context, Result};
use camino::Utf8Path;
use chrono::{Duration, NaiveDateTime};
use fn_error_context::context;
use rusqlite::{params, Connection, OptionalExtension};

/// How long one cached entry stays valid.
const CACHE_VALID_MINUTES: i64 = 10;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct MetaCache {
    conn: Mutex<Connection>,
}

impl MetaCache {
    #[context("Opening metadata cache in {dir}")]
    pub fn open(dir: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("AppInfoCache.db"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS appInfo(
                ID INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                data TEXT,
                timestamp TEXT
            )",
        )
        .context("Creating cache table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Return the cached payload for `key` if it is still within the
    /// validity window; expired rows are dropped on the way.
    pub fn lookup(&self, key: &str) -> Result<Option<String>> {
        self.lookup_at(key, chrono::Local::now().naive_local())
    }

    fn lookup_at(&self, key: &str, now: NaiveDateTime) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT data, timestamp FROM appInfo WHERE key = ? ORDER BY ID DESC LIMIT 1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((data, timestamp)) = row else {
            return Ok(None);
        };
        let stored = NaiveDateTime::parse_from_str(timestamp.trim(), TIMESTAMP_FORMAT)
            .with_context(|| format!("Parsing cache timestamp {timestamp:?}"))?;
        if now < stored + Duration::minutes(CACHE_VALID_MINUTES) {
            return Ok(Some(data));
        }
        conn.execute("DELETE FROM appInfo WHERE key = ?", params![key])?;
        tracing::debug!("cache entry for {key} expired");
        Ok(None)
    }

    /// Replace the cached payload for `key`. The delete and insert run in
    /// one transaction so readers never observe a missing entry.
    pub fn store(&self, key: &str, data: &str) -> Result<()> {
        self.store_at(key, data, chrono::Local::now().naive_local())
    }

    fn store_at(&self, key: &str, data: &str, now: NaiveDateTime) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM appInfo WHERE key = ?", params![key])?;
        tx.execute(
            "INSERT INTO appInfo(key, data, timestamp) VALUES(?, ?, ?)",
            params![key, data, now.format(TIMESTAMP_FORMAT).to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_ttl() {
        let cache = MetaCache::open_in_memory().unwrap();
        let t0 = NaiveDateTime::parse_from_str("2024-05-01 10:00:00", TIMESTAMP_FORMAT).unwrap();
        cache.store_at("org.x", "{\"code\":200}", t0).unwrap();
        let hit = cache.lookup_at("org.x", t0 + Duration::minutes(9)).unwrap();
        assert_eq!(hit.as_deref(), Some("{\"code\":200}"));
    }

    #[test]
    fn test_expiry() {
        let cache = MetaCache::open_in_memory().unwrap();
        let t0 = NaiveDateTime::parse_from_str("2024-05-01 10:00:00", TIMESTAMP_FORMAT).unwrap();
        cache.store_at("org.x", "data", t0).unwrap();
        let miss = cache
            .lookup_at("org.x", t0 + Duration::minutes(11))
            .unwrap();
        assert!(miss.is_none());
        // The expired row is gone even for an earlier clock.
        assert!(cache.lookup_at("org.x", t0).unwrap().is_none());
    }

    #[test]
    fn test_store_replaces() {
        let cache = MetaCache::open_in_memory().unwrap();
        let t0 = NaiveDateTime::parse_from_str("2024-05-01 10:00:00", TIMESTAMP_FORMAT).unwrap();
        cache.store_at("k", "one", t0).unwrap();
        cache.store_at("k", "two", t0).unwrap();
        assert_eq!(cache.lookup_at("k", t0).unwrap().as_deref(), Some("two"));
    }
}
