//! The installed-package catalog, a SQLite database at `<root>/linglong.db`.
//!
//! This is the source of truth for "is X installed". Rows are unique over
//! `(appId, version, arch, channel, module)`; the committing step of an
//! install is the row insert, so two racing installs of the same ref
//! serialize on that constraint.

use std::sync::Mutex;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use rusqlite::{params, Connection};

use crate::package::{compare_versions, PackageMeta, Ref};

/// Version of the embedded schema; recorded in `appInfoDbVersion` so newer
/// daemons can migrate older databases in place.
const SCHEMA_VERSION: &str = "1.0.0";

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS installedAppInfo(
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    appId TEXT NOT NULL,
    name TEXT,
    version TEXT NOT NULL,
    arch TEXT,
    kind TEXT DEFAULT 'app',
    runtime TEXT,
    uabUrl TEXT,
    repoName TEXT,
    description TEXT,
    user TEXT,
    installType TEXT DEFAULT 'user',
    size TEXT,
    channel TEXT,
    module TEXT,
    UNIQUE(appId, version, arch, channel, module)
);
CREATE TABLE IF NOT EXISTS appInfoDbVersion(
    version TEXT PRIMARY KEY,
    description TEXT
);
"#;

const META_COLUMNS: &str =
    "appId, name, version, arch, kind, runtime, uabUrl, repoName, description, user, size, channel, module";

/// Outcome of [`Catalog::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The unique key already existed.
    AlreadyInstalled,
}

/// Row filter; unset fields widen the match.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogFilter<'a> {
    pub id: Option<&'a str>,
    pub version: Option<&'a str>,
    pub arch: Option<&'a str>,
    pub channel: Option<&'a str>,
    pub module: Option<&'a str>,
    pub user: Option<&'a str>,
}

impl<'a> CatalogFilter<'a> {
    pub fn for_id(id: &'a str) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    fn to_sql(self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        for (column, value) in [
            ("appId", self.id),
            ("version", self.version),
            ("arch", self.arch),
            ("channel", self.channel),
            ("module", self.module),
            ("user", self.user),
        ] {
            if let Some(value) = value {
                clauses.push(format!("{column} = ?"));
                args.push(value.to_string());
            }
        }
        let clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (clause, args)
    }
}

pub struct Catalog {
    // Single writer; worker threads serialize here.
    conn: Mutex<Connection>,
}

impl Catalog {
    #[context("Opening catalog at {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// An in-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .context("Creating catalog tables")?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT version FROM appInfoDbVersion ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();
        let outdated = stored.as_deref().map(|v| v < SCHEMA_VERSION).unwrap_or(true);
        if outdated {
            conn.execute(
                "INSERT OR IGNORE INTO appInfoDbVersion(version, description) VALUES(?, ?)",
                params![SCHEMA_VERSION, "catalog schema version"],
            )?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record one installed package. The caller decides the installing user.
    #[context("Recording install of {}/{}", meta.app_id, meta.version)]
    pub fn insert(&self, meta: &PackageMeta, user: &str) -> Result<InsertOutcome> {
        let conn = self.conn.lock().unwrap();
        let r = conn.execute(
            &format!("INSERT INTO installedAppInfo({META_COLUMNS}) VALUES(?,?,?,?,?,?,?,?,?,?,?,?,?)"),
            params![
                meta.app_id,
                meta.name,
                meta.version,
                meta.arch,
                meta.kind,
                meta.runtime,
                meta.uab_url,
                meta.repo_name,
                meta.description,
                user,
                meta.size,
                meta.channel,
                meta.module,
            ],
        );
        match r {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(InsertOutcome::AlreadyInstalled)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete matching rows, returning how many were removed.
    pub fn remove(&self, filter: CatalogFilter) -> Result<usize> {
        let (clause, args) = filter.to_sql();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!("DELETE FROM installedAppInfo WHERE {clause}"),
            rusqlite::params_from_iter(args),
        )?;
        Ok(n)
    }

    /// Whether anything matches. Runtime-kind ids are user independent, so
    /// the user restriction is dropped for them; privileged callers pass
    /// `user: None` to skip the restriction entirely.
    pub fn is_installed(&self, mut filter: CatalogFilter) -> Result<bool> {
        if let Some(id) = filter.id {
            if self.id_is_runtime(id)? {
                filter.user = None;
            }
        }
        Ok(!self.list(filter)?.is_empty())
    }

    /// Matching rows ordered by `(appId, version ASC)`. The version order is
    /// numeric, re-sorted in memory since SQLite compares text.
    pub fn list(&self, filter: CatalogFilter) -> Result<Vec<PackageMeta>> {
        let (clause, args) = filter.to_sql();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {META_COLUMNS} FROM installedAppInfo WHERE {clause} ORDER BY appId, ID"
        ))?;
        let mut rows = stmt
            .query_map(rusqlite::params_from_iter(args), row_to_meta)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.sort_by(|a, b| {
            a.app_id
                .cmp(&b.app_id)
                .then_with(|| compare_versions(&a.version, &b.version))
        });
        Ok(rows)
    }

    /// The installed descriptor with the greatest numeric version matching
    /// the filter; `version_prefix` restricts to dotted-prefix matches.
    pub fn latest_installed(
        &self,
        id: &str,
        version_prefix: Option<&str>,
        arch: Option<&str>,
    ) -> Result<Option<PackageMeta>> {
        let rows = self.list(CatalogFilter {
            id: Some(id),
            arch,
            ..Default::default()
        })?;
        let prefix = version_prefix.unwrap_or("");
        let mut best: Option<PackageMeta> = None;
        for row in rows {
            let Some(version) = row.parsed_version() else {
                continue;
            };
            if !version.has_prefix(prefix) {
                continue;
            }
            let better = match best.as_ref().and_then(|b| b.parsed_version()) {
                Some(best_version) => version >= best_version,
                None => true,
            };
            if better {
                best = Some(row);
            }
        }
        Ok(best)
    }

    fn id_is_runtime(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM installedAppInfo WHERE appId = ? AND kind = 'runtime'",
            params![id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<PackageMeta> {
    Ok(PackageMeta {
        app_id: row.get(0)?,
        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        version: row.get(2)?,
        arch: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        kind: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        runtime: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        uab_url: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        repo_name: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        description: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        user: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        size: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        channel: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        module: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
    })
}

/// A filter selecting exactly the key fields of a reference.
pub fn filter_for_ref(r: &Ref) -> CatalogFilter<'_> {
    CatalogFilter {
        id: Some(&r.id),
        version: None,
        arch: Some(r.arch.as_str()),
        channel: Some(&r.channel),
        module: Some(r.module.as_str()),
        user: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, version: &str, kind: &str) -> PackageMeta {
        PackageMeta {
            app_id: id.to_string(),
            version: version.to_string(),
            arch: "x86_64".to_string(),
            kind: kind.to_string(),
            channel: "linglong".to_string(),
            module: "runtime".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_is_unique() {
        let db = Catalog::open_in_memory().unwrap();
        let m = meta("org.deepin.calculator", "1.2.2", "app");
        assert_eq!(db.insert(&m, "alice").unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            db.insert(&m, "alice").unwrap(),
            InsertOutcome::AlreadyInstalled
        );
        assert_eq!(db.list(CatalogFilter::for_id(&m.app_id)).unwrap().len(), 1);
    }

    #[test]
    fn test_latest_installed_is_numeric() {
        let db = Catalog::open_in_memory().unwrap();
        db.insert(&meta("x", "5.9.1", "app"), "alice").unwrap();
        db.insert(&meta("x", "5.10.1", "app"), "alice").unwrap();
        let latest = db.latest_installed("x", None, None).unwrap().unwrap();
        assert_eq!(latest.version, "5.10.1");
        let latest = db.latest_installed("x", Some("5.9"), None).unwrap().unwrap();
        assert_eq!(latest.version, "5.9.1");
        assert!(db.latest_installed("x", Some("6"), None).unwrap().is_none());
    }

    #[test]
    fn test_runtime_is_user_independent() {
        let db = Catalog::open_in_memory().unwrap();
        db.insert(&meta("org.deepin.Runtime", "20.5.0", "runtime"), "alice")
            .unwrap();
        db.insert(&meta("org.deepin.calculator", "1.0", "app"), "alice")
            .unwrap();
        let mut filter = CatalogFilter::for_id("org.deepin.Runtime");
        filter.user = Some("bob");
        assert!(db.is_installed(filter).unwrap());
        let mut filter = CatalogFilter::for_id("org.deepin.calculator");
        filter.user = Some("bob");
        assert!(!db.is_installed(filter).unwrap());
        filter.user = Some("alice");
        assert!(db.is_installed(filter).unwrap());
    }

    #[test]
    fn test_remove_widens_on_missing_fields() {
        let db = Catalog::open_in_memory().unwrap();
        db.insert(&meta("x", "1.0", "app"), "alice").unwrap();
        db.insert(&meta("x", "2.0", "app"), "alice").unwrap();
        let removed = db.remove(CatalogFilter::for_id("x")).unwrap();
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_list_ordering() {
        let db = Catalog::open_in_memory().unwrap();
        db.insert(&meta("b", "1.10", "app"), "u").unwrap();
        db.insert(&meta("b", "1.9", "app"), "u").unwrap();
        db.insert(&meta("a", "2.0", "app"), "u").unwrap();
        let rows = db.list(CatalogFilter::default()).unwrap();
        let keys: Vec<_> = rows
            .iter()
            .map(|m| format!("{}/{}", m.app_id, m.version))
            .collect();
        assert_eq!(keys, ["a/2.0", "b/1.9", "b/1.10"]);
    }
}
