//! sqlite-adapter — SQLite implementation of the ReplacementStore port for local/dev.
//!
//! Purpose
//! - Run the sync endpoints locally without a Supabase project.
//! - Implements the `ReplacementStore` trait from the `domain` crate with the
//!   same ownership scoping and sync filter as the remote store.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - Timestamps are stored as RFC 3339 text with millisecond precision and a
//!   `Z` suffix, so lexical order matches chronological order.
//! - Ids are random UUIDv4 strings.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use domain::{
    Caller, ColumnValue, CoreError, NewReplacement, Replacement, ReplacementId, ReplacementPatch,
    ReplacementStore, SyncFilter,
};
use http_common::{parse_rfc3339, to_iso_millis};
use rusqlite::{params, Connection};

const LATEST_FOUR_DIGIT_STAMP: &str = "9999-12-31T23:59:59.999Z";

const COLUMNS: &str = "id, user_id, book_hash, cfi, original, replacement, scope, device_id, created_at, updated_at, deleted_at";

/// SQLite-backed store for local development.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path and ensure schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let conn = Connection::open(path).map_err(map_sqerr)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the database at `path`, creating missing parent directories.
    pub fn open_creating_dirs<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir).map_err(map_sqerr)?;
        }
        Self::new(path)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

fn init_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS replacements (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            book_hash TEXT NOT NULL,
            cfi TEXT,
            original TEXT NOT NULL,
            replacement TEXT NOT NULL,
            scope TEXT NOT NULL DEFAULT 'single',
            device_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_replacements_user_updated ON replacements(user_id, updated_at);
        CREATE INDEX IF NOT EXISTS idx_replacements_user_book ON replacements(user_id, book_hash);
        "#,
    )
    .map_err(map_sqerr)
}

fn map_sqerr<E: std::fmt::Display>(e: E) -> CoreError {
    CoreError::Repository(format!("sqlite error: {e}"))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, CoreError> {
    parse_rfc3339(raw).map_err(|e| CoreError::Repository(format!("bad timestamp in db: {e}")))
}

fn row_to_replacement(row: &rusqlite::Row) -> Result<Replacement, CoreError> {
    let created_at: String = row.get(8).map_err(map_sqerr)?;
    let updated_at: String = row.get(9).map_err(map_sqerr)?;
    let deleted_at: Option<String> = row.get(10).map_err(map_sqerr)?;
    Ok(Replacement {
        id: row.get(0).map_err(map_sqerr)?,
        user_id: row.get(1).map_err(map_sqerr)?,
        book_hash: row.get(2).map_err(map_sqerr)?,
        cfi: row.get(3).map_err(map_sqerr)?,
        original: row.get(4).map_err(map_sqerr)?,
        replacement: row.get(5).map_err(map_sqerr)?,
        scope: row.get(6).map_err(map_sqerr)?,
        device_id: row.get(7).map_err(map_sqerr)?,
        created_at: Some(parse_ts(&created_at)?),
        updated_at: parse_ts(&updated_at)?,
        deleted_at: deleted_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn get_owned(conn: &Connection, id: &str, user_id: &str) -> Result<Option<Replacement>, CoreError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {COLUMNS} FROM replacements WHERE id = ?1 AND user_id = ?2"
        ))
        .map_err(map_sqerr)?;
    let mut rows = stmt.query(params![id, user_id]).map_err(map_sqerr)?;
    if let Some(row) = rows.next().map_err(map_sqerr)? {
        Ok(Some(row_to_replacement(row)?))
    } else {
        Ok(None)
    }
}

#[async_trait]
impl ReplacementStore for SqliteStore {
    async fn list(
        &self,
        caller: &Caller,
        filter: &SyncFilter,
    ) -> Result<Vec<Replacement>, CoreError> {
        let conn = self.lock()?;

        // Build WHERE clause dynamically
        let mut conditions = vec!["user_id = ?1".to_string()];
        let mut params_values: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(caller.user_id.as_str().to_string())];

        if let Some(ref hash) = filter.book_hash {
            conditions.push(format!("book_hash = ?{}", params_values.len() + 1));
            params_values.push(Box::new(hash.clone()));
        }
        // Stored text sorts chronologically only within four-digit years, so
        // a cursor before year 0 matches every row and one past 9999 matches none.
        if let Some(since) = filter.since.filter(|t| t.year() >= 0) {
            let idx = params_values.len() + 1;
            conditions.push(format!("(updated_at > ?{idx} OR deleted_at > ?{idx})"));
            let bound = if since.year() > 9999 {
                LATEST_FOUR_DIGIT_STAMP.to_string()
            } else {
                to_iso_millis(since)
            };
            params_values.push(Box::new(bound));
        }

        let sql = format!(
            "SELECT {COLUMNS} FROM replacements WHERE {} ORDER BY updated_at DESC",
            conditions.join(" AND ")
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_values.iter().map(|b| b.as_ref()).collect();
        let mut rows = stmt.query(params_refs.as_slice()).map_err(map_sqerr)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            out.push(row_to_replacement(row)?);
        }
        Ok(out)
    }

    async fn insert(
        &self,
        caller: &Caller,
        new: NewReplacement,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        let stamp = to_iso_millis(now);
        conn.execute(
            "INSERT INTO replacements(id, user_id, book_hash, cfi, original, replacement, scope, device_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                caller.user_id.as_str(),
                new.book_hash,
                new.cfi,
                new.original,
                new.replacement,
                new.scope,
                new.device_id,
                stamp,
            ],
        )
        .map_err(map_sqerr)?;
        get_owned(&conn, &id, caller.user_id.as_str())
    }

    async fn update(
        &self,
        caller: &Caller,
        id: &ReplacementId,
        patch: &ReplacementPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError> {
        let conn = self.lock()?;

        let mut assignments = Vec::new();
        let mut params_values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        for (column, value) in patch.changes() {
            assignments.push(format!("{column} = ?{}", params_values.len() + 1));
            match value {
                ColumnValue::Text(t) => params_values.push(Box::new(t.map(str::to_string))),
                ColumnValue::Timestamp(ts) => params_values.push(Box::new(ts.map(to_iso_millis))),
            }
        }
        assignments.push(format!("updated_at = ?{}", params_values.len() + 1));
        params_values.push(Box::new(to_iso_millis(now)));

        let id_idx = params_values.len() + 1;
        let sql = format!(
            "UPDATE replacements SET {} WHERE id = ?{} AND user_id = ?{}",
            assignments.join(", "),
            id_idx,
            id_idx + 1
        );
        params_values.push(Box::new(id.as_str().to_string()));
        params_values.push(Box::new(caller.user_id.as_str().to_string()));

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_values.iter().map(|b| b.as_ref()).collect();
        let changed = conn
            .execute(&sql, params_refs.as_slice())
            .map_err(map_sqerr)?;
        if changed == 0 {
            return Ok(None);
        }
        get_owned(&conn, id.as_str(), caller.user_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use domain::UserId;

    fn tmp_db() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let store = SqliteStore::new(path).unwrap();
        (store, dir)
    }

    fn caller(user: &str) -> Caller {
        Caller::new(UserId::new(user).unwrap(), "unused")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn new_rep(book: &str, original: &str) -> NewReplacement {
        NewReplacement {
            book_hash: book.into(),
            cfi: None,
            original: original.into(),
            replacement: format!("{original}-fixed"),
            scope: "single".into(),
            device_id: Some("dev-1".into()),
        }
    }

    #[tokio::test]
    async fn insert_then_list_roundtrip() {
        let (store, _dir) = tmp_db();
        let u = caller("user-1");
        let row = store
            .insert(&u, new_rep("b1", "teh"), at(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.user_id, "user-1");
        assert_eq!(row.replacement, "teh-fixed");
        assert_eq!(row.created_at, Some(at(10)));
        assert_eq!(row.updated_at, at(10));
        assert!(uuid::Uuid::parse_str(&row.id).is_ok());

        let rows = store.list(&u, &SyncFilter::default()).await.unwrap();
        assert_eq!(rows, vec![row]);
    }

    #[tokio::test]
    async fn list_scopes_by_owner_book_and_since() {
        let (store, _dir) = tmp_db();
        let a = caller("user-a");
        let b = caller("user-b");
        store.insert(&a, new_rep("b1", "one"), at(1)).await.unwrap();
        store.insert(&a, new_rep("b2", "two"), at(2)).await.unwrap();
        store.insert(&a, new_rep("b1", "three"), at(3)).await.unwrap();
        store.insert(&b, new_rep("b1", "other"), at(4)).await.unwrap();

        let all = store.list(&a, &SyncFilter::default()).await.unwrap();
        let originals: Vec<_> = all.iter().map(|r| r.original.as_str()).collect();
        assert_eq!(originals, vec!["three", "two", "one"]);

        let book = SyncFilter {
            book_hash: Some("b1".into()),
            since: None,
        };
        assert_eq!(store.list(&a, &book).await.unwrap().len(), 2);

        let since = SyncFilter {
            book_hash: None,
            since: Some(at(2)),
        };
        let newer = store.list(&a, &since).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].original, "three");
    }

    #[tokio::test]
    async fn update_applies_patch_and_clears_nullable() {
        let (store, _dir) = tmp_db();
        let u = caller("user-1");
        let mut input = new_rep("b1", "teh");
        input.cfi = Some("epubcfi(/6/4)".into());
        let row = store.insert(&u, input, at(1)).await.unwrap().unwrap();
        let id = ReplacementId::new(row.id.clone()).unwrap();

        let patch = ReplacementPatch {
            replacement: Some("the".into()),
            cfi: Some(None),
            ..ReplacementPatch::default()
        };
        let updated = store.update(&u, &id, &patch, at(5)).await.unwrap().unwrap();
        assert_eq!(updated.replacement, "the");
        assert_eq!(updated.cfi, None);
        assert_eq!(updated.device_id.as_deref(), Some("dev-1"));
        assert_eq!(updated.updated_at, at(5));
        assert_eq!(updated.created_at, Some(at(1)));
    }

    #[tokio::test]
    async fn update_of_foreign_or_unknown_row_is_none() {
        let (store, _dir) = tmp_db();
        let owner = caller("owner");
        let row = store
            .insert(&owner, new_rep("b1", "x"), at(1))
            .await
            .unwrap()
            .unwrap();
        let id = ReplacementId::new(row.id).unwrap();
        let patch = ReplacementPatch::soft_delete(at(2));

        let intruder = caller("intruder");
        assert!(store.update(&intruder, &id, &patch, at(2)).await.unwrap().is_none());

        let missing = ReplacementId::new("does-not-exist").unwrap();
        assert!(store.update(&owner, &missing, &patch, at(2)).await.unwrap().is_none());

        let still = store.list(&owner, &SyncFilter::default()).await.unwrap();
        assert!(!still[0].is_deleted());
    }

    #[tokio::test]
    async fn soft_deleted_rows_stay_visible_to_sync() {
        let (store, _dir) = tmp_db();
        let u = caller("user-1");
        let row = store.insert(&u, new_rep("b1", "x"), at(1)).await.unwrap().unwrap();
        let id = ReplacementId::new(row.id).unwrap();
        store
            .update(&u, &id, &ReplacementPatch::soft_delete(at(9)), at(9))
            .await
            .unwrap();

        let filter = SyncFilter {
            book_hash: None,
            since: Some(at(5)),
        };
        let rows = store.list(&u, &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].deleted_at, Some(at(9)));
    }

    #[tokio::test]
    async fn since_beyond_four_digit_years_still_filters() {
        let (store, _dir) = tmp_db();
        let u = caller("user-1");
        store.insert(&u, new_rep("b1", "x"), at(1)).await.unwrap();
        store.insert(&u, new_rep("b1", "y"), at(2)).await.unwrap();

        let far_future = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        for since in [far_future, DateTime::<Utc>::MAX_UTC] {
            let filter = SyncFilter {
                book_hash: None,
                since: Some(since),
            };
            assert!(store.list(&u, &filter).await.unwrap().is_empty());
        }

        let far_past = SyncFilter {
            book_hash: None,
            since: Some(DateTime::<Utc>::MIN_UTC),
        };
        assert_eq!(store.list(&u, &far_past).await.unwrap().len(), 2);
    }
}
