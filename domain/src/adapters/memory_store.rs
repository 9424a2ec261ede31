use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Caller, CoreError, NewReplacement, Replacement, ReplacementId, ReplacementPatch,
    ReplacementStore, SyncFilter,
};

/// Simple in-memory store. Rows are keyed by id behind a single mutex.
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<String, Replacement>>,
    next_id: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Seed a row as-is (tests and fixtures).
    pub fn seed(&self, row: Replacement) -> Result<(), CoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        rows.insert(row.id.clone(), row);
        Ok(())
    }

    fn reserve_id(&self) -> String {
        format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplacementStore for InMemoryStore {
    async fn list(
        &self,
        caller: &Caller,
        filter: &SyncFilter,
    ) -> Result<Vec<Replacement>, CoreError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        let mut out: Vec<Replacement> = rows
            .values()
            .filter(|r| r.user_id == caller.user_id.as_str() && filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn insert(
        &self,
        caller: &Caller,
        new: NewReplacement,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError> {
        let row = Replacement {
            id: self.reserve_id(),
            user_id: caller.user_id.as_str().to_string(),
            book_hash: new.book_hash,
            cfi: new.cfi,
            original: new.original,
            replacement: new.replacement,
            scope: new.scope,
            device_id: new.device_id,
            created_at: Some(now),
            updated_at: now,
            deleted_at: None,
        };
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        rows.insert(row.id.clone(), row.clone());
        Ok(Some(row))
    }

    async fn update(
        &self,
        caller: &Caller,
        id: &ReplacementId,
        patch: &ReplacementPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?;
        match rows.get_mut(id.as_str()) {
            Some(row) if row.user_id == caller.user_id.as_str() => {
                patch.apply_to(row, now);
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserId;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn caller(id: &str) -> Caller {
        Caller::new(UserId::new(id).unwrap(), "t")
    }

    fn new_row(book: &str) -> NewReplacement {
        NewReplacement {
            book_hash: book.into(),
            cfi: None,
            original: "old".into(),
            replacement: "new".into(),
            scope: "single".into(),
            device_id: Some("dev-1".into()),
        }
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_scopes_by_user() {
        let store = InMemoryStore::new();
        let me = caller("user-1");
        store.insert(&me, new_row("b1"), at(10)).await.unwrap();
        store.insert(&me, new_row("b1"), at(30)).await.unwrap();
        store.insert(&me, new_row("b2"), at(20)).await.unwrap();
        store
            .insert(&caller("user-2"), new_row("b1"), at(40))
            .await
            .unwrap();

        let rows = store.list(&me, &SyncFilter::default()).await.unwrap();
        let stamps: Vec<_> = rows.iter().map(|r| r.updated_at).collect();
        assert_eq!(stamps, vec![at(30), at(20), at(10)]);

        let filter = SyncFilter {
            book_hash: Some("b1".into()),
            since: Some(at(15)),
        };
        let rows = store.list(&me, &filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].updated_at, at(30));
    }

    #[tokio::test]
    async fn update_applies_patch_and_clears_nullable() {
        let store = InMemoryStore::new();
        let me = caller("user-1");
        let row = store.insert(&me, new_row("b1"), at(1)).await.unwrap().unwrap();
        let id = ReplacementId::new(row.id).unwrap();
        let patch = ReplacementPatch {
            replacement: Some("newer".into()),
            device_id: Some(None),
            ..ReplacementPatch::default()
        };
        let updated = store.update(&me, &id, &patch, at(5)).await.unwrap().unwrap();
        assert_eq!(updated.replacement, "newer");
        assert_eq!(updated.device_id, None);
        assert_eq!(updated.updated_at, at(5));
    }

    #[tokio::test]
    async fn update_missing_row_returns_none() {
        let store = InMemoryStore::new();
        let id = ReplacementId::new("nope").unwrap();
        let out = store
            .update(&caller("user-1"), &id, &ReplacementPatch::default(), at(1))
            .await
            .unwrap();
        assert!(out.is_none());
    }
}
