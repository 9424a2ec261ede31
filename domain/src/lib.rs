//! Domain library for the replacement sync service.
//!
//! Holds the row and input types, the storage port (trait), the orchestration
//! service and error definitions. Adapters (PostgREST, SQLite) and HTTP
//! concerns stay out of this crate; it only depends on serde/chrono for the
//! row shape and async-trait for the port.

use std::error::Error;
use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Scope assigned to a replacement when the client does not send one.
pub const DEFAULT_SCOPE: &str = "single";

/// Identifier of a stored replacement row.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplacementId(String);

impl ReplacementId {
    pub fn new<S: Into<String>>(s: S) -> Result<Self, CoreError> {
        let val = s.into();
        if val.trim().is_empty() {
            return Err(CoreError::InvalidId);
        }
        Ok(Self(val))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of the authenticated owner of a row.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new<S: Into<String>>(s: S) -> Result<Self, CoreError> {
        let val = s.into();
        if val.trim().is_empty() {
            return Err(CoreError::InvalidUserId);
        }
        Ok(Self(val))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The authenticated principal a request runs as.
///
/// `token` is the caller's bearer token. Remote stores forward it so that
/// row-level security is evaluated as the user; local stores ignore it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub token: String,
}

impl Caller {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

/// One row of the `replacements` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub id: String,
    pub user_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub book_hash: String,
    #[serde(default)]
    pub cfi: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub original: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub replacement: String,
    /// Legacy rows may hold `NULL`; those read back as [`DEFAULT_SCOPE`].
    #[serde(default = "default_scope", deserialize_with = "null_as_default_scope")]
    pub scope: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Stamped by the server on every write; drives incremental sync.
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker. Deleted rows are still returned to syncing clients.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Replacement {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

fn null_as_default_scope<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(|v| v.unwrap_or_else(default_scope))
}

/// Validated input for creating a replacement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewReplacement {
    pub book_hash: String,
    pub cfi: Option<String>,
    pub original: String,
    pub replacement: String,
    pub scope: String,
    pub device_id: Option<String>,
}

/// Create input as sent by the client, before validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ReplacementDraft {
    #[serde(default)]
    pub book_hash: Option<String>,
    #[serde(default)]
    pub cfi: Option<String>,
    #[serde(default)]
    pub original: Option<String>,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Partial update of a replacement.
///
/// Nullable columns are tri-state: `None` leaves the column untouched,
/// `Some(None)` clears it and `Some(Some(v))` sets it. The other text columns
/// may be omitted but not set to `null`. Identity columns and `updated_at`
/// are not part of the patch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ReplacementPatch {
    #[serde(default, deserialize_with = "present")]
    pub book_hash: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub cfi: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub original: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub replacement: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub scope: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub device_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

// Distinguishes an explicit `null` from an absent key.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// A key that is present must carry a value; `null` is a type error.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// A single column assignment produced by a patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnValue<'a> {
    Text(Option<&'a str>),
    Timestamp(Option<DateTime<Utc>>),
}

impl ReplacementPatch {
    /// Patch that marks a row as deleted at the given instant.
    pub fn soft_delete(at: DateTime<Utc>) -> Self {
        Self {
            deleted_at: Some(Some(at)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes().is_empty()
    }

    /// Column assignments in table order, excluding `updated_at`.
    pub fn changes(&self) -> Vec<(&'static str, ColumnValue<'_>)> {
        let mut out = Vec::new();
        if let Some(v) = &self.book_hash {
            out.push(("book_hash", ColumnValue::Text(Some(v.as_str()))));
        }
        if let Some(v) = &self.cfi {
            out.push(("cfi", ColumnValue::Text(v.as_deref())));
        }
        if let Some(v) = &self.original {
            out.push(("original", ColumnValue::Text(Some(v.as_str()))));
        }
        if let Some(v) = &self.replacement {
            out.push(("replacement", ColumnValue::Text(Some(v.as_str()))));
        }
        if let Some(v) = &self.scope {
            out.push(("scope", ColumnValue::Text(Some(v.as_str()))));
        }
        if let Some(v) = &self.device_id {
            out.push(("device_id", ColumnValue::Text(v.as_deref())));
        }
        if let Some(v) = self.deleted_at {
            out.push(("deleted_at", ColumnValue::Timestamp(v)));
        }
        out
    }

    /// Apply the patch to an in-memory row and stamp `updated_at`.
    pub fn apply_to(&self, row: &mut Replacement, now: DateTime<Utc>) {
        if let Some(v) = &self.book_hash {
            row.book_hash = v.clone();
        }
        if let Some(v) = &self.cfi {
            row.cfi = v.clone();
        }
        if let Some(v) = &self.original {
            row.original = v.clone();
        }
        if let Some(v) = &self.replacement {
            row.replacement = v.clone();
        }
        if let Some(v) = &self.scope {
            row.scope = v.clone();
        }
        if let Some(v) = &self.device_id {
            row.device_id = v.clone();
        }
        if let Some(v) = self.deleted_at {
            row.deleted_at = v;
        }
        row.updated_at = now;
    }
}

/// Incremental sync filter for listing a caller's replacements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncFilter {
    /// Restrict to one book.
    pub book_hash: Option<String>,
    /// Only rows updated or deleted strictly after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl SyncFilter {
    /// Whether a row owned by the caller passes the filter.
    pub fn matches(&self, row: &Replacement) -> bool {
        if let Some(hash) = &self.book_hash {
            if row.book_hash != *hash {
                return false;
            }
        }
        match self.since {
            Some(since) => row.updated_at > since || row.deleted_at.is_some_and(|d| d > since),
            None => true,
        }
    }
}

/// Time source abstraction to make code testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Storage port for the `replacements` table.
///
/// Every operation is scoped to `caller.user_id`.
#[async_trait]
pub trait ReplacementStore: Send + Sync {
    /// Rows owned by the caller that pass `filter`, newest `updated_at` first.
    /// Soft-deleted rows are included.
    async fn list(&self, caller: &Caller, filter: &SyncFilter)
        -> Result<Vec<Replacement>, CoreError>;
    /// Insert a row for the caller stamped with `now`.
    async fn insert(
        &self,
        caller: &Caller,
        new: NewReplacement,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError>;
    /// Apply `patch` and `updated_at = now` to the caller's row with `id`.
    /// Returns `None` when no row matched.
    async fn update(
        &self,
        caller: &Caller,
        id: &ReplacementId,
        patch: &ReplacementPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError>;
}

/// Core domain errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    MissingFields,
    InvalidId,
    InvalidUserId,
    Repository(String),
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::MissingFields => write!(f, "Missing required fields"),
            CoreError::InvalidId => write!(f, "Missing id"),
            CoreError::InvalidUserId => write!(f, "invalid user id"),
            CoreError::Repository(msg) => write!(f, "repository error: {}", msg),
        }
    }
}

impl Error for CoreError {}

pub mod adapters;
pub mod service;
pub mod validate;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(updated_secs: i64, deleted_secs: Option<i64>) -> Replacement {
        Replacement {
            id: "r-1".into(),
            user_id: "user-1".into(),
            book_hash: "b1".into(),
            cfi: None,
            original: "old".into(),
            replacement: "new".into(),
            scope: DEFAULT_SCOPE.into(),
            device_id: None,
            created_at: None,
            updated_at: Utc.timestamp_opt(updated_secs, 0).unwrap(),
            deleted_at: deleted_secs.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        }
    }

    #[test]
    fn ids_reject_blank() {
        assert!(ReplacementId::new("r-1").is_ok());
        assert!(matches!(ReplacementId::new(""), Err(CoreError::InvalidId)));
        assert!(matches!(UserId::new("  "), Err(CoreError::InvalidUserId)));
    }

    #[test]
    fn patch_distinguishes_null_from_absent() {
        let patch: ReplacementPatch =
            serde_json::from_value(serde_json::json!({"cfi": null, "replacement": "x"})).unwrap();
        assert_eq!(patch.cfi, Some(None));
        assert_eq!(patch.device_id, None);
        assert_eq!(patch.replacement.as_deref(), Some("x"));
    }

    #[test]
    fn patch_rejects_null_for_required_columns() {
        for column in ["book_hash", "original", "replacement", "scope"] {
            let body = serde_json::json!({ column: null });
            let err = serde_json::from_value::<ReplacementPatch>(body).unwrap_err();
            assert!(err.to_string().contains("null"), "{column}: {err}");
        }
        let patch: ReplacementPatch =
            serde_json::from_value(serde_json::json!({"scope": "book"})).unwrap();
        assert_eq!(patch.scope.as_deref(), Some("book"));
    }

    #[test]
    fn patch_ignores_identity_columns() {
        let patch: ReplacementPatch = serde_json::from_value(serde_json::json!({
            "id": "other",
            "user_id": "someone-else",
            "updated_at": "2020-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn filter_since_matches_updates_and_deletions() {
        let since = Utc.timestamp_opt(100, 0).unwrap();
        let filter = SyncFilter {
            book_hash: None,
            since: Some(since),
        };
        assert!(filter.matches(&row(101, None)));
        assert!(!filter.matches(&row(100, None)));
        assert!(filter.matches(&row(50, Some(150))));
        assert!(!filter.matches(&row(50, Some(60))));
    }

    #[test]
    fn filter_book_hash_scopes_rows() {
        let filter = SyncFilter {
            book_hash: Some("b2".into()),
            since: None,
        };
        assert!(!filter.matches(&row(1, None)));
    }

    #[test]
    fn row_deserializes_with_defaults() {
        let r: Replacement = serde_json::from_value(serde_json::json!({
            "id": "r-1",
            "user_id": "user-1",
            "book_hash": "b1",
            "original": "old",
            "replacement": "new",
            "updated_at": "2024-05-01T10:00:00.123456+00:00"
        }))
        .unwrap();
        assert_eq!(r.scope, "single");
        assert!(r.cfi.is_none());
        assert!(!r.is_deleted());
    }

    #[test]
    fn row_tolerates_null_text_columns() {
        let r: Replacement = serde_json::from_value(serde_json::json!({
            "id": "r-1",
            "user_id": "user-1",
            "book_hash": "b1",
            "cfi": null,
            "original": null,
            "replacement": "new",
            "scope": null,
            "device_id": null,
            "updated_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(r.scope, DEFAULT_SCOPE);
        assert_eq!(r.original, "");
        assert_eq!(r.replacement, "new");
    }
}
