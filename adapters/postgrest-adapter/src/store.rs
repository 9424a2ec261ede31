//! `ReplacementStore` backed by the remote `replacements` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Caller, ColumnValue, CoreError, NewReplacement, Replacement, ReplacementId, ReplacementPatch,
    ReplacementStore, SyncFilter,
};
use http_common::to_iso_millis;
use serde_json::{Map, Value};

use crate::{PostgrestClient, PostgrestError, QueryBuilder};

/// Default remote table name.
pub const DEFAULT_TABLE: &str = "replacements";

/// Store that translates each port call into one PostgREST request made with
/// the caller's access token.
#[derive(Clone, Debug)]
pub struct PostgrestStore {
    client: PostgrestClient,
    table: String,
}

impl PostgrestStore {
    pub fn new(client: PostgrestClient, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    fn query(&self, caller: &Caller) -> QueryBuilder {
        self.client.with_token(&caller.token).from(&self.table)
    }

    /// The list request for a caller and filter, before it is sent.
    pub fn list_query(&self, caller: &Caller, filter: &SyncFilter) -> QueryBuilder {
        let mut q = self
            .query(caller)
            .select("*")
            .eq("user_id", caller.user_id.as_str());
        if let Some(hash) = &filter.book_hash {
            q = q.eq("book_hash", hash);
        }
        if let Some(since) = filter.since {
            let iso = to_iso_millis(since);
            q = q.or(&format!("updated_at.gt.{iso},deleted_at.gt.{iso}"));
        }
        q.order("updated_at", false)
    }
}

fn map_err(e: PostgrestError) -> CoreError {
    CoreError::Repository(e.to_string())
}

fn insert_row(caller: &Caller, new: NewReplacement, now: DateTime<Utc>) -> Value {
    let mut row = Map::new();
    row.insert("user_id".into(), caller.user_id.as_str().into());
    row.insert("book_hash".into(), new.book_hash.into());
    row.insert("cfi".into(), new.cfi.map_or(Value::Null, Value::from));
    row.insert("original".into(), new.original.into());
    row.insert("replacement".into(), new.replacement.into());
    row.insert("scope".into(), new.scope.into());
    // Absent device ids are left to the column default.
    if let Some(device) = new.device_id {
        row.insert("device_id".into(), device.into());
    }
    row.insert("updated_at".into(), to_iso_millis(now).into());
    Value::Object(row)
}

fn patch_body(patch: &ReplacementPatch, now: DateTime<Utc>) -> Value {
    let mut body = Map::new();
    for (column, value) in patch.changes() {
        let v = match value {
            ColumnValue::Text(t) => t.map_or(Value::Null, Value::from),
            ColumnValue::Timestamp(ts) => ts.map_or(Value::Null, |t| to_iso_millis(t).into()),
        };
        body.insert(column.to_string(), v);
    }
    body.insert("updated_at".into(), to_iso_millis(now).into());
    Value::Object(body)
}

#[async_trait]
impl ReplacementStore for PostgrestStore {
    async fn list(
        &self,
        caller: &Caller,
        filter: &SyncFilter,
    ) -> Result<Vec<Replacement>, CoreError> {
        self.list_query(caller, filter)
            .execute_as::<Replacement>()
            .await
            .map_err(map_err)
    }

    async fn insert(
        &self,
        caller: &Caller,
        new: NewReplacement,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError> {
        let rows = self
            .query(caller)
            .insert(insert_row(caller, new, now))
            .select("*")
            .execute_as::<Replacement>()
            .await
            .map_err(map_err)?;
        Ok(rows.into_iter().next())
    }

    async fn update(
        &self,
        caller: &Caller,
        id: &ReplacementId,
        patch: &ReplacementPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError> {
        let rows = self
            .query(caller)
            .update(patch_body(patch, now))
            .match_columns(&[("id", id.as_str()), ("user_id", caller.user_id.as_str())])
            .select("*")
            .execute_as::<Replacement>()
            .await
            .map_err(map_err)?;
        Ok(rows.into_iter().next())
    }
}
