//! postgrest-adapter — query-builder client for a PostgREST endpoint (as
//! served by Supabase under `/rest/v1`) and the `ReplacementStore` built on it.
//!
//! API
//! - `PostgrestClient::new(supabase_url, api_key).with_token(token).from(table)`
//!   returns a [`QueryBuilder`] with `select/eq/or/order/match_columns` filters
//!   and `insert/update` writes.
//! - `QueryBuilder::execute()` → `Result<Vec<serde_json::Value>, PostgrestError>`
//!   (the `{data, error}` pair as a `Result`); `execute_as::<T>()` decodes rows.
//!
//! Notes
//! - Requests carry `apikey` plus `Authorization: Bearer <token>` so the remote
//!   store evaluates row-level security as the calling user.
//! - Writes followed by `select(..)` ask for the written rows back with
//!   `Prefer: return=representation`.

mod store;

pub use store::{PostgrestStore, DEFAULT_TABLE};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PostgrestError {
    /// The endpoint answered with a non-success status.
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    Request(String),
}

impl From<reqwest::Error> for PostgrestError {
    fn from(e: reqwest::Error) -> Self {
        PostgrestError::Transport(e.to_string())
    }
}

// Error body PostgREST returns for failed requests.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Connection settings shared by every query.
#[derive(Clone, Debug)]
pub struct PostgrestClient {
    rest_url: String,
    api_key: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl PostgrestClient {
    /// Client for `{supabase_url}/rest/v1` authenticated with the project key.
    pub fn new(supabase_url: &str, api_key: impl Into<String>) -> Self {
        Self::with_rest_url(
            format!("{}/rest/v1", supabase_url.trim_end_matches('/')),
            api_key,
        )
    }

    /// Client for an explicit PostgREST root URL.
    pub fn with_rest_url(rest_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Copy of this client that sends the caller's access token instead of
    /// the project key.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..self.clone()
        }
    }

    pub fn rest_url(&self) -> &str {
        &self.rest_url
    }

    /// Start a query against `table`.
    pub fn from(&self, table: &str) -> QueryBuilder {
        QueryBuilder {
            client: self.clone(),
            table: table.to_string(),
            method: Method::GET,
            select: None,
            filters: Vec::new(),
            order: None,
            body: None,
        }
    }

    fn headers(&self) -> Result<HeaderMap, PostgrestError> {
        let bearer = self.token.as_deref().unwrap_or(&self.api_key);
        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(&self.api_key)?);
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {bearer}"))?);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

fn header_value(v: &str) -> Result<HeaderValue, PostgrestError> {
    HeaderValue::from_str(v).map_err(|e| PostgrestError::Request(format!("bad header value: {e}")))
}

/// A single request being assembled against one table.
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    client: PostgrestClient,
    table: String,
    method: Method,
    select: Option<String>,
    filters: Vec<(String, String)>,
    order: Option<String>,
    body: Option<serde_json::Value>,
}

impl QueryBuilder {
    /// Columns to return. After `insert`/`update` this also requests the
    /// written rows back.
    pub fn select(mut self, columns: &str) -> Self {
        self.select = Some(columns.to_string());
        self
    }

    /// `column = value`.
    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filters.push((column.to_string(), format!("eq.{value}")));
        self
    }

    /// AND of `column = value` for every pair.
    pub fn match_columns(mut self, pairs: &[(&str, &str)]) -> Self {
        for (column, value) in pairs {
            self = self.eq(column, value);
        }
        self
    }

    /// OR of comma-separated PostgREST filters, e.g.
    /// `updated_at.gt.2024-01-01T00:00:00.000Z,deleted_at.gt.2024-01-01T00:00:00.000Z`.
    pub fn or(mut self, filters: &str) -> Self {
        self.filters.push(("or".to_string(), format!("({filters})")));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        let dir = if ascending { "asc" } else { "desc" };
        self.order = Some(format!("{column}.{dir}"));
        self
    }

    pub fn insert(mut self, row: serde_json::Value) -> Self {
        self.method = Method::POST;
        self.body = Some(row);
        self
    }

    pub fn update(mut self, changes: serde_json::Value) -> Self {
        self.method = Method::PATCH;
        self.body = Some(changes);
        self
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.filters.len() + 2);
        if let Some(cols) = &self.select {
            pairs.push(("select".to_string(), cols.clone()));
        }
        pairs.extend(self.filters.iter().cloned());
        if let Some(order) = &self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        pairs
    }

    /// Assemble the HTTP request without sending it.
    pub fn build(&self) -> Result<reqwest::Request, PostgrestError> {
        let url = format!("{}/{}", self.client.rest_url, self.table);
        let mut headers = self.client.headers()?;
        if self.body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            let prefer = if self.select.is_some() {
                "return=representation"
            } else {
                "return=minimal"
            };
            headers.insert("prefer", HeaderValue::from_static(prefer));
        }
        let mut rb = self
            .client
            .http
            .request(self.method.clone(), url)
            .headers(headers)
            .query(&self.query_pairs());
        if let Some(body) = &self.body {
            rb = rb.json(body);
        }
        rb.build().map_err(|e| PostgrestError::Request(e.to_string()))
    }

    /// Send the request and return the rows of the response.
    pub async fn execute(self) -> Result<Vec<serde_json::Value>, PostgrestError> {
        let req = self.build()?;
        debug!(method = %req.method(), table = %self.table, "postgrest request");
        let resp = self.client.http.execute(req).await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<serde_json::Value>(&text)
            .map_err(|e| PostgrestError::Decode(e.to_string()))?
        {
            serde_json::Value::Array(rows) => Ok(rows),
            serde_json::Value::Null => Ok(Vec::new()),
            row => Ok(vec![row]),
        }
    }

    /// Send the request and decode each returned row as `T`.
    pub async fn execute_as<T: DeserializeOwned>(self) -> Result<Vec<T>, PostgrestError> {
        self.execute()
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| PostgrestError::Decode(e.to_string())))
            .collect()
    }
}

fn api_error(status: StatusCode, text: &str) -> PostgrestError {
    let parsed = serde_json::from_str::<ApiErrorBody>(text).ok();
    let (message, code) = match parsed {
        Some(body) => {
            let message = body.message.or(body.details).unwrap_or_default();
            (message, body.code)
        }
        None => (text.trim().to_string(), None),
    };
    PostgrestError::Api {
        status: status.as_u16(),
        message,
        code,
    }
}
