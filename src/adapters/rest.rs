//! PostgREST adapter: Implementation of `RemoteTable` over HTTP.
//!
//! Requests go to `{base_url}/rest/v1/{table}` with the API key sent both
//! as `apikey` and as a bearer token. Filters are encoded in PostgREST's
//! query syntax by [`query_pairs`], which is pure and unit tested.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;

use crate::ports::{Filter, Query, RemoteTable, Row, TableError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest raw (non-JSON) error body carried into a `TableError`.
const MAX_RAW_ERROR_CHARS: usize = 200;

/// Error type for the PostgREST adapter.
#[derive(Debug, thiserror::Error)]
pub enum RestTableError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(TableError),

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<RestTableError> for TableError {
    fn from(e: RestTableError) -> Self {
        match e {
            RestTableError::Api(inner) => inner,
            RestTableError::Http(http) => {
                let code = http
                    .status()
                    .map_or_else(|| "HTTP".to_string(), |s| s.as_u16().to_string());
                TableError::new(code, http.to_string())
            }
            RestTableError::Decode(decode) => {
                TableError::new("PGRST_DECODE", format!("Invalid response body: {decode}"))
            }
        }
    }
}

/// PostgREST table client.
pub struct RestTables {
    client: Client,
    base_url: String,
    api_key: String,
}

impl fmt::Debug for RestTables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestTables")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl RestTables {
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, RestTableError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("medprofile/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.endpoint(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Vec<Row>, RestTableError> {
        let response = request.send().await?;
        read_rows(response).await
    }
}

async fn read_rows(response: Response) -> Result<Vec<Row>, RestTableError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let error = parse_api_error(status.as_u16(), &body);
        tracing::debug!(status = status.as_u16(), code = %error.code, "Table request rejected");
        return Err(RestTableError::Api(error));
    }
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&body)?)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Turn a failed response into a `TableError`, preferring PostgREST's
/// `{code, message}` body and falling back to the HTTP status.
#[must_use]
pub fn parse_api_error(status: u16, body: &str) -> TableError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => TableError::new(
            parsed.code.unwrap_or_else(|| status.to_string()),
            parsed.message.unwrap_or_default(),
        ),
        Err(_) => TableError::new(
            status.to_string(),
            body.trim().chars().take(MAX_RAW_ERROR_CHARS).collect::<String>(),
        ),
    }
}

/// Render a scalar the way PostgREST expects it in a filter.
fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Quote a value used inside `in.(...)` or `or=(...)` when it contains
/// characters that are reserved there.
fn list_item(raw: &str) -> String {
    if raw.contains([',', '.', ':', '(', ')', '"', ' ', '\\']) {
        format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        raw.to_string()
    }
}

fn in_list(values: &[Value]) -> String {
    let items: Vec<String> = values.iter().map(|v| list_item(&scalar(v))).collect();
    format!("in.({})", items.join(","))
}

/// `column.op.value` form used inside logical groups.
fn condition(filter: &Filter) -> String {
    match filter {
        Filter::Eq(column, Value::Null) => format!("{column}.is.null"),
        Filter::Eq(column, value) => format!("{column}.eq.{}", list_item(&scalar(value))),
        Filter::In(column, values) => format!("{column}.{}", in_list(values)),
        Filter::ILike(column, pattern) => {
            format!("{column}.ilike.{}", list_item(&pattern.replace('%', "*")))
        }
        Filter::Or(filters) => format!("or({})", group(filters)),
    }
}

fn group(filters: &[Filter]) -> String {
    filters.iter().map(condition).collect::<Vec<_>>().join(",")
}

/// Query-string pairs for a set of filters.
#[must_use]
pub fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Eq(column, Value::Null) => (column.clone(), "is.null".to_string()),
            Filter::Eq(column, value) => (column.clone(), format!("eq.{}", scalar(value))),
            Filter::In(column, values) => (column.clone(), in_list(values)),
            Filter::ILike(column, pattern) => {
                (column.clone(), format!("ilike.{}", pattern.replace('%', "*")))
            }
            Filter::Or(filters) => ("or".to_string(), format!("({})", group(filters))),
        })
        .collect()
}

/// Query-string pairs for a select.
#[must_use]
pub fn query_pairs(query: &Query) -> Vec<(String, String)> {
    let mut pairs = vec![("select".to_string(), "*".to_string())];
    pairs.extend(filter_pairs(&query.filters));
    if let Some(order) = &query.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        pairs.push(("order".to_string(), format!("{}.{direction}", order.column)));
    }
    pairs
}

impl RemoteTable for RestTables {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, TableError> {
        let request = self.request(Method::GET, table).query(&query_pairs(query));
        Ok(self.send(request).await?)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, TableError> {
        let request = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&rows);
        Ok(self.send(request).await?)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Row,
    ) -> Result<Vec<Row>, TableError> {
        let request = self
            .request(Method::PATCH, table)
            .query(&filter_pairs(filters))
            .header("Prefer", "return=representation")
            .json(&patch);
        Ok(self.send(request).await?)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), TableError> {
        let request = self
            .request(Method::DELETE, table)
            .query(&filter_pairs(filters));
        self.send(request).await?;
        Ok(())
    }
}
