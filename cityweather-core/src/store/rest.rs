use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::retry::{RetryConfig, with_retry};

use super::{Filter, Query, RecordStore, Row, StoreError, Table};

/// Client for a hosted PostgREST-style backend (`{base}/rest/v1/{table}`).
#[derive(Debug, Clone)]
pub struct RestStore {
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    timeout: Duration,
    retry: RetryConfig,
    http: Client,
}

impl RestStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(StoreError::InvalidConfig(format!(
                "store url must start with http:// or https://, got '{base_url}'"
            )));
        }

        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url,
            api_key: api_key.into(),
            access_token: None,
            timeout,
            retry: RetryConfig::default(),
            http,
        })
    }

    /// Act on behalf of a signed-in user instead of the anonymous key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, method: Method, table: Table, params: &[(String, String)]) -> RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.base_url, table.as_str());
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);

        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .query(params)
    }

    async fn execute(&self, req: RequestBuilder) -> Result<String, StoreError> {
        let res = req.send().await.map_err(|e| self.transport_error(e))?;

        let status = res.status();
        let body = res.text().await.map_err(|e| self.transport_error(e))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(status_error(status, &body))
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> StoreError {
        if e.is_timeout() { StoreError::Timeout(self.timeout) } else { StoreError::Network(e) }
    }
}

#[derive(Debug, Deserialize)]
struct PgError {
    message: Option<String>,
    code: Option<String>,
}

fn status_error(status: StatusCode, body: &str) -> StoreError {
    let message = match serde_json::from_str::<PgError>(body) {
        Ok(PgError { message: Some(msg), code: Some(code) }) => format!("{msg} ({code})"),
        Ok(PgError { message: Some(msg), .. }) => msg,
        _ => truncate_body(body),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::CONFLICT => StoreError::Conflict(message),
        _ => StoreError::Api { status: status.as_u16(), message },
    }
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|Filter::Eq { column, value }| (column.clone(), format!("eq.{}", param_text(value))))
        .collect()
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(filter_params(&query.filters));

    if let Some(order) = &query.order {
        let dir = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{dir}", order.column)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }

    params
}

#[async_trait]
impl RecordStore for RestStore {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let params = query_params(query);
        let params = &params;
        let table = query.table;

        tracing::debug!(%table, ?params, "store select");

        let body = with_retry(&self.retry, move || {
            self.execute(self.request(Method::GET, table, params))
        })
        .await?;

        serde_json::from_str::<Vec<Row>>(&body)
            .map_err(|e| StoreError::Decode(format!("{table} response: {e}")))
    }

    async fn insert(&self, table: Table, row: Row) -> Result<(), StoreError> {
        tracing::debug!(%table, "store insert");

        let req = self
            .request(Method::POST, table, &[])
            .header("Prefer", "return=minimal")
            .json(&row);

        self.execute(req).await.map(|_| ())
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<(), StoreError> {
        if filters.is_empty() {
            return Err(StoreError::InvalidRequest(format!("refusing to delete from {table} without filters")));
        }

        let params = filter_params(filters);
        let params = &params;

        tracing::debug!(%table, ?params, "store delete");

        with_retry(&self.retry, move || {
            self.execute(self.request(Method::DELETE, table, params))
        })
        .await
        .map(|_| ())
    }

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<(), StoreError> {
        if filters.is_empty() {
            return Err(StoreError::InvalidRequest(format!("refusing to update {table} without filters")));
        }

        tracing::debug!(%table, "store update");

        let req = self
            .request(Method::PATCH, table, &filter_params(filters))
            .header("Prefer", "return=minimal")
            .json(&patch);

        self.execute(req).await.map(|_| ())
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() > MAX {
        format!("{}...", body.chars().take(MAX).collect::<String>())
    } else {
        body.to_string()
    }
}
