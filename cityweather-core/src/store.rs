use async_trait::async_trait;
use serde_json::Value;
use std::{convert::TryFrom, fmt::Debug, future::Future, sync::Arc, time::Duration};
use thiserror::Error;

use crate::{Config, store::rest::RestStore};

pub mod memory;
pub mod rest;

/// A loosely-typed row as returned by the record store.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Cities,
    WeatherData,
    Forecasts,
    UserPreferences,
    Profiles,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Cities => "cities",
            Table::WeatherData => "weather_data",
            Table::Forecasts => "forecasts",
            Table::UserPreferences => "user_preferences",
            Table::Profiles => "profiles",
        }
    }

    pub const fn all() -> &'static [Table] {
        &[
            Table::Cities,
            Table::WeatherData,
            Table::Forecasts,
            Table::UserPreferences,
            Table::Profiles,
        ]
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Table {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Table::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == value.to_lowercase())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown table '{value}'. Known tables: cities, weather_data, forecasts, user_preferences, profiles."
                )
            })
    }
}

/// Store operation kind, used for diagnostics and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Delete,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: Value },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq { column: column.into(), value: value.into() }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq { column, value } => row.get(column).is_some_and(|v| values_equal(v, value)),
        }
    }
}

/// Compare loosely so `"7"` and `7` match an id column either way.
fn values_equal(stored: &Value, wanted: &Value) -> bool {
    match (stored, wanted) {
        (Value::Number(a), Value::String(b)) | (Value::String(b), Value::Number(a)) => {
            a.to_string() == *b
        }
        _ => stored == wanted,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn from(table: Table) -> Self {
        Self { table, filters: Vec::new(), order: None, limit: None }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order = Some(Order { column: column.into(), ascending: true });
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order = Some(Order { column: column.into(), ascending: false });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Value of the first equality filter on `column`, if any.
    pub fn filter_value(&self, column: &str) -> Option<&Value> {
        self.filters.iter().find_map(|f| match f {
            Filter::Eq { column: c, value } if c == column => Some(value),
            _ => None,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to decode row: {0}")]
    Decode(String),

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid store request: {0}")]
    InvalidRequest(String),

    #[error("Injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }

    /// User-friendly error message for display.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(_) => "Not found".to_string(),
            Self::Conflict(_) => "Already exists".to_string(),
            Self::PermissionDenied(_) => "You are not allowed to do that. Please sign in again.".to_string(),
            Self::Timeout(_) => "The server took too long to respond".to_string(),
            Self::Api { status, .. } => format!("Server error ({status})"),
            Self::Network(_) => "Network error. Check your connection.".to_string(),
            Self::Decode(_) => "Received unexpected data from the server".to_string(),
            Self::InvalidConfig(msg) => format!("Configuration error: {msg}"),
            Self::InvalidRequest(msg) => format!("Invalid request: {msg}"),
            Self::Injected(msg) => msg.clone(),
        }
    }
}

/// Query-capable record store (tables of loosely-typed rows).
#[async_trait]
pub trait RecordStore: Send + Sync + Debug {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    async fn insert(&self, table: Table, row: Row) -> Result<(), StoreError>;

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<(), StoreError>;

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<(), StoreError>;

    /// Exactly one row, otherwise `NotFound` (none) or `Conflict` (several).
    async fn select_single(&self, query: &Query) -> Result<Row, StoreError> {
        match self.select_maybe_single(query).await? {
            Some(row) => Ok(row),
            None => Err(StoreError::NotFound(describe(query))),
        }
    }

    /// Zero or one row; more than one is `Conflict`.
    async fn select_maybe_single(&self, query: &Query) -> Result<Option<Row>, StoreError> {
        let probe = match query.limit {
            Some(n) if n <= 2 => query.clone(),
            _ => query.clone().limit(2),
        };

        let mut rows = self.select(&probe).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(StoreError::Conflict(format!("expected a single row from {}, got {n}", describe(query)))),
        }
    }
}

fn describe(query: &Query) -> String {
    let filters = query
        .filters
        .iter()
        .map(|Filter::Eq { column, value }| format!("{column}={value}"))
        .collect::<Vec<_>>()
        .join(", ");

    if filters.is_empty() {
        query.table.to_string()
    } else {
        format!("{} ({filters})", query.table)
    }
}

/// Run one store round-trip under a deadline; expiry becomes `StoreError::Timeout`.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}

/// Construct the hosted store client from config.
pub fn store_from_config(config: &Config) -> anyhow::Result<Arc<dyn RecordStore>> {
    let settings = config.store_config()?;

    let mut store = RestStore::new(&settings.url, &settings.api_key, config.request_timeout())
        .map_err(|e| anyhow::anyhow!("{e}.\nHint: run `cityweather configure` to fix the store URL."))?
        .with_retry(config.retry_config());

    if let Some(token) = &settings.access_token {
        store = store.with_access_token(token);
    }

    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_from_config_errors_when_not_configured() {
        let err = store_from_config(&Config::default()).unwrap_err();
        assert!(err.to_string().contains("No record store configured"));
    }

    #[test]
    fn store_from_config_rejects_bad_url() {
        let mut cfg = Config::default();
        cfg.set_store("xyz.supabase.co".into(), "anon".into());

        let err = store_from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("Hint: run `cityweather configure`"));
    }

    #[test]
    fn store_from_config_works_when_configured() {
        let mut cfg = Config::default();
        cfg.set_store("https://xyz.supabase.co".into(), "anon".into());

        assert!(store_from_config(&cfg).is_ok());
    }

    #[test]
    fn table_as_str_roundtrip() {
        for table in Table::all() {
            let parsed = Table::try_from(table.as_str()).expect("roundtrip should succeed");
            assert_eq!(*table, parsed);
        }
    }

    #[test]
    fn unknown_table_error() {
        let err = Table::try_from("weather").unwrap_err();
        assert!(err.to_string().contains("Unknown table"));
    }

    #[test]
    fn query_builder_collects_filters() {
        let q = Query::from(Table::WeatherData)
            .eq("city_id", "c1")
            .order_desc("recorded_at")
            .limit(1);

        assert_eq!(q.filter_value("city_id"), Some(&json!("c1")));
        assert_eq!(q.order, Some(Order { column: "recorded_at".into(), ascending: false }));
        assert_eq!(q.limit, Some(1));
    }

    #[test]
    fn filter_matches_numeric_ids_as_strings() {
        let mut row = Row::new();
        row.insert("id".into(), json!(7));

        assert!(Filter::eq("id", "7").matches(&row));
        assert!(!Filter::eq("id", "8").matches(&row));
        assert!(!Filter::eq("missing", "7").matches(&row));
    }

    #[test]
    fn retryable_classification() {
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(StoreError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(StoreError::Api { status: 429, message: String::new() }.is_retryable());
        assert!(!StoreError::Api { status: 400, message: String::new() }.is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
        assert!(!StoreError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn user_messages() {
        assert!(StoreError::PermissionDenied("rls".into()).user_message().contains("sign in"));
        assert!(StoreError::Api { status: 502, message: String::new() }.user_message().contains("502"));
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(())
        };

        let err = with_deadline(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn deadline_passes_through_result() {
        let value = with_deadline(Duration::from_secs(1), async { Ok::<_, StoreError>(5) })
            .await
            .expect("fast future");
        assert_eq!(value, 5);
    }
}
