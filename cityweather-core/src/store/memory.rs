use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{cmp::Ordering, collections::HashMap, time::Duration};

use super::{Filter, Operation, Query, RecordStore, Row, StoreError, Table};
use crate::model::parse_timestamp;

/// In-process record store.
///
/// Backs the CLI's offline mode and the test suites. Besides plain storage it
/// can inject failures per (table, operation) and add latency to any call
/// that targets a given city or to every call of one (table, operation).
/// Reads snapshot their rows before the delay, so a delayed read can return
/// data that a concurrent write has already changed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<Table, Vec<Row>>,
    failures: HashMap<(Table, Operation), String>,
    city_delays: HashMap<String, Duration>,
    op_delays: HashMap<(Table, Operation), Duration>,
    calls: HashMap<Table, usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a JSON document shaped like `{"cities": [{...}], "forecasts": [...]}`.
    pub fn from_json(doc: &Value) -> Result<Self> {
        let tables = doc
            .as_object()
            .ok_or_else(|| anyhow!("Seed document must be a JSON object keyed by table name"))?;

        let store = Self::new();
        for (name, rows) in tables {
            let table = Table::try_from(name.as_str())?;
            let rows = rows
                .as_array()
                .ok_or_else(|| anyhow!("Seed table '{name}' must be an array of rows"))?;

            for (i, row) in rows.iter().enumerate() {
                store
                    .put(table, row.clone())
                    .with_context(|| format!("Invalid row {i} in seed table '{name}'"))?;
            }
        }

        Ok(store)
    }

    /// Add a row directly, bypassing constraints and hooks.
    pub fn put(&self, table: Table, row: Value) -> Result<()> {
        let Value::Object(row) = row else {
            return Err(anyhow!("rows must be JSON objects"));
        };
        self.inner.lock().tables.entry(table).or_default().push(row);
        Ok(())
    }

    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.inner.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    /// Make every `op` on `table` fail until cleared.
    pub fn fail(&self, table: Table, op: Operation, message: impl Into<String>) {
        self.inner.lock().failures.insert((table, op), message.into());
    }

    pub fn clear_failure(&self, table: Table, op: Operation) {
        self.inner.lock().failures.remove(&(table, op));
    }

    /// Delay every call whose target city is `city_id`.
    pub fn delay_city(&self, city_id: &str, delay: Duration) {
        self.inner.lock().city_delays.insert(city_id.to_string(), delay);
    }

    /// Delay every `op` on `table`.
    pub fn delay(&self, table: Table, op: Operation, delay: Duration) {
        self.inner.lock().op_delays.insert((table, op), delay);
    }

    /// Number of calls (of any kind) made against `table`.
    pub fn calls(&self, table: Table) -> usize {
        self.inner.lock().calls.get(&table).copied().unwrap_or(0)
    }

    fn begin(
        inner: &mut Inner,
        table: Table,
        op: Operation,
        city: Option<&Value>,
    ) -> (Result<(), StoreError>, Option<Duration>) {
        *inner.calls.entry(table).or_default() += 1;

        let by_city = city
            .map(value_key)
            .and_then(|key| inner.city_delays.get(&key).copied());
        let delay = by_city.max(inner.op_delays.get(&(table, op)).copied());

        let outcome = match inner.failures.get(&(table, op)) {
            Some(msg) => Err(StoreError::Injected(msg.clone())),
            None => Ok(()),
        };

        (outcome, delay)
    }

    async fn settle<T>(result: Result<T, StoreError>, delay: Option<Duration>) -> Result<T, StoreError> {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

fn target_city<'a>(table: Table, filters: &'a [Filter]) -> Option<&'a Value> {
    let key = if table == Table::Cities { "id" } else { "city_id" };
    filters.iter().find_map(|f| match f {
        Filter::Eq { column, value } if column == key => Some(value),
        _ => None,
    })
}

fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => x.cmp(y),
        },
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn matches_all(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(row))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let (result, delay) = {
            let mut inner = self.inner.lock();
            let (outcome, delay) =
                Self::begin(&mut inner, query.table, Operation::Select, target_city(query.table, &query.filters));

            let result = outcome.map(|()| {
                let mut rows: Vec<Row> = inner
                    .tables
                    .get(&query.table)
                    .map(|rows| rows.iter().filter(|r| matches_all(r, &query.filters)).cloned().collect())
                    .unwrap_or_default();

                if let Some(order) = &query.order {
                    // Stable sort: ties keep insertion order in both directions.
                    rows.sort_by(|a, b| {
                        let ord = compare_values(a.get(&order.column), b.get(&order.column));
                        if order.ascending { ord } else { ord.reverse() }
                    });
                }

                if let Some(limit) = query.limit {
                    rows.truncate(limit);
                }

                rows
            });

            (result, delay)
        };

        Self::settle(result, delay).await
    }

    async fn insert(&self, table: Table, row: Row) -> Result<(), StoreError> {
        let (result, delay) = {
            let mut inner = self.inner.lock();
            let column = if table == Table::Cities { "id" } else { "city_id" };
            let city = row.get(column).cloned();
            let (outcome, delay) = Self::begin(&mut inner, table, Operation::Insert, city.as_ref());

            let result = outcome.and_then(|()| {
                let rows = inner.tables.entry(table).or_default();

                if table == Table::UserPreferences {
                    let key = [
                        Filter::eq("user_id", row.get("user_id").cloned().unwrap_or(Value::Null)),
                        Filter::eq("city_id", row.get("city_id").cloned().unwrap_or(Value::Null)),
                    ];
                    if rows.iter().any(|r| matches_all(r, &key)) {
                        return Err(StoreError::Conflict(
                            "duplicate key violates unique constraint on (user_id, city_id)".to_string(),
                        ));
                    }
                }

                rows.push(row);
                Ok(())
            });

            (result, delay)
        };

        Self::settle(result, delay).await
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<(), StoreError> {
        let (result, delay) = {
            let mut inner = self.inner.lock();
            let (outcome, delay) =
                Self::begin(&mut inner, table, Operation::Delete, target_city(table, filters));

            let result = outcome.map(|()| {
                if let Some(rows) = inner.tables.get_mut(&table) {
                    rows.retain(|r| !matches_all(r, filters));
                }
            });

            (result, delay)
        };

        Self::settle(result, delay).await
    }

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<(), StoreError> {
        let (result, delay) = {
            let mut inner = self.inner.lock();
            let (outcome, delay) =
                Self::begin(&mut inner, table, Operation::Update, target_city(table, filters));

            let result = outcome.map(|()| {
                if let Some(rows) = inner.tables.get_mut(&table) {
                    for row in rows.iter_mut().filter(|r| matches_all(r, filters)) {
                        for (k, v) in &patch {
                            row.insert(k.clone(), v.clone());
                        }
                    }
                }
            });

            (result, delay)
        };

        Self::settle(result, delay).await
    }
}
