//! Per-city weather view models.
//!
//! Only the city lookup is required. Missing observations or forecasts, and
//! failures while reading them, degrade to the "Unknown" placeholder and an
//! empty forecast.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    model::{City, CityId, CityWeather, CurrentConditions, ForecastDay, WeatherObservation},
    store::{Query, RecordStore, StoreError, Table, with_deadline},
};

/// Forecast window surfaced per city.
pub const FORECAST_DAYS: usize = 7;

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome for one position of an [`CityWeatherAggregator::assemble_many`] batch.
#[derive(Debug)]
pub struct BatchEntry {
    pub city_id: CityId,
    pub result: Result<CityWeather, StoreError>,
}

impl BatchEntry {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// View models of the entries that assembled, in batch order.
pub fn succeeded(entries: Vec<BatchEntry>) -> Vec<CityWeather> {
    entries.into_iter().filter_map(|e| e.result.ok()).collect()
}

pub struct CityWeatherAggregator {
    store: Arc<dyn RecordStore>,
    deadline: Duration,
    clock: Clock,
}

impl fmt::Debug for CityWeatherAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CityWeatherAggregator")
            .field("store", &self.store)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl CityWeatherAggregator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, deadline: DEFAULT_DEADLINE, clock: Arc::new(Utc::now) }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Source of the placeholder timestamp for cities without observations.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the view model for one city.
    ///
    /// Fails only if the city itself cannot be read.
    pub async fn assemble_one(&self, city_id: &CityId) -> Result<CityWeather, StoreError> {
        let now = (self.clock)();

        let (city, latest, forecast) = tokio::join!(
            self.fetch_city(city_id),
            self.fetch_latest(city_id),
            self.fetch_forecast(city_id),
        );

        let city = city?;
        let current = latest.map(CurrentConditions::from).unwrap_or_else(|| CurrentConditions::unknown(now));

        Ok(CityWeather { city, current, forecast })
    }

    /// Assemble every id concurrently.
    ///
    /// The result has one entry per input position, in input order regardless
    /// of completion order. A failing city yields an `Err` entry and does not
    /// affect the others.
    pub async fn assemble_many(&self, city_ids: &[CityId]) -> Vec<BatchEntry> {
        let tasks = city_ids.iter().map(|city_id| async move {
            let result = self.assemble_one(city_id).await;
            if let Err(e) = &result {
                tracing::warn!(city = %city_id, error = %e, "failed to assemble city weather");
            }
            BatchEntry { city_id: city_id.clone(), result }
        });

        let entries = join_all(tasks).await;

        tracing::debug!(
            requested = city_ids.len(),
            failed = entries.iter().filter(|e| !e.is_ok()).count(),
            "assembled weather batch"
        );
        entries
    }

    async fn fetch_city(&self, city_id: &CityId) -> Result<City, StoreError> {
        let query = Query::from(Table::Cities).eq("id", city_id.as_str());
        let row = with_deadline(self.deadline, self.store.select_single(&query)).await?;
        City::from_row(row)
    }

    async fn fetch_latest(&self, city_id: &CityId) -> Option<WeatherObservation> {
        let query = Query::from(Table::WeatherData)
            .eq("city_id", city_id.as_str())
            .order_desc("recorded_at")
            .limit(1);

        let rows = match with_deadline(self.deadline, self.store.select(&query)).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(city = %city_id, error = %e, "weather unavailable, using placeholder");
                return None;
            }
        };

        let row = rows.into_iter().next()?;
        match WeatherObservation::from_row(row) {
            Ok(obs) => Some(obs),
            Err(e) => {
                tracing::warn!(city = %city_id, error = %e, "unreadable weather row, using placeholder");
                None
            }
        }
    }

    async fn fetch_forecast(&self, city_id: &CityId) -> Vec<ForecastDay> {
        let query = Query::from(Table::Forecasts)
            .eq("city_id", city_id.as_str())
            .order_asc("date")
            .limit(FORECAST_DAYS);

        let rows = match with_deadline(self.deadline, self.store.select(&query)).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(city = %city_id, error = %e, "forecast unavailable");
                return Vec::new();
            }
        };

        let mut days: Vec<ForecastDay> = rows
            .into_iter()
            .filter_map(|row| match ForecastDay::from_row(row) {
                Ok(day) => Some(day),
                Err(e) => {
                    tracing::warn!(city = %city_id, error = %e, "skipping unreadable forecast row");
                    None
                }
            })
            .collect();

        days.sort_by_key(|d| d.date);
        days.truncate(FORECAST_DAYS);
        days
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Operation, memory::MemoryStore};
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_clock() -> Clock {
        Arc::new(|| Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn store_with_city(id: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .put(Table::Cities, json!({ "id": id, "city_name": "Lisbon", "country": "Portugal" }))
            .expect("put");
        store
    }

    #[tokio::test]
    async fn missing_city_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let agg = CityWeatherAggregator::new(store);

        let err = agg.assemble_one(&"nope".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn weather_failure_degrades_to_placeholder() {
        let store = store_with_city("c1");
        store.fail(Table::WeatherData, Operation::Select, "permission denied");
        store.fail(Table::Forecasts, Operation::Select, "permission denied");

        let agg = CityWeatherAggregator::new(store).with_clock(fixed_clock());
        let view = agg.assemble_one(&"c1".into()).await.expect("city exists");

        assert!(!view.current.observed);
        assert_eq!(view.current.condition, "Unknown");
        assert_eq!(view.current.recorded_at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        assert!(view.forecast.is_empty());
    }

    #[tokio::test]
    async fn unreadable_forecast_rows_are_skipped() {
        let store = store_with_city("c1");
        store
            .put(Table::Forecasts, json!({ "city_id": "c1", "date": "2024-05-02", "min_temp": 1, "max_temp": 2 }))
            .expect("put");
        store
            .put(Table::Forecasts, json!({ "city_id": "c1", "date": "not-a-date" }))
            .expect("put");

        let agg = CityWeatherAggregator::new(store);
        let view = agg.assemble_one(&"c1".into()).await.expect("city exists");
        assert_eq!(view.forecast.len(), 1);
    }

    #[tokio::test]
    async fn slow_city_lookup_times_out() {
        let store = store_with_city("c1");
        store.delay_city("c1", Duration::from_millis(200));

        let agg = CityWeatherAggregator::new(store).with_deadline(Duration::from_millis(20));
        let err = agg.assemble_one(&"c1".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let agg = CityWeatherAggregator::new(Arc::new(MemoryStore::new()));
        assert!(agg.assemble_many(&[]).await.is_empty());
    }
}
