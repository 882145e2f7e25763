use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use std::{sync::Arc, time::Duration};

use cityweather_core::{
    CityId, CityWeatherAggregator, FavoritesManager, StoreError, Table, UserId,
    aggregator::{Clock, succeeded},
    store::{Operation, memory::MemoryStore},
};

fn clock() -> Clock {
    Arc::new(|| Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap())
}

fn seeded() -> Arc<MemoryStore> {
    let store = MemoryStore::from_json(&json!({
        "cities": [
            { "id": "C1", "city_name": "Lisbon", "country": "Portugal", "latitude": 38.72, "longitude": -9.14 },
            { "id": "C2", "city_name": "Berlin", "country": "Germany" },
            { "id": "C3", "city_name": "Oslo", "country": "Norway" },
        ],
        "weather_data": [
            { "city_id": "C1", "temperature": 22, "humidity": 60, "condition": "Cloudy", "recorded_at": "2024-06-01T09:00:00Z" },
            { "city_id": "C1", "temperature": 25, "humidity": 40, "condition": "Sunny", "recorded_at": "2024-06-01T15:00:00Z" },
            { "city_id": "C2", "temperature": "18.5", "humidity": 70, "condition": "Rain", "recorded_at": "2024-06-01T12:00:00Z" },
        ],
    }))
    .expect("valid seed");

    // Ten forecast rows for C1, inserted out of order.
    for day in [5, 1, 9, 3, 10, 2, 8, 4, 7, 6] {
        store
            .put(
                Table::Forecasts,
                json!({
                    "city_id": "C1",
                    "date": format!("2024-06-{day:02}"),
                    "min_temp": 10 + day,
                    "max_temp": 20 + day,
                    "condition": "Sunny",
                }),
            )
            .expect("put");
    }

    Arc::new(store)
}

#[tokio::test]
async fn latest_observation_wins() {
    let agg = CityWeatherAggregator::new(seeded()).with_clock(clock());
    let view = agg.assemble_one(&CityId::new("C1")).await.expect("C1 exists");

    assert!(view.current.observed);
    assert_eq!(view.current.temperature_c, 25.0);
    assert_eq!(view.current.condition, "Sunny");
    assert_eq!(view.current.recorded_at, Utc.with_ymd_and_hms(2024, 6, 1, 15, 0, 0).unwrap());
    assert_eq!(view.city.name, "Lisbon");
}

#[tokio::test]
async fn forecast_is_capped_to_seven_earliest_in_order() {
    let agg = CityWeatherAggregator::new(seeded());
    let view = agg.assemble_one(&CityId::new("C1")).await.expect("C1 exists");

    let dates: Vec<_> = view.forecast.iter().map(|d| d.date).collect();
    let expected: Vec<_> = (1..=7).map(|d| NaiveDate::from_ymd_opt(2024, 6, d).unwrap()).collect();
    assert_eq!(dates, expected);
}

#[tokio::test]
async fn absent_data_yields_placeholder_and_empty_forecast() {
    let agg = CityWeatherAggregator::new(seeded()).with_clock(clock());
    let view = agg.assemble_one(&CityId::new("C3")).await.expect("C3 exists");

    assert_eq!(view.current.condition, "Unknown");
    assert_eq!(view.current.temperature_c, 0.0);
    assert_eq!(view.current.humidity_pct, 0);
    assert_eq!(view.current.recorded_at, Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
    assert!(view.forecast.is_empty());
}

#[tokio::test]
async fn assemble_one_is_idempotent() {
    let agg = CityWeatherAggregator::new(seeded()).with_clock(clock());

    for id in ["C1", "C2", "C3"] {
        let id = CityId::new(id);
        let first = agg.assemble_one(&id).await.expect("exists");
        let second = agg.assemble_one(&id).await.expect("exists");
        assert_eq!(first, second);
    }
}

#[tokio::test]
async fn batch_preserves_input_order_under_skewed_latency() {
    let store = seeded();
    // Completion order is the reverse of input order.
    store.delay_city("C1", Duration::from_millis(150));
    store.delay_city("C2", Duration::from_millis(100));
    store.delay_city("C3", Duration::from_millis(50));

    let agg = CityWeatherAggregator::new(store);
    let ids: Vec<CityId> = ["C1", "C2", "C3"].into_iter().map(CityId::new).collect();

    let started = std::time::Instant::now();
    let entries = agg.assemble_many(&ids).await;
    let elapsed = started.elapsed();

    let order: Vec<_> = entries.iter().map(|e| e.city_id.as_str()).collect();
    assert_eq!(order, vec!["C1", "C2", "C3"]);
    assert!(entries.iter().all(|e| e.is_ok()));

    let names: Vec<_> = succeeded(entries).into_iter().map(|v| v.city.name).collect();
    assert_eq!(names, vec!["Lisbon", "Berlin", "Oslo"]);

    // Run one after another the cities would take 150 + 100 + 50 ms.
    assert!(elapsed < Duration::from_millis(225), "batch took {elapsed:?}");
}

#[tokio::test]
async fn latest_observation_is_compared_by_instant() {
    let store = seeded();
    for (condition, at) in [("Hazy", "2024-06-01T17:30:00+03:00"), ("Clear", "2024-06-01T16:00:00Z")] {
        store
            .put(
                Table::WeatherData,
                json!({ "city_id": "C3", "temperature": 12, "humidity": 50, "condition": condition, "recorded_at": at }),
            )
            .expect("put");
    }

    let view = CityWeatherAggregator::new(store).assemble_one(&CityId::new("C3")).await.expect("C3 exists");
    assert_eq!(view.current.condition, "Clear");
    assert_eq!(view.current.recorded_at, Utc.with_ymd_and_hms(2024, 6, 1, 16, 0, 0).unwrap());
}

#[tokio::test]
async fn failing_city_is_isolated_in_batch() {
    let agg = CityWeatherAggregator::new(seeded());
    let ids: Vec<CityId> = ["C2", "missing", "C1"].into_iter().map(CityId::new).collect();

    let entries = agg.assemble_many(&ids).await;
    assert_eq!(entries.len(), 3);
    assert!(entries[0].is_ok());
    assert!(matches!(entries[1].result, Err(StoreError::NotFound(_))));
    assert_eq!(entries[1].city_id.as_str(), "missing");
    assert!(entries[2].is_ok());

    let names: Vec<_> = succeeded(entries).into_iter().map(|v| v.city.name).collect();
    assert_eq!(names, vec!["Berlin", "Lisbon"]);
}

#[tokio::test]
async fn city_lookup_failure_marks_every_entry() {
    let store = seeded();
    store.fail(Table::Cities, Operation::Select, "offline");

    let agg = CityWeatherAggregator::new(store);
    let entries = agg.assemble_many(&[CityId::new("C1"), CityId::new("C2")]).await;

    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| !e.is_ok()));
}

#[tokio::test]
async fn favorite_then_unfavorite_scenario() {
    let store = seeded();
    let manager = FavoritesManager::new(store.clone());
    let user = UserId::new("U1");
    let (c1, c2) = (CityId::new("C1"), CityId::new("C2"));

    assert!(manager.toggle_favorite(&user, &c1).await.expect("favorite C1"));
    assert!(manager.toggle_favorite(&user, &c2).await.expect("favorite C2"));
    assert!(!manager.toggle_favorite(&user, &c1).await.expect("unfavorite C1"));

    let fresh = FavoritesManager::new(store);
    fresh.hydrate(&user).await.expect("hydrate");
    assert_eq!(fresh.favorites(), vec![c2]);
}

#[tokio::test]
async fn toggle_flips_on_success_and_holds_on_failure() {
    let store = seeded();
    let manager = FavoritesManager::new(store.clone());
    let user = UserId::new("U1");

    for id in ["C1", "C2", "C3"] {
        let city = CityId::new(id);
        let before = manager.is_favorite(&city);
        manager.toggle_favorite(&user, &city).await.expect("toggle");
        assert_eq!(manager.is_favorite(&city), !before);
    }

    store.fail(Table::UserPreferences, Operation::Delete, "network down");
    store.fail(Table::UserPreferences, Operation::Insert, "network down");

    for id in ["C1", "C2"] {
        let city = CityId::new(id);
        let before = manager.is_favorite(&city);
        assert!(manager.toggle_favorite(&user, &city).await.is_err());
        assert_eq!(manager.is_favorite(&city), before);
    }

    let other = CityId::new("C9");
    assert!(manager.toggle_favorite(&user, &other).await.is_err());
    assert!(!manager.is_favorite(&other));
}

#[tokio::test]
async fn dashboard_composition_uses_favorites_in_order() {
    let store = seeded();
    let manager = FavoritesManager::new(store.clone());
    let user = UserId::new("U1");
    manager.toggle_favorite(&user, &CityId::new("C2")).await.expect("toggle");
    manager.toggle_favorite(&user, &CityId::new("C1")).await.expect("toggle");

    let ids = cityweather_core::CityCatalog::new(store.clone())
        .favorite_cities(&user)
        .await
        .expect("favorites");
    let views = succeeded(CityWeatherAggregator::new(store).assemble_many(&ids).await);

    let names: Vec<_> = views.iter().map(|v| v.city.name.as_str()).collect();
    assert_eq!(names, vec!["Berlin", "Lisbon"]);
}
