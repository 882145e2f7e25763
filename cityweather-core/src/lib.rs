//! Core library for the `cityweather` CLI.
//!
//! This crate defines:
//! - The record-store contract and its hosted and in-memory implementations
//! - The favorites set manager (per-user favorite cities)
//! - The city weather aggregator (latest reading plus a 7-day forecast per city)
//! - Configuration & credentials handling
//!
//! It is used by `cityweather-cli`, but can also be reused by other binaries or services.

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod favorites;
pub mod model;
pub mod retry;
pub mod store;

pub use aggregator::{BatchEntry, CityWeatherAggregator, FORECAST_DAYS};
pub use catalog::{CityCatalog, filter_cities};
pub use config::{Config, SessionConfig, StoreConfig};
pub use favorites::FavoritesManager;
pub use model::{
    City, CityId, CityWeather, ConditionKind, CurrentConditions, ForecastDay, FavoriteRelation,
    UserId, WeatherObservation,
};
pub use store::{RecordStore, StoreError, Table, store_from_config};
