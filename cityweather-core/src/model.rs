use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt;

use crate::store::{Row, StoreError};

/// Condition label used when a city has no observation yet.
pub const UNKNOWN_CONDITION: &str = "Unknown";

/// Opaque, stable city identifier as issued by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CityId(String);

impl CityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of the signed-in user, passed explicitly to every favorites call.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: CityId,
    pub name: String,
    pub country: String,
    pub coordinates: Option<Coordinates>,
}

/// A single reading from the `weather_data` time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub city_id: CityId,
    pub temperature_c: f64,
    pub humidity_pct: u8,
    pub condition: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    pub city_id: CityId,
    pub date: NaiveDate,
    pub min_temp_c: f64,
    pub max_temp_c: f64,
    pub condition: String,
}

/// Existence-only link between a user and a tracked city.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FavoriteRelation {
    pub user_id: UserId,
    pub city_id: CityId,
}

impl FavoriteRelation {
    pub fn new(user_id: UserId, city_id: CityId) -> Self {
        Self { user_id, city_id }
    }

    /// Insert payload for the `user_preferences` table.
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("user_id".into(), Value::String(self.user_id.to_string()));
        row.insert("city_id".into(), Value::String(self.city_id.to_string()));
        row
    }
}

/// Current conditions as surfaced in a view model.
///
/// `observed` is false when the values are the "no data yet" placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub temperature_c: f64,
    pub humidity_pct: u8,
    pub condition: String,
    pub recorded_at: DateTime<Utc>,
    pub observed: bool,
}

impl CurrentConditions {
    pub fn unknown(at: DateTime<Utc>) -> Self {
        Self {
            temperature_c: 0.0,
            humidity_pct: 0,
            condition: UNKNOWN_CONDITION.to_string(),
            recorded_at: at,
            observed: false,
        }
    }
}

impl From<WeatherObservation> for CurrentConditions {
    fn from(obs: WeatherObservation) -> Self {
        Self {
            temperature_c: obs.temperature_c,
            humidity_pct: obs.humidity_pct,
            condition: obs.condition,
            recorded_at: obs.recorded_at,
            observed: true,
        }
    }
}

/// Composite built fresh on every aggregation call; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityWeather {
    pub city: City,
    pub current: CurrentConditions,
    pub forecast: Vec<ForecastDay>,
}

/// Coarse condition category derived from the free-text label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Rain,
    Cloudy,
    PartlyCloudy,
    Clear,
}

impl ConditionKind {
    pub fn classify(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.contains("rain") {
            Self::Rain
        } else if lower.contains("cloud") {
            Self::Cloudy
        } else if lower.contains("partly") {
            Self::PartlyCloudy
        } else {
            Self::Clear
        }
    }
}

// Persisted row shapes. Field names follow the tables; conversion into the
// entities above happens only here.

#[derive(Debug, Deserialize)]
struct CityRow {
    #[serde(deserialize_with = "de_id")]
    id: String,
    city_name: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WeatherRow {
    #[serde(deserialize_with = "de_id")]
    city_id: String,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    temperature: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    humidity: Option<f64>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ForecastRow {
    #[serde(deserialize_with = "de_id")]
    city_id: String,
    date: NaiveDate,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    min_temp: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    max_temp: Option<f64>,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PreferenceRow {
    #[serde(deserialize_with = "de_id")]
    user_id: String,
    #[serde(deserialize_with = "de_id")]
    city_id: String,
}

fn decode<T: DeserializeOwned>(row: Row) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| StoreError::Decode(e.to_string()))
}

impl City {
    pub fn from_row(row: Row) -> Result<Self, StoreError> {
        let row: CityRow = decode(row)?;
        let coordinates = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates { latitude, longitude }),
            _ => None,
        };

        Ok(Self {
            id: CityId(row.id),
            name: row.city_name,
            country: row.country.unwrap_or_default(),
            coordinates,
        })
    }
}

impl WeatherObservation {
    pub fn from_row(row: Row) -> Result<Self, StoreError> {
        let row: WeatherRow = decode(row)?;
        Ok(Self {
            city_id: CityId(row.city_id),
            temperature_c: row.temperature.unwrap_or(0.0),
            humidity_pct: clamp_percent(row.humidity.unwrap_or(0.0)),
            condition: row.condition.unwrap_or_else(|| UNKNOWN_CONDITION.to_string()),
            recorded_at: row.recorded_at,
        })
    }
}

impl ForecastDay {
    pub fn from_row(row: Row) -> Result<Self, StoreError> {
        let row: ForecastRow = decode(row)?;
        Ok(Self {
            city_id: CityId(row.city_id),
            date: row.date,
            min_temp_c: row.min_temp.unwrap_or(0.0),
            max_temp_c: row.max_temp.unwrap_or(0.0),
            condition: row.condition.unwrap_or_else(|| UNKNOWN_CONDITION.to_string()),
        })
    }
}

impl FavoriteRelation {
    pub fn from_row(row: Row) -> Result<Self, StoreError> {
        let row: PreferenceRow = decode(row)?;
        Ok(Self { user_id: UserId(row.user_id), city_id: CityId(row.city_id) })
    }
}

fn clamp_percent(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

/// Accepts string or integer keys.
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected id, got {other}"))),
    }
}

/// `numeric` columns may arrive as JSON numbers or as numeric strings.
fn de_opt_decimal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid decimal '{s}'"))),
        other => Err(serde::de::Error::custom(format!("expected decimal, got {other}"))),
    }
}

/// RFC 3339, or a zone-less timestamp interpreted as UTC.
fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

/// RFC 3339 with any offset, or a zoneless timestamp read as UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|ndt| ndt.and_utc())
}
