use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::fmt::Write;

use cityweather_core::{BatchEntry, City, CityWeather, ConditionKind, ForecastDay};

/// Local date and offset used for labels.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext {
    pub today: NaiveDate,
    pub offset: FixedOffset,
}

impl RenderContext {
    pub fn local() -> Self {
        let now = chrono::Local::now();
        Self { today: now.date_naive(), offset: *now.offset() }
    }
}

fn symbol(condition: &str) -> &'static str {
    match ConditionKind::classify(condition) {
        ConditionKind::Rain => "🌧",
        ConditionKind::Cloudy => "☁",
        ConditionKind::PartlyCloudy => "⛅",
        ConditionKind::Clear => "☀",
    }
}

fn degrees(value: f64) -> i64 {
    value.round() as i64
}

fn updated_label(at: DateTime<Utc>, ctx: &RenderContext) -> String {
    at.with_timezone(&ctx.offset).format("%b %-d, %-I:%M %p").to_string()
}

fn day_label(date: NaiveDate, ctx: &RenderContext) -> String {
    if date == ctx.today { "Today".to_string() } else { date.format("%a").to_string() }
}

pub fn weather_card(view: &CityWeather, ctx: &RenderContext) -> String {
    let current = &view.current;
    let mut out = String::new();

    let _ = writeln!(out, "{}, {}  {}", view.city.name, view.city.country, symbol(&current.condition));
    let _ = writeln!(out, "  {}°C  {}", degrees(current.temperature_c), current.condition);
    let _ = writeln!(out, "  Humidity: {}%", current.humidity_pct);
    let _ = writeln!(out, "  Updated: {}", updated_label(current.recorded_at, ctx));
    out
}

pub fn forecast_strip(days: &[ForecastDay], ctx: &RenderContext) -> String {
    let mut out = String::from("  7-Day Forecast\n");
    for day in days {
        let _ = writeln!(
            out,
            "  {:<5} {:<6} {}  {}° / {}°  {}",
            day_label(day.date, ctx),
            day.date.format("%b %-d").to_string(),
            symbol(&day.condition),
            degrees(day.max_temp_c),
            degrees(day.min_temp_c),
            day.condition,
        );
    }
    out
}

pub fn city_detail(view: &CityWeather, favorite: Option<bool>, ctx: &RenderContext) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{}", view.city.name);
    let _ = writeln!(out, "{}", view.city.country);
    if let Some(coords) = view.city.coordinates {
        let _ = writeln!(out, "{:.4}°, {:.4}°", coords.latitude, coords.longitude);
    }
    match favorite {
        Some(true) => out.push_str("♥ In your favorites\n"),
        Some(false) => out.push_str("♡ Not in your favorites\n"),
        None => {}
    }
    out.push('\n');

    if !view.current.observed && view.forecast.is_empty() {
        out.push_str("No weather data available for this city\n");
        return out;
    }

    if view.current.observed {
        out.push_str(&weather_card(view, ctx));
    }
    if !view.forecast.is_empty() {
        out.push('\n');
        out.push_str(&forecast_strip(&view.forecast, ctx));
    }
    out
}

pub fn dashboard(entries: &[BatchEntry], ctx: &RenderContext) -> String {
    if entries.is_empty() {
        return "No favorite cities yet\n\
                Start adding cities to track their weather (see `cityweather cities`).\n"
            .to_string();
    }

    let mut out = String::from("Your Weather Dashboard\n\n");
    for entry in entries {
        match &entry.result {
            Ok(view) => {
                out.push_str(&weather_card(view, ctx));
                if !view.forecast.is_empty() {
                    out.push_str(&forecast_strip(&view.forecast, ctx));
                }
            }
            Err(e) => {
                let _ = writeln!(out, "⚠ {}: {}", entry.city_id, e.user_message());
            }
        }
        out.push('\n');
    }
    out
}

pub fn city_list<'a>(cities: &[&'a City], is_favorite: impl Fn(&'a City) -> bool, search: &str) -> String {
    if cities.is_empty() {
        return format!("No cities found matching \"{}\"\n", search.trim());
    }

    let mut out = String::new();
    for city in cities {
        let mark = if is_favorite(city) { "♥" } else { "♡" };
        let _ = writeln!(out, "{mark} {} ({})  [{}]", city.name, city.country, city.id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cityweather_core::{CityId, CurrentConditions, StoreError, model::Coordinates};

    fn ctx() -> RenderContext {
        RenderContext {
            today: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            offset: FixedOffset::east_opt(0).unwrap(),
        }
    }

    fn lisbon() -> City {
        City {
            id: CityId::new("c1"),
            name: "Lisbon".into(),
            country: "Portugal".into(),
            coordinates: Some(Coordinates { latitude: 38.72231, longitude: -9.13934 }),
        }
    }

    fn view(observed: bool, forecast: Vec<ForecastDay>) -> CityWeather {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 15, 5, 0).unwrap();
        let current = if observed {
            CurrentConditions {
                temperature_c: 24.6,
                humidity_pct: 40,
                condition: "Sunny".into(),
                recorded_at: at,
                observed: true,
            }
        } else {
            CurrentConditions::unknown(at)
        };
        CityWeather { city: lisbon(), current, forecast }
    }

    fn day(d: u32, condition: &str) -> ForecastDay {
        ForecastDay {
            city_id: CityId::new("c1"),
            date: NaiveDate::from_ymd_opt(2024, 6, d).unwrap(),
            min_temp_c: 11.4,
            max_temp_c: 25.5,
            condition: condition.into(),
        }
    }

    #[test]
    fn card_rounds_and_formats_time() {
        let card = weather_card(&view(true, vec![]), &ctx());
        assert!(card.contains("25°C  Sunny"));
        assert!(card.contains("Humidity: 40%"));
        assert!(card.contains("Updated: Jun 1, 3:05 PM"));
        assert!(card.starts_with("Lisbon, Portugal  ☀"));
    }

    #[test]
    fn forecast_labels_today_then_weekday() {
        let strip = forecast_strip(&[day(1, "Light rain"), day(2, "Cloudy")], &ctx());
        let lines: Vec<_> = strip.lines().collect();
        assert!(lines[1].contains("Today"));
        assert!(lines[1].contains("🌧"));
        assert!(lines[1].contains("26° / 11°"));
        assert!(lines[2].contains("Sun"));
        assert!(lines[2].contains("Jun 2"));
    }

    #[test]
    fn detail_without_any_data() {
        let text = city_detail(&view(false, vec![]), Some(false), &ctx());
        assert!(text.contains("38.7223°, -9.1393°"));
        assert!(text.contains("Not in your favorites"));
        assert!(text.contains("No weather data available for this city"));
    }

    #[test]
    fn detail_with_forecast_only_skips_card() {
        let text = city_detail(&view(false, vec![day(2, "Sunny")]), None, &ctx());
        assert!(!text.contains("Humidity"));
        assert!(text.contains("7-Day Forecast"));
    }

    #[test]
    fn dashboard_reports_failed_entries_inline() {
        let entries = vec![
            BatchEntry { city_id: CityId::new("c1"), result: Ok(view(true, vec![day(1, "Sunny")])) },
            BatchEntry { city_id: CityId::new("gone"), result: Err(StoreError::NotFound("cities".into())) },
        ];

        let text = dashboard(&entries, &ctx());
        assert!(text.contains("Lisbon, Portugal"));
        assert!(text.contains("⚠ gone: Not found"));
    }

    #[test]
    fn empty_dashboard_hints_at_browsing() {
        assert!(dashboard(&[], &ctx()).contains("No favorite cities yet"));
    }

    #[test]
    fn city_list_marks_favorites() {
        let a = lisbon();
        let text = city_list(&[&a], |c| c.id.as_str() == "c1", "");
        assert!(text.starts_with("♥ Lisbon (Portugal)  [c1]"));

        assert!(city_list(&[], |_| false, " tokyo ").contains("No cities found matching \"tokyo\""));
    }
}
