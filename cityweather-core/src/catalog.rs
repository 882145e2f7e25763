use std::{sync::Arc, time::Duration};

use crate::{
    model::{City, CityId, FavoriteRelation, UserId},
    store::{Query, RecordStore, StoreError, Table, with_deadline},
};

/// Read-only access to the `cities` catalog.
#[derive(Debug, Clone)]
pub struct CityCatalog {
    store: Arc<dyn RecordStore>,
    deadline: Duration,
}

impl CityCatalog {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, deadline: crate::aggregator::DEFAULT_DEADLINE }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// All known cities, ordered by display name.
    pub async fn list(&self) -> Result<Vec<City>, StoreError> {
        let query = Query::from(Table::Cities).order_asc("city_name");
        let rows = with_deadline(self.deadline, self.store.select(&query)).await?;
        rows.into_iter().map(City::from_row).collect()
    }

    /// Ids of the user's favorite cities in store order.
    pub async fn favorite_cities(&self, user: &UserId) -> Result<Vec<CityId>, StoreError> {
        let query = Query::from(Table::UserPreferences).eq("user_id", user.as_str());
        let rows = with_deadline(self.deadline, self.store.select(&query)).await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = FavoriteRelation::from_row(row)?.city_id;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// Case-insensitive substring match on name or country. An empty query keeps everything.
pub fn filter_cities<'a>(cities: &'a [City], query: &str) -> Vec<&'a City> {
    let needle = query.trim().to_lowercase();
    cities
        .iter()
        .filter(|c| {
            needle.is_empty()
                || c.name.to_lowercase().contains(&needle)
                || c.country.to_lowercase().contains(&needle)
        })
        .collect()
}
