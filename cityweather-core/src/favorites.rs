//! Client-side set of a user's favorite cities.
//!
//! The `user_preferences` table is the source of truth. The local cache is
//! mutated only after the store confirms a write, so it can lag the server
//! while a call is in flight but never runs ahead of it. Keep it that way:
//! there is deliberately no optimistic write or rollback path.
//!
//! Every confirmed per-city write bumps a generation counter. A full
//! [`hydrate`](FavoritesManager::hydrate) whose read overlapped such a write
//! re-reads instead of replacing the set with a snapshot older than the write.

use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use crate::{
    model::{CityId, FavoriteRelation, UserId},
    store::{Filter, Query, RecordStore, StoreError, Table, with_deadline},
};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Reads attempted by one `hydrate` before it gives up on a stable snapshot.
const HYDRATE_ATTEMPTS: usize = 3;

type KeyLocks = Mutex<HashMap<CityId, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Debug, Default)]
struct Cache {
    /// Set once a full hydrate has replaced the set.
    hydrated: bool,
    generation: u64,
    ids: BTreeSet<CityId>,
}

#[derive(Debug)]
pub struct FavoritesManager {
    store: Arc<dyn RecordStore>,
    deadline: Duration,
    cache: RwLock<Cache>,
    // One async lock per city with a call in flight.
    in_flight: KeyLocks,
}

/// Claim on a city's entry in the key-lock map. Dropping it, including when
/// the owning future is cancelled, removes the entry once no one else holds it.
struct KeyClaim<'a> {
    in_flight: &'a KeyLocks,
    city: CityId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        // Two references: the map's and this claim's.
        let unused = in_flight
            .get(&self.city)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2);
        if unused {
            in_flight.remove(&self.city);
        }
    }
}

impl FavoritesManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            deadline: DEFAULT_DEADLINE,
            cache: RwLock::new(Cache::default()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Deadline applied to each store round-trip.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Replace the cache with the user's favorites from the store.
    ///
    /// On failure the previous set is kept and the error is returned. If a
    /// toggle or refresh is confirmed while the read is in flight, the read is
    /// retried; after [`HYDRATE_ATTEMPTS`] overlapping reads the current set
    /// is kept as is.
    pub async fn hydrate(&self, user: &UserId) -> Result<usize, StoreError> {
        let query = Query::from(Table::UserPreferences).eq("user_id", user.as_str());

        for attempt in 1..=HYDRATE_ATTEMPTS {
            let started = self.cache.read().generation;
            let rows = with_deadline(self.deadline, self.store.select(&query)).await?;

            let ids = rows
                .into_iter()
                .map(|row| FavoriteRelation::from_row(row).map(|rel| rel.city_id))
                .collect::<Result<BTreeSet<_>, _>>()?;

            let count = ids.len();
            let applied = {
                let mut cache = self.cache.write();
                if cache.generation == started {
                    cache.ids = ids;
                    cache.hydrated = true;
                    true
                } else {
                    false
                }
            };

            if applied {
                tracing::debug!(%user, count, "favorites hydrated");
                return Ok(count);
            }
            tracing::debug!(%user, attempt, "favorites changed during hydrate, reading again");
        }

        tracing::warn!(%user, "favorites kept changing during hydrate, keeping cached set");
        Ok(self.len())
    }

    /// Like [`hydrate`](Self::hydrate), but a failure only logs and keeps the current set.
    pub async fn hydrate_best_effort(&self, user: &UserId) {
        if let Err(e) = self.hydrate(user).await {
            tracing::warn!(%user, error = %e, "failed to load favorites, keeping cached set");
        }
    }

    /// Reconcile a single city's membership with the store.
    ///
    /// This is a per-city hydration: it writes only `city`'s entry and leaves
    /// [`is_hydrated`](Self::is_hydrated) untouched, since the rest of the set
    /// is still unknown.
    pub async fn refresh_one(&self, user: &UserId, city: &CityId) -> Result<bool, StoreError> {
        let claim = self.claim(city);
        let _guard = claim.lock.lock().await;

        let query = Query::from(Table::UserPreferences)
            .eq("user_id", user.as_str())
            .eq("city_id", city.as_str());
        let exists = with_deadline(self.deadline, self.store.select_maybe_single(&query))
            .await?
            .is_some();

        self.set_membership(city, exists);
        Ok(exists)
    }

    /// Local cache only; false for anything not hydrated yet.
    pub fn is_favorite(&self, city: &CityId) -> bool {
        self.cache.read().ids.contains(city)
    }

    /// Whether a full [`hydrate`](Self::hydrate) has succeeded.
    pub fn is_hydrated(&self) -> bool {
        self.cache.read().hydrated
    }

    /// Sorted snapshot of the cached set.
    pub fn favorites(&self) -> Vec<CityId> {
        self.cache.read().ids.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().ids.is_empty()
    }

    /// Flip membership of `city` for `user` and return the new membership.
    ///
    /// Toggles of the same city are serialized: a second call waits for the
    /// first to finish and then reads the updated membership. On failure the
    /// cache is left exactly as it was before the call.
    pub async fn toggle_favorite(&self, user: &UserId, city: &CityId) -> Result<bool, StoreError> {
        let claim = self.claim(city);
        let _guard = claim.lock.lock().await;

        self.toggle_locked(user, city).await
    }

    async fn toggle_locked(&self, user: &UserId, city: &CityId) -> Result<bool, StoreError> {
        let was_favorite = self.is_favorite(city);

        if was_favorite {
            let filters = [Filter::eq("user_id", user.as_str()), Filter::eq("city_id", city.as_str())];
            match with_deadline(self.deadline, self.store.delete(Table::UserPreferences, &filters)).await {
                Ok(()) => {
                    self.set_membership(city, false);
                    tracing::info!(%user, %city, "removed from favorites");
                    Ok(false)
                }
                Err(e) => {
                    tracing::warn!(%user, %city, error = %e, "failed to remove favorite");
                    Err(e)
                }
            }
        } else {
            let row = FavoriteRelation::new(user.clone(), city.clone()).to_row();
            match with_deadline(self.deadline, self.store.insert(Table::UserPreferences, row)).await {
                Ok(()) => {
                    self.set_membership(city, true);
                    tracing::info!(%user, %city, "added to favorites");
                    Ok(true)
                }
                // The relation already exists server-side; converge on it.
                Err(StoreError::Conflict(msg)) => {
                    tracing::debug!(%user, %city, %msg, "favorite already present in store");
                    self.set_membership(city, true);
                    Ok(true)
                }
                Err(e) => {
                    tracing::warn!(%user, %city, error = %e, "failed to add favorite");
                    Err(e)
                }
            }
        }
    }

    fn set_membership(&self, city: &CityId, member: bool) {
        let mut cache = self.cache.write();
        cache.generation += 1;
        if member {
            cache.ids.insert(city.clone());
        } else {
            cache.ids.remove(city);
        }
    }

    fn claim(&self, city: &CityId) -> KeyClaim<'_> {
        let lock = self.in_flight.lock().entry(city.clone()).or_default().clone();
        KeyClaim { in_flight: &self.in_flight, city: city.clone(), lock }
    }
}
