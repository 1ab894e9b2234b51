use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{ListingsKey, PlaceKey, ResultCache};
use crate::clustering::{ClusterGroup, SpatialClusterer};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, SearchFailure};
use crate::images::{ImageAssetPipeline, ImageState};
use crate::model::{FilterCriteria, Listing, ListingSet, Source, WeatherSnapshot};
use crate::retry::{ResilientInvoker, RetryPolicy};
use crate::settings::{SavedSearch, SettingsStore};
use crate::source::RentalDataSource;

/// Acquisition state of one view region, tagged with the key it was requested for.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionState<K, T> {
    Idle,
    Loading(K),
    Loaded(K, T),
    Failed(K, SearchFailure),
}

impl<K: PartialEq, T> RegionState<K, T> {
    pub fn key(&self) -> Option<&K> {
        match self {
            RegionState::Idle => None,
            RegionState::Loading(key)
            | RegionState::Loaded(key, _)
            | RegionState::Failed(key, _) => Some(key),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, RegionState::Loading(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            RegionState::Loaded(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&SearchFailure> {
        match self {
            RegionState::Failed(_, failure) => Some(failure),
            _ => None,
        }
    }

    fn is_current(&self, key: &K) -> bool {
        self.key() == Some(key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    PriceAsc,
    PriceDesc,
    SqftDesc,
}

impl SortKey {
    fn apply(&self, listings: &mut [Listing]) {
        match self {
            SortKey::PriceAsc => listings.sort_by(|a, b| a.price.total_cmp(&b.price)),
            SortKey::PriceDesc => listings.sort_by(|a, b| b.price.total_cmp(&a.price)),
            SortKey::SqftDesc => listings.sort_by(|a, b| b.sqft.total_cmp(&a.sqft)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionViewState {
    pub place: String,
    pub committed_place: Option<String>,
    pub filters: FilterCriteria,
    pub committed_filters: Option<FilterCriteria>,
    pub selected: Option<String>,
    pub hovered: Option<String>,
    pub cluster_restriction: Option<HashSet<String>>,
    pub favorites: BTreeSet<String>,
    pub show_favorites_only: bool,
    pub sort: SortKey,
}

/// In-flight fetches for one commit. Each result travels with the key it was
/// requested for so a superseded commit can be recognised and dropped.
pub struct PendingSearch {
    key: ListingsKey,
    listings: Option<BoxFuture<'static, AppResult<ListingSet>>>,
    weather: Option<BoxFuture<'static, AppResult<WeatherSnapshot>>>,
}

impl PendingSearch {
    pub fn key(&self) -> &ListingsKey {
        &self.key
    }

    pub async fn run(self) -> SearchOutcome {
        let PendingSearch {
            key,
            listings,
            weather,
        } = self;
        let listings = async move {
            match listings {
                Some(fetch) => Some(fetch.await),
                None => None,
            }
        };
        let weather = async move {
            match weather {
                Some(fetch) => Some(fetch.await),
                None => None,
            }
        };
        let (listings, weather) = future::join(listings, weather).await;
        SearchOutcome {
            key,
            listings,
            weather,
        }
    }
}

pub struct SearchOutcome {
    pub key: ListingsKey,
    pub listings: Option<AppResult<ListingSet>>,
    pub weather: Option<AppResult<WeatherSnapshot>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub listings_applied: bool,
    pub weather_applied: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub place: String,
    pub committed_place: Option<String>,
    pub filters: FilterCriteria,
    pub listings: Vec<Listing>,
    pub total_listings: usize,
    pub sources: Vec<Source>,
    pub listings_loading: bool,
    pub listings_error: Option<SearchFailure>,
    pub weather: Option<WeatherSnapshot>,
    pub weather_loading: bool,
    pub weather_error: Option<SearchFailure>,
    pub clusters: Vec<ClusterGroup>,
    pub images: HashMap<String, ImageState>,
    pub selected: Option<String>,
    pub hovered: Option<String>,
    pub favorites: BTreeSet<String>,
    pub show_favorites_only: bool,
    pub cluster_restricted: bool,
    pub sort: SortKey,
    pub storage_error: Option<String>,
}

pub struct SearchSession {
    source: Arc<dyn RentalDataSource>,
    cache: ResultCache,
    invoker: ResilientInvoker,
    images: ImageAssetPipeline,
    clusterer: SpatialClusterer,
    store: SettingsStore,
    state: SessionViewState,
    listings: RegionState<ListingsKey, ListingSet>,
    weather: RegionState<PlaceKey, WeatherSnapshot>,
    storage_error: Option<String>,
}

impl SearchSession {
    pub fn new(source: Arc<dyn RentalDataSource>, store: SettingsStore, config: &AppConfig) -> Self {
        let cache = ResultCache::new();
        let images = ImageAssetPipeline::new(
            Arc::clone(&source),
            cache.images.clone(),
            ResilientInvoker::new(RetryPolicy::image(config)),
        );
        Self {
            source,
            invoker: ResilientInvoker::new(RetryPolicy::text(config)),
            images,
            cache,
            clusterer: SpatialClusterer::new(config.cluster_radius),
            store,
            state: SessionViewState::default(),
            listings: RegionState::Idle,
            weather: RegionState::Idle,
            storage_error: None,
        }
    }

    pub fn state(&self) -> &SessionViewState {
        &self.state
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn images(&self) -> &ImageAssetPipeline {
        &self.images
    }

    pub fn listings_state(&self) -> &RegionState<ListingsKey, ListingSet> {
        &self.listings
    }

    pub fn weather_state(&self) -> &RegionState<PlaceKey, WeatherSnapshot> {
        &self.weather
    }

    pub fn set_draft_place(&mut self, place: impl Into<String>) {
        self.state.place = place.into();
    }

    pub fn set_draft_filters(&mut self, filters: FilterCriteria) {
        self.state.filters = filters;
    }

    /// Commits a search. Cached regions are applied immediately; anything else is
    /// returned as a `PendingSearch` to be driven and handed back to `apply`.
    /// An empty place is ignored.
    pub fn commit_search(
        &mut self,
        place: &str,
        filters: FilterCriteria,
    ) -> Option<PendingSearch> {
        let place = place.trim();
        if place.is_empty() {
            debug!("ignoring search with empty place");
            return None;
        }

        let filters = filters.normalized();
        let key = ListingsKey::new(place, &filters);
        info!(place, filters = ?filters, "committing search");

        self.state.place = place.to_string();
        self.state.filters = filters.clone();
        self.state.committed_place = Some(place.to_string());
        self.state.committed_filters = Some(filters.clone());
        self.state.selected = None;
        self.state.hovered = None;
        self.state.cluster_restriction = None;

        let listings = match self.cache.listings.get(&key) {
            Some(set) => {
                debug!(place, "listings served from cache");
                self.listings = RegionState::Loaded(key.clone(), set);
                None
            }
            None => {
                self.listings = RegionState::Loading(key.clone());
                Some(self.listings_fetch(key.clone(), place.to_string(), filters))
            }
        };

        let weather = match self.cache.weather.get(&key.place) {
            Some(snapshot) => {
                self.weather = RegionState::Loaded(key.place.clone(), snapshot);
                None
            }
            None => {
                self.weather = RegionState::Loading(key.place.clone());
                Some(self.weather_fetch(key.place.clone(), place.to_string()))
            }
        };

        if listings.is_none() && weather.is_none() {
            return None;
        }
        Some(PendingSearch {
            key,
            listings,
            weather,
        })
    }

    fn listings_fetch(
        &self,
        key: ListingsKey,
        place: String,
        filters: FilterCriteria,
    ) -> BoxFuture<'static, AppResult<ListingSet>> {
        let cache = self.cache.listings.clone();
        let invoker = self.invoker.clone();
        let source = Arc::clone(&self.source);
        async move {
            cache
                .get_or_fetch(key, move || async move {
                    let page = invoker
                        .run_quota_aware(|| source.fetch_listings(&place, &filters))
                        .await?;
                    Ok(ListingSet::from_page(page))
                })
                .await
        }
        .boxed()
    }

    fn weather_fetch(
        &self,
        key: PlaceKey,
        place: String,
    ) -> BoxFuture<'static, AppResult<WeatherSnapshot>> {
        let cache = self.cache.weather.clone();
        let invoker = self.invoker.clone();
        let source = Arc::clone(&self.source);
        async move {
            cache
                .get_or_fetch(key, move || async move {
                    invoker
                        .run_quota_aware(|| source.fetch_weather(&place))
                        .await
                })
                .await
        }
        .boxed()
    }

    /// Applies a finished search. Regions whose key no longer matches the
    /// committed search are discarded.
    pub fn apply(&mut self, outcome: SearchOutcome) -> ApplyReport {
        let mut report = ApplyReport::default();

        if let Some(result) = outcome.listings {
            if self.listings.is_current(&outcome.key) && self.listings.is_loading() {
                self.listings = match result {
                    Ok(set) => {
                        info!(place = %outcome.key.place, count = set.len(), "listings loaded");
                        RegionState::Loaded(outcome.key.clone(), set)
                    }
                    Err(err) => {
                        warn!(?err, place = %outcome.key.place, "listings failed");
                        RegionState::Failed(outcome.key.clone(), SearchFailure::from(&err))
                    }
                };
                report.listings_applied = true;
            } else {
                debug!(place = %outcome.key.place, "discarding stale listings response");
            }
        }

        if let Some(result) = outcome.weather {
            if self.weather.is_current(&outcome.key.place) && self.weather.is_loading() {
                self.weather = match result {
                    Ok(snapshot) => RegionState::Loaded(outcome.key.place.clone(), snapshot),
                    Err(err) => {
                        warn!(?err, place = %outcome.key.place, "weather failed");
                        RegionState::Failed(outcome.key.place.clone(), weather_failure(&err))
                    }
                };
                report.weather_applied = true;
            } else {
                debug!(place = %outcome.key.place, "discarding stale weather response");
            }
        }

        report
    }

    /// Commit, fetch and apply in one step.
    pub async fn search(&mut self, place: &str, filters: FilterCriteria) -> ApplyReport {
        match self.commit_search(place, filters) {
            Some(pending) => {
                let outcome = pending.run().await;
                self.apply(outcome)
            }
            None => ApplyReport::default(),
        }
    }

    /// Best effort: failures and blank input yield no suggestions.
    pub async fn suggest_locations(&self, partial: &str) -> Vec<String> {
        if partial.trim().is_empty() {
            return Vec::new();
        }
        match self.source.fetch_location_suggestions(partial).await {
            Ok(suggestions) => suggestions,
            Err(err) => {
                warn!(?err, "location suggestions unavailable");
                Vec::new()
            }
        }
    }

    pub fn toggle_favorite(&mut self, id: &str) -> bool {
        if self.state.favorites.remove(id) {
            false
        } else {
            self.state.favorites.insert(id.to_string());
            true
        }
    }

    pub fn set_show_favorites_only(&mut self, enabled: bool) {
        self.state.show_favorites_only = enabled;
    }

    pub fn apply_cluster_restriction(&mut self, ids: impl IntoIterator<Item = String>) {
        self.state.cluster_restriction = Some(ids.into_iter().collect());
    }

    pub fn clear_cluster_restriction(&mut self) {
        self.state.cluster_restriction = None;
    }

    pub fn select_listing(&mut self, id: Option<&str>) {
        self.state.selected = id.map(str::to_string);
    }

    pub fn hover_listing(&mut self, id: Option<&str>) {
        self.state.hovered = id.map(str::to_string);
    }

    pub fn set_sort(&mut self, sort: SortKey) {
        self.state.sort = sort;
    }

    pub fn save_settings(&mut self) -> AppResult<()> {
        let search = SavedSearch::new(self.state.place.clone(), self.state.filters.clone());
        let result = self.store.save_search(&search);
        self.note_storage(result)
    }

    /// Restores the saved draft and commits it right away.
    pub fn load_settings(&mut self) -> AppResult<Option<PendingSearch>> {
        let loaded = self.store.load_search();
        match self.note_storage(loaded)? {
            Some(saved) => {
                self.state.place = saved.place.clone();
                self.state.filters = saved.filters.clone();
                Ok(self.commit_search(&saved.place, saved.filters))
            }
            None => Ok(None),
        }
    }

    pub fn save_favorites(&mut self) -> AppResult<()> {
        let result = self.store.save_favorites(&self.state.favorites);
        self.note_storage(result)
    }

    pub fn load_favorites(&mut self) -> AppResult<()> {
        let loaded = self.store.load_favorites();
        self.state.favorites = self.note_storage(loaded)?;
        Ok(())
    }

    fn note_storage<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        match result {
            Ok(value) => {
                self.storage_error = None;
                Ok(value)
            }
            Err(err) => {
                warn!(?err, "settings storage failed");
                self.storage_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Loaded listings that pass the committed filters and the favorites toggle.
    fn mappable_listings(&self) -> Vec<Listing> {
        let Some(set) = self.listings.value() else {
            return Vec::new();
        };
        let filters = self.state.committed_filters.clone().unwrap_or_default();
        set.listings
            .iter()
            .filter(|listing| filters.matches(listing))
            .filter(|listing| {
                !self.state.show_favorites_only || self.state.favorites.contains(&listing.id)
            })
            .cloned()
            .collect()
    }

    pub fn displayed_listings(&self) -> Vec<Listing> {
        let mut listings = self.mappable_listings();
        if let Some(restriction) = &self.state.cluster_restriction {
            listings.retain(|listing| restriction.contains(&listing.id));
        }
        self.state.sort.apply(&mut listings);
        listings
    }

    pub fn cluster_layout(&self) -> Vec<ClusterGroup> {
        self.clusterer.cluster(&self.mappable_listings())
    }

    pub fn view(&self) -> SessionView {
        let listings = self.displayed_listings();
        let images = self
            .images
            .states_for(listings.iter().map(|listing| listing.id.as_str()));
        SessionView {
            place: self.state.place.clone(),
            committed_place: self.state.committed_place.clone(),
            filters: self.state.filters.clone(),
            total_listings: self.listings.value().map(ListingSet::len).unwrap_or(0),
            sources: self
                .listings
                .value()
                .map(|set| set.sources.clone())
                .unwrap_or_default(),
            listings_loading: self.listings.is_loading(),
            listings_error: self.listings.failure().cloned(),
            weather: self.weather.value().cloned(),
            weather_loading: self.weather.is_loading(),
            weather_error: self.weather.failure().cloned(),
            clusters: self.cluster_layout(),
            images,
            selected: self.state.selected.clone(),
            hovered: self.state.hovered.clone(),
            favorites: self.state.favorites.clone(),
            show_favorites_only: self.state.show_favorites_only,
            cluster_restricted: self.state.cluster_restriction.is_some(),
            sort: self.state.sort,
            storage_error: self.storage_error.clone(),
            listings,
        }
    }
}

fn weather_failure(err: &AppError) -> SearchFailure {
    match SearchFailure::from(err) {
        SearchFailure::Unavailable(_) => {
            SearchFailure::Unavailable("weather data could not be loaded".into())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::model::fixtures::listing;
    use crate::model::ListingsPage;

    /// Scripted source: listings per place, optional failure modes, call counters.
    #[derive(Default)]
    struct ScriptedSource {
        listings: Mutex<HashMap<String, Vec<Listing>>>,
        listing_calls: AtomicU32,
        weather_calls: AtomicU32,
        rate_limit_listings: Mutex<bool>,
        malformed_listings: Mutex<bool>,
        fail_weather: Mutex<bool>,
    }

    impl ScriptedSource {
        fn with_place(self, place: &str, listings: Vec<Listing>) -> Self {
            self.listings.lock().insert(place.to_string(), listings);
            self
        }
    }

    #[async_trait]
    impl RentalDataSource for ScriptedSource {
        async fn fetch_listings(
            &self,
            place: &str,
            _filters: &FilterCriteria,
        ) -> AppResult<ListingsPage> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            if *self.rate_limit_listings.lock() {
                return Err(AppError::RateLimited("RESOURCE_EXHAUSTED".into()));
            }
            if *self.malformed_listings.lock() {
                return Err(AppError::MalformedResponse(
                    "EOF while parsing a list at line 1 column 1429".into(),
                ));
            }
            Ok(ListingsPage {
                listings: self.listings.lock().get(place).cloned().unwrap_or_default(),
                sources: vec![Source {
                    uri: format!("https://listings.example/{place}"),
                    title: None,
                }],
            })
        }

        async fn fetch_weather(&self, _place: &str) -> AppResult<WeatherSnapshot> {
            self.weather_calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail_weather.lock() {
                return Err(AppError::Remote("weather backend down".into()));
            }
            Ok(WeatherSnapshot {
                temperature: 72.0,
                condition: "Sunny".into(),
                wind_speed: 5.0,
            })
        }

        async fn fetch_location_suggestions(&self, partial: &str) -> AppResult<Vec<String>> {
            if partial.starts_with('x') {
                return Err(AppError::Remote("nope".into()));
            }
            Ok(vec![format!("{partial}ville, TN")])
        }

        async fn generate_image(&self, subject: &str) -> AppResult<String> {
            Ok(format!("data:image/png;base64,{}", subject.len()))
        }

        async fn enhance_image(&self, image_ref: &str) -> AppResult<String> {
            Ok(image_ref.to_string())
        }
    }

    fn nashville() -> Vec<Listing> {
        vec![
            listing("n1", 1200.0, 1, 36.16, -86.78),
            listing("n2", 2400.0, 3, 36.17, -86.77),
            listing("n3", 1800.0, 2, 36.30, -86.60),
            listing("n4", 3100.0, 4, 36.161, -86.781),
        ]
    }

    fn test_config() -> AppConfig {
        AppConfig {
            text_max_retries: 2,
            image_max_retries: 1,
            retry_initial_delay_ms: 0,
            retry_jitter_ms: 0,
            ..AppConfig::default()
        }
    }

    fn session_with(source: Arc<ScriptedSource>, dir: &std::path::Path) -> SearchSession {
        SearchSession::new(source, SettingsStore::new(dir), &test_config())
    }

    #[tokio::test]
    async fn identical_commits_hit_the_remote_once() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().with_place("Nashville, TN", nashville()));
        let mut session = session_with(Arc::clone(&source), dir.path());

        session.search("Nashville, TN", FilterCriteria::default()).await;
        assert!(session
            .commit_search("Nashville, TN", FilterCriteria::default())
            .is_none());

        assert_eq!(source.listing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.weather_calls.load(Ordering::SeqCst), 1);
        let stats = session.cache().listings.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (1, 1, 1));
        let view = session.view();
        assert_eq!(view.listings.len(), 4);
        assert!(!view.listings_loading);
        assert_eq!(view.weather.unwrap().condition, "Sunny");
    }

    #[tokio::test]
    async fn filter_change_refetches_and_hides_smaller_units() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().with_place("Nashville, TN", nashville()));
        let mut session = session_with(Arc::clone(&source), dir.path());

        session.search("Nashville, TN", FilterCriteria::default()).await;
        session.select_listing(Some("n1"));
        session.toggle_favorite("n2");

        let three_beds = FilterCriteria {
            min_bedrooms: Some(3),
            ..FilterCriteria::default()
        };
        let pending = session.commit_search("Nashville, TN", three_beds).unwrap();
        assert!(session.view().listings.is_empty());
        assert!(session.view().listings_loading);
        assert!(!session.view().weather_loading);
        session.apply(pending.run().await);

        assert_eq!(source.listing_calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.weather_calls.load(Ordering::SeqCst), 1);
        let view = session.view();
        assert!(view.listings.iter().all(|l| l.bedrooms >= 3));
        assert_eq!(view.listings.len(), 2);
        assert_eq!(view.selected, None);
        assert!(view.favorites.contains("n2"));
    }

    #[tokio::test]
    async fn late_response_for_superseded_query_is_discarded() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            ScriptedSource::default()
                .with_place("Nashville, TN", nashville())
                .with_place("Austin, TX", vec![listing("a1", 1500.0, 2, 30.27, -97.74)]),
        );
        let mut session = session_with(source, dir.path());

        let query_a = session
            .commit_search("Nashville, TN", FilterCriteria::default())
            .unwrap();
        let query_b = session
            .commit_search("Austin, TX", FilterCriteria::default())
            .unwrap();
        assert_ne!(query_a.key(), query_b.key());
        assert_eq!(query_b.key().place.as_str(), "austin, tx");

        let outcome_b = query_b.run().await;
        let report_b = session.apply(outcome_b);
        assert!(report_b.listings_applied && report_b.weather_applied);

        let outcome_a = query_a.run().await;
        let report_a = session.apply(outcome_a);
        assert_eq!(report_a, ApplyReport::default());

        let view = session.view();
        assert_eq!(view.committed_place.as_deref(), Some("Austin, TX"));
        let ids: Vec<_> = view.listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["a1"]);

        // The superseded fetch still completed, so its result is cached.
        assert!(session
            .commit_search("Nashville, TN", FilterCriteria::default())
            .is_none());
        assert_eq!(session.view().listings.len(), 4);
    }

    #[tokio::test]
    async fn weather_failure_does_not_block_listings() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().with_place("Nashville, TN", nashville()));
        *source.fail_weather.lock() = true;
        let mut session = session_with(Arc::clone(&source), dir.path());

        session.search("Nashville, TN", FilterCriteria::default()).await;

        let view = session.view();
        assert_eq!(view.listings.len(), 4);
        assert!(view.listings_error.is_none());
        assert!(matches!(view.weather_error, Some(SearchFailure::Unavailable(_))));
        assert!(matches!(
            session.weather_state(),
            RegionState::Failed(place, _) if place.as_str() == "nashville, tn"
        ));
        assert_eq!(source.weather_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_surfaces_try_again_later() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default());
        *source.rate_limit_listings.lock() = true;
        let mut session = session_with(Arc::clone(&source), dir.path());

        session.search("Nashville, TN", FilterCriteria::default()).await;

        assert_eq!(source.listing_calls.load(Ordering::SeqCst), 3);
        let view = session.view();
        assert_eq!(view.listings_error, Some(SearchFailure::TryAgainLater));
        assert!(view.weather.is_some());

        // Failures are not cached: the next commit asks again.
        *source.rate_limit_listings.lock() = false;
        assert!(session
            .commit_search("Nashville, TN", FilterCriteria::default())
            .is_some());
    }

    #[tokio::test]
    async fn malformed_listings_are_not_retried() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default());
        *source.malformed_listings.lock() = true;
        let mut session = session_with(Arc::clone(&source), dir.path());

        session.search("Nashville, TN", FilterCriteria::default()).await;

        assert_eq!(source.listing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            session.view().listings_error,
            Some(SearchFailure::BadResponseFormat)
        );
    }

    #[tokio::test]
    async fn empty_result_is_a_valid_state() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default());
        let mut session = session_with(source, dir.path());

        session.search("Nowhere, ZZ", FilterCriteria::default()).await;

        let view = session.view();
        assert!(view.listings.is_empty());
        assert!(view.listings_error.is_none());
        assert!(!view.listings_loading);
        assert!(view.clusters.is_empty());
    }

    #[test]
    fn empty_place_is_ignored() {
        let dir = tempdir().unwrap();
        let mut session = session_with(Arc::new(ScriptedSource::default()), dir.path());
        assert!(session.commit_search("   ", FilterCriteria::default()).is_none());
        assert!(session.state().committed_place.is_none());
        assert_eq!(*session.listings_state(), RegionState::Idle);
    }

    #[tokio::test]
    async fn favorites_clusters_and_sorting_shape_the_view() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().with_place("Nashville, TN", nashville()));
        let mut session = session_with(source, dir.path());
        session.search("Nashville, TN", FilterCriteria::default()).await;

        let prices: Vec<_> = session.view().listings.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![1200.0, 1800.0, 2400.0, 3100.0]);
        session.set_sort(SortKey::PriceDesc);
        assert_eq!(session.view().listings[0].id, "n4");
        session.set_sort(SortKey::SqftDesc);
        assert_eq!(session.view().listings[0].id, "n4");

        let clusters = session.cluster_layout();
        let downtown = clusters
            .iter()
            .find(|group| group.contains("n1"))
            .cloned()
            .unwrap();
        assert!(downtown.contains("n4"));
        assert!(!downtown.contains("n3"));

        session.apply_cluster_restriction(downtown.ids.clone());
        let view = session.view();
        assert!(view.cluster_restricted);
        assert!(view.listings.iter().all(|l| downtown.contains(&l.id)));
        assert_eq!(view.clusters.len(), clusters.len());
        session.clear_cluster_restriction();

        assert!(session.toggle_favorite("n3"));
        session.set_show_favorites_only(true);
        let ids: Vec<_> = session.view().listings.into_iter().map(|l| l.id).collect();
        assert_eq!(ids, vec!["n3"]);
        assert!(!session.toggle_favorite("n3"));
        assert!(session.view().listings.is_empty());

        session.hover_listing(Some("n2"));
        assert_eq!(session.view().hovered.as_deref(), Some("n2"));
        session.hover_listing(None);
        assert_eq!(session.view().hovered, None);
    }

    #[tokio::test]
    async fn saved_settings_restore_and_commit() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().with_place("Nashville, TN", nashville()));
        let filters = FilterCriteria {
            min_bedrooms: Some(2),
            ..FilterCriteria::default()
        };

        {
            let mut session = session_with(Arc::clone(&source), dir.path());
            session.set_draft_place("Nashville, TN");
            session.set_draft_filters(filters.clone());
            session.save_settings().unwrap();
            session.toggle_favorite("n2");
            session.save_favorites().unwrap();
        }

        let mut session = session_with(Arc::clone(&source), dir.path());
        session.load_favorites().unwrap();
        let pending = session.load_settings().unwrap().unwrap();
        assert_eq!(session.state().committed_filters, Some(filters));
        session.apply(pending.run().await);

        let view = session.view();
        assert_eq!(view.place, "Nashville, TN");
        assert!(view.listings.iter().all(|l| l.bedrooms >= 2));
        assert!(view.favorites.contains("n2"));
    }

    #[test]
    fn storage_failures_are_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let mut session = session_with(Arc::new(ScriptedSource::default()), &blocker);

        session.set_draft_place("Boise, ID");
        assert!(session.save_settings().is_err());
        assert!(session.view().storage_error.is_some());
        assert!(session.load_settings().is_err());
        assert_eq!(session.view().place, "Boise, ID");
    }

    #[tokio::test]
    async fn suggestions_are_best_effort() {
        let dir = tempdir().unwrap();
        let session = session_with(Arc::new(ScriptedSource::default()), dir.path());
        assert_eq!(session.suggest_locations("Nash").await, vec!["Nashville, TN"]);
        assert!(session.suggest_locations("xyz").await.is_empty());
        assert!(session.suggest_locations("  ").await.is_empty());
    }

    #[tokio::test]
    async fn images_load_lazily_for_displayed_listings() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().with_place("Nashville, TN", nashville()));
        let mut session = session_with(source, dir.path());
        session.search("Nashville, TN", FilterCriteria::default()).await;

        let view = session.view();
        assert!(view.images.values().all(|state| *state == ImageState::None));

        let first = view.listings[0].clone();
        session.images().on_visible(&first).await;
        let view = session.view();
        assert!(view.images[&first.id].can_enhance());
        assert_eq!(
            view.images.values().filter(|s| **s == ImageState::None).count(),
            3
        );
    }
}
