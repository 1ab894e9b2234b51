mod cache;
mod clustering;
mod config;
mod errors;
mod gemini;
mod images;
mod model;
mod retry;
mod session;
mod settings;
mod source;

use std::path::Path;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheStats, KeyedCache, ListingsKey, PlaceKey, ResultCache};
pub use crate::clustering::{
    ClusterGroup, MarkerKind, NormalizedPoint, PlacedListing, SpatialClusterer,
    DEFAULT_CLUSTER_RADIUS,
};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::errors::{sanitize_error_copy, AppError, AppResult, SearchFailure};
pub use crate::gemini::GeminiDataSource;
pub use crate::images::{EnhanceOutcome, ImageAssetPipeline, ImageOrigin, ImageState};
pub use crate::model::{
    BathCount, Contact, FilterCriteria, Listing, ListingSet, ListingsPage, Location, PriceRange,
    PropertyType, School, Source, WeatherSnapshot,
};
pub use crate::retry::{ResilientInvoker, RetryPolicy};
pub use crate::session::{
    ApplyReport, PendingSearch, RegionState, SearchOutcome, SearchSession, SessionView,
    SessionViewState, SortKey,
};
pub use crate::settings::{SavedSearch, SettingsStore};
pub use crate::source::{build_data_source, RentalDataSource, SyntheticDataSource};

/// Builds a ready session: picks the data source from `config`, then restores
/// favorites from `data_dir`. A broken favorites file does not stop startup.
pub fn bootstrap_session(config: &AppConfig, data_dir: &Path) -> AppResult<SearchSession> {
    init_tracing();
    let source = build_data_source(config)?;
    let mut session = SearchSession::new(source, SettingsStore::new(data_dir), config);
    if let Err(err) = session.load_favorites() {
        warn!(?err, "failed to restore favorites");
    }
    info!(
        data_dir = %data_dir.display(),
        profile = ?config.public_profile(),
        "search session ready"
    );
    Ok(session)
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,rental_scout_lib=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
