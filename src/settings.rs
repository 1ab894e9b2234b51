use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::model::FilterCriteria;

const SAVED_SEARCH_FILE: &str = "saved-search.json";
const FAVORITES_FILE: &str = "favorites.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSearch {
    pub place: String,
    pub filters: FilterCriteria,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

impl SavedSearch {
    pub fn new(place: impl Into<String>, filters: FilterCriteria) -> Self {
        Self {
            place: place.into(),
            filters,
            saved_at: Utc::now(),
        }
    }
}

/// The two durable records a session keeps: one saved search and the favorites list.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    dir: PathBuf,
}

impl SettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_search(&self, search: &SavedSearch) -> AppResult<()> {
        self.persist(SAVED_SEARCH_FILE, search)
    }

    pub fn load_search(&self) -> AppResult<Option<SavedSearch>> {
        self.load(SAVED_SEARCH_FILE)
    }

    pub fn save_favorites(&self, favorites: &BTreeSet<String>) -> AppResult<()> {
        self.persist(FAVORITES_FILE, favorites)
    }

    pub fn load_favorites(&self) -> AppResult<BTreeSet<String>> {
        Ok(self.load(FAVORITES_FILE)?.unwrap_or_default())
    }

    fn persist<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> AppResult<()> {
        fs::create_dir_all(&self.dir)?;
        let serialized = serde_json::to_string_pretty(value)?;
        fs::write(self.dir.join(name), serialized)?;
        debug!(record = name, "persisted settings record");
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> AppResult<Option<T>> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<T>(&contents) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    warn!(
                        target: "settings",
                        error = ?err,
                        record = name,
                        "failed to parse settings record; ignoring it"
                    );
                    Ok(None)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Storage(format!(
                "unable to read {}: {err}",
                path.display()
            ))),
        }
    }
}
