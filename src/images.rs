use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::KeyedCache;
use crate::errors::sanitize_error_copy;
use crate::model::Listing;
use crate::retry::ResilientInvoker;
use crate::source::RentalDataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageOrigin {
    Generated,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ImageState {
    None,
    Loading,
    Ready { origin: ImageOrigin, url: String },
    Enhancing { url: String },
    Enhanced { url: String },
}

impl ImageState {
    pub fn url(&self) -> Option<&str> {
        match self {
            ImageState::Ready { url, .. }
            | ImageState::Enhancing { url }
            | ImageState::Enhanced { url } => Some(url),
            ImageState::None | ImageState::Loading => None,
        }
    }

    pub fn can_enhance(&self) -> bool {
        matches!(
            self,
            ImageState::Ready {
                origin: ImageOrigin::Generated,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnhanceOutcome {
    /// Not offered for this listing right now (no generated image, or already busy/done).
    Skipped,
    Enhanced { url: String },
    /// The prior image is kept.
    Failed { reason: String },
}

/// Lazy, visibility-driven image acquisition with an optional one-shot enhancement.
#[derive(Clone)]
pub struct ImageAssetPipeline {
    source: Arc<dyn RentalDataSource>,
    cache: KeyedCache<String, String>,
    invoker: ResilientInvoker,
    slots: Arc<Mutex<HashMap<String, ImageState>>>,
}

impl ImageAssetPipeline {
    pub fn new(
        source: Arc<dyn RentalDataSource>,
        cache: KeyedCache<String, String>,
        invoker: ResilientInvoker,
    ) -> Self {
        Self {
            source,
            cache,
            invoker,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state(&self, listing_id: &str) -> ImageState {
        self.slots
            .lock()
            .get(listing_id)
            .cloned()
            .unwrap_or(ImageState::None)
    }

    pub fn states_for<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, ImageState> {
        let slots = self.slots.lock();
        ids.into_iter()
            .map(|id| {
                let state = slots.get(id).cloned().unwrap_or(ImageState::None);
                (id.to_string(), state)
            })
            .collect()
    }

    /// Called when a listing first scrolls into view. Only the first call for a
    /// listing fetches; later calls return the current state untouched.
    pub async fn on_visible(&self, listing: &Listing) -> ImageState {
        {
            let mut slots = self.slots.lock();
            match slots.get(&listing.id) {
                Some(ImageState::None) | None => {}
                Some(existing) => return existing.clone(),
            }
            if let Some(url) = self.cache.get(&listing.id) {
                let ready = ImageState::Ready {
                    origin: ImageOrigin::Generated,
                    url,
                };
                slots.insert(listing.id.clone(), ready.clone());
                return ready;
            }
            slots.insert(listing.id.clone(), ImageState::Loading);
        }

        let subject = describe_subject(listing);
        let result = self
            .cache
            .get_or_fetch(listing.id.clone(), || {
                self.invoker
                    .run_quota_aware(|| self.source.generate_image(&subject))
            })
            .await;

        let state = match result {
            Ok(url) => {
                debug!(listing_id = %listing.id, "generated listing image");
                ImageState::Ready {
                    origin: ImageOrigin::Generated,
                    url,
                }
            }
            Err(err) => {
                warn!(?err, listing_id = %listing.id, "image generation failed; using placeholder");
                ImageState::Ready {
                    origin: ImageOrigin::Placeholder,
                    url: listing.image_url.clone(),
                }
            }
        };
        self.slots.lock().insert(listing.id.clone(), state.clone());
        state
    }

    pub async fn enhance(&self, listing_id: &str) -> EnhanceOutcome {
        let current = {
            let mut slots = self.slots.lock();
            let Some(ImageState::Ready {
                origin: ImageOrigin::Generated,
                url,
            }) = slots.get(listing_id).cloned()
            else {
                debug!(listing_id, "enhancement not available");
                return EnhanceOutcome::Skipped;
            };
            slots.insert(
                listing_id.to_string(),
                ImageState::Enhancing { url: url.clone() },
            );
            url
        };

        match self
            .invoker
            .run_quota_aware(|| self.source.enhance_image(&current))
            .await
        {
            Ok(url) => {
                info!(listing_id, "listing image enhanced");
                self.cache.insert(listing_id.to_string(), url.clone());
                self.slots.lock().insert(
                    listing_id.to_string(),
                    ImageState::Enhanced { url: url.clone() },
                );
                EnhanceOutcome::Enhanced { url }
            }
            Err(err) => {
                warn!(?err, listing_id, "image enhancement failed; keeping prior image");
                self.slots.lock().insert(
                    listing_id.to_string(),
                    ImageState::Ready {
                        origin: ImageOrigin::Generated,
                        url: current,
                    },
                );
                EnhanceOutcome::Failed {
                    reason: sanitize_error_copy(&err.to_string()),
                }
            }
        }
    }
}

fn describe_subject(listing: &Listing) -> String {
    let mut subject = format!(
        "a {}-bedroom {} at {}, {}",
        listing.bedrooms,
        listing.property_type.as_str().to_lowercase(),
        listing.location.address,
        listing.location.city
    );
    if !listing.amenities.is_empty() {
        let highlights: Vec<_> = listing.amenities.iter().take(3).map(String::as_str).collect();
        subject.push_str(&format!(" featuring {}", highlights.join(", ")));
    }
    subject
}
