use std::sync::Arc;

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::gemini::GeminiDataSource;
use crate::model::{
    FilterCriteria, Listing, ListingsPage, Location, PropertyType, School, WeatherSnapshot,
};

/// Everything the session needs from the remote generative endpoint.
#[async_trait]
pub trait RentalDataSource: Send + Sync {
    async fn fetch_listings(&self, place: &str, filters: &FilterCriteria)
        -> AppResult<ListingsPage>;

    async fn fetch_weather(&self, place: &str) -> AppResult<WeatherSnapshot>;

    async fn fetch_location_suggestions(&self, partial: &str) -> AppResult<Vec<String>>;

    async fn generate_image(&self, subject: &str) -> AppResult<String>;

    async fn enhance_image(&self, image_ref: &str) -> AppResult<String>;
}

pub fn build_data_source(config: &AppConfig) -> AppResult<Arc<dyn RentalDataSource>> {
    match GeminiDataSource::maybe_new(config)? {
        Some(client) => Ok(Arc::new(client)),
        None => {
            tracing::info!("no Gemini key configured; using synthetic listings");
            Ok(Arc::new(SyntheticDataSource::new(config.listings_per_search)))
        }
    }
}

const STREETS: &[&str] = &["Oak", "Maple", "Cedar", "Elm", "Main", "Church", "Park", "Lake"];
const AMENITIES: &[&str] = &[
    "In-unit laundry",
    "Dishwasher",
    "Parking",
    "Pet friendly",
    "Balcony",
    "Gym",
    "Pool",
    "Central air",
];
const CONDITIONS: &[&str] = &["Sunny", "Partly Cloudy", "Overcast", "Light Rain", "Clear"];

/// Offline stand-in: deterministic per place so repeated runs look the same.
#[derive(Debug, Clone)]
pub struct SyntheticDataSource {
    listings_per_search: usize,
}

impl SyntheticDataSource {
    pub fn new(listings_per_search: usize) -> Self {
        Self {
            listings_per_search: listings_per_search.max(1),
        }
    }

    fn rng_for(parts: &[&str]) -> StdRng {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.trim().to_lowercase().as_bytes());
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        let mut seed = [0_u8; 32];
        seed.copy_from_slice(&digest);
        StdRng::from_seed(seed)
    }

    fn synthesize(
        &self,
        rng: &mut StdRng,
        place: &str,
        index: usize,
        filters: &FilterCriteria,
        variant: &str,
    ) -> Listing {
        let (city, state) = split_place(place);
        let price = filters.normalized().price;
        let bedrooms = filters.min_bedrooms.unwrap_or(0) + rng.gen_range(0..=2);
        let min_baths = filters.min_bathrooms.map(|b| b.as_f64()).unwrap_or(1.0);
        let bathrooms = min_baths + f64::from(rng.gen_range(0..=2_u8)) * 0.5;
        let property_type = filters
            .property_type
            .unwrap_or(PropertyType::ALL[rng.gen_range(0..PropertyType::ALL.len())]);
        let amenities = (0..rng.gen_range(4..=6))
            .map(|i| AMENITIES[(index + i) % AMENITIES.len()].to_string())
            .collect();
        let id = format!(
            "synthetic-{}-{variant}-{index}",
            city.to_lowercase().replace(' ', "-")
        );

        Listing {
            location: Location {
                address: format!(
                    "{} {} St",
                    rng.gen_range(100..9999),
                    STREETS[rng.gen_range(0..STREETS.len())]
                ),
                city: city.clone(),
                state,
                zip: format!("{:05}", rng.gen_range(10_000..99_999)),
                lat: rng.gen_range(-0.08..0.08),
                lng: rng.gen_range(-0.08..0.08),
            },
            price: f64::from(rng.gen_range(price.min..=price.max)),
            bedrooms,
            bathrooms,
            sqft: f64::from(450 + bedrooms * 350 + rng.gen_range(0..300)),
            property_type,
            amenities,
            image_url: format!("https://picsum.photos/seed/{id}/800/600"),
            is_rent_to_own: Some(filters.rent_to_own || rng.gen_bool(0.2)),
            private_schools: Some(vec![School {
                name: format!("{city} Academy"),
                distance: format!("{:.1} miles", rng.gen_range(0.3..4.0)),
            }]),
            contact: None,
            id,
        }
    }
}

#[async_trait]
impl RentalDataSource for SyntheticDataSource {
    async fn fetch_listings(
        &self,
        place: &str,
        filters: &FilterCriteria,
    ) -> AppResult<ListingsPage> {
        let mut rng = Self::rng_for(&[place]);
        let (center_lat, center_lng) = (rng.gen_range(25.0..48.0), rng.gen_range(-122.0..-71.0));
        let filters_json = serde_json::to_string(&filters.normalized())?;
        let variant: String = Sha256::digest(filters_json.as_bytes())
            .iter()
            .take(4)
            .map(|b| format!("{b:02x}"))
            .collect();
        let mut listings_rng = Self::rng_for(&[place, &filters_json]);
        let listings = (0..self.listings_per_search)
            .map(|index| {
                let mut listing =
                    self.synthesize(&mut listings_rng, place, index, filters, &variant);
                listing.location.lat += center_lat;
                listing.location.lng += center_lng;
                listing
            })
            .collect();
        Ok(ListingsPage {
            listings,
            sources: Vec::new(),
        })
    }

    async fn fetch_weather(&self, place: &str) -> AppResult<WeatherSnapshot> {
        let mut rng = Self::rng_for(&[place, "weather"]);
        Ok(WeatherSnapshot {
            temperature: f64::from(rng.gen_range(20..95)),
            condition: CONDITIONS[rng.gen_range(0..CONDITIONS.len())].to_string(),
            wind_speed: f64::from(rng.gen_range(0..25)),
        })
    }

    async fn fetch_location_suggestions(&self, _partial: &str) -> AppResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn generate_image(&self, subject: &str) -> AppResult<String> {
        let digest = Sha256::digest(subject.as_bytes());
        let seed: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        Ok(format!("https://picsum.photos/seed/{seed}/800/600"))
    }

    async fn enhance_image(&self, image_ref: &str) -> AppResult<String> {
        if image_ref.is_empty() {
            return Err(AppError::Remote("nothing to enhance".into()));
        }
        Ok(format!("{image_ref}?enhanced=1"))
    }
}

fn split_place(place: &str) -> (String, String) {
    let mut parts = place.split(',').map(str::trim).filter(|p| !p.is_empty());
    let city = parts.next().unwrap_or("Springfield").to_string();
    let state = parts.next().unwrap_or("").to_string();
    (city, state)
}
