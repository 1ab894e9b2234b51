use std::collections::HashSet;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Apartment,
    House,
    Condo,
    Townhouse,
}

impl PropertyType {
    pub const ALL: [PropertyType; 4] = [
        PropertyType::Apartment,
        PropertyType::House,
        PropertyType::Condo,
        PropertyType::Townhouse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Apartment => "Apartment",
            PropertyType::House => "House",
            PropertyType::Condo => "Condo",
            PropertyType::Townhouse => "Townhouse",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct School {
    pub name: String,
    pub distance: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    #[serde(flatten)]
    pub location: Location,
    pub price: f64,
    pub bedrooms: u32,
    pub bathrooms: f64,
    pub sqft: f64,
    pub property_type: PropertyType,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub is_rent_to_own: Option<bool>,
    #[serde(default)]
    pub private_schools: Option<Vec<School>>,
    #[serde(default)]
    pub contact: Option<Contact>,
}

impl Listing {
    pub fn rent_to_own(&self) -> bool {
        self.is_rent_to_own.unwrap_or(false)
    }

    fn violation(&self) -> Option<&'static str> {
        if !(self.price.is_finite() && self.price >= 0.0) {
            return Some("price");
        }
        if !(self.bathrooms.is_finite() && self.bathrooms >= 0.0) {
            return Some("bathrooms");
        }
        if !(self.sqft.is_finite() && self.sqft >= 0.0) {
            return Some("sqft");
        }
        if !(self.location.lat.is_finite() && self.location.lng.is_finite()) {
            return Some("coordinates");
        }
        None
    }

    fn derived_id(&self, salt: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.location.address.as_bytes());
        hasher.update(self.location.city.as_bytes());
        hasher.update(self.location.zip.as_bytes());
        hasher.update(salt.to_le_bytes());
        let digest = URL_SAFE_NO_PAD.encode(hasher.finalize());
        format!("listing_{}", &digest[..16])
    }
}

/// Minimum bathroom count in half-bath steps so filters stay hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BathCount(u16);

impl BathCount {
    pub fn new(value: f64) -> Self {
        let halves = (value.max(0.0) * 2.0).round();
        Self(halves.min(u16::MAX as f64) as u16)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.0) / 2.0
    }
}

impl Serialize for BathCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for BathCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(BathCount::new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRange {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteria {
    pub price: PriceRange,
    /// `None` means any.
    #[serde(default)]
    pub min_bedrooms: Option<u32>,
    #[serde(default)]
    pub min_bathrooms: Option<BathCount>,
    #[serde(default)]
    pub property_type: Option<PropertyType>,
    #[serde(default)]
    pub rent_to_own: bool,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self {
            price: PriceRange {
                min: 500,
                max: 10_000,
            },
            min_bedrooms: None,
            min_bathrooms: None,
            property_type: None,
            rent_to_own: false,
        }
    }
}

impl FilterCriteria {
    pub fn normalized(&self) -> Self {
        let mut normalized = self.clone();
        if normalized.price.min > normalized.price.max {
            std::mem::swap(&mut normalized.price.min, &mut normalized.price.max);
        }
        normalized
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        let price = self.normalized().price;
        if listing.price < f64::from(price.min) || listing.price > f64::from(price.max) {
            return false;
        }
        if let Some(beds) = self.min_bedrooms {
            if listing.bedrooms < beds {
                return false;
            }
        }
        if let Some(baths) = self.min_bathrooms {
            if listing.bathrooms < baths.as_f64() {
                return false;
            }
        }
        if let Some(kind) = self.property_type {
            if listing.property_type != kind {
                return false;
            }
        }
        !self.rent_to_own || listing.rent_to_own()
    }

    /// Plain-language rendering used when asking the remote source for listings.
    pub fn describe(&self) -> String {
        let price = self.normalized().price;
        let mut parts = vec![format!("monthly rent between ${} and ${}", price.min, price.max)];
        if let Some(beds) = self.min_bedrooms {
            parts.push(format!("at least {beds} bedrooms"));
        }
        if let Some(baths) = self.min_bathrooms {
            parts.push(format!("at least {} bathrooms", baths.as_f64()));
        }
        if let Some(kind) = self.property_type {
            parts.push(format!("property type {kind}"));
        }
        if self.rent_to_own {
            parts.push("rent-to-own options only".to_string());
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSnapshot {
    /// Degrees Fahrenheit.
    pub temperature: f64,
    pub condition: String,
    /// Miles per hour.
    pub wind_speed: f64,
}

impl WeatherSnapshot {
    pub fn temperature_celsius(&self) -> f64 {
        (self.temperature - 32.0) * 5.0 / 9.0
    }
}

/// A web page the remote source cited for a listing set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub uri: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Raw result of a listings fetch, before sanitation.
#[derive(Debug, Clone, Default)]
pub struct ListingsPage {
    pub listings: Vec<Listing>,
    pub sources: Vec<Source>,
}

/// A cleaned listing set: ids are unique and numeric fields are non-negative.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListingSet {
    pub listings: Vec<Listing>,
    pub sources: Vec<Source>,
}

impl ListingSet {
    pub fn from_page(page: ListingsPage) -> Self {
        let mut seen = HashSet::with_capacity(page.listings.len());
        let mut listings = Vec::with_capacity(page.listings.len());
        for mut listing in page.listings {
            if let Some(field) = listing.violation() {
                warn!(listing_id = %listing.id, field, "dropping listing with invalid field");
                continue;
            }
            let mut salt = 0;
            while listing.id.trim().is_empty() || seen.contains(&listing.id) {
                listing.id = listing.derived_id(salt);
                salt += 1;
            }
            seen.insert(listing.id.clone());
            listings.push(listing);
        }
        Self {
            listings,
            sources: page.sources,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Listing> {
        self.listings.iter().find(|listing| listing.id == id)
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}
