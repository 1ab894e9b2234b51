use serde::Serialize;

use crate::model::Listing;

pub const DEFAULT_CLUSTER_RADIUS: f64 = 0.07;

/// Position in the unit square; `x` follows longitude, `y` follows latitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalizedPoint {
    pub x: f64,
    pub y: f64,
}

impl NormalizedPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &NormalizedPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedListing {
    pub id: String,
    pub point: NormalizedPoint,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MarkerKind {
    Individual,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroup {
    pub ids: Vec<String>,
    pub centroid: NormalizedPoint,
    pub count: usize,
    pub average_price: f64,
    pub kind: MarkerKind,
}

impl ClusterGroup {
    fn from_members(members: &[&PlacedListing]) -> Self {
        let count = members.len();
        let n = count as f64;
        let (sx, sy, sp) = members.iter().fold((0.0, 0.0, 0.0), |(x, y, p), m| {
            (x + m.point.x, y + m.point.y, p + m.price)
        });
        Self {
            ids: members.iter().map(|m| m.id.clone()).collect(),
            centroid: NormalizedPoint::new(sx / n, sy / n),
            count,
            average_price: sp / n,
            kind: if count == 1 {
                MarkerKind::Individual
            } else {
                MarkerKind::Aggregate
            },
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|member| member == id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialClusterer {
    radius: f64,
}

impl Default for SpatialClusterer {
    fn default() -> Self {
        Self::new(DEFAULT_CLUSTER_RADIUS)
    }
}

impl SpatialClusterer {
    pub fn new(radius: f64) -> Self {
        let radius = if radius.is_finite() && radius > 0.0 {
            radius
        } else {
            DEFAULT_CLUSTER_RADIUS
        };
        Self { radius }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Maps coordinates into the unit square using the set's own bounds. A zero
    /// range on either axis falls back to a span of 1 so every point lands at 0.
    pub fn normalize(&self, listings: &[Listing]) -> Vec<PlacedListing> {
        if listings.is_empty() {
            return Vec::new();
        }
        let (mut min_lat, mut max_lat) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_lng, mut max_lng) = (f64::INFINITY, f64::NEG_INFINITY);
        for listing in listings {
            min_lat = min_lat.min(listing.location.lat);
            max_lat = max_lat.max(listing.location.lat);
            min_lng = min_lng.min(listing.location.lng);
            max_lng = max_lng.max(listing.location.lng);
        }
        let lat_range = non_zero_span(max_lat - min_lat);
        let lng_range = non_zero_span(max_lng - min_lng);

        listings
            .iter()
            .map(|listing| PlacedListing {
                id: listing.id.clone(),
                point: NormalizedPoint::new(
                    (listing.location.lng - min_lng) / lng_range,
                    (listing.location.lat - min_lat) / lat_range,
                ),
                price: listing.price,
            })
            .collect()
    }

    pub fn cluster(&self, listings: &[Listing]) -> Vec<ClusterGroup> {
        self.group(&self.normalize(listings))
    }

    /// Single greedy pass in input order: each unassigned seed claims every
    /// unassigned point within the radius of itself.
    ///
    /// Only seed distance is guaranteed: every point outside a group is at least
    /// `radius` from that group's seed. Two members of different groups may still
    /// sit closer than `radius` to each other.
    pub fn group(&self, points: &[PlacedListing]) -> Vec<ClusterGroup> {
        let mut assigned = vec![false; points.len()];
        let mut groups = Vec::new();

        for (seed_idx, seed) in points.iter().enumerate() {
            if assigned[seed_idx] {
                continue;
            }
            let mut members = Vec::new();
            for (idx, candidate) in points.iter().enumerate().skip(seed_idx) {
                if !assigned[idx] && seed.point.distance(&candidate.point) < self.radius {
                    assigned[idx] = true;
                    members.push(candidate);
                }
            }
            groups.push(ClusterGroup::from_members(&members));
        }

        groups
    }
}

fn non_zero_span(span: f64) -> f64 {
    if span.is_finite() && span > 0.0 {
        span
    } else {
        1.0
    }
}
