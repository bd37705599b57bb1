// src/geofence/region.rs - Circular region math and fix-based transition detection

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use super::{RegionTransition, TransitionKind};
use crate::core::types::{GeofenceRegion, Location};

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

pub fn valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

impl GeofenceRegion {
    pub fn distance_to(&self, lat: f64, lon: f64) -> f64 {
        haversine_m(self.latitude, self.longitude, lat, lon)
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        valid_coordinate(lat, lon) && self.radius_m > 0.0 && self.distance_to(lat, lon) <= self.radius_m
    }
}

/// Location whose geofence contains the fix; the nearest centre wins when
/// several overlap.
pub fn resolve_location(locations: &[Location], lat: f64, lon: f64) -> Option<&Location> {
    if !valid_coordinate(lat, lon) {
        return None;
    }
    locations
        .iter()
        .map(|loc| (loc, GeofenceRegion::from_location(loc)))
        .filter(|(_, region)| region.contains(lat, lon))
        .min_by(|(_, a), (_, b)| a.distance_to(lat, lon).total_cmp(&b.distance_to(lat, lon)))
        .map(|(loc, _)| loc)
}

/// Turns a stream of position fixes into Enter/Exit transitions by diffing
/// region membership between consecutive fixes.
#[derive(Debug, Default)]
pub struct RegionTracker {
    inside: HashSet<String>,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(
        &mut self,
        regions: &[GeofenceRegion],
        lat: f64,
        lon: f64,
        at: DateTime<Utc>,
    ) -> Vec<RegionTransition> {
        if !valid_coordinate(lat, lon) {
            tracing::debug!(lat, lon, "Ignoring invalid position fix");
            return Vec::new();
        }

        let mut transitions = Vec::new();
        for region in regions {
            let now_inside = region.contains(lat, lon);
            let was_inside = self.inside.contains(&region.identifier);
            let kind = match (was_inside, now_inside) {
                (false, true) => TransitionKind::Enter,
                (true, false) => TransitionKind::Exit,
                _ => continue,
            };
            if now_inside {
                self.inside.insert(region.identifier.clone());
            } else {
                self.inside.remove(&region.identifier);
            }
            transitions.push(RegionTransition {
                region_id: region.identifier.clone(),
                kind,
                at,
            });
        }
        transitions
    }

    pub fn is_inside(&self, region_id: &str) -> bool {
        self.inside.contains(region_id)
    }

    pub fn reset(&mut self) {
        self.inside.clear();
    }

    /// Start from "inside" every region, so the first fix outside is an Exit.
    pub fn assume_inside(&mut self, regions: &[GeofenceRegion]) {
        self.inside = regions.iter().map(|r| r.identifier.clone()).collect();
    }
}
