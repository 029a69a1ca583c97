use std::sync::Arc;

use schema::{CtoEntry, ValidationError};
use serde::Serialize;
use store::{DatasetKey, PersistenceBackend, StoreResult};
use tracing::debug;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const DEFAULT_RADIUS_M: f64 = 500.0;
pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_RADIUS_M: f64 = 50_000.0;
pub const MAX_LIMIT: usize = 200;

/// Great-circle distance in metres.
pub fn haversine_m(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let half_dlat = (lat2 - lat1) / 2.0;
    let half_dlon = (lon2 - lon1) / 2.0;
    let a = half_dlat.sin().powi(2) + lat1.cos() * lat2.cos() * half_dlon.sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyCto {
    #[serde(flatten)]
    pub entry: CtoEntry,
    pub distance_m: f64,
}

/// Entries within `radius_m` of the point, closest first. Entries without
/// usable coordinates are skipped.
pub fn nearest(
    entries: impl IntoIterator<Item = CtoEntry>,
    latitude: f64,
    longitude: f64,
    radius_m: f64,
    limit: usize,
) -> Vec<NearbyCto> {
    let origin = (latitude, longitude);
    let mut found: Vec<NearbyCto> = entries
        .into_iter()
        .filter_map(|entry| {
            let distance_m = haversine_m(origin, entry.coordinates()?);
            (distance_m <= radius_m).then_some(NearbyCto { entry, distance_m })
        })
        .collect();
    found.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    found.truncate(limit);
    found
}

pub struct CtoDirectory {
    backend: Arc<dyn PersistenceBackend>,
}

impl CtoDirectory {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self { backend }
    }

    pub async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius_m: Option<f64>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<NearbyCto>> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(ValidationError::InvalidRange("lat").into());
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(ValidationError::InvalidRange("lng").into());
        }
        let radius_m = radius_m.unwrap_or(DEFAULT_RADIUS_M);
        if !(radius_m > 0.0 && radius_m <= MAX_RADIUS_M) {
            return Err(ValidationError::InvalidRange("raio").into());
        }
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(ValidationError::InvalidRange("limite").into());
        }

        let records = self.backend.read(DatasetKey::CtoBase).await?;
        let scanned = records.len();
        let found = nearest(
            records.iter().map(CtoEntry::from_record),
            latitude,
            longitude,
            radius_m,
            limit,
        );
        debug!(scanned, found = found.len(), radius_m, "cto proximity query");
        Ok(found)
    }
}
