//! Channel admission filters
//!
//! Matched channel names pass three filters in order:
//!
//! ```text
//! mask match → restriction (non-public needs a privileged peer)
//!            → exclusion prefixes
//!            → selected stations (ring filter, if one was requested)
//! ```

use crate::config::{QueryConfig, StationConfig};
use crate::query::error::{QueryError, QueryResult};
use crate::storage::types::SeedName;
use std::collections::{HashMap, HashSet};

/// Name of the exclusion list used when a request names none
pub const DEFAULT_EXCLUSION_LIST: &str = "default";

/// Source of access-restriction flags
pub trait RestrictionSource: Send + Sync {
    fn is_public(&self, channel: &SeedName) -> bool;
}

/// Channels starting with any configured prefix are not public
#[derive(Debug, Clone, Default)]
pub struct PrefixRestrictions {
    prefixes: Vec<String>,
}

impl PrefixRestrictions {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

impl RestrictionSource for PrefixRestrictions {
    fn is_public(&self, channel: &SeedName) -> bool {
        !self.prefixes.iter().any(|p| channel.as_str().starts_with(p.as_str()))
    }
}

/// Named lists of excluded channel prefixes
#[derive(Debug, Clone, Default)]
pub struct ExclusionLists {
    lists: HashMap<String, Vec<String>>,
}

impl ExclusionLists {
    pub fn new(lists: HashMap<String, Vec<String>>) -> Self {
        Self { lists }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(config.exclusions.clone())
    }

    /// Prefixes of list `id`, or of the default list; unknown ids exclude nothing
    pub fn prefixes(&self, id: Option<&str>) -> Vec<String> {
        let id = id.unwrap_or(DEFAULT_EXCLUSION_LIST);
        match self.lists.get(id) {
            Some(prefixes) => prefixes.clone(),
            None => {
                if id != DEFAULT_EXCLUSION_LIST {
                    tracing::warn!(list = id, "Unknown exclusion list");
                }
                Vec::new()
            }
        }
    }
}

/// Distance/azimuth ring around a point: `mindeg:maxdeg:lat:long[:minaz:maxaz]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingSpec {
    pub min_deg: f64,
    pub max_deg: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub azimuth: Option<(f64, f64)>,
}

impl RingSpec {
    pub fn parse(text: &str) -> QueryResult<Self> {
        let bad = || QueryError::Parse(format!("bad ring filter '{}'", text));
        let parts = text
            .split(':')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|_| bad())?;

        let azimuth = match parts.len() {
            4 => None,
            6 => Some((parts[4], parts[5])),
            _ => return Err(bad()),
        };
        let spec = Self {
            min_deg: parts[0],
            max_deg: parts[1],
            latitude: parts[2],
            longitude: parts[3],
            azimuth,
        };
        if spec.min_deg > spec.max_deg
            || !(-90.0..=90.0).contains(&spec.latitude)
            || !(-180.0..=360.0).contains(&spec.longitude)
        {
            return Err(bad());
        }
        Ok(spec)
    }

    /// Whether a point at `delta` degrees and `azimuth` from the center is inside
    pub fn contains(&self, delta: f64, azimuth: f64) -> bool {
        if delta < self.min_deg || delta > self.max_deg {
            return false;
        }
        match self.azimuth {
            None => true,
            Some((lo, hi)) if lo <= hi => azimuth >= lo && azimuth <= hi,
            // Range wraps through north
            Some((lo, hi)) => azimuth >= lo || azimuth <= hi,
        }
    }
}

/// Resolves a ring filter to the network+station keys inside it
pub trait MetadataLookup: Send + Sync {
    fn stations_in_ring(&self, ring: &RingSpec) -> QueryResult<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationLocation {
    /// Network + station, space padded to 7
    pub key: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Station coordinates from configuration
#[derive(Debug, Clone, Default)]
pub struct StationTable {
    stations: Vec<StationLocation>,
}

impl StationTable {
    pub fn from_config(stations: &[StationConfig]) -> Self {
        Self {
            stations: stations
                .iter()
                .map(|s| StationLocation {
                    key: SeedName::new(&s.name).network_station().to_string(),
                    latitude: s.latitude,
                    longitude: s.longitude,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

impl MetadataLookup for StationTable {
    fn stations_in_ring(&self, ring: &RingSpec) -> QueryResult<Vec<String>> {
        if self.stations.is_empty() {
            return Err(QueryError::Metadata("no station coordinates configured".to_string()));
        }
        Ok(self
            .stations
            .iter()
            .filter(|s| {
                let (delta, azimuth) =
                    distance_azimuth(ring.latitude, ring.longitude, s.latitude, s.longitude);
                ring.contains(delta, azimuth)
            })
            .map(|s| s.key.clone())
            .collect())
    }
}

/// Great-circle distance (degrees) and azimuth (degrees from north) from point 1 to point 2
pub fn distance_azimuth(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64) {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = phi2 - phi1;
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlon / 2.0).sin().powi(2);
    let delta = 2.0 * a.sqrt().min(1.0).asin();

    let y = dlon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlon.cos();
    let azimuth = y.atan2(x).to_degrees().rem_euclid(360.0);

    (delta.to_degrees(), azimuth)
}

/// Per-request admission rules applied after the mask matches
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    pub privileged: bool,
    pub show_illegal: bool,
    pub exclusions: Vec<String>,
    /// Network+station keys admitted by a ring filter
    pub selected: Option<HashSet<String>>,
}

impl ChannelFilter {
    pub fn admits(&self, channel: &SeedName, restrictions: &dyn RestrictionSource) -> bool {
        if !self.show_illegal && !channel.is_legal() {
            return false;
        }
        if !self.privileged && !restrictions.is_public(channel) {
            return false;
        }
        if self
            .exclusions
            .iter()
            .any(|p| channel.as_str().starts_with(p.as_str()))
        {
            return false;
        }
        match &self.selected {
            Some(keys) => keys.contains(channel.network_station()),
            None => true,
        }
    }
}
