//! Core data types shared by the storage, realtime and query layers
//!
//! - `SeedName`: the fixed 12-character channel identifier
//! - Julian day helpers used as the on-disk partition key
//! - `TimeRange`: a half-open millisecond interval
//! - `FileDescriptor`: one `YYYY_DDD_NODE.idx` file found by a directory scan

use crate::storage::error::{StorageError, StorageResult};
use chrono::{DateTime, Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Julian day number of 1970-01-01
pub const JULIAN_UNIX_EPOCH: i32 = 2_440_588;

/// Offset between chrono's day count from the common era and the julian day number
const JULIAN_CE_OFFSET: i32 = 1_721_425;

/// Milliseconds in one day
pub const MS_PER_DAY: i64 = 86_400_000;

/// A channel identifier: network(2) station(5) channel(3) location(2), space padded
///
/// The inner string is always exactly 12 ASCII characters, so the accessors
/// below can slice by byte position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeedName(String);

impl SeedName {
    /// Fixed width of a seed name
    pub const LEN: usize = 12;

    /// Build a seed name from any string, padding with spaces or truncating to 12
    pub fn new(name: &str) -> Self {
        Self::from_bytes(name.as_bytes())
    }

    /// Build a seed name from raw record bytes; non-ASCII bytes become `?`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut name = String::with_capacity(Self::LEN);
        for i in 0..Self::LEN {
            let c = match bytes.get(i) {
                Some(&b) if b.is_ascii() && b != 0 => b as char,
                Some(0) | None => ' ',
                Some(_) => '?',
            };
            name.push(c);
        }
        Self(name)
    }

    /// Assemble from the individual SEED fields
    pub fn from_parts(network: &str, station: &str, channel: &str, location: &str) -> Self {
        Self::new(&format!(
            "{:<2.2}{:<5.5}{:<3.3}{:<2.2}",
            network, station, channel, location
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn network(&self) -> &str {
        &self.0[0..2]
    }

    pub fn station(&self) -> &str {
        &self.0[2..7]
    }

    pub fn channel(&self) -> &str {
        &self.0[7..10]
    }

    pub fn location(&self) -> &str {
        &self.0[10..12]
    }

    /// Band and instrument codes (first two characters of the channel)
    pub fn band(&self) -> &str {
        &self.0[7..9]
    }

    /// Network plus station, the key used by station metadata lookups
    pub fn network_station(&self) -> &str {
        &self.0[0..7]
    }

    /// A legal name has a non-blank network, station and channel, and only
    /// uppercase letters, digits, spaces, `-` or `_`.
    pub fn is_legal(&self) -> bool {
        let chars_ok = self
            .0
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, ' ' | '-' | '_'));
        chars_ok
            && !self.network().trim().is_empty()
            && !self.station().trim().is_empty()
            && !self.channel().trim().is_empty()
    }
}

impl std::fmt::Display for SeedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SeedName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Julian day containing the given epoch millisecond
pub fn julian_from_millis(ms: i64) -> i32 {
    ms.div_euclid(MS_PER_DAY) as i32 + JULIAN_UNIX_EPOCH
}

/// Julian day for a year and day-of-year, `None` if the date does not exist
pub fn julian_from_year_doy(year: i32, doy: u32) -> Option<i32> {
    NaiveDate::from_yo_opt(year, doy).map(|d| d.num_days_from_ce() + JULIAN_CE_OFFSET)
}

/// Year and day-of-year of a julian day
pub fn year_doy_from_julian(julian: i32) -> Option<(i32, u32)> {
    NaiveDate::from_num_days_from_ce_opt(julian - JULIAN_CE_OFFSET).map(|d| (d.year(), d.ordinal()))
}

/// Epoch milliseconds at 00:00 UTC of a julian day
pub fn julian_start_millis(julian: i32) -> i64 {
    (julian - JULIAN_UNIX_EPOCH) as i64 * MS_PER_DAY
}

/// Render epoch milliseconds as `YYYY/MM/DD HH:MM:SS.mmm`
pub fn format_millis(ms: i64) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y/%m/%d %H:%M:%S%.3f").to_string(),
        None => format!("{}ms", ms),
    }
}

/// Time range for queries (half-open interval: [start, end)), epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: i64,
    /// End timestamp (exclusive)
    pub end: i64,
}

impl TimeRange {
    /// Create a time range, returning None if end precedes start
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if the span `[start, end)` overlaps this range
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        start < self.end && end > self.start
    }

    /// Get the duration in milliseconds
    pub fn duration_millis(&self) -> i64 {
        self.end - self.start
    }

    /// Get the duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.duration_millis() as f64 / 1000.0
    }

    /// Julian days touched by this range
    pub fn julian_days(&self) -> RangeInclusive<i32> {
        let last = if self.end > self.start { self.end - 1 } else { self.end };
        julian_from_millis(self.start)..=julian_from_millis(last)
    }
}

fn index_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4})_(\d{3})_([A-Za-z0-9]{1,4})\.idx$").unwrap_or_else(|e| {
            unreachable!("static index name pattern failed to compile: {}", e)
        })
    })
}

/// An index file discovered on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileDescriptor {
    /// Canonical path of the `.idx` file
    pub path: PathBuf,
    /// Julian day the file partitions
    pub julian: i32,
    /// Node (instance) identifier, up to 4 characters
    pub node: String,
}

impl FileDescriptor {
    /// Parse a `YYYY_DDD_NODE.idx` file name; the path is kept as given
    pub fn from_path(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidFileName(path.to_path_buf()))?;

        let caps = index_name_pattern()
            .captures(name)
            .ok_or_else(|| StorageError::InvalidFileName(path.to_path_buf()))?;

        let year: i32 = caps[1]
            .parse()
            .map_err(|_| StorageError::InvalidFileName(path.to_path_buf()))?;
        let doy: u32 = caps[2]
            .parse()
            .map_err(|_| StorageError::InvalidFileName(path.to_path_buf()))?;
        let julian = julian_from_year_doy(year, doy)
            .ok_or_else(|| StorageError::InvalidFileName(path.to_path_buf()))?;

        Ok(Self {
            path: path.to_path_buf(),
            julian,
            node: caps[3].to_string(),
        })
    }

    /// File name for a given day and node
    pub fn file_name(julian: i32, node: &str) -> Option<String> {
        let (year, doy) = year_doy_from_julian(julian)?;
        Some(format!("{:04}_{:03}_{}.idx", year, doy, node))
    }

    /// Path of the companion data file (same stem, `.ms` extension)
    pub fn data_path(&self) -> PathBuf {
        self.path.with_extension("ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_name_fields() {
        let name = SeedName::new("USDUG  BHZ00");
        assert_eq!(name.network(), "US");
        assert_eq!(name.station(), "DUG  ");
        assert_eq!(name.channel(), "BHZ");
        assert_eq!(name.location(), "00");
        assert_eq!(name.band(), "BH");
        assert!(name.is_legal());

        let built = SeedName::from_parts("US", "DUG", "BHZ", "00");
        assert_eq!(built, name);
    }

    #[test]
    fn test_seed_name_padding_and_legality() {
        let short = SeedName::new("IUANMO");
        assert_eq!(short.as_str().len(), SeedName::LEN);
        assert!(!short.is_legal()); // blank channel

        let odd = SeedName::from_bytes(b"US\xffUG  BHZ00");
        assert_eq!(odd.as_str().len(), SeedName::LEN);
        assert!(!odd.is_legal());
    }

    #[test]
    fn test_julian_conversions() {
        assert_eq!(julian_from_millis(0), JULIAN_UNIX_EPOCH);
        assert_eq!(julian_from_millis(-1), JULIAN_UNIX_EPOCH - 1);
        assert_eq!(julian_from_year_doy(1970, 1), Some(JULIAN_UNIX_EPOCH));
        assert_eq!(julian_from_year_doy(2014, 20), Some(2_456_678));
        assert_eq!(year_doy_from_julian(2_456_678), Some((2014, 20)));
        assert_eq!(julian_start_millis(JULIAN_UNIX_EPOCH + 1), MS_PER_DAY);
        assert!(julian_from_year_doy(2014, 366).is_none());
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::try_new(1000, 2000).unwrap();
        assert!(range.contains(1000));
        assert!(!range.contains(2000));
        assert!(range.overlaps(1500, 2500));
        assert!(!range.overlaps(2000, 3000));
        assert!(TimeRange::try_new(2000, 1000).is_none());

        let day = TimeRange::try_new(0, MS_PER_DAY).unwrap();
        assert_eq!(day.julian_days(), JULIAN_UNIX_EPOCH..=JULIAN_UNIX_EPOCH);
    }

    #[test]
    fn test_file_descriptor_parse() {
        let desc = FileDescriptor::from_path("/data/2014_020_CI.idx").unwrap();
        assert_eq!(desc.julian, 2_456_678);
        assert_eq!(desc.node, "CI");
        assert_eq!(desc.data_path(), PathBuf::from("/data/2014_020_CI.ms"));

        assert!(FileDescriptor::from_path("/data/2014_020_TOOLONG.idx").is_err());
        assert!(FileDescriptor::from_path("/data/2014_020_CI.ms").is_err());
        assert!(FileDescriptor::from_path("/data/notes.txt").is_err());

        assert_eq!(
            FileDescriptor::file_name(2_456_678, "CI").as_deref(),
            Some("2014_020_CI.idx")
        );
    }
}
