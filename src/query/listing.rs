//! Directory-style listing lines
//!
//! ```text
//! -ls   /data/2014_020_CI.idx julian=2456678 node=CI bytes=98816
//! -lsc  USDUG  BHZ00 #days=0003 14019-14020 14032
//! -lsrt USDUG  BHZ00 start=2014/01/20 11:00:00.000 nsamp=144000 rate=40.000000 clean=true
//! ```

use crate::realtime::SpanSummary;
use crate::storage::types::{format_millis, year_doy_from_julian, FileDescriptor, SeedName};
use std::collections::BTreeSet;

/// One `-ls` line
pub fn file_line(desc: &FileDescriptor) -> String {
    let bytes: u64 = [desc.path.clone(), desc.data_path()]
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();
    format!(
        "{} julian={} node={} bytes={}",
        desc.path.display(),
        desc.julian,
        desc.node,
        bytes
    )
}

/// One `-lsc` line; consecutive days collapse into ranges
pub fn channel_line(channel: &SeedName, days: &BTreeSet<i32>) -> String {
    let mut line = format!("{} #days={:04}", channel, days.len());
    for (first, last) in day_runs(days) {
        line.push(' ');
        line.push_str(&yydoy(first));
        if last != first {
            line.push('-');
            line.push_str(&yydoy(last));
        }
    }
    line
}

/// One `-lsrt` line
pub fn realtime_line(summary: &SpanSummary) -> String {
    format!(
        "{} start={} nsamp={} rate={:.6} clean={}",
        summary.channel,
        format_millis(summary.start),
        summary.nsamp,
        summary.rate,
        summary.clean_decode
    )
}

fn day_runs(days: &BTreeSet<i32>) -> Vec<(i32, i32)> {
    let mut runs: Vec<(i32, i32)> = Vec::new();
    for &day in days {
        match runs.last_mut() {
            Some((_, last)) if *last + 1 == day => *last = day,
            _ => runs.push((day, day)),
        }
    }
    runs
}

fn yydoy(julian: i32) -> String {
    match year_doy_from_julian(julian) {
        Some((year, doy)) => format!("{:02}{:03}", year.rem_euclid(100), doy),
        None => format!("?{}", julian),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::julian_from_year_doy;

    #[test]
    fn test_channel_line_compresses_runs() {
        let day = |doy| julian_from_year_doy(2014, doy).unwrap();
        let days: BTreeSet<i32> = [day(19), day(20), day(21), day(32), day(40), day(41)]
            .into_iter()
            .collect();
        assert_eq!(
            channel_line(&SeedName::new("USDUG  BHZ00"), &days),
            "USDUG  BHZ00 #days=0006 14019-14021 14032 14040-14041"
        );
    }

    #[test]
    fn test_year_boundary_run() {
        let days: BTreeSet<i32> = [
            julian_from_year_doy(2013, 365).unwrap(),
            julian_from_year_doy(2014, 1).unwrap(),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            channel_line(&SeedName::new("IUANMO BHZ00"), &days),
            "IUANMO BHZ00 #days=0002 13365-14001"
        );
    }

    #[test]
    fn test_file_line_sums_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let idx = dir.path().join("2014_020_CI.idx");
        std::fs::write(&idx, vec![0u8; 1024]).unwrap();
        std::fs::write(dir.path().join("2014_020_CI.ms"), vec![0u8; 512]).unwrap();
        let desc = FileDescriptor::from_path(&idx).unwrap();
        let line = file_line(&desc);
        assert!(line.ends_with("julian=2456678 node=CI bytes=1536"), "{}", line);
    }
}
