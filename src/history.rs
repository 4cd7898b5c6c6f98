//! Historical recording index.
//!
//! Recordings live in a date-partitioned tree:
//!
//! ```text
//! <root>/<YYYY-MM>/<DD>/<index>_<HH-MM-SS>.avi
//! ```
//!
//! The index allocates the next path for a new session, rolls an
//! allocation back when the writer fails to open, and looks up stored
//! clips for replay. Only the pipeline controller mutates it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, NaiveDate};
use tracing::{debug, warn};

use crate::error::Result;

const VIDEO_SUFFIX: &str = "avi";

#[derive(Debug, Clone)]
pub struct VideoEntry {
    pub path: PathBuf,
    /// Start time as `HH-MM-SS`, taken from the file name.
    pub start_time: String,
}

/// Outcome of a date+index lookup. The variants map onto the history
/// precondition codes 2 and 3.
#[derive(Debug, Clone)]
pub enum Lookup {
    Found {
        path: PathBuf,
        /// `YYYY-MM-DD_index_HH-MM-SS`, used as the window title.
        label: String,
    },
    NoSuchDate,
    NoSuchIndex,
}

pub struct RecordingIndex {
    root: PathBuf,
    by_date: BTreeMap<NaiveDate, BTreeMap<u32, VideoEntry>>,
}

impl RecordingIndex {
    /// Open the index, scanning whatever tree already exists under
    /// `root` (the root is created if missing).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let mut by_date: BTreeMap<NaiveDate, BTreeMap<u32, VideoEntry>> = BTreeMap::new();

        for month_entry in std::fs::read_dir(&root)? {
            let month_dir = month_entry?.path();
            if !month_dir.is_dir() {
                continue;
            }
            for day_entry in std::fs::read_dir(&month_dir)? {
                let day_dir = day_entry?.path();
                if !day_dir.is_dir() {
                    continue;
                }
                let Some(date) = date_from_dirs(&month_dir, &day_dir) else {
                    warn!(target: "history", "skipping unparseable dir {}", day_dir.display());
                    continue;
                };
                for file_entry in std::fs::read_dir(&day_dir)? {
                    let file = file_entry?.path();
                    if !file.is_file() {
                        continue;
                    }
                    if let Some((index, start_time)) = parse_video_name(&file) {
                        by_date.entry(date).or_default().insert(
                            index,
                            VideoEntry {
                                path: file,
                                start_time,
                            },
                        );
                    }
                }
            }
        }
        // Day directories that held no parseable video are dropped.
        by_date.retain(|_, v| !v.is_empty());
        debug!(target: "history", "recording index loaded {} day(s)", by_date.len());
        Ok(Self { root, by_date })
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    /// Allocate the path for a recording starting at `start`. Creates
    /// the day directory and registers the entry; the file itself is
    /// created by the video writer.
    pub fn allocate(&mut self, start: DateTime<Local>) -> Result<PathBuf> {
        let date = start.date_naive();
        let day_dir = self
            .root
            .join(format!("{:04}-{:02}", date.year(), date.month()))
            .join(format!("{:02}", date.day()));
        std::fs::create_dir_all(&day_dir)?;

        let index = self
            .by_date
            .get(&date)
            .and_then(|m| m.keys().next_back().copied())
            .map_or(1, |last| last + 1);
        let start_time = start.format("%H-%M-%S").to_string();
        let path = day_dir.join(format!("{}_{}.{}", index, start_time, VIDEO_SUFFIX));

        self.by_date.entry(date).or_default().insert(
            index,
            VideoEntry {
                path: path.clone(),
                start_time,
            },
        );
        Ok(path)
    }

    /// Deletion hook: forget a just-allocated path after the caller
    /// failed to open its writer.
    pub fn rollback(&mut self, path: &Path) {
        for entries in self.by_date.values_mut() {
            entries.retain(|_, e| e.path != path);
        }
        self.by_date.retain(|_, entries| !entries.is_empty());
    }

    pub fn lookup(&self, date: NaiveDate, index: u32) -> Lookup {
        let Some(entries) = self.by_date.get(&date) else {
            return Lookup::NoSuchDate;
        };
        match entries.get(&index) {
            Some(entry) => Lookup::Found {
                path: entry.path.clone(),
                label: format!("{}_{}_{}", date.format("%Y-%m-%d"), index, entry.start_time),
            },
            None => Lookup::NoSuchIndex,
        }
    }

    /// All clips recorded on a date, index-ordered.
    pub fn videos_on(&self, date: NaiveDate) -> Vec<(u32, VideoEntry)> {
        self.by_date
            .get(&date)
            .map(|m| m.iter().map(|(i, e)| (*i, e.clone())).collect())
            .unwrap_or_default()
    }
}

/// Parse a user-supplied date. The separator is whatever follows the
/// four-digit year (`2024-06-11`, `2024/06/11`, ...).
pub fn parse_user_date(raw: &str) -> Option<NaiveDate> {
    let sep = raw.chars().nth(4)?;
    let mut parts = raw.split(sep);
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn date_from_dirs(month_dir: &Path, day_dir: &Path) -> Option<NaiveDate> {
    let month_name = month_dir.file_name()?.to_str()?;
    let day_name = day_dir.file_name()?.to_str()?;
    let (year, month) = month_name.split_once('-')?;
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day_name.parse().ok()?)
}

/// Parse `<index>_<HH-MM-SS>.avi` into its parts.
fn parse_video_name(path: &Path) -> Option<(u32, String)> {
    if path.extension()?.to_str()? != VIDEO_SUFFIX {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (index, start_time) = stem.split_once('_')?;
    Some((index.parse().ok()?, start_time.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn allocate_builds_date_partitioned_paths() {
        let dir = TempDir::new().unwrap();
        let mut index = RecordingIndex::open(dir.path()).unwrap();
        let path = index.allocate(at(2024, 6, 11, 9, 30, 5)).unwrap();
        assert!(path.ends_with("2024-06/11/1_09-30-05.avi"));
        assert!(path.parent().unwrap().is_dir());

        // Second allocation on the same day gets the next index.
        let second = index.allocate(at(2024, 6, 11, 10, 0, 0)).unwrap();
        assert!(second.ends_with("2024-06/11/2_10-00-00.avi"));
    }

    #[test]
    fn rollback_removes_entry_from_index() {
        let dir = TempDir::new().unwrap();
        let mut index = RecordingIndex::open(dir.path()).unwrap();
        let path = index.allocate(at(2024, 6, 11, 9, 30, 5)).unwrap();
        assert!(!index.is_empty());

        index.rollback(&path);
        assert!(index.is_empty());
        let date = NaiveDate::from_ymd_opt(2024, 6, 11).unwrap();
        assert!(matches!(index.lookup(date, 1), Lookup::NoSuchDate));
    }

    #[test]
    fn scan_recovers_entries_and_lookup_distinguishes_codes() {
        let dir = TempDir::new().unwrap();
        let day = dir.path().join("2024-06").join("11");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("1_09-30-05.avi"), b"").unwrap();
        std::fs::write(day.join("3_17-00-00.avi"), b"").unwrap();
        std::fs::write(day.join("notes.txt"), b"").unwrap();

        let index = RecordingIndex::open(dir.path()).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 6, 11).unwrap();

        match index.lookup(date, 1) {
            Lookup::Found { label, .. } => assert_eq!(label, "2024-06-11_1_09-30-05"),
            other => panic!("expected hit, got {:?}", other),
        }
        assert!(matches!(index.lookup(date, 2), Lookup::NoSuchIndex));
        let other_date = NaiveDate::from_ymd_opt(2024, 6, 12).unwrap();
        assert!(matches!(index.lookup(other_date, 1), Lookup::NoSuchDate));

        // New allocations continue after the highest existing index.
        let mut index = index;
        let path = index.allocate(at(2024, 6, 11, 18, 0, 0)).unwrap();
        assert!(path.ends_with("2024-06/11/4_18-00-00.avi"));
    }

    #[test]
    fn parse_user_date_accepts_any_separator() {
        assert_eq!(
            parse_user_date("2024-06-11"),
            NaiveDate::from_ymd_opt(2024, 6, 11)
        );
        assert_eq!(
            parse_user_date("2024/6/1"),
            NaiveDate::from_ymd_opt(2024, 6, 1)
        );
        assert_eq!(parse_user_date("junk"), None);
    }
}
