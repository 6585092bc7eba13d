// btrbak_common is the shared library implementing the backup engine logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, IsoWeek, NaiveDateTime};

use crate::SnapshotParseError;

/// A `Snapshot` name uniquely identifies one capture within a pool. It is
/// both the directory name under `snapshots/` and the name the remote side
/// uses for its own copy, so all three sites (local pool, remote host,
/// retention links) must agree byte-for-byte.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Snapshot {
    taken: NaiveDateTime,
}

impl Snapshot {
    const FMT: &'static str = "%Y.%m.%d_%H.%M";

    /// Builds a `Snapshot` name from the current moment, truncated to the
    /// minute as the on-disk name format requires.
    pub fn now() -> Self {
        Snapshot {
            taken: chrono::Local::now().naive_local(),
        }
    }

    pub fn taken(&self) -> NaiveDateTime {
        self.taken
    }

    /// The snapshot's path under a pool's `snapshots/` directory.
    pub fn path_in(&self, snapshots_dir: &Path) -> PathBuf {
        snapshots_dir.join(self.to_string())
    }

    /// The ISO calendar year/month/day/week keys used to derive retention
    /// bucket link names.
    pub fn bucket_keys(&self) -> BucketKeys {
        let date = self.taken.date();
        let iso_week: IsoWeek = date.iso_week();

        BucketKeys {
            day: format!("{:04}.{:02}.{:02}", date.year(), date.month(), date.day()),
            week: format!("{:04}-{:02}", iso_week.year(), iso_week.week()),
            month: format!("{:04}.{:02}", date.year(), date.month()),
            year: format!("{:04}", date.year()),
        }
    }
}

/// The four calendar keys a snapshot maps to for the day/week/month/year
/// retention buckets (the `latest` bucket keys on the snapshot name
/// itself).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BucketKeys {
    pub day: String,
    pub week: String,
    pub month: String,
    pub year: String,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.taken.format(Self::FMT))
    }
}

impl Ord for Snapshot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lexicographic ordering on the rendered name equals chronological
        // ordering given the fixed-width zero-padded format, but comparing
        // the parsed timestamps directly avoids the allocation.
        self.taken.cmp(&other.taken)
    }
}

impl PartialOrd for Snapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<&str> for Snapshot {
    type Error = SnapshotParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let taken = NaiveDateTime::parse_from_str(value, Self::FMT)
            .map_err(|_| SnapshotParseError::BadFormat(value.to_string()))?;

        Ok(Snapshot { taken })
    }
}

impl TryFrom<&Path> for Snapshot {
    type Error = SnapshotParseError;

    fn try_from(path: &Path) -> Result<Self, Self::Error> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SnapshotParseError::BadFormat(path.display().to_string()))?;

        Snapshot::try_from(name)
    }
}

/// Describes the on-disk layout of a pool and resolves every path an
/// engine component needs, so no component hardcodes a relative path
/// itself.
#[derive(Clone, Debug)]
pub struct Pool {
    root: PathBuf,
}

impl Pool {
    pub fn new(root: PathBuf) -> Self {
        Pool { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.snapshots_dir().join("new")
    }

    pub fn retention_dir(&self) -> PathBuf {
        self.root.join("retention")
    }

    pub fn retention_bucket(&self, bucket: &str) -> PathBuf {
        self.retention_dir().join(bucket)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn raw_image_path(&self) -> PathBuf {
        self.images_dir().join("image.raw")
    }

    pub fn qcow2_image_path(&self) -> PathBuf {
        self.images_dir().join("image.qcow2")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.tar")
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.root.join(".lockfile")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(crate::config::FILE_NAME)
    }

    /// Creates every directory in the pool layout, idempotently. Does not
    /// touch `metadata.tar`, the lockfile, or the configuration file.
    pub fn create_layout(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.snapshots_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.images_dir())?;

        for bucket in ["latest", "days", "weeks", "months", "years"] {
            fs::create_dir_all(self.retention_bucket(bucket))?;
        }

        Ok(())
    }

    /// Lists every snapshot currently present under `snapshots/`, sorted
    /// ascending. Entries that don't match the snapshot name pattern (e.g.
    /// `new/`) are silently skipped, matching the "for each snapshot S
    /// under `snapshots/` matching the name pattern" phrasing used
    /// throughout the algorithms.
    pub fn list_snapshots(&self) -> std::io::Result<Vec<Snapshot>> {
        let dir = self.snapshots_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Ok(snap) = Snapshot::try_from(entry.path().as_path()) {
                names.push(snap);
            }
        }

        names.sort();
        Ok(names)
    }

    /// The highest-sorted locally-present snapshot, if any.
    pub fn latest_snapshot(&self) -> std::io::Result<Option<Snapshot>> {
        Ok(self.list_snapshots()?.into_iter().last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_try_from() {
        let snap = Snapshot::try_from("2024.01.02_12.30").unwrap();
        assert_eq!(snap.to_string(), "2024.01.02_12.30");
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(Snapshot::try_from("not-a-snapshot").is_err());
        assert!(Snapshot::try_from("2024.13.40_99.99").is_err());
    }

    #[test]
    fn orders_chronologically_not_just_lexically() {
        let earlier = Snapshot::try_from("2024.01.01_00.00").unwrap();
        let later = Snapshot::try_from("2024.01.02_00.00").unwrap();
        assert!(earlier < later);
    }

    #[test]
    fn bucket_keys_handle_iso_week_53_boundary() {
        // 2020-12-31 falls in ISO week 53 of 2020, not week 1 of 2021.
        let snap = Snapshot::try_from("2020.12.31_00.00").unwrap();
        let keys = snap.bucket_keys();
        assert_eq!(keys.week, "2020-53");
        assert_eq!(keys.year, "2020");
    }

    #[test]
    fn bucket_keys_basic() {
        let snap = Snapshot::try_from("2024.03.05_08.15").unwrap();
        let keys = snap.bucket_keys();
        assert_eq!(keys.day, "2024.03.05");
        assert_eq!(keys.month, "2024.03");
        assert_eq!(keys.year, "2024");
    }
}
