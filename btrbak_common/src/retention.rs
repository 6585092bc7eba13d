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

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use crate::config::RetentionMap;
use crate::pool::{Pool, Snapshot};

/// One retention bucket's directory name paired with the keep-count
/// applying to it and the key each snapshot maps to within it.
struct Bucket<'a> {
    name: &'a str,
    keep: u32,
}

fn buckets(map: &RetentionMap) -> [Bucket<'_>; 5] {
    [
        Bucket { name: "latest", keep: map.latest },
        Bucket { name: "days", keep: map.days },
        Bucket { name: "weeks", keep: map.weeks },
        Bucket { name: "months", keep: map.months },
        Bucket { name: "years", keep: map.years },
    ]
}

fn bucket_key(snapshot: &Snapshot, bucket_name: &str) -> String {
    match bucket_name {
        "latest" => snapshot.to_string(),
        "days" => snapshot.bucket_keys().day,
        "weeks" => snapshot.bucket_keys().week,
        "months" => snapshot.bucket_keys().month,
        "years" => snapshot.bucket_keys().year,
        other => unreachable!("unknown retention bucket {other}"),
    }
}

/// Runs the full retention algorithm against `pool`, using `map`'s
/// per-bucket keep-counts. Returns the set of snapshot names deleted.
pub fn run(pool: &Pool, map: &RetentionMap) -> std::io::Result<Vec<Snapshot>> {
    let snapshots = pool.list_snapshots()?;

    // Step 1: create missing links, first-wins per coordinate.
    for bucket in buckets(map) {
        let dir = pool.retention_bucket(bucket.name);
        fs::create_dir_all(&dir)?;

        for snapshot in &snapshots {
            let key = bucket_key(snapshot, bucket.name);
            let link_path = dir.join(&key);

            if link_path.symlink_metadata().is_err() {
                symlink(snapshot.to_string(), &link_path)?;
            }
        }
    }

    // Step 2: trim each bucket to its keep-count, sorting lexicographically
    // (equal to chronological ordering given the key formats).
    for bucket in buckets(map) {
        let dir = pool.retention_bucket(bucket.name);
        let mut links: Vec<_> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        links.sort();

        let keep = bucket.keep as usize;
        if links.len() > keep {
            for stale in &links[..links.len() - keep] {
                let _ = fs::remove_file(dir.join(stale));
            }
        }
    }

    // Step 3: union of remaining link targets is the kept set.
    let mut kept: HashSet<String> = HashSet::new();
    for bucket in buckets(map) {
        let dir = pool.retention_bucket(bucket.name);
        for entry in fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
            if let Ok(target) = fs::read_link(entry.path()) {
                kept.insert(target.to_string_lossy().to_string());
            }
        }
    }

    // Step 4: delete any pool snapshot not in the kept set. This is the
    // only step that destroys snapshots.
    let mut deleted = Vec::new();
    for snapshot in &snapshots {
        if !kept.contains(&snapshot.to_string()) {
            delete_subvolume(&snapshot.path_in(&pool.snapshots_dir()))?;
            deleted.push(*snapshot);
        }
    }

    // Step 5: sweep stale links whose target no longer exists.
    let remaining: HashSet<String> = snapshots
        .iter()
        .map(|s| s.to_string())
        .filter(|name| kept.contains(name))
        .collect();

    for bucket in buckets(map) {
        let dir = pool.retention_bucket(bucket.name);
        for entry in fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
            if let Ok(target) = fs::read_link(entry.path()) {
                let target = target.to_string_lossy().to_string();
                if !remaining.contains(&target) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    Ok(deleted)
}

/// Deletes a btrfs subvolume by shelling out to `btrfs subvolume delete`,
/// matching the engine's general preference for driving the CoW
/// filesystem via its own CLI rather than a binding.
fn delete_subvolume(path: &Path) -> std::io::Result<()> {
    use std::process::{Command, Stdio};

    let status = Command::new("btrfs")
        .arg("subvolume")
        .arg("delete")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .status()?;

    if !status.success() {
        return Err(std::io::Error::other(format!(
            "btrfs subvolume delete {} failed",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    fn make_pool(name: &str) -> Pool {
        let dir = std::env::temp_dir().join(format!("btrbak-retention-test-{name}"));
        let _ = stdfs::remove_dir_all(&dir);
        let pool = Pool::new(dir);
        pool.create_layout().unwrap();
        pool
    }

    fn touch_snapshot(pool: &Pool, name: &str) {
        stdfs::create_dir_all(pool.snapshots_dir().join(name)).unwrap();
    }

    #[test]
    fn first_wins_per_day_coordinate() {
        let pool = make_pool("first-wins");
        touch_snapshot(&pool, "2024.01.02_00.00");
        touch_snapshot(&pool, "2024.01.02_12.00");

        let map = RetentionMap {
            latest: 5,
            days: 2,
            weeks: 0,
            months: 0,
            years: 0,
        };
        run(&pool, &map).unwrap();

        let day_link = pool.retention_bucket("days").join("2024.01.02");
        let target = stdfs::read_link(&day_link).unwrap();
        assert_eq!(target.to_string_lossy(), "2024.01.02_00.00");

        stdfs::remove_dir_all(pool.root()).unwrap();
    }

    #[test]
    fn zero_keep_counts_delete_everything() {
        let pool = make_pool("zero-keep");
        touch_snapshot(&pool, "2024.01.01_00.00");
        touch_snapshot(&pool, "2024.01.02_00.00");

        let map = RetentionMap {
            latest: 0,
            days: 0,
            weeks: 0,
            months: 0,
            years: 0,
        };
        // delete_subvolume shells out to `btrfs`, unavailable in this test
        // environment, so assert on the pure kept-set computation instead
        // by checking no retention links survive trimming (step 2/3),
        // which is what step 4 would act on.
        let dir = pool.retention_bucket("latest");
        stdfs::create_dir_all(&dir).unwrap();
        for bucket in buckets(&map) {
            let bdir = pool.retention_bucket(bucket.name);
            stdfs::create_dir_all(&bdir).unwrap();
            for snapshot in pool.list_snapshots().unwrap() {
                let key = bucket_key(&snapshot, bucket.name);
                let _ = symlink(snapshot.to_string(), bdir.join(&key));
            }
            let mut links: Vec<_> = stdfs::read_dir(&bdir)
                .unwrap()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect();
            links.sort();
            let keep = bucket.keep as usize;
            assert_eq!(keep, 0);
            for stale in &links[..links.len() - keep] {
                stdfs::remove_file(bdir.join(stale)).unwrap();
            }
            assert_eq!(stdfs::read_dir(&bdir).unwrap().count(), 0);
        }

        stdfs::remove_dir_all(pool.root()).unwrap();
    }
}
