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

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs4::fs_std::FileExt;

use crate::PreconditionError;

/// Holds the pool's exclusive, non-blocking lock for the lifetime of one
/// invocation, granting mutual exclusion at pool granularity. The
/// underlying advisory lock is released by the kernel when the held `File`
/// is closed, so dropping a `PoolLock` is enough to release it; there is
/// no explicit unlock call.
pub struct PoolLock {
    _file: File,
}

impl PoolLock {
    /// Opens (creating if absent) the pool's `.lockfile` and attempts to
    /// acquire it for exclusive access without blocking. Fails with
    /// [`PreconditionError::Locked`] if another invocation already holds
    /// it.
    pub fn acquire(path: &Path) -> Result<Self, PreconditionError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|_| PreconditionError::Locked)?;

        file.try_lock_exclusive()
            .map_err(|_| PreconditionError::Locked)?;

        Ok(PoolLock { _file: file })
    }
}

/// A release action registered by some resource acquisition (a temp file,
/// an attached block device, a mountpoint). Must be idempotent: it may run
/// exactly once in the ordinary case, but [`CleanupStack`] also allows a
/// caller to pop and run releases early, so a release that already ran
/// must tolerate being skipped rather than run twice.
pub type Release = Box<dyn FnOnce() + Send>;

/// A LIFO stack of pending cleanup actions. Outer
/// resources (e.g. a mountpoint) are expected to be pushed after the inner
/// resources they depend on (e.g. the attached device backing that mount),
/// so popping in reverse order tears down outer-before-inner.
///
/// Dropping the stack runs every remaining release in reverse-of-push
/// order, so a `?`-propagated error or an early return both trigger full
/// teardown without extra bookkeeping at the call site.
#[derive(Default)]
pub struct CleanupStack {
    releases: Vec<Release>,
}

impl CleanupStack {
    pub fn new() -> Self {
        CleanupStack::default()
    }

    /// Registers a release action to run during teardown.
    pub fn push(&mut self, release: Release) {
        self.releases.push(release);
    }

    /// Runs every pending release now, in reverse-of-push order, and
    /// clears the stack. Used when a caller wants cleanup to happen at a
    /// precise point rather than implicitly at drop.
    pub fn run_all(&mut self) {
        while let Some(release) = self.releases.pop() {
            release();
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn releases_run_in_reverse_of_push_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut stack = CleanupStack::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            stack.push(Box::new(move || order.lock().unwrap().push(i)));
        }
        drop(stack);

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn second_lock_on_same_file_fails() {
        let dir = std::env::temp_dir().join("btrbak-lock-test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let lockfile = dir.join(".lockfile");

        let first = PoolLock::acquire(&lockfile).unwrap();
        let second = PoolLock::acquire(&lockfile);
        assert!(second.is_err());

        drop(first);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
