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

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Name of the pool-local configuration file, relative to the pool root.
pub const FILE_NAME: &str = "btrfs-backup.conf";

/// Per-bucket keep-counts for the retention subsystem.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionMap {
    pub latest: u32,
    pub days: u32,
    pub weeks: u32,
    pub months: u32,
    pub years: u32,
}

impl Default for RetentionMap {
    fn default() -> Self {
        RetentionMap {
            latest: 5,
            days: 5,
            weeks: 4,
            months: 4,
            years: 20,
        }
    }
}

/// The merged configuration record a single invocation is built from:
/// compiled-in defaults, overlaid with `btrfs-backup.conf` if present,
/// overlaid with whatever the caller explicitly supplied on the command
/// line. Every component receives this record (or a projection of it)
/// explicitly; nothing is read from global state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub rootfs: String,
    pub rootdev: String,
    pub rootpart: u32,
    pub compress_cmd: Vec<String>,
    pub decompress_cmd: Vec<String>,
    pub btrfs_compression: String,
    pub retention: RetentionMap,
    pub direct_qcow2: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            rootfs: "@".to_string(),
            rootdev: "sda".to_string(),
            rootpart: 2,
            compress_cmd: vec!["zstd".to_string(), "-T0".to_string()],
            decompress_cmd: vec!["zstd".to_string(), "-d".to_string()],
            btrfs_compression: "zstd".to_string(),
            retention: RetentionMap::default(),
            direct_qcow2: false,
        }
    }
}

impl PoolConfig {
    /// Loads the pool configuration starting from compiled-in defaults and
    /// overlaying `<pool>/btrfs-backup.conf` if it exists. Returns the
    /// defaults unchanged when the file is absent, matching the pool
    /// configuration file's documented "override" semantics rather than
    /// requiring it.
    pub fn load(pool_root: &Path) -> Result<Self, ConfigError> {
        let path = pool_root.join(FILE_NAME);

        if !path.exists() {
            return Ok(PoolConfig::default());
        }

        let text = fs::read_to_string(path)?;
        let config: PoolConfig = toml::from_str(&text)?;

        Ok(config)
    }

    /// Applies a sparse set of CLI overrides on top of this configuration.
    /// `overrides` carries only the fields the caller actually supplied;
    /// anything left `None` keeps the value already present (defaults or
    /// config file), matching the documented precedence of CLI flags over
    /// `btrfs-backup.conf` over compiled-in defaults.
    pub fn apply_overrides(&mut self, overrides: CliOverrides) {
        if let Some(rootfs) = overrides.rootfs {
            self.rootfs = rootfs;
        }
        if let Some(rootdev) = overrides.rootdev {
            self.rootdev = rootdev;
        }
        if let Some(rootpart) = overrides.rootpart {
            self.rootpart = rootpart;
        }
        if let Some(latest) = overrides.latest {
            self.retention.latest = latest;
        }
        if let Some(days) = overrides.days {
            self.retention.days = days;
        }
        if let Some(weeks) = overrides.weeks {
            self.retention.weeks = weeks;
        }
        if let Some(months) = overrides.months {
            self.retention.months = months;
        }
        if let Some(years) = overrides.years {
            self.retention.years = years;
        }
        if overrides.direct_qcow2 {
            self.direct_qcow2 = true;
        }
    }
}

/// The subset of [`PoolConfig`] fields that the command-line surface may
/// override, carried as `Option`s so the driver can tell "not supplied"
/// apart from "supplied, equal to the default".
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub rootfs: Option<String>,
    pub rootdev: Option<String>,
    pub rootpart: Option<u32>,
    pub latest: Option<u32>,
    pub days: Option<u32>,
    pub weeks: Option<u32>,
    pub months: Option<u32>,
    pub years: Option<u32>,
    pub direct_qcow2: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.rootfs, "@");
        assert_eq!(config.rootdev, "sda");
        assert_eq!(config.rootpart, 2);
        assert_eq!(config.retention, RetentionMap::default());
        assert!(!config.direct_qcow2);
    }

    #[test]
    fn overrides_only_touch_supplied_fields() {
        let mut config = PoolConfig::default();
        config.apply_overrides(CliOverrides {
            rootdev: Some("vda".to_string()),
            days: Some(10),
            ..Default::default()
        });

        assert_eq!(config.rootdev, "vda");
        assert_eq!(config.retention.days, 10);
        assert_eq!(config.rootfs, "@");
        assert_eq!(config.retention.latest, 5);
    }

    #[test]
    fn load_with_no_file_returns_defaults() {
        let dir = std::env::temp_dir().join("btrbak-config-test-missing");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let loaded = PoolConfig::load(&dir).unwrap();
        assert_eq!(loaded, PoolConfig::default());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_parses_present_file() {
        let dir = std::env::temp_dir().join("btrbak-config-test-present");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(FILE_NAME),
            "rootdev = \"vdb\"\n[retention]\nlatest = 3\ndays = 3\nweeks = 2\nmonths = 2\nyears = 10\n",
        )
        .unwrap();

        let loaded = PoolConfig::load(&dir).unwrap();
        assert_eq!(loaded.rootdev, "vdb");
        assert_eq!(loaded.retention.latest, 3);

        fs::remove_dir_all(&dir).unwrap();
    }
}
