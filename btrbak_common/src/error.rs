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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while parsing a snapshot name from a directory entry or a
/// remote listing line.
#[derive(Debug, Error)]
pub enum SnapshotParseError {
    #[error("snapshot name `{0}` does not match the YYYY.MM.DD_HH.MM pattern")]
    BadFormat(String),
}

/// Errors raised while loading or saving a [`crate::config::PoolConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed pool configuration: {0}")]
    Malformed(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Usage-level mistakes: missing options, a pool path that isn't a
/// directory.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("--backup-dir is required")]
    MissingBackupDir,
    #[error("--host is required")]
    MissingHost,
    #[error("pool path `{0}` is not a directory")]
    NotADirectory(PathBuf),
}

/// Failures that prevent an operation from even starting: a missing external
/// tool, a pool not on the expected filesystem, or the pool lock already
/// being held.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("required external tool `{0}` not found in PATH")]
    MissingTool(&'static str),
    #[error("pool path `{0}` is not on a btrfs filesystem")]
    NotBtrfs(PathBuf),
    #[error("pool is locked by another invocation")]
    Locked,
}

/// Failures originating on the remote host side of the Remote Agent
/// contract.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote command `{command}` on {host} exited with status {status}")]
    CommandFailed {
        host: String,
        command: String,
        status: i32,
    },
    #[error("remote snapshot listing on {0} could not be parsed")]
    UnreadableListing(String),
    #[error("remote send of snapshot {0} failed")]
    SendFailed(String),
}

/// Failures in a multi-stage subprocess pipeline (send | compress | ... |
/// decompress | receive). Carries the first non-zero exit status observed,
/// scanning stages left to right.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline stage `{stage}` exited with status {status}")]
    StageFailed { stage: String, status: i32 },
    #[error("pipeline stage `{0}` was terminated by a signal")]
    StageSignaled(String),
}

/// Failures interpreting the Metadata Store archive.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata archive is missing required entry `{0}`")]
    MissingEntry(&'static str),
    #[error("fdisk-l entry has no byte-length line")]
    MissingByteLength,
    #[error("super-dump entry is missing an fsid or label line")]
    MissingFsidOrLabel,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures specific to the Image Builder's partitioning, formatting, and
/// mount steps.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("restoring the partition table into {0} failed")]
    PartitionRestoreFailed(PathBuf),
    #[error("creating the btrfs filesystem on {0} failed")]
    FilesystemCreateFailed(PathBuf),
    #[error("mounting {device} at {mountpoint} failed: {source}")]
    MountFailed {
        device: PathBuf,
        mountpoint: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("expected image byte length but fdisk-l parsed to 0")]
    ZeroLength,
}

/// Failures attaching, waiting for, or releasing a block device.
#[derive(Debug, Error)]
pub enum BlockDeviceError {
    #[error("no free network block device slot available")]
    NoFreeSlot,
    #[error("device {0} did not settle with the expected partition node")]
    SettleTimeout(PathBuf),
    #[error("attach of {0} failed")]
    AttachFailed(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The aggregate error type returned by every public entry point in this
/// crate, composed from the per-component taxonomies above plus a catch-all
/// I/O variant for anything not covered by a more specific kind.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    BlockDevice(#[from] BlockDeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    SnapshotParse(#[from] SnapshotParseError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
