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

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::config::{CliOverrides, PoolConfig};
use crate::image::ImageBuilder;
use crate::lock::PoolLock;
use crate::metadata::Capture;
use crate::pool::Pool;
use crate::remote::RemoteAgent;
use crate::{retention, transfer};
use crate::{EngineError, PreconditionError, UsageError};

/// One operation from the command-line surface, in the order the driver
/// must execute them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Setup,
    Backup,
    Retention,
    CreateImage,
    UpdateImage,
    CloneImage,
    ListImages,
    MountRaw,
    MountQcow2,
}

/// Everything the driver needs for one invocation: which pool, which
/// remote host, which operations, and what command line overrides to
/// apply to the pool's configuration.
pub struct Invocation {
    pub backup_dir: PathBuf,
    pub host: Option<String>,
    pub overrides: CliOverrides,
    pub operations: Vec<Operation>,
}

/// Runs one invocation: validates inputs, acquires the pool lock, merges
/// configuration, and dispatches operations left to right, aborting on the
/// first failure.
pub fn run(invocation: Invocation) -> Result<(), EngineError> {
    if invocation.backup_dir.as_os_str().is_empty() {
        return Err(UsageError::MissingBackupDir.into());
    }
    if !invocation.backup_dir.is_dir() {
        return Err(UsageError::NotADirectory(invocation.backup_dir).into());
    }

    let pool = Pool::new(invocation.backup_dir);
    let _lock = PoolLock::acquire(&pool.lockfile_path()).map_err(|e| {
        eprintln!("[warn] <{}> pool is locked by another invocation", pool.root().display());
        e
    })?;

    let mut config = PoolConfig::load(pool.root())?;
    config.apply_overrides(invocation.overrides);

    for operation in &invocation.operations {
        eprintln!("[info] <{}> running {operation:?}", pool.root().display());
        dispatch(*operation, &pool, &config, invocation.host.as_deref())?;
    }

    Ok(())
}

fn dispatch(
    operation: Operation,
    pool: &Pool,
    config: &PoolConfig,
    host: Option<&str>,
) -> Result<(), EngineError> {
    match operation {
        Operation::Setup => setup(pool, config, require_host(host)?),
        Operation::Backup => {
            let agent = RemoteAgent::new(require_host(host)?.to_string());
            let snapshot = transfer::backup(pool, config, &agent)?;
            eprintln!("[info] <{}> backed up {snapshot}", pool.root().display());
            Ok(())
        }
        Operation::Retention => {
            let deleted = retention::run(pool, &config.retention)?;
            eprintln!(
                "[info] <{}> retention deleted {} snapshot(s)",
                pool.root().display(),
                deleted.len()
            );
            Ok(())
        }
        Operation::CreateImage => {
            let outcome = ImageBuilder::new(pool, config).create()?;
            eprintln!("[info] <{}> image {outcome:?}", pool.root().display());
            Ok(())
        }
        Operation::UpdateImage => {
            let outcome = ImageBuilder::new(pool, config).update()?;
            eprintln!("[info] <{}> image {outcome:?}", pool.root().display());
            Ok(())
        }
        Operation::CloneImage => clone_image(pool, config),
        Operation::ListImages => list_images(pool),
        Operation::MountRaw => mount_and_run(&pool.raw_image_path(), Some("raw"), config),
        Operation::MountQcow2 => mount_and_run(&pool.qcow2_image_path(), Some("qcow2"), config),
    }
}

fn require_host(host: Option<&str>) -> Result<&str, EngineError> {
    host.ok_or_else(|| UsageError::MissingHost.into())
}

/// Tools every operation set this engine exposes may shell out to at some
/// point. Checked up front during setup so a missing one fails fast with a
/// clear error instead of surfacing deep inside a subprocess pipeline.
const REQUIRED_TOOLS: &[&str] = &[
    "btrfs",
    "qemu-img",
    "qemu-nbd",
    "losetup",
    "btrfstune",
    "mkfs.btrfs",
    "sgdisk",
];

fn tool_in_path(name: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {name}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn check_required_tools() -> Result<(), EngineError> {
    for tool in REQUIRED_TOOLS {
        if !tool_in_path(tool) {
            return Err(PreconditionError::MissingTool(tool).into());
        }
    }
    Ok(())
}

/// Setup: creates the pool layout idempotently, applies the default
/// compression property, and captures the initial Metadata Store.
fn setup(pool: &Pool, config: &PoolConfig, host: &str) -> Result<(), EngineError> {
    if !pool.root().is_dir() {
        return Err(UsageError::NotADirectory(pool.root().to_path_buf()).into());
    }
    if !is_btrfs(pool.root()) {
        return Err(PreconditionError::NotBtrfs(pool.root().to_path_buf()).into());
    }
    check_required_tools()?;

    pool.create_layout()?;
    apply_default_compression(pool, &config.btrfs_compression)?;

    let agent = RemoteAgent::new(host.to_string());
    let capture = Capture::fetch(&agent, &config.rootdev, config.rootpart)?;
    capture.write_archive(&pool.metadata_path())?;

    eprintln!("[info] <{}> setup complete for host {host}", pool.root().display());
    Ok(())
}

fn is_btrfs(path: &std::path::Path) -> bool {
    let output = Command::new("stat")
        .arg("-f")
        .arg("-c")
        .arg("%T")
        .arg(path)
        .output();

    matches!(output, Ok(o) if o.status.success()
        && String::from_utf8_lossy(&o.stdout).trim() == "btrfs")
}

fn apply_default_compression(pool: &Pool, profile: &str) -> std::io::Result<()> {
    let status = Command::new("btrfs")
        .arg("property")
        .arg("set")
        .arg(pool.snapshots_dir())
        .arg("compression")
        .arg(profile)
        .status()?;

    if !status.success() {
        return Err(std::io::Error::other("setting default compression property failed"));
    }
    Ok(())
}

/// `--clone-image` duplicates the existing materialized image to a new
/// path rather than rebuilding it: a cheap reflink copy on a CoW
/// filesystem.
fn clone_image(pool: &Pool, config: &PoolConfig) -> Result<(), EngineError> {
    let source = if config.direct_qcow2 {
        pool.qcow2_image_path()
    } else {
        pool.raw_image_path()
    };
    let destination = source.with_extension("clone");

    let status = Command::new("cp")
        .arg("--reflink=auto")
        .arg(&source)
        .arg(&destination)
        .status()?;

    if !status.success() {
        return Err(std::io::Error::other("cloning image failed").into());
    }
    Ok(())
}

fn list_images(pool: &Pool) -> Result<(), EngineError> {
    for candidate in [pool.raw_image_path(), pool.qcow2_image_path()] {
        if candidate.exists() {
            println!("{}", candidate.display());
        }
    }
    Ok(())
}

/// `--mount-raw`/`--mount-qcow2`: mounts the image and runs a configured
/// subcommand inside it, defaulting to an interactive shell when attached
/// to a terminal and to printing the mountpoint otherwise so the operation
/// stays scriptable. Always unmounts afterward regardless of the
/// subcommand's exit status.
fn mount_and_run(
    image_path: &std::path::Path,
    format: Option<&str>,
    config: &PoolConfig,
) -> Result<(), EngineError> {
    use crate::blockdev::{Attachment, BlockDeviceBroker};
    use crate::lock::CleanupStack;
    use sys_mount::{Mount, UnmountFlags};

    let mut cleanup = CleanupStack::new();

    let attachment = BlockDeviceBroker::attach_nbd(image_path, format)?;
    let rootpart = config.rootpart;
    let device = attachment.device.clone();
    let mode = attachment.mode;
    cleanup.push(Box::new(move || {
        let attachment = Attachment {
            device: device.clone(),
            mode,
            randomize_uuid_on_release: false,
        };
        let _ = BlockDeviceBroker::release(&attachment, rootpart);
    }));

    let partition = format!("{}p{}", attachment.device.display(), rootpart);
    let mountpoint = std::env::temp_dir().join("btrbak-mount");
    std::fs::create_dir_all(&mountpoint)?;

    let mount = Mount::builder()
        .mount_autodrop(&partition, &mountpoint, UnmountFlags::DETACH)
        .map_err(|e| crate::ImageError::MountFailed {
            device: PathBuf::from(&partition),
            mountpoint: mountpoint.clone(),
            source: e,
        })?;

    let mountpoint_for_release = mountpoint.clone();
    cleanup.push(Box::new(move || {
        drop(mount);
        let _ = std::fs::remove_dir(&mountpoint_for_release);
    }));

    if std::io::stderr().is_terminal() {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let _ = Command::new(shell).current_dir(&mountpoint).status();
    } else {
        println!("{}", mountpoint.display());
    }

    cleanup.run_all();
    Ok(())
}
