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

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::BlockDeviceError;

/// How the engine attaches an image file as a block device: a loopback
/// device for a raw image, or a network block device for a qcow2 image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachMode {
    /// Loopback device, partition-scanned (raw mode).
    Loopback,
    /// Network block device (direct-compressed-image mode).
    NetworkBlock,
}

/// An attached image file. Exactly one [`BlockDeviceBroker::release`] must
/// pair with every successful attach; the broker itself does not enforce
/// this, callers register the release with a [`crate::lock::CleanupStack`].
pub struct Attachment {
    pub device: PathBuf,
    pub mode: AttachMode,
    /// Set by the Image Builder's Init phase the first time a fresh
    /// filesystem is formatted on this attachment; read by `release` to
    /// decide whether to randomize the filesystem UUID before detaching,
    /// so a cloned image never shares a filesystem UUID with its source.
    pub randomize_uuid_on_release: bool,
}

/// Allocates, attaches, waits for, and releases block devices backing
/// image files.
pub struct BlockDeviceBroker;

impl BlockDeviceBroker {
    /// Attaches `image_path` as a network block device. Ensures the kernel
    /// module is loaded, finds the first `/dev/nbdN` reporting zero size
    /// (unused), requests the attach, and waits for the device manager to
    /// settle before confirming the expected partition node exists.
    /// `format` names the image's on-disk format (e.g. `"qcow2"`) so
    /// `qemu-nbd` parses it correctly instead of guessing; pass `None` to
    /// let `qemu-nbd` probe the format itself.
    pub fn attach_nbd(image_path: &Path, format: Option<&str>) -> Result<Attachment, BlockDeviceError> {
        ensure_nbd_module_loaded()?;

        let device = first_free_nbd_device()?;

        let mut command = Command::new("qemu-nbd");
        command.arg("--connect").arg(&device);
        if let Some(format) = format {
            command.arg(format!("--format={format}"));
        }
        command.arg(image_path);

        let status = command.status()?;
        if !status.success() {
            eprintln!("[warn] qemu-nbd --connect {} exited with status {:?}", device.display(), status.code());
            return Err(BlockDeviceError::AttachFailed(device));
        }

        settle()?;
        wait_for_partition_node(&device, 1)?;

        Ok(Attachment {
            device,
            mode: AttachMode::NetworkBlock,
            randomize_uuid_on_release: false,
        })
    }

    /// Attaches `image_path` as a partition-scanned loopback device.
    pub fn attach_loopback(image_path: &Path) -> Result<Attachment, BlockDeviceError> {
        let output = Command::new("losetup")
            .arg("--find")
            .arg("--partscan")
            .arg("--show")
            .arg(image_path)
            .output()?;

        if !output.status.success() {
            return Err(BlockDeviceError::AttachFailed(image_path.to_path_buf()));
        }

        let device = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim().to_string());

        settle()?;
        wait_for_partition_node(&device, 1)?;

        Ok(Attachment {
            device,
            mode: AttachMode::Loopback,
            randomize_uuid_on_release: false,
        })
    }

    /// Unmounts any mountpoint, randomizes the filesystem UUID if the
    /// attachment requests it, and detaches the device. Idempotent:
    /// detaching an already-detached device is not an error.
    pub fn release(attachment: &Attachment, rootpart: u32) -> Result<(), BlockDeviceError> {
        if attachment.randomize_uuid_on_release {
            let partition = partition_node(&attachment.device, rootpart);
            let _ = Command::new("btrfstune")
                .arg("-f")
                .arg("-u")
                .arg(&partition)
                .status();
        }

        match attachment.mode {
            AttachMode::NetworkBlock => {
                let _ = Command::new("qemu-nbd")
                    .arg("--disconnect")
                    .arg(&attachment.device)
                    .status();
            }
            AttachMode::Loopback => {
                let _ = Command::new("losetup")
                    .arg("--detach")
                    .arg(&attachment.device)
                    .status();
            }
        }

        Ok(())
    }
}

fn ensure_nbd_module_loaded() -> Result<(), BlockDeviceError> {
    let status = Command::new("modprobe")
        .arg("nbd")
        .arg("max_part=8")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    if !status.success() {
        return Err(BlockDeviceError::AttachFailed(PathBuf::from("/dev/nbd0")));
    }

    Ok(())
}

fn first_free_nbd_device() -> Result<PathBuf, BlockDeviceError> {
    for n in 0..16 {
        let device = PathBuf::from(format!("/dev/nbd{n}"));
        let size_path = format!("/sys/class/block/nbd{n}/size");

        let size = std::fs::read_to_string(&size_path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        if size == 0 {
            return Ok(device);
        }
    }

    Err(BlockDeviceError::NoFreeSlot)
}

/// Waits for the device manager to finish processing uevents triggered by
/// an attach, so partition device nodes have been created before the
/// caller looks for them.
fn settle() -> Result<(), BlockDeviceError> {
    let status = Command::new("udevadm")
        .arg("settle")
        .arg("--timeout=10")
        .status()?;

    if !status.success() {
        thread::sleep(Duration::from_millis(500));
    }

    Ok(())
}

fn partition_node(device: &Path, partition: u32) -> PathBuf {
    // /dev/nbd0 -> /dev/nbd0p1, /dev/loop0 -> /dev/loop0p1.
    PathBuf::from(format!("{}p{}", device.display(), partition))
}

fn wait_for_partition_node(device: &Path, partition: u32) -> Result<(), BlockDeviceError> {
    let node = partition_node(device, partition);

    for _ in 0..20 {
        if node.exists() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }

    Err(BlockDeviceError::SettleTimeout(node))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_node_appends_p_and_index() {
        let node = partition_node(Path::new("/dev/nbd3"), 1);
        assert_eq!(node, PathBuf::from("/dev/nbd3p1"));
    }
}
