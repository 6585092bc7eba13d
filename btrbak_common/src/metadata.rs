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

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use tar::{Archive, Builder, Header};

use crate::system;
use crate::{MetadataError, RemoteError};

/// Fixed entry names inside `metadata.tar`. The engine relies on these
/// exact names; nothing discovers them dynamically.
pub mod entries {
    pub const FDISK_L: &str = "fdisk-l";
    pub const SGDISK_BACKUP: &str = "sgdisk-backup";
    pub const PART1_IMG: &str = "part1-img";
    pub const SUPER_DUMP: &str = "super-dump";
    pub const FSTAB: &str = "fstab";
}

/// The four captured remote artifacts plus `/etc/fstab`, held in memory
/// between capture and archive write (or between archive read and use by
/// the Image Builder).
pub struct Capture {
    pub fdisk_l: Vec<u8>,
    pub sgdisk_backup: Vec<u8>,
    pub part1_img: Vec<u8>,
    pub super_dump: Vec<u8>,
    pub fstab: Vec<u8>,
}

impl Capture {
    /// Pulls all five artifacts from the Remote Agent in one pass.
    pub fn fetch(
        agent: &crate::remote::RemoteAgent,
        rootdev: &str,
        rootpart: u32,
    ) -> Result<Self, RemoteError> {
        Ok(Capture {
            fdisk_l: agent.read_partition_listing(rootdev)?,
            sgdisk_backup: agent.read_partition_table_backup(rootdev)?,
            part1_img: agent.read_boot_partition(rootdev)?,
            super_dump: agent.read_superblock_dump(rootdev, rootpart)?,
            fstab: agent.read_fstab()?,
        })
    }

    /// Writes the archive to a sibling temp file and atomically renames it
    /// over `path` on completion, so a crash mid-write never leaves a
    /// truncated `metadata.tar` in place of a good one.
    pub fn write_archive(&self, path: &Path) -> Result<(), MetadataError> {
        let tmp_path = path.with_extension("tar.tmp");

        {
            let file = File::create(&tmp_path)?;
            let mut builder = Builder::new(file);

            append_entry(&mut builder, entries::FDISK_L, &self.fdisk_l)?;
            append_entry(&mut builder, entries::SGDISK_BACKUP, &self.sgdisk_backup)?;
            append_entry(&mut builder, entries::PART1_IMG, &self.part1_img)?;
            append_entry(&mut builder, entries::SUPER_DUMP, &self.super_dump)?;
            append_entry(&mut builder, entries::FSTAB, &self.fstab)?;

            builder.finish()?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Reads and validates every fixed entry out of `metadata.tar`.
    pub fn read_archive(path: &Path) -> Result<Self, MetadataError> {
        let file = File::open(path)?;
        let mut archive = Archive::new(file);

        let mut fdisk_l = None;
        let mut sgdisk_backup = None;
        let mut part1_img = None;
        let mut super_dump = None;
        let mut fstab = None;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_path_buf();
            let name = path.to_string_lossy().to_string();

            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;

            match name.as_str() {
                entries::FDISK_L => fdisk_l = Some(buf),
                entries::SGDISK_BACKUP => sgdisk_backup = Some(buf),
                entries::PART1_IMG => part1_img = Some(buf),
                entries::SUPER_DUMP => super_dump = Some(buf),
                entries::FSTAB => fstab = Some(buf),
                _ => {}
            }
        }

        Ok(Capture {
            fdisk_l: fdisk_l.ok_or(MetadataError::MissingEntry(entries::FDISK_L))?,
            sgdisk_backup: sgdisk_backup.ok_or(MetadataError::MissingEntry(entries::SGDISK_BACKUP))?,
            part1_img: part1_img.ok_or(MetadataError::MissingEntry(entries::PART1_IMG))?,
            super_dump: super_dump.ok_or(MetadataError::MissingEntry(entries::SUPER_DUMP))?,
            fstab: fstab.ok_or(MetadataError::MissingEntry(entries::FSTAB))?,
        })
    }

    /// The image byte length recorded in the captured `fdisk -l` listing.
    pub fn disk_byte_length(&self) -> Result<u64, MetadataError> {
        let text = String::from_utf8_lossy(&self.fdisk_l);
        system::parse_disk_byte_length(&text).ok_or(MetadataError::MissingByteLength)
    }

    /// The filesystem UUID (`fsid`) and label recorded in the captured
    /// superblock dump.
    pub fn fsid_and_label(&self) -> Result<(String, String), MetadataError> {
        let text = String::from_utf8_lossy(&self.super_dump);
        let (fsid, label) = system::parse_fsid_and_label(&text);

        match (fsid, label) {
            (Some(fsid), Some(label)) => Ok((fsid, label)),
            _ => Err(MetadataError::MissingFsidOrLabel),
        }
    }

    /// Every `subvol=@...` identifier referenced by the captured fstab.
    pub fn required_subvolumes(&self) -> Vec<String> {
        let text = String::from_utf8_lossy(&self.fstab);
        system::parse_required_subvolumes(&text)
    }
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), MetadataError> {
    let mut header = Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o600);
    header.set_cksum();

    builder.append(&header, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_capture() -> Capture {
        Capture {
            fdisk_l: b"Disk /dev/sda: 20 GiB, 21474836480 bytes, 41943040 sectors\n".to_vec(),
            sgdisk_backup: vec![0xde, 0xad, 0xbe, 0xef],
            part1_img: vec![1, 2, 3, 4],
            super_dump: b"fsid\t\tabc-123\nlabel\t\tmyhost\n".to_vec(),
            fstab: b"UUID=abc / btrfs subvol=@ 0 0\nUUID=abc /home btrfs subvol=@home 0 0\n"
                .to_vec(),
        }
    }

    #[test]
    fn archive_round_trips_all_entries() {
        let dir = std::env::temp_dir().join("btrbak-metadata-test");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let archive_path = dir.join("metadata.tar");

        let capture = sample_capture();
        capture.write_archive(&archive_path).unwrap();

        let read_back = Capture::read_archive(&archive_path).unwrap();
        assert_eq!(read_back.fdisk_l, capture.fdisk_l);
        assert_eq!(read_back.sgdisk_backup, capture.sgdisk_backup);
        assert_eq!(read_back.fstab, capture.fstab);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn derived_fields_parse_correctly() {
        let capture = sample_capture();
        assert_eq!(capture.disk_byte_length().unwrap(), 21474836480);
        assert_eq!(
            capture.fsid_and_label().unwrap(),
            ("abc-123".to_string(), "myhost".to_string())
        );
        assert_eq!(
            capture.required_subvolumes(),
            vec!["@".to_string(), "@home".to_string()]
        );
    }
}
