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

use std::process::ExitStatus;

use rand::Rng;

use crate::PipelineError;

/// Provides a `Vec<u8>` of `n` random bytes, used for temp-file name
/// suffixes. Uses the thread-local generator of the `rand` crate.
pub fn random_bytes(n: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Standard)
        .take(n)
        .collect()
}

/// Renders `n` random bytes as a lowercase hex string, for use as a temp
/// file/directory suffix.
pub fn random_suffix(n: usize) -> String {
    random_bytes(n).iter().map(|b| format!("{b:02x}")).collect()
}

/// Extracts the image byte length from a stored `fdisk -l` listing. The
/// engine pins the remote locale to `C` specifically so this line always
/// reads "Disk /dev/sda: 21.48 GiB, 23068672000 bytes, 45056000 sectors",
/// and the byte count is always the 5th whitespace-separated token.
///
/// This parser is intentionally narrow: rather than attempting to
/// recognize every locale's number formatting, it fails loudly when the
/// expected shape isn't found.
pub fn parse_disk_byte_length(fdisk_l: &str) -> Option<u64> {
    fdisk_l.lines().find_map(|line| {
        if !line.starts_with("Disk ") {
            return None;
        }

        line.split_whitespace().nth(4)?.parse::<u64>().ok()
    })
}

/// Extracts the `fsid` and `label` fields from a stored superblock text
/// dump (`btrfs inspect-internal dump-super` output). Each field's value
/// is the 2nd whitespace-separated token on its line.
pub fn parse_fsid_and_label(super_dump: &str) -> (Option<String>, Option<String>) {
    let mut fsid = None;
    let mut label = None;

    for line in super_dump.lines() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("fsid") => fsid = tokens.next().map(str::to_string),
            Some("label") => label = tokens.next().map(str::to_string),
            _ => {}
        }
    }

    (fsid, label)
}

/// Extracts every `subvol=@...` identifier referenced by a stored
/// `/etc/fstab`, in file order, deduplicated.
pub fn parse_required_subvolumes(fstab: &str) -> Vec<String> {
    let mut subvols = Vec::new();

    for line in fstab.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        for token in line.split(|c: char| c == ',' || c.is_whitespace()) {
            if let Some(name) = token.strip_prefix("subvol=") {
                if name.starts_with('@') && !subvols.iter().any(|s: &String| s == name) {
                    subvols.push(name.to_string());
                }
            }
        }
    }

    subvols
}

/// Comments out every fstab line whose filesystem type field is `swap`,
/// leaving every other line untouched — a materialized image's swap device
/// rarely matches the host's, so the entry must not be trusted blindly.
/// Operates line-by-line so it is safe to run repeatedly (idempotent: an
/// already-commented swap line is left as-is).
pub fn neutralize_swap_entries(fstab: &str) -> String {
    fstab
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                return line.to_string();
            }

            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() >= 3 && fields[2] == "swap" {
                format!("# {line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Maps a subprocess's [`ExitStatus`] to a [`PipelineError`], naming the
/// failing stage so a multi-stage pipeline's error identifies which
/// program actually failed. Logs the stage name and exit status to stderr
/// before returning on failure, so an operator can correlate the typed
/// error with the underlying tool.
pub fn check_stage(stage: &str, status: ExitStatus) -> Result<(), PipelineError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => {
            eprintln!("[warn] pipeline stage `{stage}` exited with status {code}");
            Err(PipelineError::StageFailed {
                stage: stage.to_string(),
                status: code,
            })
        }
        None => {
            eprintln!("[warn] pipeline stage `{stage}` was terminated by a signal");
            Err(PipelineError::StageSignaled(stage.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fdisk_l_byte_length() {
        let listing = "Disk /dev/sda: 21.48 GiB, 23068672000 bytes, 45056000 sectors\nUnits: sectors of 1 * 512 = 512 bytes\n";
        assert_eq!(parse_disk_byte_length(listing), Some(23068672000));
    }

    #[test]
    fn missing_disk_line_yields_none() {
        assert_eq!(parse_disk_byte_length("Units: sectors of 1 * 512\n"), None);
    }

    #[test]
    fn parses_fsid_and_label() {
        let dump = "fsid\t\t\t3b2a1c4d-...\nlabel\t\t\tmyhost\ngeneration\t\t42\n";
        let (fsid, label) = parse_fsid_and_label(dump);
        assert_eq!(fsid.as_deref(), Some("3b2a1c4d-..."));
        assert_eq!(label.as_deref(), Some("myhost"));
    }

    #[test]
    fn parses_required_subvolumes_deduplicated() {
        let fstab = "UUID=abc / btrfs subvol=@,compress=zstd 0 0\n\
                     UUID=abc /home btrfs subvol=@home 0 0\n\
                     UUID=abc /.snapshots btrfs subvol=@,compress=zstd 0 0\n";
        let subvols = parse_required_subvolumes(fstab);
        assert_eq!(subvols, vec!["@".to_string(), "@home".to_string()]);
    }

    #[test]
    fn neutralizes_only_swap_lines() {
        let fstab = "UUID=abc / btrfs subvol=@ 0 0\n\
                     UUID=def none swap sw 0 0\n\
                     # already commented swap line\n";
        let result = neutralize_swap_entries(fstab);
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines[0], "UUID=abc / btrfs subvol=@ 0 0");
        assert_eq!(lines[1], "# UUID=def none swap sw 0 0");
        assert_eq!(lines[2], "# already commented swap line");
    }
}
