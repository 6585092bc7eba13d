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

use std::io::Read;
use std::process::{Child, Command, Stdio};

use crate::pool::Snapshot;
use crate::RemoteError;

/// The fixed location on the remote host under which the Remote Agent
/// creates and enumerates snapshots. Engine treats this as a contract with
/// the remote side rather than something to discover.
pub const REMOTE_SNAPSHOT_ROOT: &str = "/.btrfs/snapshots";

/// Drives the source host over a remote shell. Every method here spawns
/// `ssh` as a subprocess (never a TCP client library) against a fixed
/// command line, matching the engine's general preference for shelling
/// out to system tools rather than linking bindings for them.
pub struct RemoteAgent {
    host: String,
}

impl RemoteAgent {
    pub fn new(host: String) -> Self {
        RemoteAgent { host }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn ssh_command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg(&self.host).arg(remote_command);
        // Pin the remote locale to C so fixed-position parsing of tool
        // output is reliable regardless of the operator's own locale.
        cmd.env("LC_ALL", "C");
        cmd
    }

    fn run_capturing(&self, remote_command: &str) -> Result<Vec<u8>, RemoteError> {
        let output = self
            .ssh_command(remote_command)
            .stdin(Stdio::null())
            .output()
            .map_err(|_| RemoteError::CommandFailed {
                host: self.host.clone(),
                command: remote_command.to_string(),
                status: -1,
            })?;

        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                host: self.host.clone(),
                command: remote_command.to_string(),
                status: output.status.code().unwrap_or(-1),
            });
        }

        Ok(output.stdout)
    }

    /// Creates a read-only snapshot of `/` at
    /// `<remote_snapshot_root>/<snapshot_name>`.
    pub fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), RemoteError> {
        let remote_path = format!("{REMOTE_SNAPSHOT_ROOT}/{snapshot}");
        let remote_command =
            format!("sudo btrfs subvolume snapshot -r / '{remote_path}'");

        self.run_capturing(&remote_command)?;
        Ok(())
    }

    /// Lists the names of snapshots present under the remote snapshot
    /// root, used by Snapshot Transfer to validate candidate parents.
    pub fn list_snapshots(&self) -> Result<Vec<String>, RemoteError> {
        let remote_command = format!("ls -1 '{REMOTE_SNAPSHOT_ROOT}'");
        let stdout = self.run_capturing(&remote_command)?;

        let text = String::from_utf8(stdout)
            .map_err(|_| RemoteError::UnreadableListing(self.host.clone()))?;

        Ok(text.lines().map(str::to_string).collect())
    }

    /// Spawns the remote `btrfs send` (full, or differential from `parent`
    /// if given) piped through the configured compressor, leaving stdout
    /// open for the caller to read the compressed stream from. The caller
    /// is responsible for waiting on the returned child and checking its
    /// exit status as part of the overall pipeline.
    pub fn spawn_send(
        &self,
        snapshot: Snapshot,
        parent: Option<Snapshot>,
        compress_cmd: &[String],
    ) -> Result<Child, RemoteError> {
        let remote_path = format!("{REMOTE_SNAPSHOT_ROOT}/{snapshot}");

        let mut send_args = String::from("sudo btrfs send");
        if let Some(parent) = parent {
            send_args.push_str(&format!(" -p '{REMOTE_SNAPSHOT_ROOT}/{parent}'"));
        }
        send_args.push_str(&format!(" '{remote_path}'"));

        let compressor = compress_cmd.join(" ");
        let remote_command = format!("{send_args} | {compressor}");

        self.ssh_command(&remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|_| RemoteError::SendFailed(snapshot.to_string()))
    }

    /// Reads the four fixed Metadata Store artifacts plus `/etc/fstab`
    /// from the remote host.
    pub fn read_partition_listing(&self, rootdev: &str) -> Result<Vec<u8>, RemoteError> {
        self.run_capturing(&format!("sudo fdisk -l /dev/{rootdev}"))
    }

    pub fn read_partition_table_backup(&self, rootdev: &str) -> Result<Vec<u8>, RemoteError> {
        self.run_capturing(&format!(
            "sudo sgdisk --backup=/dev/stdout /dev/{rootdev} 2>/dev/null"
        ))
    }

    pub fn read_boot_partition(&self, rootdev: &str) -> Result<Vec<u8>, RemoteError> {
        self.run_capturing(&format!("sudo dd if=/dev/{rootdev}1 bs=1M status=none"))
    }

    pub fn read_superblock_dump(&self, rootdev: &str, rootpart: u32) -> Result<Vec<u8>, RemoteError> {
        self.run_capturing(&format!(
            "sudo btrfs inspect-internal dump-super /dev/{rootdev}{rootpart}"
        ))
    }

    pub fn read_fstab(&self) -> Result<Vec<u8>, RemoteError> {
        self.run_capturing("cat /etc/fstab")
    }
}

/// Reads a spawned child's stdout to completion (used when a compressed
/// send stream is small enough to buffer, e.g. in tests); production
/// callers stream directly into the receive pipeline instead of buffering.
pub fn drain_stdout(mut child: Child) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_end(&mut buf)?;
    }
    child.wait()?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_command_targets_configured_host() {
        let agent = RemoteAgent::new("root@backuphost".to_string());
        let cmd = agent.ssh_command("true");
        assert_eq!(cmd.get_program(), "ssh");
    }
}
