// btrbak is a remote filesystem backup engine for btrfs hosts.
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

mod error;
use error::*;

use std::path::PathBuf;

use btrbak_common::config::CliOverrides;
use btrbak_common::driver::{self, Invocation, Operation};

use clap::{Arg, ArgAction, CommandFactory, FromArgMatches, Parser};

/// Each operation flag's long name paired with the [`Operation`] it maps
/// to, in the fixed list the command line surface exposes. These are
/// registered on the builder directly rather than as `Cli` struct fields,
/// since their only consumer is `ordered_operations`, which reads argv
/// position via `ArgMatches::indices_of` rather than a typed field — a
/// struct field here would just be dead weight.
const OPERATION_FLAGS: &[(&str, Operation)] = &[
    ("setup", Operation::Setup),
    ("backup", Operation::Backup),
    ("retention", Operation::Retention),
    ("create-image", Operation::CreateImage),
    ("update-image", Operation::UpdateImage),
    ("clone-image", Operation::CloneImage),
    ("list-images", Operation::ListImages),
    ("mount-raw", Operation::MountRaw),
    ("mount-qcow2", Operation::MountQcow2),
];

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local backup pool.
    #[arg(long = "backup-dir")]
    backup_dir: PathBuf,

    /// Hostname of the source machine the pool backs up.
    #[arg(long)]
    host: Option<String>,

    /// Override the rootfs subvolume name (default `@`).
    #[arg(long)]
    rootfs: Option<String>,

    /// Override the source block device name (default `sda`).
    #[arg(long)]
    rootdev: Option<String>,

    /// Override the source partition number (default `2`).
    #[arg(long)]
    rootpart: Option<u32>,

    #[arg(long)]
    latest: Option<u32>,
    #[arg(long)]
    days: Option<u32>,
    #[arg(long)]
    weeks: Option<u32>,
    #[arg(long)]
    months: Option<u32>,
    #[arg(long)]
    years: Option<u32>,

    /// Work directly in a compressed sparse (qcow2) image instead of a raw
    /// sparse image converted afterward.
    #[arg(long = "direct-qcow2", action = ArgAction::SetTrue)]
    direct_qcow2: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            rootfs: self.rootfs.clone(),
            rootdev: self.rootdev.clone(),
            rootpart: self.rootpart,
            latest: self.latest,
            days: self.days,
            weeks: self.weeks,
            months: self.months,
            years: self.years,
            direct_qcow2: self.direct_qcow2,
        }
    }
}

fn main() {
    if let Err(e) = logic() {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn logic() -> Result<()> {
    // The 9 operation flags are registered directly on the builder (not as
    // `Cli` struct fields) so their argv position can be recovered via
    // `ArgMatches::indices_of`, which the derive API doesn't expose.
    // Operations run in the order the user actually gave the flags, not
    // declaration order.
    let mut command = Cli::command();
    for (name, _) in OPERATION_FLAGS {
        command = command.arg(
            Arg::new(*name)
                .long(*name)
                .action(ArgAction::SetTrue)
                .help(format!("Run the `{name}` operation")),
        );
    }

    let matches = command.get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let operations = ordered_operations(&matches);

    let invocation = Invocation {
        backup_dir: cli.backup_dir.clone(),
        host: cli.host.clone(),
        overrides: cli.overrides(),
        operations,
    };

    driver::run(invocation)?;
    Ok(())
}

fn ordered_operations(matches: &clap::ArgMatches) -> Vec<Operation> {
    let mut flagged: Vec<(usize, Operation)> = Vec::new();

    for (name, operation) in OPERATION_FLAGS {
        if let Some(indices) = matches.indices_of(name) {
            for index in indices {
                flagged.push((index, *operation));
            }
        }
    }

    flagged.sort_by_key(|(index, _)| *index);
    flagged.into_iter().map(|(_, op)| op).collect()
}
