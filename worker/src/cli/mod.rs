// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Arg, ArgAction, Command};
use thiserror::Error;

mod backend;
mod check_updates;
mod rescue;
mod sleep;

/// Generate the CLI command structure
fn command() -> Command {
    Command::new("appman-worker")
        .about("Privileged package operation worker")
        .arg(
            Arg::new("root")
                .short('D')
                .long("directory")
                .global(true)
                .help("Root directory")
                .action(ArgAction::Set)
                .default_value("/"),
        )
        .arg_required_else_help(true)
        .subcommand(backend::command())
        .subcommand(check_updates::command())
        .subcommand(rescue::command())
        .subcommand(sleep::command())
}

/// Process all CLI arguments, yielding the process exit code
pub fn process() -> Result<i32, Error> {
    let matches = command().get_matches();
    let root = matches
        .get_one::<String>("root")
        .cloned()
        .unwrap_or_else(|| "/".into());

    match matches.subcommand() {
        Some(("backend", args)) => backend::handle(&root, args).map(|_| 0).map_err(Error::Backend),
        Some(("check-for-updates", args)) => {
            check_updates::handle(&root, args).map_err(Error::CheckUpdates)
        }
        Some(("rescue", args)) => Ok(rescue::handle(&root, args)),
        Some(("sleep", args)) => sleep::handle(&root, args).map(|_| 0).map_err(Error::Sleep),
        _ => unreachable!(),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend: {0}")]
    Backend(#[from] backend::Error),

    #[error("check-for-updates: {0}")]
    CheckUpdates(#[from] check_updates::Error),

    #[error("sleep: {0}")]
    Sleep(#[from] appman_worker::lock::Error),
}
