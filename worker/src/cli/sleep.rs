// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{thread, time::Duration};

use clap::{value_parser, Arg, ArgMatches, Command};
use log::info;

use appman_worker::{lock, Installation};

pub fn command() -> Command {
    Command::new("sleep")
        .about("Hold the worker lock, for testing lock arbitration")
        .arg(
            Arg::new("weak")
                .required(false)
                .value_parser(value_parser!(String)),
        )
}

pub fn handle(root: &str, args: &ArgMatches) -> Result<(), lock::Error> {
    let installation = Installation::open(root);

    let mode = match args.get_one::<String>("weak").map(String::as_str) {
        Some("weak") => lock::Mode::Weak,
        _ => lock::Mode::Strong,
    };

    let _lock = lock::acquire(installation.lock_path(), mode)?;

    loop {
        info!("sleeping...");
        thread::sleep(Duration::from_secs(5));
    }
}
