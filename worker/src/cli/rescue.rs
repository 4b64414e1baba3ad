// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{value_parser, Arg, ArgMatches, Command};

use appman_worker::{rescue, runtime, Installation};

pub fn command() -> Command {
    Command::new("rescue")
        .about("Replay an interrupted system update from removable media")
        .arg(
            Arg::new("package")
                .required(false)
                .value_parser(value_parser!(String)),
        )
        .arg(
            Arg::new("download_root")
                .required(false)
                .value_parser(value_parser!(String)),
        )
}

pub fn handle(root: &str, args: &ArgMatches) -> i32 {
    let installation = Installation::open(root);
    let _runtime = runtime::init();

    rescue::run(
        &installation,
        args.get_one::<String>("package").map(String::as_str),
        args.get_one::<String>("download_root").map(String::as_str),
    )
}
