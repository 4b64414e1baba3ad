// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{value_parser, Arg, ArgMatches, Command};
use thiserror::Error;

use appman_worker::{
    lock, protocol::Encoder, runtime, server, status::NullMonitor, Installation, Options, Worker,
};

pub fn command() -> Command {
    Command::new("check-for-updates")
        .about("Refresh the package lists without a front-end")
        .arg(
            Arg::new("http_proxy")
                .required(false)
                .value_parser(value_parser!(String)),
        )
}

/// Exit code 0 on (partial) success, 1 on failure, 2 when the cache
/// cannot be opened at all.
pub fn handle(root: &str, args: &ArgMatches) -> Result<i32, Error> {
    let installation = Installation::open(root);

    // A weak instance never disturbs an interactive worker.
    let _lock = lock::acquire(installation.lock_path(), lock::Mode::Weak)?;
    let _runtime = runtime::init();

    if let Some(proxy) = args.get_one::<String>("http_proxy") {
        std::env::set_var("http_proxy", proxy);
    }

    let mut worker = Worker::new(installation, Options::default());
    worker.misc_init(&mut NullMonitor);

    if worker.cache.is_none() {
        return Ok(2);
    }

    let mut response = Encoder::new();
    let code = server::check_updates(&mut worker, &mut response, &mut NullMonitor);

    Ok(if code.is_success() { 0 } else { 1 })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("lock")]
    Lock(#[from] lock::Error),
}
