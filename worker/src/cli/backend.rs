// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    os::unix::fs::{FileTypeExt, OpenOptionsExt},
};

use clap::{value_parser, Arg, ArgMatches, Command};
use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use thiserror::Error;

use appman_worker::{
    lock, runtime,
    server::{self, Pipes},
    status::NullMonitor,
    Installation, Options, Worker,
};

pub fn command() -> Command {
    Command::new("backend")
        .about("Serve one front-end client over fifos until its input closes")
        .arg(Arg::new("input").required(true).value_parser(value_parser!(String)))
        .arg(Arg::new("output").required(true).value_parser(value_parser!(String)))
        .arg(Arg::new("status").required(true).value_parser(value_parser!(String)))
        .arg(Arg::new("cancel").required(true).value_parser(value_parser!(String)))
        .arg(Arg::new("options").required(true).value_parser(value_parser!(String)))
}

pub fn handle(root: &str, args: &ArgMatches) -> Result<(), Error> {
    let fifo = |name: &str| -> Result<&str, Error> {
        let path = args
            .get_one::<String>(name)
            .map(String::as_str)
            .unwrap_or_default();
        let is_fifo = std::fs::metadata(path)
            .map(|m| m.file_type().is_fifo())
            .unwrap_or(false);
        if is_fifo {
            Ok(path)
        } else {
            Err(Error::NotAFifo(path.to_owned()))
        }
    };

    // Input and cancel start non-blocking: the hello frame must go out
    // before the client has the write ends open.
    let input = open_nonblocking(fifo("input")?)?;
    let cancel = open_nonblocking(fifo("cancel")?)?;
    let output = OpenOptions::new()
        .write(true)
        .open(fifo("output")?)
        .map_err(Error::Open)?;
    let status = OpenOptions::new()
        .write(true)
        .open(fifo("status")?)
        .map_err(Error::Open)?;

    let mut pipes = Pipes {
        input,
        output,
        status,
        cancel,
    };

    // Tell the frontend the pipes are open, then wait for it to open the
    // request stream for writing.
    server::send_hello(&mut pipes).map_err(Error::Open)?;
    block_for_read(&pipes.input)?;

    // From here on requests are read blocking; the cancel stream stays
    // non-blocking for polling.
    fcntl(pipes.input.as_raw_fd(), FcntlArg::F_SETFL(OFlag::empty()))
        .map_err(Error::Fcntl)?;

    let options = Options::parse(
        args.get_one::<String>("options")
            .map(String::as_str)
            .unwrap_or_default(),
    );

    debug!(
        "starting with pid {}, options {options:?}",
        std::process::id()
    );

    // Don't let our heavy lifting starve the UI.
    nix::errno::Errno::clear();
    if unsafe { nix::libc::nice(20) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error().unwrap_or(0) != 0 {
            warn!("nice: {err}");
        }
    }

    let installation = Installation::open(root);
    let _lock = lock::acquire(installation.lock_path(), lock::Mode::Strong)?;
    let _runtime = runtime::init();

    let mut worker = Worker::new(installation, options);
    worker.misc_init(&mut NullMonitor);

    server::serve(&mut worker, &mut pipes)?;
    Ok(())
}

fn open_nonblocking(path: &str) -> Result<File, Error> {
    OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path)
        .map_err(Error::Open)
}

fn block_for_read(file: &File) -> Result<(), Error> {
    let mut pfd = nix::libc::pollfd {
        fd: file.as_raw_fd(),
        events: nix::libc::POLLIN,
        revents: 0,
    };

    if unsafe { nix::libc::poll(&mut pfd, 1, -1) } < 0 {
        return Err(Error::Poll(nix::errno::Errno::last()));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} is not a fifo")]
    NotAFifo(String),
    #[error("can't open pipe")]
    Open(#[source] std::io::Error),
    #[error("poll")]
    Poll(#[source] nix::errno::Errno),
    #[error("fcntl")]
    Fcntl(#[source] nix::errno::Errno),
    #[error("lock")]
    Lock(#[from] lock::Error),
    #[error("serve")]
    Serve(#[from] server::Error),
}
