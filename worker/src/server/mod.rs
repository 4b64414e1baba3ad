// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The single-threaded request/response loop.
//!
//! One frame in, one frame out; `STATUS` frames may be interleaved
//! before the reply. Stale cancel bytes are drained before each command,
//! the domain configuration is reloaded when its file changed, and a
//! handler may schedule a cache rebuild that runs after the reply so the
//! client perceives it as background work.

use std::{
    fs::File,
    io::{self, Read},
};

use log::{info, warn};
use thiserror::Error;

use crate::{
    protocol::{self, Command, Decoder, Encoder, FrameHeader, PayloadBuf, StatusOp},
    status::{Monitor, StatusTracker},
    worker::Worker,
};

mod handlers;

pub use self::handlers::check_updates;

/// The four streams connecting the worker to its client
pub struct Pipes {
    /// Requests; blocking
    pub input: File,
    /// Replies and spontaneous status frames; blocking
    pub output: File,
    /// Reserved for raw package-manager chatter; held open so the client
    /// sees a clean EOF on exit
    pub status: File,
    /// Any byte here aborts the running download; non-blocking
    pub cancel: File,
}

/// Whether the loop keeps serving after a command
enum Flow {
    Continue,
    Exit,
}

/// Serve one client until its input closes.
pub fn serve(worker: &mut Worker, pipes: &mut Pipes) -> Result<(), Error> {
    let mut tracker = StatusTracker::new();
    let mut payload = PayloadBuf::new();

    loop {
        let header = match FrameHeader::read(&mut pipes.input) {
            Ok(header) => header,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("client disconnected");
                return Ok(());
            }
            Err(e) => return Err(Error::Read(e)),
        };

        payload
            .fill(&mut pipes.input, header.length.max(0) as usize)
            .map_err(Error::Read)?;

        // A cancel sent for an earlier command must not abort this one.
        drain(&mut pipes.cancel);

        worker
            .domains
            .reload_if_modified(worker.installation.domains_conf_path());
        worker.init_cache_after_request = false;

        let mut request = Decoder::new(payload.as_slice());
        let mut response = Encoder::new();

        let flow = {
            let mut monitor = PipeMonitor {
                output: &mut pipes.output,
                cancel: &mut pipes.cancel,
                tracker: &mut tracker,
            };

            match Command::from_repr(header.command) {
                Some(Command::Status) | None => {
                    warn!("unrecognized request: {}", header.command);
                    Flow::Continue
                }
                Some(command) => {
                    handlers::dispatch(worker, command, &mut request, &mut response, &mut monitor)
                }
            }
        };

        if matches!(flow, Flow::Exit) {
            return Ok(());
        }

        protocol::write_frame(
            &mut pipes.output,
            header.command,
            header.sequence,
            response.as_slice(),
        )
        .map_err(Error::Write)?;

        if worker.init_cache_after_request {
            // Rebuilt after the reply; the client sees it as background
            // work, though status frames still flow.
            let mut monitor = PipeMonitor {
                output: &mut pipes.output,
                cancel: &mut pipes.cancel,
                tracker: &mut tracker,
            };
            worker.cache_init(&mut monitor);
        }
    }
}

/// Send the hello frame telling the client the pipes are open.
pub fn send_hello(pipes: &mut Pipes) -> io::Result<()> {
    StatusTracker::new()
        .send(&mut pipes.output, StatusOp::General, 0, 0, -1)
        .map(|_| ())
}

/// Reads all bytes currently available from a non-blocking stream
fn drain(cancel: &mut File) {
    let mut buf = [0u8; 64];
    while matches!(cancel.read(&mut buf), Ok(n) if n > 0) {}
}

/// Reports progress as status frames and polls the cancel stream
struct PipeMonitor<'a> {
    output: &'a mut File,
    cancel: &'a mut File,
    tracker: &'a mut StatusTracker,
}

impl Monitor for PipeMonitor<'_> {
    fn status(&mut self, op: StatusOp, already: i32, total: i32, min_change: i32) {
        if let Err(e) = self
            .tracker
            .send(self.output, op, already, total, min_change)
        {
            warn!("can't send status: {e}");
        }
    }

    fn cancelled(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.cancel.read(&mut byte), Ok(1))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("reading request")]
    Read(#[source] io::Error),
    #[error("writing reply")]
    Write(#[source] io::Error),
}
