// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Spontaneous progress reporting.
//!
//! `STATUS` frames carry `{op, already, total}` and are written with
//! `sequence = -1` at any point between a request and its reply. The
//! throttle below is part of the wire contract: a frame goes out only
//! when `already` decreased, grew by at least `min_change`, equals −1,
//! or `total` or `op` changed.

use std::io::{self, Write};

use crate::protocol::{self, Command, Encoder, StatusOp};

/// Remembers the last emitted status to implement the throttle
#[derive(Debug, Default)]
pub struct StatusTracker {
    last_op: i32,
    last_already: i32,
    last_total: i32,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a status frame when the change is worth reporting.
    ///
    /// Returns whether a frame was written.
    pub fn send(
        &mut self,
        out: &mut impl Write,
        op: StatusOp,
        already: i32,
        total: i32,
        min_change: i32,
    ) -> io::Result<bool> {
        let op = op as i32;

        if already == -1
            || already < self.last_already
            || already >= self.last_already.saturating_add(min_change)
            || total != self.last_total
            || op != self.last_op
        {
            self.last_already = already;
            self.last_total = total;
            self.last_op = op;

            let mut payload = Encoder::new();
            payload.int32(op);
            payload.int32(already);
            payload.int32(total);
            protocol::write_frame(out, Command::Status as i32, -1, payload.as_slice())?;
            return Ok(true);
        }

        Ok(false)
    }
}

/// Where long-running work reports progress and polls for cancellation.
///
/// The backend connects this to the output and cancel streams; command
/// line modes run against [`NullMonitor`].
pub trait Monitor {
    fn status(&mut self, op: StatusOp, already: i32, total: i32, min_change: i32);

    /// True once the client has written to the cancel stream
    fn cancelled(&mut self) -> bool;
}

/// A monitor that reports nothing and never cancels
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn status(&mut self, _op: StatusOp, _already: i32, _total: i32, _min_change: i32) {}

    fn cancelled(&mut self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frames(out: &[u8]) -> usize {
        // Each status frame is a 12-byte header plus a 12-byte payload.
        assert_eq!(out.len() % 24, 0);
        out.len() / 24
    }

    #[test]
    fn throttle_bounds_frame_count() {
        let mut tracker = StatusTracker::new();
        let mut out = Vec::new();

        // Strictly increasing `already`, constant op and total: the frame
        // count is bounded by ceil(span / min_change) + 1.
        for already in 0..=1000 {
            tracker
                .send(&mut out, StatusOp::Downloading, already, 5000, 100)
                .unwrap();
        }

        assert!(frames(&out) <= 1000 / 100 + 1);
        assert!(frames(&out) >= 2);
    }

    #[test]
    fn forced_conditions_always_emit() {
        let mut tracker = StatusTracker::new();
        let mut out = Vec::new();

        assert!(tracker.send(&mut out, StatusOp::General, 50, 100, 1000).unwrap());
        // Decrease forces a frame.
        assert!(tracker.send(&mut out, StatusOp::General, 10, 100, 1000).unwrap());
        // Total change forces a frame.
        assert!(tracker.send(&mut out, StatusOp::General, 10, 200, 1000).unwrap());
        // Op change forces a frame.
        assert!(tracker
            .send(&mut out, StatusOp::Downloading, 10, 200, 1000)
            .unwrap());
        // -1 always goes out.
        assert!(tracker
            .send(&mut out, StatusOp::Downloading, -1, 200, 1000)
            .unwrap());
        // A small increase does not.
        assert!(!tracker
            .send(&mut out, StatusOp::Downloading, 12, 200, 1000)
            .unwrap());
    }

    #[test]
    fn frame_carries_sequence_minus_one() {
        let mut tracker = StatusTracker::new();
        let mut out = Vec::new();
        tracker.send(&mut out, StatusOp::General, 0, 0, -1).unwrap();

        let header = crate::protocol::FrameHeader::read(&mut out.as_slice()).unwrap();
        assert_eq!(header.command, Command::Status as i32);
        assert_eq!(header.sequence, -1);
        assert_eq!(header.length, 12);
    }
}
