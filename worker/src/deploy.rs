// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Running the package manager.
//!
//! The executor hands over an ordered plan; dpkg does the real work in
//! three passes (unpack, remove, configure-pending). Progress lines
//! arrive on a dedicated status pipe (`pmstatus:<pkg>:<pct>:<text>`),
//! are parsed by a reader thread and re-emitted as general status
//! frames. Cancellation is deliberately ignored here: interrupting dpkg
//! is worse than finishing.

use std::{
    io::{BufRead, BufReader},
    os::fd::{AsRawFd, FromRawFd},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc,
};

use log::{info, warn};
use thiserror::Error;

use crate::{
    installation::Installation,
    protocol::StatusOp,
    status::Monitor,
};

/// What dpkg has to do
#[derive(Debug, Default)]
pub struct Plan {
    /// Archives to unpack and configure
    pub unpack: Vec<PathBuf>,
    /// Package names to remove
    pub remove: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.unpack.is_empty() && self.remove.is_empty()
    }
}

/// Run the plan to completion
pub fn run(plan: &Plan, installation: &Installation, monitor: &mut dyn Monitor) -> Result<(), Error> {
    if !plan.unpack.is_empty() {
        let mut args = base_args(installation);
        args.push("--auto-deconfigure".into());
        args.push("--unpack".into());
        args.extend(plan.unpack.iter().map(|p| p.display().to_string()));
        run_dpkg(args, monitor)?;
    }

    if !plan.remove.is_empty() {
        let mut args = base_args(installation);
        args.push("--remove".into());
        args.extend(plan.remove.iter().cloned());
        run_dpkg(args, monitor)?;
    }

    let mut args = base_args(installation);
    args.push("--configure".into());
    args.push("--pending".into());
    run_dpkg(args, monitor)
}

/// Install a standalone package file, removing it again on failure
pub fn install_file(installation: &Installation, path: &Path) -> Result<(), Error> {
    let mut args = base_args(installation);
    args.push("-i".into());
    args.push(path.display().to_string());

    if let Err(e) = run_dpkg(args, &mut crate::status::NullMonitor) {
        warn!("installing {path:?} failed, removing the remains");

        if let Some(name) = deb_field(path, "Package") {
            let mut args = base_args(installation);
            args.push("--remove".into());
            args.push(name);
            let _ = run_dpkg(args, &mut crate::status::NullMonitor);
        }

        return Err(e);
    }

    Ok(())
}

/// Read one control field out of a `.deb` on disk
pub fn deb_field(path: &Path, field: &str) -> Option<String> {
    deb_control(path)?
        .get(field)
        .map(str::to_owned)
}

/// The whole control stanza of a `.deb` on disk
pub fn deb_control(path: &Path) -> Option<crate::db::control::Stanza> {
    let output = Command::new("dpkg-deb")
        .arg("-f")
        .arg(path)
        .stderr(Stdio::inherit())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    crate::db::control::parse_one(&String::from_utf8_lossy(&output.stdout))
}

/// Clean a dpkg journal left over from an interrupted run; the cache
/// cannot be built over one.
pub fn clear_dpkg_journal(installation: &Installation) {
    let updates = installation.dpkg_updates_dir();
    let Ok(entries) = std::fs::read_dir(&updates) else {
        return;
    };

    let journalled = entries
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            !name.is_empty() && name.chars().all(|c| c.is_ascii_digit())
        });

    if journalled {
        info!("running 'dpkg --configure dpkg' to clean up the journal");
        let mut args = base_args(installation);
        args.push("--configure".into());
        args.push("dpkg".into());
        let _ = run_dpkg(args, &mut crate::status::NullMonitor);
    }
}

fn base_args(installation: &Installation) -> Vec<String> {
    let mut args = vec!["--force-confold".to_owned()];
    if installation.root != Path::new("/") {
        args.push(format!("--root={}", installation.root.display()));
        args.push("--force-not-root".to_owned());
    }
    args
}

fn run_dpkg(args: Vec<String>, monitor: &mut dyn Monitor) -> Result<(), Error> {
    let (status_read, status_write) = nix::unistd::pipe().map_err(Error::Pipe)?;

    let mut command = Command::new("dpkg");
    command.arg(format!("--status-fd={}", status_write.as_raw_fd()));
    command.args(&args);

    info!("dpkg {}", args.join(" "));

    let mut child = command.spawn().map_err(Error::Spawn)?;
    drop(status_write);

    let (tx, rx) = mpsc::channel::<f32>();

    std::thread::scope(|scope| {
        scope.spawn(move || {
            let reader = BufReader::new(unsafe { std::fs::File::from_raw_fd(status_read) });
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if let Some(percent) = parse_pmstatus(&line) {
                    if tx.send(percent).is_err() {
                        break;
                    }
                }
            }
        });

        while let Ok(percent) = rx.recv() {
            monitor.status(StatusOp::General, percent as i32, 100, 1);
        }
    });

    let status = child.wait().map_err(Error::Spawn)?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Dpkg(status.code().unwrap_or(-1)))
    }
}

/// `pmstatus:<package>:<percent>:<text>`
fn parse_pmstatus(line: &str) -> Option<f32> {
    let rest = line.strip_prefix("pmstatus:")?;
    let mut parts = rest.splitn(3, ':');
    let _package = parts.next()?;
    parts.next()?.trim().parse().ok()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("can't create status pipe")]
    Pipe(#[source] nix::errno::Errno),
    #[error("can't run dpkg")]
    Spawn(#[source] std::io::Error),
    #[error("dpkg failed with status {0}")]
    Dpkg(i32),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pmstatus_parsing() {
        assert_eq!(parse_pmstatus("pmstatus:dpkg:50.0:Unpacking dpkg"), Some(50.0));
        assert_eq!(parse_pmstatus("pmstatus:x:12.5:"), Some(12.5));
        assert_eq!(parse_pmstatus("status: something else"), None);
        assert_eq!(parse_pmstatus("pmstatus:broken"), None);
    }

    #[test]
    fn plan_emptiness() {
        let mut plan = Plan::default();
        assert!(plan.is_empty());
        plan.remove.push("x".into());
        assert!(!plan.is_empty());
    }
}
