// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Lock arbitration between worker instances.
//!
//! The process lock is an advisory write lock on a well-known file whose
//! content records the holder (`"<s|w> <pid>\n"`). A strong acquirer may
//! cooperatively terminate a strong holder and, as a last resort, kill it
//! and break the lock. Weak holders are never terminated and weak
//! acquirers never terminate anyone.
//!
//! Archive and list directories use simpler `flock`-style locks which can
//! be broken when the `break_locks` option is set. A visible forced break
//! beats silent corruption.

use std::{io::Read, os::fd::AsRawFd, path::Path, thread::sleep, time::Duration};

use fs_err::{self as fs, File};
use log::{info, warn};
use nix::{
    fcntl::{fcntl, flock, FcntlArg, FlockArg},
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use thiserror::Error;

use crate::environment::LOCK_RETRY_LIMIT;

/// How a worker instance holds the process lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The interactive worker
    Strong,
    /// Non-interactive refresh
    Weak,
}

impl Mode {
    fn letter(self) -> char {
        match self {
            Mode::Strong => 's',
            Mode::Weak => 'w',
        }
    }

    fn from_letter(letter: char) -> Option<Self> {
        match letter {
            's' => Some(Mode::Strong),
            'w' => Some(Mode::Weak),
            _ => None,
        }
    }
}

/// The held process lock; released when the process exits or this drops
#[derive(Debug)]
pub struct Lock {
    _file: File,
}

enum Attempt {
    Acquired(File),
    Held(Mode, i32),
}

/// Acquire the process lock at `path` in the given mode.
///
/// Retries contended acquisition up to five times, then either fails
/// (weak acquirer or weak holder) or escalates: five SIGTERMs one second
/// apart, then SIGKILL plus lock-file removal and another round.
pub fn acquire(path: impl AsRef<Path>, mode: Mode) -> Result<Lock, Error> {
    let path = path.as_ref();
    let record = format!("{} {}\n", mode.letter(), std::process::id());

    let mut lock_attempts = 0;
    let mut termination_attempts = 0;

    loop {
        match try_lock(path, &record)? {
            Attempt::Acquired(file) => return Ok(Lock { _file: file }),
            Attempt::Held(holder_mode, holder_pid) => {
                if mode == Mode::Weak || holder_mode == Mode::Weak {
                    if lock_attempts < LOCK_RETRY_LIMIT {
                        lock_attempts += 1;
                        sleep(Duration::from_secs(1));
                    } else {
                        return Err(Error::Contended(holder_pid));
                    }
                } else if termination_attempts < LOCK_RETRY_LIMIT {
                    termination_attempts += 1;
                    info!("terminating {holder_pid} to get lock");
                    let _ = kill(Pid::from_raw(holder_pid), Signal::SIGTERM);
                    sleep(Duration::from_secs(1));
                } else {
                    // The big hammer.
                    warn!("killing {holder_pid} to get lock");
                    let _ = kill(Pid::from_raw(holder_pid), Signal::SIGKILL);
                    let _ = fs::remove_file(path);
                    sleep(Duration::from_secs(1));
                }
            }
        }
    }
}

/// One acquisition attempt. On contention, returns the holder record.
fn try_lock(path: &Path, record: &str) -> Result<Attempt, Error> {
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let lock = nix::libc::flock {
        l_type: nix::libc::F_WRLCK as _,
        l_whence: nix::libc::SEEK_SET as _,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };

    match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&lock)) {
        Ok(_) => {}
        Err(nix::errno::Errno::EACCES) | Err(nix::errno::Errno::EAGAIN) => {
            let mut content = String::new();
            file.read_to_string(&mut content)?;
            return parse_holder(&content)
                .map(|(mode, pid)| Attempt::Held(mode, pid))
                .ok_or(Error::UnparsableHolder);
        }
        Err(errno) => return Err(Error::Fcntl(errno)),
    }

    file.set_len(0)?;
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(0))?;
    file.write_all(record.as_bytes())?;

    Ok(Attempt::Acquired(file))
}

fn parse_holder(content: &str) -> Option<(Mode, i32)> {
    let mut parts = content.split_whitespace();
    let mode = Mode::from_letter(parts.next()?.chars().next()?)?;
    let pid = parts.next()?.parse().ok()?;
    Some((mode, pid))
}

/// An exclusive lock over a shared directory (archives, lists)
#[derive(Debug)]
pub struct DirLock {
    _file: File,
}

/// Take the directory lock at `lock_path`, optionally breaking a stale one.
pub fn lock_directory(lock_path: impl AsRef<Path>, break_locks: bool) -> Result<DirLock, Error> {
    let lock_path = lock_path.as_ref();

    match flock_path(lock_path) {
        Ok(file) => return Ok(DirLock { _file: file }),
        Err(first) => {
            if !break_locks {
                return Err(first);
            }
        }
    }

    match fs::remove_file(lock_path) {
        Ok(_) => info!("forcing {lock_path:?}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("can't remove {lock_path:?}: {e}"),
    }

    flock_path(lock_path).map(|file| DirLock { _file: file })
}

fn flock_path(path: &Path) -> Result<File, Error> {
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(Error::Flock)?;
    Ok(file)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("lock held by pid {0} and too weak to take it")]
    Contended(i32),
    #[error("can't parse lock holder record")]
    UnparsableHolder,
    #[error("obtaining file lock")]
    Fcntl(#[source] nix::errno::Errno),
    #[error("obtaining exclusive directory lock")]
    Flock(#[source] nix::errno::Errno),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn holder_record_roundtrip() {
        assert_eq!(parse_holder("s 1234\n"), Some((Mode::Strong, 1234)));
        assert_eq!(parse_holder("w 7\n"), Some((Mode::Weak, 7)));
        assert_eq!(parse_holder("garbage"), None);
        assert_eq!(parse_holder(""), None);
    }

    #[test]
    fn acquire_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker-lock");

        let _lock = acquire(&path, Mode::Strong).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("s {}\n", std::process::id()));
    }

    #[test]
    fn directory_lock_breaks_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        // A stale lock file alone does not block; only a held flock does.
        std::fs::write(&path, b"").unwrap();
        let _lock = lock_directory(&path, true).unwrap();
    }
}
