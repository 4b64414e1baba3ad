// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The framed request/response protocol spoken over the fifos.
//!
//! Each frame is a fixed `{command, sequence, length}` header followed by
//! `length` payload bytes. Payload primitives are native-endian and keep
//! the cursor aligned to four bytes; see [`codec`].

use std::io::{self, Read, Write};

use bitflags::bitflags;
use strum::FromRepr;

use crate::environment::FIXED_REQUEST_BUF_SIZE;

pub mod codec;

pub use self::codec::{Decoder, Encoder};

/// Commands the dispatcher understands.
///
/// `Status` never appears in a request; the worker emits it spontaneously
/// with `sequence = -1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, strum::Display)]
#[repr(i32)]
pub enum Command {
    Noop,
    Status,
    GetPackageList,
    GetPackageInfo,
    GetPackageDetails,
    CheckUpdates,
    GetCatalogues,
    SetCatalogues,
    AddTempCatalogues,
    RmTempCatalogues,
    GetFreeSpace,
    InstallCheck,
    DownloadPackage,
    InstallPackage,
    RemoveCheck,
    RemovePackage,
    Clean,
    GetFileDetails,
    InstallFile,
    SaveBackupData,
    GetSystemUpdatePackages,
    Reboot,
    SetOptions,
    SetEnv,
    ThirdPartyPolicyCheck,
    Autoremove,
    Exit,
}

/// Result of an operation, carried in reply payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, strum::Display)]
#[repr(i32)]
pub enum ResultCode {
    Success,
    Failure,
    PartialSuccess,
    PackagesNotFound,
    PackageCorrupted,
    OutOfSpace,
    DownloadFailed,
}

impl ResultCode {
    /// Fold one per-item result into a running combination: success yields
    /// to anything, equal codes keep, disagreement becomes failure.
    pub fn combine(self, one: ResultCode) -> ResultCode {
        if self == ResultCode::Success {
            one
        } else if self == one {
            self
        } else {
            ResultCode::Failure
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::PartialSuccess)
    }
}

/// Operation tag in a status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(i32)]
pub enum StatusOp {
    Downloading,
    General,
}

/// Trust summary entry codes in `INSTALL_CHECK` replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TrustCode {
    End = 0,
    NotCertified = 1,
    DomainsViolated = 2,
}

/// Installability / removability verdicts in `GET_PACKAGE_INFO` replies.
///
/// Ordered so that combining two verdicts takes the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Status {
    Unknown = 0,
    Able = 1,
    Unable = 2,
    Missing = 3,
    Conflicting = 4,
    Needed = 5,
    SystemUpdateUnremovable = 6,
}

/// Summary entry codes in `GET_PACKAGE_DETAILS` replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SumType {
    End = 0,
    Installing = 1,
    Upgrading = 2,
    Removing = 3,
    Missing = 4,
    Conflicting = 5,
    NeededBy = 6,
}

bitflags! {
    /// Per-package behavior flags declared in the control record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PackageFlags: i32 {
        const CLOSE_APPS = 1 << 0;
        const SUGGEST_BACKUP = 1 << 1;
        const REBOOT = 1 << 2;
        const SYSTEM_UPDATE = 1 << 3;
        const FLASH_AND_REBOOT = 1 << 4;
    }
}

impl PackageFlags {
    /// Parse a comma-separated flag declaration
    pub fn parse(declaration: &str) -> Self {
        let mut flags = Self::empty();
        for token in declaration.split(',') {
            flags |= match token.trim() {
                "close-apps" => Self::CLOSE_APPS,
                "suggest-backup" => Self::SUGGEST_BACKUP,
                "reboot" => Self::REBOOT,
                "system-update" => Self::SYSTEM_UPDATE,
                "flash-and-reboot" => Self::FLASH_AND_REBOOT,
                _ => Self::empty(),
            };
        }
        flags
    }
}

/// The fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: i32,
    pub sequence: i32,
    pub length: i32,
}

impl FrameHeader {
    pub const SIZE: usize = 12;

    pub fn read(input: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        input.read_exact(&mut buf)?;
        Ok(Self {
            command: i32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            sequence: i32::from_ne_bytes(buf[4..8].try_into().unwrap()),
            length: i32::from_ne_bytes(buf[8..12].try_into().unwrap()),
        })
    }

    pub fn write(&self, out: &mut impl Write) -> io::Result<()> {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.command.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.sequence.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.length.to_ne_bytes());
        out.write_all(&buf)
    }
}

/// Write one complete frame
pub fn write_frame(
    out: &mut impl Write,
    command: i32,
    sequence: i32,
    payload: &[u8],
) -> io::Result<()> {
    FrameHeader {
        command,
        sequence,
        length: payload.len() as i32,
    }
    .write(out)?;
    out.write_all(payload)?;
    out.flush()
}

/// Request payload storage: requests up to 4 KiB stay on the stack.
pub struct PayloadBuf {
    fixed: [u8; FIXED_REQUEST_BUF_SIZE],
    heap: Vec<u8>,
    len: usize,
}

impl PayloadBuf {
    pub fn new() -> Self {
        Self {
            fixed: [0; FIXED_REQUEST_BUF_SIZE],
            heap: Vec::new(),
            len: 0,
        }
    }

    /// Fill the buffer with exactly `len` bytes from `input`
    pub fn fill(&mut self, input: &mut impl Read, len: usize) -> io::Result<()> {
        self.len = len;
        if len <= FIXED_REQUEST_BUF_SIZE {
            input.read_exact(&mut self.fixed[..len])
        } else {
            self.heap.resize(len, 0);
            input.read_exact(&mut self.heap[..len])
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len <= FIXED_REQUEST_BUF_SIZE {
            &self.fixed[..self.len]
        } else {
            &self.heap[..self.len]
        }
    }
}

impl Default for PayloadBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_roundtrip() {
        assert_eq!(Command::from_repr(0), Some(Command::Noop));
        assert_eq!(Command::from_repr(26), Some(Command::Exit));
        assert_eq!(Command::from_repr(27), None);
    }

    #[test]
    fn combine_rescodes() {
        use ResultCode::*;
        assert_eq!(Success.combine(PackagesNotFound), PackagesNotFound);
        assert_eq!(PackagesNotFound.combine(PackagesNotFound), PackagesNotFound);
        assert_eq!(PackagesNotFound.combine(OutOfSpace), Failure);
        assert_eq!(Failure.combine(Success), Failure);
    }

    #[test]
    fn flags_parse() {
        let flags = PackageFlags::parse("reboot, system-update");
        assert!(flags.contains(PackageFlags::REBOOT));
        assert!(flags.contains(PackageFlags::SYSTEM_UPDATE));
        assert!(!flags.contains(PackageFlags::CLOSE_APPS));
    }

    #[test]
    fn frame_header_roundtrip() {
        let header = FrameHeader {
            command: 5,
            sequence: 42,
            length: 16,
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), FrameHeader::SIZE);
        let parsed = FrameHeader::read(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn payload_buf_small_and_large() {
        let small = vec![7u8; 16];
        let mut buf = PayloadBuf::new();
        buf.fill(&mut small.as_slice(), 16).unwrap();
        assert_eq!(buf.as_slice(), &small[..]);

        let large = vec![9u8; FIXED_REQUEST_BUF_SIZE + 1];
        buf.fill(&mut large.as_slice(), large.len()).unwrap();
        assert_eq!(buf.as_slice(), &large[..]);
    }
}
