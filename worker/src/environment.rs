// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

/// Requests up to this size are decoded from a stack buffer
pub const FIXED_REQUEST_BUF_SIZE: usize = 4096;

/// Debian architecture served by this worker
pub const HOST_ARCH: &str = "armel";

/// Distribution assumed for catalogues that do not name one
pub const DEFAULT_DISTRIBUTION: &str = "stable";

/// Sections carrying user-visible applications
pub const USER_SECTION_PREFIX: &str = "user/";
/// Historic alias for [`USER_SECTION_PREFIX`], still found in the wild
pub const OLD_USER_SECTION_PREFIX: &str = "maemo/";

/// Lock acquisition retries before giving up (or escalating)
pub const LOCK_RETRY_LIMIT: u32 = 5;

/// Progress granularity for cache rebuilds, percent
pub const STATUS_MIN_CHANGE_GENERAL: i32 = 5;
/// Progress granularity for downloads, bytes
pub const STATUS_MIN_CHANGE_DOWNLOAD: i32 = 1000;

/// Default mountpoint of the internal memory card
pub const INTERNAL_MMC_MOUNTPOINT: &str = "/home/user/MyDocs";
/// Default mountpoint of the removable memory card
pub const REMOVABLE_MMC_MOUNTPOINT: &str = "/media/mmc1";
/// The home partition, third fallback for downloads
pub const HOME_MOUNTPOINT: &str = "/home";

/// Environment variable carrying the package name to maintainer scripts
pub const PKGNAME_ENVVAR: &str = "APPMAN_PKG_NAME";

/// Free space a tmpfs must offer before docs are diverted onto it
pub const DOCS_TMPFS_THRESHOLD: i64 = 30 * 1024 * 1024;

/// The magic package name standing for "every upgradeable system package"
pub const MAGIC_SYS: &str = "magic:sys";

/// Recursion limit for the install marker
pub const INSTALL_RECURSION_LIMIT: u32 = 100;

pub fn internal_mmc_mountpoint() -> String {
    std::env::var("INTERNAL_MMC_MOUNTPOINT").unwrap_or_else(|_| INTERNAL_MMC_MOUNTPOINT.into())
}

pub fn removable_mmc_mountpoint() -> String {
    std::env::var("REMOVABLE_MMC_MOUNTPOINT").unwrap_or_else(|_| REMOVABLE_MMC_MOUNTPOINT.into())
}
