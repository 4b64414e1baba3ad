// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The rescue boot path.
//!
//! When an install was journalled but never finished, the next boot runs
//! this entry point instead of the UI. It replays the recorded install
//! from the recorded download root, then from a list of removable
//! devices, then from raw device numbers. On success the device reboots
//! into the finished system; the outcome lands in a result file the
//! post-boot notification reads.

use std::{path::Path, process::Command};

use log::{info, warn};
use nix::{
    mount::{mount, umount, MsFlags},
    sys::stat::{mknod, Mode, SFlag},
};
use xexp::Xexp;

use crate::{
    environment::DOCS_TMPFS_THRESHOLD,
    installation::Installation,
    journal,
    operation::{self, get_free_space, Params},
    options::Options,
    planner,
    protocol::{Encoder, ResultCode},
    status::NullMonitor,
    worker::Worker,
};

/// Directories diverted off the rootfs while a system update runs
const DOCS_DIRS: [&str; 4] = ["doc", "info", "man", "doc-base"];

/// Removable devices tried in order when the recorded root fails
const RESCUE_DEVS: [&str; 6] = [
    "/dev/mmcblk0p1",
    "/dev/mmcblk1p1",
    "/dev/mmcblk0p2",
    "/dev/mmcblk0p3",
    "/dev/mmcblk0",
    "/dev/mmcblk1",
];

/// Raw device numbers tried last
const RESCUE_DEVNODES: [(u64, u64); 4] = [(254, 9), (254, 1), (254, 8), (254, 0)];

/// Replay the journalled operation, or the explicitly named one.
pub fn run(installation: &Installation, package: Option<&str>, download_root: Option<&str>) -> i32 {
    match package {
        Some(package) => {
            do_rescue(installation, package, download_root, false);
        }
        None => match journal::read(installation) {
            Some(record) => {
                do_rescue(
                    installation,
                    &record.package,
                    record.download_root.as_deref(),
                    true,
                );
            }
            None => {
                info!("nothing to rescue");
            }
        },
    }

    0
}

fn do_rescue(
    installation: &Installation,
    package: &str,
    download_root: Option<&str>,
    erase_record: bool,
) {
    let mut result = ResultCode::Failure;

    info!("installing {package}");

    // Clean any dpkg journal first; the rest of the configuration runs
    // through the normal install path for better progress reporting.
    run_system("dpkg --configure dpkg");

    let tmpfs = choose_tmpfs_for_docs();
    fs_setup(tmpfs.as_deref());

    let mut worker = Worker::new(installation.clone(), Options::default());
    worker.misc_init(&mut NullMonitor);

    if worker.ensure_cache(&mut NullMonitor) {
        let marked = match worker.cache.as_mut() {
            Some(cache) => planner::mark_named_for_install(cache, &Options::default(), package),
            None => false,
        };

        if marked {
            result = rescue_from_all_sources(&mut worker, download_root);

            // If we get this far we have done everything we can. An
            // interruption before this point retries on the next boot.
            if erase_record {
                journal::erase(installation);
            }

            if result == ResultCode::PackagesNotFound {
                fs_teardown(tmpfs.as_deref());
            } else {
                if result != ResultCode::Success {
                    run_system("dpkg --configure -a --force-all");
                }
                fs_teardown(tmpfs.as_deref());
                reboot_device();
            }
        } else {
            warn!("package {package} not found");
        }
    } else {
        warn!("failed to initialize package cache");
    }

    let result_file = Xexp::text(
        "success",
        if result == ResultCode::Success { "1" } else { "0" },
    );
    if let Err(e) = xexp::write_file(installation.rescue_result_path(), &result_file) {
        warn!("can't write rescue result: {e}");
    }
}

fn rescue_from_all_sources(worker: &mut Worker, download_root: Option<&str>) -> ResultCode {
    let mut result = rescue_with_dir(worker, download_root.map(Path::new));

    if result != ResultCode::Success {
        result = ResultCode::PackagesNotFound;
        for dev in RESCUE_DEVS {
            result = rescue_with_dev(worker, dev);
            if result != ResultCode::PackagesNotFound {
                break;
            }
        }
    }

    if result == ResultCode::PackagesNotFound {
        for (major, minor) in RESCUE_DEVNODES {
            result = rescue_with_devnode(worker, major, minor);
            if result != ResultCode::PackagesNotFound {
                break;
            }
        }
    }

    result
}

fn rescue_with_dir(worker: &mut Worker, dir: Option<&Path>) -> ResultCode {
    info!("installing from {dir:?}");
    let mut scratch = Encoder::new();
    let result = operation::operation(
        worker,
        &mut scratch,
        &mut NullMonitor,
        &Params::offline_install(dir.map(Path::to_path_buf)),
    );
    info!("result code {result}");
    result
}

fn rescue_with_dev(worker: &mut Worker, dev: &str) -> ResultCode {
    let dir = Path::new("/rescue");

    info!("installing from {dev}");

    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("{dir:?}: {e}");
    }

    run_system(&format!("mount -t vfat '{dev}' '{}'", dir.display()));
    let result = rescue_with_dir(worker, Some(dir));
    run_system(&format!("umount '{}'", dir.display()));

    if let Err(e) = std::fs::remove_dir(dir) {
        warn!("{dir:?}: {e}");
    }

    result
}

fn rescue_with_devnode(worker: &mut Worker, major: u64, minor: u64) -> ResultCode {
    let node = Path::new("/dev.rescue");

    if let Err(e) = mknod(
        node,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o600),
        nix::sys::stat::makedev(major, minor),
    ) {
        warn!("{node:?}: {e}");
    }

    info!("installing from {major}:{minor}");

    let result = rescue_with_dev(worker, &node.display().to_string());

    let _ = std::fs::remove_file(node);

    result
}

/// First tmpfs-ish location with enough room for the diverted docs
pub(crate) fn choose_tmpfs_for_docs() -> Option<String> {
    for candidate in ["/dev/shm", "/home"] {
        if path_is_writable(Path::new(candidate))
            && get_free_space(Path::new(candidate)) >= DOCS_TMPFS_THRESHOLD
        {
            return Some(candidate.to_owned());
        }
    }
    None
}

/// Probe with an actual write; mount flags lie about read-only media
pub fn path_is_writable(path: &Path) -> bool {
    let probe = path.join(format!(".appman-probe-{}", std::process::id()));
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Divert the documentation trees onto the tmpfs so the flash cannot
/// exhaust the rootfs, and recompress the rootfs while it runs.
fn fs_setup(tmpfs: Option<&str>) {
    if run_system("mount /home") == 0 {
        // /opt is not a symlink anymore; bind it from /home.
        let _ = mount(
            Some("/home/opt"),
            "/opt",
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        );
    }

    rootfs_set_compression(true);
    bindmount_docs(tmpfs);
}

fn fs_teardown(tmpfs: Option<&str>) {
    let _ = umount("/opt");
    run_system("umount /home");

    bindumount_docs(tmpfs);
    rootfs_set_compression(false);
}

pub(crate) fn bindmount_docs(tmpfs: Option<&str>) {
    let Some(tmpfs) = tmpfs else { return };

    let rootdir = Path::new(tmpfs).join(".doc");
    if let Err(e) = std::fs::create_dir_all(&rootdir) {
        warn!("{rootdir:?}: {e}");
        return;
    }

    for name in DOCS_DIRS {
        let dir = rootdir.join(name);
        if std::fs::create_dir_all(&dir).is_ok() {
            let target = format!("/usr/share/{name}");
            if let Err(e) = mount(
                Some(&dir),
                target.as_str(),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            ) {
                warn!("bind {dir:?} -> {target}: {e}");
            }
        }
    }
}

pub(crate) fn bindumount_docs(tmpfs: Option<&str>) {
    let Some(tmpfs) = tmpfs else { return };

    for name in DOCS_DIRS {
        let _ = umount(format!("/usr/share/{name}").as_str());
    }

    let _ = std::fs::remove_dir_all(Path::new(tmpfs).join(".doc"));
}

pub(crate) fn rootfs_set_compression(high: bool) {
    let level = if high { "lzo999" } else { "lzo" };
    run_system(&format!("mount -o remount,compr={level} /"));
}

pub fn reboot_device() {
    if run_system("/usr/sbin/dsmetool -b") == 0 {
        return;
    }
    run_system("/sbin/reboot");
}

fn run_system(command: &str) -> i32 {
    info!("+ {command}");
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .map(|status| status.code().unwrap_or(-1))
        .unwrap_or(-1)
}
