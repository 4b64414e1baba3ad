// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The two-phase lists refresh.
//!
//! Repository index downloads go into a hard-linked mirror of the lists
//! directory; only a fully run fetch is committed by renaming the mirror
//! into place. An interrupted refresh therefore never leaves `Packages`
//! files inconsistent with their release metadata. Per-item failures are
//! attributed to their catalogues and reported, but do not stop the
//! transaction.

use std::{fs, io, path::Path};

use log::{info, warn};
use thiserror::Error;
use xexp::Xexp;

use crate::{
    catalogue,
    environment::STATUS_MIN_CHANGE_DOWNLOAD,
    fetch::{Fetcher, Item, Outcome, Pulse},
    installation::Installation,
    lock,
    protocol::{ResultCode, StatusOp},
    source::{uri_to_filename, SourceList},
    status::Monitor,
};

/// Refresh the lists directory from `sources` (the user catalogues plus
/// any temporary ones).
///
/// Fetch errors are attached to `catalogues` as `{errors {error {uri,
/// msg}}}` sub-trees; items from sources outside the tree stay
/// unattributed. The result is `Success` when everything completed,
/// `PartialSuccess` when the transaction committed with item failures,
/// and `Failure` when nothing could be committed.
pub fn update_package_lists(
    installation: &Installation,
    catalogues: &mut Xexp,
    sources: &SourceList,
    break_locks: bool,
    monitor: &mut dyn Monitor,
) -> ResultCode {
    let lists = installation.lists_dir();
    let lists_new = lists.with_extension("new");
    let lists_old = lists.with_extension("old");

    let _lock = match lock::lock_directory(lists.with_extension("lock"), break_locks) {
        Ok(lock) => lock,
        Err(e) => {
            warn!("unable to lock the lists directory: {e}");
            return ResultCode::Failure;
        }
    };

    // Stage: a hard-link mirror of the current lists.
    let _ = remove_tree(&lists_new);
    if let Err(e) = duplink_tree(&lists, &lists_new) {
        warn!("can't stage lists transaction: {e}");
        let _ = remove_tree(&lists_new);
        return ResultCode::Failure;
    }

    let result = match download_lists(sources, &lists_new, monitor) {
        Ok(fetcher) => {
            let mut some_failed = false;
            let mut all_failed = !fetcher.items.is_empty();

            for item in &fetcher.items {
                match item.status {
                    crate::fetch::ItemStatus::Failed => some_failed = true,
                    _ => all_failed = false,
                }
            }

            if all_failed {
                None
            } else {
                for item in fetcher.failed_items() {
                    let message = item.error.as_deref().unwrap_or("failed");
                    info!("failed to fetch {}: {message}", item.uri);
                    catalogue::attach_error(catalogues, &item.uri, message);
                }
                Some(if some_failed {
                    ResultCode::PartialSuccess
                } else {
                    ResultCode::Success
                })
            }
        }
        Err(e) => {
            warn!("lists refresh failed: {e}");
            None
        }
    };

    match result {
        Some(code) => {
            // Commit: double rename through the old directory.
            let commit = || -> io::Result<()> {
                let _ = remove_tree(&lists_old);
                fs::rename(&lists, &lists_old)?;
                fs::rename(&lists_new, &lists)?;
                remove_tree(&lists_old)
            };
            if let Err(e) = commit() {
                warn!("can't commit lists transaction: {e}");
                let _ = remove_tree(&lists_new);
                return ResultCode::Failure;
            }
            code
        }
        None => {
            let _ = remove_tree(&lists_new);
            ResultCode::Failure
        }
    }
}

/// Fetch every index file of every source into the staged directory
fn download_lists(
    sources: &SourceList,
    lists_dir: &Path,
    monitor: &mut dyn Monitor,
) -> Result<Fetcher, Error> {
    let mut fetcher = Fetcher::new();

    for source in &sources.sources {
        let release = source.release_uri();
        fetcher.add(Item::new(
            &release,
            lists_dir.join(uri_to_filename(&release)),
            None,
        ));

        for (_, uri) in source.packages_uris() {
            fetcher.add(Item::new(&uri, lists_dir.join(uri_to_filename(&uri)), None));
        }
    }

    // Refreshing replaces files wholesale; stale partials would resume
    // against new content.
    let _ = remove_tree(&lists_dir.join("partial"));

    let mut pulse = |already: u64, total: u64| {
        monitor.status(
            StatusOp::Downloading,
            already as i32,
            total as i32,
            STATUS_MIN_CHANGE_DOWNLOAD,
        );
        if monitor.cancelled() {
            Pulse::Abort
        } else {
            Pulse::Continue
        }
    };

    match fetcher.run(&mut pulse) {
        Outcome::Aborted => Err(Error::Cancelled),
        _ => Ok(fetcher),
    }
}

/// Mirror `old` into `new`, hard-linking every regular file
fn duplink_tree(old: &Path, new: &Path) -> io::Result<()> {
    fs::create_dir_all(new)?;
    for entry in fs::read_dir(old)? {
        let entry = entry?;
        let target = new.join(entry.file_name());
        let kind = entry.file_type()?;
        if kind.is_dir() {
            duplink_tree(&entry.path(), &target)?;
        } else if kind.is_file() {
            fs::hard_link(entry.path(), target)?;
        }
    }
    Ok(())
}

fn remove_tree(tree: &Path) -> io::Result<()> {
    match fs::remove_dir_all(tree) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cancelled")]
    Cancelled,
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut map = BTreeMap::new();
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_file() {
                map.insert(
                    entry.file_name().to_string_lossy().into_owned(),
                    fs::read(entry.path()).unwrap(),
                );
            }
        }
        map
    }

    #[test]
    fn duplink_mirrors_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("lists");
        fs::create_dir_all(old.join("partial")).unwrap();
        fs::write(old.join("a_Packages"), b"alpha").unwrap();
        fs::write(old.join("partial/b"), b"partial").unwrap();

        let new = dir.path().join("lists.new");
        duplink_tree(&old, &new).unwrap();

        assert_eq!(fs::read(new.join("a_Packages")).unwrap(), b"alpha");
        assert_eq!(fs::read(new.join("partial/b")).unwrap(), b"partial");
    }

    #[test]
    fn failed_transaction_preserves_lists_dir() {
        // An unreachable source makes every item fail, which must roll
        // the transaction back without touching the lists directory.
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());
        fs::write(installation.lists_dir().join("a_Packages"), b"alpha").unwrap();

        let before = snapshot(&installation.lists_dir());

        let mut catalogues = Xexp::list("catalogues");
        let mut cat = Xexp::list("catalogue");
        cat.append(Xexp::text("uri", "http://127.0.0.1:1/nothing"));
        cat.append(Xexp::text("dist", "stable"));
        cat.append(Xexp::text("components", "main"));
        catalogues.append(cat);

        // Leak the guard: parallel tests must not tear the runtime down
        // under each other.
        std::mem::forget(crate::runtime::init());
        let sources = SourceList::from_catalogues(&catalogues);
        let code = update_package_lists(
            &installation,
            &mut catalogues,
            &sources,
            false,
            &mut crate::status::NullMonitor,
        );

        assert_eq!(code, ResultCode::Failure);
        assert_eq!(snapshot(&installation.lists_dir()), before);
        assert!(!installation.lists_dir().with_extension("new").exists());
    }
}
