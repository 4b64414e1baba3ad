// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::trace;

/// Maps every well-known path of the worker onto a filesystem root.
///
/// The root is `/` in production; tests point it at a scratch directory.
#[derive(Debug, Clone)]
pub struct Installation {
    pub root: PathBuf,
}

impl Installation {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        trace!("root dir: {root:?}");

        let this = Self { root };
        this.ensure_dirs_exist();
        this
    }

    /// Worker state: lock, journal, extra info, catalogue bookkeeping
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("var/lib/appman")
    }

    pub fn state_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.state_dir().join(path)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_path("worker-lock")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state_path("current-operation")
    }

    pub fn rescue_result_path(&self) -> PathBuf {
        self.state_path("rescue-result")
    }

    pub fn failed_catalogues_path(&self) -> PathBuf {
        self.state_path("failed-catalogues")
    }

    pub fn temp_catalogues_path(&self) -> PathBuf {
        self.state_path("catalogues.temp")
    }

    pub fn catalogues_path(&self) -> PathBuf {
        self.state_path("catalogues")
    }

    pub fn backup_catalogues_path(&self) -> PathBuf {
        self.state_path("catalogues.backup")
    }

    pub fn backup_packages_path(&self) -> PathBuf {
        self.state_path("packages.backup")
    }

    pub fn autoinst_path(&self) -> PathBuf {
        self.state_path("autoinst")
    }

    pub fn domain_file_path(&self, domain: &str) -> PathBuf {
        self.state_path(format!("domain.{domain}"))
    }

    pub fn available_updates_path(&self) -> PathBuf {
        self.state_path("available-updates")
    }

    /// Domain declarations, reloaded on mtime change
    pub fn domains_conf_path(&self) -> PathBuf {
        self.root.join("etc/appman/domains")
    }

    /// The sources list generated from the user catalogues
    pub fn sources_list_path(&self) -> PathBuf {
        self.root.join("etc/apt/sources.list.d/appman.list")
    }

    /// The sources list generated from temporary catalogues
    pub fn temp_sources_list_path(&self) -> PathBuf {
        self.root.join("etc/apt/sources.list.d/appman-temp.list")
    }

    pub fn sources_parts_dir(&self) -> PathBuf {
        self.root.join("etc/apt/sources.list.d")
    }

    pub fn main_sources_path(&self) -> PathBuf {
        self.root.join("etc/apt/sources.list")
    }

    /// The dpkg database, shared with other package tooling
    pub fn dpkg_admin_dir(&self) -> PathBuf {
        self.root.join("var/lib/dpkg")
    }

    pub fn status_path(&self) -> PathBuf {
        self.dpkg_admin_dir().join("status")
    }

    pub fn dpkg_updates_dir(&self) -> PathBuf {
        self.dpkg_admin_dir().join("updates")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("var/cache/appman")
    }

    /// Downloaded repository index files
    pub fn lists_dir(&self) -> PathBuf {
        self.cache_dir().join("lists")
    }

    /// Downloaded package archives (default location)
    pub fn archives_dir(&self) -> PathBuf {
        self.cache_dir().join("archives")
    }

    /// Archive cache placed on an alternative download root
    pub fn alt_archives_dir(alt_root: impl AsRef<Path>) -> PathBuf {
        alt_root.as_ref().join(".appman-archive-cache")
    }

    fn ensure_dirs_exist(&self) {
        for path in [
            self.state_dir(),
            self.lists_dir(),
            self.archives_dir().join("partial"),
            self.sources_parts_dir(),
        ] {
            let _ = fs::create_dir_all(path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn paths_are_rooted() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        assert!(installation.lock_path().starts_with(dir.path()));
        assert!(installation.lists_dir().exists());
        assert!(installation.archives_dir().join("partial").exists());
    }
}
