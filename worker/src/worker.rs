// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The worker state handle: everything a command handler needs, passed
//! explicitly instead of living in process globals.

use log::warn;

use crate::{
    cache::Cache,
    catalogue, deploy,
    domain::Domains,
    environment::{self, STATUS_MIN_CHANGE_GENERAL},
    installation::Installation,
    options::Options,
    protocol::{PackageFlags, StatusOp},
    status::Monitor,
    updates,
};

pub struct Worker {
    pub installation: Installation,
    pub options: Options,
    pub domains: Domains,
    pub cache: Option<Cache>,
    /// Rebuild the cache after the current reply has been sent
    pub init_cache_after_request: bool,
    /// Download size of the last operation, reported to the client
    pub download_size: i64,
    pub lc_messages: Option<String>,
}

impl Worker {
    pub fn new(installation: Installation, options: Options) -> Self {
        let domains = Domains::load(installation.domains_conf_path());

        Self {
            installation,
            options,
            domains,
            cache: None,
            init_cache_after_request: false,
            download_size: 0,
            lc_messages: std::env::var("LC_MESSAGES").ok().filter(|l| !l.is_empty()),
        }
    }

    /// Startup work shared by all entry points: build the cache, drop
    /// stale temporary catalogues, seed the mountpoint environment.
    pub fn misc_init(&mut self, monitor: &mut dyn Monitor) {
        self.cache_init(monitor);
        catalogue::clean_temp_catalogues(&self.installation);

        if std::env::var_os("INTERNAL_MMC_MOUNTPOINT").is_none() {
            std::env::set_var(
                "INTERNAL_MMC_MOUNTPOINT",
                environment::INTERNAL_MMC_MOUNTPOINT,
            );
        }
        if std::env::var_os("REMOVABLE_MMC_MOUNTPOINT").is_none() {
            std::env::set_var(
                "REMOVABLE_MMC_MOUNTPOINT",
                environment::REMOVABLE_MMC_MOUNTPOINT,
            );
        }
    }

    /// (Re)build the cache. On failure the worker stays alive and
    /// handlers see an absent cache.
    pub fn cache_init(&mut self, monitor: &mut dyn Monitor) {
        // Close the previous cache first; rebuilding over a dpkg journal
        // fails.
        self.cache = None;
        deploy::clear_dpkg_journal(&self.installation);

        monitor.status(StatusOp::General, 0, 100, STATUS_MIN_CHANGE_GENERAL);

        match Cache::open(
            &self.installation,
            &self.domains,
            self.options.allow_wrong_domains,
        ) {
            Ok(cache) => {
                updates::write_available_updates(
                    &cache,
                    &self.domains,
                    &self.installation,
                    self.lc_messages.as_deref(),
                );
                self.cache = Some(cache);
            }
            Err(e) => {
                warn!("can't build the package cache: {e}");
            }
        }

        monitor.status(StatusOp::General, 100, 100, STATUS_MIN_CHANGE_GENERAL);
    }

    /// Make sure a cache exists; a transient failure may have healed.
    pub fn ensure_cache(&mut self, monitor: &mut dyn Monitor) -> bool {
        if self.cache.is_none() {
            self.cache_init(monitor);
        }
        self.cache.is_some()
    }

    pub fn need_cache_init(&mut self) {
        self.init_cache_after_request = true;
    }

    /// Is this package a system-update (SSU) package?
    pub fn is_ssu(&self, package: &str) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        let Some(pkg) = cache.db.find_package(package) else {
            return false;
        };

        cache
            .candidate(pkg)
            .or(cache.current(pkg))
            .is_some_and(|version| {
                cache
                    .db
                    .version(version)
                    .flags()
                    .contains(PackageFlags::SYSTEM_UPDATE)
            })
    }

    /// Names of installed packages whose candidate carries the
    /// system-update flag.
    pub fn system_update_packages(&self) -> Vec<String> {
        let Some(cache) = &self.cache else {
            return vec![];
        };

        cache
            .db
            .package_ids()
            .filter(|&pkg| cache.current(pkg).is_some())
            .filter_map(|pkg| {
                let candidate = cache.candidate(pkg)?;
                cache
                    .db
                    .version(candidate)
                    .flags()
                    .contains(PackageFlags::SYSTEM_UPDATE)
                    .then(|| cache.db.package(pkg).name.clone())
            })
            .collect()
    }
}
