// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Candidate version selection and per-operation trust bookkeeping.
//!
//! Selection layers two guards over plain priority comparison: an entry
//! from the status pseudo-file never becomes a candidate unless it is
//! the installed version, and outside `allow_wrong_domains` mode a
//! version is ignored when its source domain does not dominate the
//! installed package's current domain. After priority selection the
//! installed version is elevated to the pseudo-status priority so that
//! only higher-priority overrides can force a downgrade.

use log::info;

use crate::{
    db::{Database, PackageId, VersionId, PSEUDO_STATUS_PRIORITY},
    domain::{DomainId, Domains, UNSIGNED},
};

use super::extra::ExtraInfo;

/// Compute the candidate version of every package.
///
/// Versions inside each package must already be sorted newest-first.
pub fn compute_candidates(
    db: &Database,
    extra: &[ExtraInfo],
    index_domains: &[DomainId],
    domains: &Domains,
    allow_wrong_domains: bool,
) -> Vec<Option<VersionId>> {
    db.package_ids()
        .map(|pkg| candidate_for(db, pkg, extra, index_domains, domains, allow_wrong_domains))
        .collect()
}

fn candidate_for(
    db: &Database,
    pkg: PackageId,
    extra: &[ExtraInfo],
    index_domains: &[DomainId],
    domains: &Domains,
    allow_wrong_domains: bool,
) -> Option<VersionId> {
    let package = db.package(pkg);
    let cur_domain = extra[pkg].cur_domain.unwrap_or(UNSIGNED);

    let mut pref: Option<VersionId> = None;
    let mut max = 0;

    for &ver in &package.versions {
        let version = db.version(ver);

        for location in &version.locations {
            let index = db.index(location.index);

            // The status file never sources a candidate other than the
            // installed version itself.
            if index.not_source && package.current != Some(ver) {
                continue;
            }

            if !allow_wrong_domains
                && !index.not_source
                && !domains.dominates(index_domains[location.index], cur_domain)
            {
                info!(
                    "ignoring version from wrong domain: {} {}",
                    package.name, version.version
                );
                continue;
            }

            if index.priority > max {
                pref = Some(ver);
                max = index.priority;
            }
        }

        // Elevate the installed version to the pseudo-status priority:
        // versions ranked after it can no longer win on source priority
        // alone, which prevents silent downgrades.
        if package.current == Some(ver) && max < PSEUDO_STATUS_PRIORITY {
            if pref.is_none() {
                pref = Some(ver);
            }
            max = PSEUDO_STATUS_PRIORITY;
        }
    }

    pref
}

/// Begin trust bookkeeping for an operation: no prospective domain yet.
pub fn reset_new_domains(extra: &mut [ExtraInfo]) {
    for info in extra.iter_mut() {
        info.new_domain = UNSIGNED;
    }
}

/// Evaluate one index as the source of a package's candidate version.
///
/// Returns the trust level the acquisition would run at, or `None` when
/// this index must not be used. Records the accepted domain as the
/// package's prospective domain.
pub fn index_trust_level_for_package(
    extra: &mut [ExtraInfo],
    pkg: PackageId,
    index_domain: DomainId,
    new_install: bool,
    domains: &Domains,
) -> Option<i64> {
    let cur_level = domains.trust_level(extra[pkg].cur_domain.unwrap_or(UNSIGNED));
    let index_level = domains.trust_level(index_domain);

    // Once a good domain is found, accept only the same domain or a
    // strictly better one.
    if extra[pkg].new_domain != UNSIGNED {
        let new_level = domains.trust_level(extra[pkg].new_domain);
        if index_domain == extra[pkg].new_domain || index_level > new_level {
            extra[pkg].new_domain = index_domain;
            return Some(index_level);
        }
        return None;
    }

    // A new install accepts the first domain that comes along.
    if new_install {
        extra[pkg].new_domain = index_domain;
        return Some(index_level);
    }

    // An upgrade accepts the current domain or one that dominates it.
    if index_level >= cur_level {
        extra[pkg].new_domain = index_domain;
        return Some(index_level);
    }

    Some(cur_level)
}

/// Commit the prospective domains of every related package.
pub fn collect_new_domains(extra: &mut [ExtraInfo]) {
    for info in extra.iter_mut() {
        if info.related {
            info.cur_domain = Some(info.new_domain);
        }
    }
}

/// Did the domain guard suppress an upgrade of this package?
///
/// True when a version newer than the installed one exists only in
/// domains that do not dominate the package's current domain.
pub fn blocked_by_domain(
    db: &Database,
    pkg: PackageId,
    extra: &[ExtraInfo],
    index_domains: &[DomainId],
    domains: &Domains,
) -> bool {
    let package = db.package(pkg);
    let Some(current) = package.current else {
        return false;
    };
    let cur_domain = extra[pkg].cur_domain.unwrap_or(UNSIGNED);
    let current_version = &db.version(current).version;

    package.versions.iter().any(|&ver| {
        let version = db.version(ver);
        crate::db::version::compare(&version.version, current_version)
            == std::cmp::Ordering::Greater
            && version.locations.iter().any(|location| {
                !db.index(location.index).not_source
                    && !domains.dominates(index_domains[location.index], cur_domain)
            })
    })
}
