// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-package extra info owned by the worker, persisted across runs:
//! the auto-install flag and the domain each installed package came from.
//!
//! On disk this is one `autoinst` file plus one `domain.<name>` file per
//! domain, each a newline-separated package-name list, written with
//! flush and fsync for crash safety.

use std::io::{self, Write};

use fs_err as fs;
use log::warn;

use crate::{
    db::Database,
    domain::{DomainId, Domains},
    installation::Installation,
};

/// Transient and persistent per-package state
#[derive(Debug, Clone, Default)]
pub struct ExtraInfo {
    /// Installed only to satisfy another package
    pub autoinst: bool,
    /// Participates in the current operation
    pub related: bool,
    /// Scheduled removal that fix-soft may undo
    pub soft: bool,
    /// Domain the installed version came from; `None` is invalid/unknown
    pub cur_domain: Option<DomainId>,
    /// Domain selected for the candidate during the current operation
    pub new_domain: DomainId,
}

/// Load extra info for every package in the database.
///
/// Any installed package without a valid domain is assigned the
/// highest-trust domain among its installed-version sources (default
/// `unsigned`); when that repairs anything the result is persisted
/// immediately.
pub fn load(
    db: &Database,
    domains: &Domains,
    index_domains: &[DomainId],
    installation: &Installation,
) -> Vec<ExtraInfo> {
    let mut extra = vec![ExtraInfo::default(); db.packages.len()];

    for name in read_name_list(&installation.autoinst_path()) {
        if let Some(pkg) = db.find_package(&name) {
            extra[pkg].autoinst = true;
        }
    }

    for (id, domain) in domains.iter() {
        for name in read_name_list(&installation.domain_file_path(&domain.name)) {
            if let Some(pkg) = db.find_package(&name) {
                extra[pkg].cur_domain = Some(id);
            }
        }
    }

    let mut changed = false;
    for pkg in db.package_ids() {
        if extra[pkg].cur_domain.is_some() {
            continue;
        }
        let Some(current) = db.package(pkg).current else {
            continue;
        };

        let mut best = crate::domain::UNSIGNED;
        for location in &db.version(current).locations {
            if db.index(location.index).not_source {
                continue;
            }
            let candidate = index_domains[location.index];
            if domains.trust_level(candidate) > domains.trust_level(best) {
                best = candidate;
                changed = true;
            }
        }
        extra[pkg].cur_domain = Some(best);
    }

    if changed {
        if let Err(e) = save_domains(db, domains, &extra, installation) {
            warn!("can't persist repaired domains: {e}");
        }
    }

    extra
}

/// Rewrite the autoinst file from the auto flags and refresh the
/// in-memory copy so a later reset restores this state.
pub fn save(
    db: &Database,
    domains: &Domains,
    extra: &mut [ExtraInfo],
    auto_flags: &[bool],
    installation: &Installation,
) -> io::Result<()> {
    let mut autoinst = Vec::new();
    for pkg in db.package_ids() {
        extra[pkg].autoinst = auto_flags[pkg];
        if auto_flags[pkg] {
            autoinst.push(db.package(pkg).name.as_str());
        }
    }
    write_name_list(&installation.autoinst_path(), &autoinst)?;

    save_domains(db, domains, extra, installation)
}

fn save_domains(
    db: &Database,
    domains: &Domains,
    extra: &[ExtraInfo],
    installation: &Installation,
) -> io::Result<()> {
    for (id, domain) in domains.iter() {
        let names: Vec<&str> = db
            .package_ids()
            .filter(|&pkg| extra[pkg].cur_domain == Some(id))
            .map(|pkg| db.package(pkg).name.as_str())
            .collect();
        write_name_list(&installation.domain_file_path(&domain.name), &names)?;
    }
    Ok(())
}

fn read_name_list(path: &std::path::Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => text.lines().map(str::to_owned).collect(),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("unreadable {path:?}: {e}");
            }
            vec![]
        }
    }
}

fn write_name_list(path: &std::path::Path, names: &[&str]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    for name in names {
        writeln!(file, "{name}")?;
    }
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoinst");

        write_name_list(&path, &["libfoo", "libbar"]).unwrap();
        assert_eq!(read_name_list(&path), vec!["libfoo", "libbar"]);
        assert!(read_name_list(&dir.path().join("missing")).is_empty());
    }
}
