// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The cache facade: the current world (installed database plus
//! downloaded indexes) and the desired world (per-package marks).
//!
//! `reset` makes desired equal to current. All structural data lives in
//! [`Database`] arrays; this layer adds marks, extra info, the domain of
//! every index file, and the queries the planner and executor need.

use std::io;

use log::debug;

use crate::{
    db::{self, Database, DepClause, DepKind, InstState, PackageId, VersionId},
    domain::{DomainId, Domains},
    installation::Installation,
    release,
};

pub mod extra;
pub mod policy;

pub use self::extra::ExtraInfo;

/// Desired handling of one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Keep,
    Install,
    Delete,
}

/// Desired state of one package
#[derive(Debug, Clone, Default)]
pub struct MarkState {
    pub mode: Mode,
    pub reinstall: bool,
    /// Installed (or to be installed) only as a dependency
    pub auto: bool,
}

/// Which world a dependency query runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum World {
    Current,
    Desired,
}

pub struct Cache {
    pub db: Database,
    pub marks: Vec<MarkState>,
    pub extra: Vec<ExtraInfo>,
    pub candidates: Vec<Option<VersionId>>,
    pub index_domains: Vec<DomainId>,
    /// The operation the marks currently represent
    memo: Option<(String, bool)>,
}

impl Cache {
    /// Build the cache: read the status database and index files, assign
    /// index domains, load extra info (repairing invalid domains), and
    /// compute candidates.
    pub fn open(
        installation: &Installation,
        domains: &Domains,
        allow_wrong_domains: bool,
    ) -> Result<Self, db::Error> {
        let sources = crate::catalogue::active_sources(installation);
        let mut db = Database::load(installation, &sources)?;
        sort_versions(&mut db);

        let index_domains: Vec<DomainId> = (0..db.indexes.len())
            .map(|index| release::classify(&db, index, domains, installation))
            .collect();

        let extra = extra::load(&db, domains, &index_domains, installation);
        let candidates =
            policy::compute_candidates(&db, &extra, &index_domains, domains, allow_wrong_domains);

        let marks = vec![MarkState::default(); db.packages.len()];

        let mut cache = Self {
            db,
            marks,
            extra,
            candidates,
            index_domains,
            memo: None,
        };
        cache.reset();
        Ok(cache)
    }

    /// Make the desired world equal to the current one
    pub fn reset(&mut self) {
        for pkg in 0..self.marks.len() {
            self.reset_package(pkg);
        }
        self.memo = None;
    }

    pub fn reset_package(&mut self, pkg: PackageId) {
        self.marks[pkg] = MarkState {
            mode: Mode::Keep,
            reinstall: false,
            auto: self.extra[pkg].autoinst,
        };
        self.extra[pkg].related = false;
        self.extra[pkg].soft = false;
    }

    /// Remember the operation the marks represent; a repeat of the same
    /// request keeps the marks and reports `true`.
    pub fn check_state(&mut self, package: &str, is_install: bool) -> bool {
        if self
            .memo
            .as_ref()
            .is_some_and(|(p, i)| p == package && *i == is_install)
        {
            return true;
        }

        if self.memo.is_some() {
            self.reset();
        }
        self.memo = Some((package.to_owned(), is_install));
        false
    }

    pub fn name(&self, pkg: PackageId) -> &str {
        &self.db.package(pkg).name
    }

    pub fn current(&self, pkg: PackageId) -> Option<VersionId> {
        self.db.package(pkg).current
    }

    pub fn candidate(&self, pkg: PackageId) -> Option<VersionId> {
        self.candidates[pkg]
    }

    pub fn state(&self, pkg: PackageId) -> InstState {
        self.db.package(pkg).state
    }

    pub fn mode(&self, pkg: PackageId) -> Mode {
        self.marks[pkg].mode
    }

    /// The version the plan leaves on the device
    pub fn desired(&self, pkg: PackageId) -> Option<VersionId> {
        match self.marks[pkg].mode {
            Mode::Keep => self.current(pkg),
            Mode::Install => self.candidate(pkg),
            Mode::Delete => None,
        }
    }

    pub fn is_installed(&self, pkg: PackageId) -> bool {
        self.current(pkg).is_some()
    }

    /// Install of a version over an installed package
    pub fn is_upgrade(&self, pkg: PackageId) -> bool {
        self.marks[pkg].mode == Mode::Install && self.is_installed(pkg)
    }

    pub fn is_new_install(&self, pkg: PackageId) -> bool {
        self.marks[pkg].mode == Mode::Install && !self.is_installed(pkg)
    }

    pub fn is_delete(&self, pkg: PackageId) -> bool {
        self.marks[pkg].mode == Mode::Delete
    }

    pub fn is_keep(&self, pkg: PackageId) -> bool {
        self.marks[pkg].mode == Mode::Keep
    }

    /// Low-level install mark without dependency handling.
    ///
    /// Returns the resulting mode: `Install`, or `Keep` when the
    /// candidate already is the installed version.
    pub fn mark_install_one(&mut self, pkg: PackageId) -> Option<Mode> {
        let candidate = self.candidate(pkg)?;
        let mode = if self.current(pkg) == Some(candidate) {
            Mode::Keep
        } else {
            Mode::Install
        };
        self.marks[pkg].mode = mode;
        Some(mode)
    }

    pub fn mark_delete(&mut self, pkg: PackageId) {
        if self.is_installed(pkg) {
            self.marks[pkg].mode = Mode::Delete;
        }
    }

    pub fn set_reinstall(&mut self, pkg: PackageId, reinstall: bool) {
        self.marks[pkg].reinstall = reinstall;
    }

    pub fn inst_count(&self) -> usize {
        self.marks.iter().filter(|m| m.mode == Mode::Install).count()
    }

    pub fn del_count(&self) -> usize {
        self.marks.iter().filter(|m| m.mode == Mode::Delete).count()
    }

    /// Does the desired version of `pkg` have dependency problems?
    pub fn is_broken(&self, pkg: PackageId, world: World) -> bool {
        let version = match world {
            World::Current => self.current(pkg),
            World::Desired => self.desired(pkg),
        };
        let Some(version) = version else {
            return false;
        };

        self.db
            .version(version)
            .depends
            .iter()
            .any(|clause| !self.clause_holds(pkg, clause, world))
    }

    pub fn inst_broken(&self, pkg: PackageId) -> bool {
        self.is_broken(pkg, World::Desired)
    }

    pub fn now_broken(&self, pkg: PackageId) -> bool {
        self.is_broken(pkg, World::Current)
    }

    pub fn broken_count(&self) -> usize {
        self.db
            .package_ids()
            .filter(|&pkg| self.inst_broken(pkg))
            .count()
    }

    pub fn any_newly_or_related_broken(&self) -> bool {
        self.db.package_ids().any(|pkg| {
            self.inst_broken(pkg) && (!self.now_broken(pkg) || self.extra[pkg].related)
        })
    }

    /// Does one clause hold for its owner in the given world?
    ///
    /// Positive clauses hold when some alternative is satisfied, negative
    /// ones when no forbidden target is present.
    pub fn clause_holds(&self, owner: PackageId, clause: &DepClause, world: World) -> bool {
        if clause.kind.is_negative() {
            !clause
                .alternatives
                .iter()
                .any(|target| self.target_present(owner, target, world))
        } else if clause.kind.is_critical() {
            self.clause_satisfied(clause, world)
        } else {
            // Recommends and Replaces never break a plan.
            true
        }
    }

    /// Is a positive clause satisfied in the given world?
    pub fn clause_satisfied(&self, clause: &DepClause, world: World) -> bool {
        clause.alternatives.iter().any(|target| {
            if let Some(pkg) = self.db.find_package(&target.name) {
                let version = match world {
                    World::Current => self.current(pkg),
                    World::Desired => self.desired(pkg),
                };
                if let Some(version) = version {
                    if target.matches_version(&self.db.version(version).version) {
                        return true;
                    }
                }
            }

            // Providers satisfy unversioned alternatives.
            target.constraint.is_none()
                && self
                    .db
                    .providers(&target.name)
                    .iter()
                    .any(|&provider| self.version_in_world(provider, world))
        })
    }

    fn target_present(&self, owner: PackageId, target: &db::DepTarget, world: World) -> bool {
        if let Some(pkg) = self.db.find_package(&target.name) {
            if pkg != owner {
                let version = match world {
                    World::Current => self.current(pkg),
                    World::Desired => self.desired(pkg),
                };
                if let Some(version) = version {
                    if target.matches_version(&self.db.version(version).version) {
                        return true;
                    }
                }
            }
        }

        target.constraint.is_none()
            && self.db.providers(&target.name).iter().any(|&provider| {
                self.db.version(provider).package != owner
                    && self.version_in_world(provider, world)
            })
    }

    /// Is this exact version what its package resolves to in a world?
    fn version_in_world(&self, version: VersionId, world: World) -> bool {
        let pkg = self.db.version(version).package;
        match world {
            World::Current => self.current(pkg) == Some(version),
            World::Desired => self.desired(pkg) == Some(version),
        }
    }

    /// Would installing `pkg` pull a satisfying version of this clause?
    pub fn clause_satisfiable_by_candidates(&self, clause: &DepClause) -> bool {
        clause.alternatives.iter().any(|target| {
            self.db
                .find_package(&target.name)
                .and_then(|pkg| self.candidate(pkg))
                .is_some_and(|cand| target.matches_version(&self.db.version(cand).version))
                || (target.constraint.is_none() && !self.db.providers(&target.name).is_empty())
        })
    }

    /// Total bytes of archives the plan would download
    pub fn deb_size(&self) -> i64 {
        self.db
            .package_ids()
            .filter_map(|pkg| self.version_to_fetch(pkg))
            .map(|ver| self.db.version(ver).download_size)
            .sum()
    }

    /// Net change of installed size, bytes
    pub fn usr_size_delta(&self) -> i64 {
        self.db
            .package_ids()
            .map(|pkg| {
                let installed = self
                    .current(pkg)
                    .map(|v| self.db.version(v).installed_size)
                    .unwrap_or(0);
                let desired = self
                    .desired(pkg)
                    .map(|v| self.db.version(v).installed_size)
                    .unwrap_or(0);
                desired - installed
            })
            .sum()
    }

    /// The archive the plan needs for this package, if any
    pub fn version_to_fetch(&self, pkg: PackageId) -> Option<VersionId> {
        match self.marks[pkg].mode {
            Mode::Install => self.candidate(pkg),
            Mode::Keep if self.marks[pkg].reinstall => self.candidate(pkg),
            _ => None,
        }
    }

    /// The ordered list of packages the executor must handle: everything
    /// whose plan differs from the current state, plus related packages
    /// even when kept, so a reconfiguration is not skipped.
    pub fn order_list(&self) -> Vec<PackageId> {
        let mut list = Vec::new();

        for pkg in self.db.package_ids() {
            if self.db.package(pkg).versions.is_empty() {
                continue;
            }

            let uninteresting = (self.is_keep(pkg) || self.desired(pkg) == self.current(pkg))
                && self.state(pkg) == InstState::NeedsNothing
                && !self.marks[pkg].reinstall
                && self.marks[pkg].mode != Mode::Delete;
            if uninteresting {
                continue;
            }

            if self.is_keep(pkg) && !self.marks[pkg].reinstall && !self.extra[pkg].related {
                debug!("not handling unrelated package {}", self.name(pkg));
                continue;
            }

            list.push(pkg);
        }

        list
    }

    /// Persist extra info, folding the current auto flags in
    pub fn save_extra_info(
        &mut self,
        domains: &Domains,
        installation: &Installation,
    ) -> io::Result<()> {
        let auto_flags: Vec<bool> = self.marks.iter().map(|m| m.auto).collect();
        extra::save(
            &self.db,
            domains,
            &mut self.extra,
            &auto_flags,
            installation,
        )
    }

    /// Sum of declared extra-space requirements of affected packages
    pub fn required_free_space(&self) -> i64 {
        self.db
            .package_ids()
            .filter(|&pkg| {
                self.extra[pkg].related
                    && (self.is_upgrade(pkg) || self.state(pkg) != InstState::NeedsNothing)
            })
            .filter_map(|pkg| self.candidate(pkg))
            .map(|ver| self.db.version(ver).required_free_space())
            .sum()
    }

    /// Aggregate flag set of the affected candidates
    pub fn related_flags(&self) -> crate::protocol::PackageFlags {
        self.db
            .package_ids()
            .filter(|&pkg| {
                self.extra[pkg].related
                    && (self.is_upgrade(pkg)
                        || self.is_new_install(pkg)
                        || self.state(pkg) != InstState::NeedsNothing)
            })
            .filter_map(|pkg| self.candidate(pkg))
            .map(|ver| self.db.version(ver).flags())
            .fold(crate::protocol::PackageFlags::empty(), |acc, flags| {
                acc | flags
            })
    }

    /// Does the desired version of `pkg` replace `target`?
    pub fn package_replaces(&self, pkg: PackageId, target: PackageId) -> bool {
        let Some(version) = self.desired(pkg) else {
            return false;
        };
        let target_name = &self.db.package(target).name;

        self.db
            .version(version)
            .clauses(DepKind::Replaces)
            .flat_map(|clause| &clause.alternatives)
            .any(|alt| {
                &alt.name == target_name
                    && self
                        .current(target)
                        .is_some_and(|cur| alt.matches_version(&self.db.version(cur).version))
            })
    }
}

/// Sort every package's version list newest-first; candidate selection
/// and downgrade protection rely on this order.
fn sort_versions(db: &mut Database) {
    for package in &mut db.packages {
        let versions = &db.versions;
        package
            .versions
            .sort_by(|&a, &b| db::version::compare(&versions[b].version, &versions[a].version));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::FixtureBuilder;

    #[test]
    fn reset_restores_current_world() {
        let fixture = FixtureBuilder::new()
            .installed("alpha", "1.0", &[])
            .available("alpha", "2.0", &[])
            .build();
        let mut cache = fixture.open_cache();

        let alpha = cache.db.find_package("alpha").unwrap();
        cache.mark_install_one(alpha);
        assert_eq!(cache.mode(alpha), Mode::Install);

        cache.reset();
        assert_eq!(cache.mode(alpha), Mode::Keep);
        assert_eq!(cache.desired(alpha), cache.current(alpha));
    }

    #[test]
    fn candidate_prefers_newer_available() {
        let fixture = FixtureBuilder::new()
            .installed("alpha", "1.0", &[])
            .available("alpha", "2.0", &[])
            .build();
        let cache = fixture.open_cache();

        let alpha = cache.db.find_package("alpha").unwrap();
        let candidate = cache.candidate(alpha).unwrap();
        assert_eq!(cache.db.version(candidate).version, "2.0");
    }

    #[test]
    fn installed_version_shields_downgrades() {
        let fixture = FixtureBuilder::new()
            .installed("alpha", "2.0", &[])
            .available("alpha", "1.0", &[])
            .build();
        let cache = fixture.open_cache();

        let alpha = cache.db.find_package("alpha").unwrap();
        let candidate = cache.candidate(alpha).unwrap();
        assert_eq!(cache.db.version(candidate).version, "2.0");
    }

    #[test]
    fn broken_queries_track_worlds() {
        let fixture = FixtureBuilder::new()
            .installed("app", "1.0", &["lib (>= 1.0)"])
            .installed("lib", "1.0", &[])
            .build();
        let mut cache = fixture.open_cache();

        let app = cache.db.find_package("app").unwrap();
        let lib = cache.db.find_package("lib").unwrap();

        assert!(!cache.now_broken(app));
        assert!(!cache.inst_broken(app));

        cache.mark_delete(lib);
        assert!(!cache.now_broken(app));
        assert!(cache.inst_broken(app));
    }

    #[test]
    fn providers_satisfy_unversioned_clauses() {
        let fixture = FixtureBuilder::new()
            .installed("app", "1.0", &["mail-reader"])
            .installed_with(
                "postler",
                "1.0",
                &[],
                &[("Provides", "mail-reader")],
            )
            .build();
        let cache = fixture.open_cache();

        let app = cache.db.find_package("app").unwrap();
        assert!(!cache.now_broken(app));
    }

    #[test]
    fn order_list_includes_related_kept_packages() {
        let fixture = FixtureBuilder::new()
            .installed("alpha", "1.0", &[])
            .installed("beta", "1.0", &[])
            .available("alpha", "2.0", &[])
            .build();
        let mut cache = fixture.open_cache();

        let alpha = cache.db.find_package("alpha").unwrap();
        let beta = cache.db.find_package("beta").unwrap();

        cache.mark_install_one(alpha);
        cache.extra[beta].related = true;
        cache.set_reinstall(beta, true);

        let order = cache.order_list();
        assert!(order.contains(&alpha));
        assert!(order.contains(&beta));

        // An unrelated kept package stays out.
        cache.reset();
        cache.mark_install_one(alpha);
        let order = cache.order_list();
        assert!(order.contains(&alpha));
        assert!(!order.contains(&beta));
    }
}
