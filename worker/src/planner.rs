// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! "No surprises" install and remove marking.
//!
//! Installing a package never silently uninstalls another: removals
//! scheduled to resolve a conflict are soft, restricted to non-user
//! packages the installing package replaces, and undone again by the
//! fix-soft pass when they would break something. The dispatcher relies
//! on the cache memo so repeating the same request keeps the marks.

use log::debug;

use crate::{
    cache::{Cache, Mode, World},
    db::{DepClause, DepKind, InstState, PackageId, VersionId},
    environment::{INSTALL_RECURSION_LIMIT, MAGIC_SYS},
    options::Options,
};

/// Mark the named package for installation. `magic:sys` marks every
/// upgradeable non-user package. Returns false when the name is unknown.
pub fn mark_named_for_install(cache: &mut Cache, options: &Options, package: &str) -> bool {
    if cache.check_state(package, true) {
        return true;
    }

    if package == MAGIC_SYS {
        mark_sys_upgrades(cache);
        return true;
    }

    match cache.db.find_package(package) {
        Some(pkg) => {
            mark_for_install(cache, options, pkg);
            true
        }
        None => false,
    }
}

pub fn mark_for_install(cache: &mut Cache, options: &Options, pkg: PackageId) {
    debug!("install {}", cache.name(pkg));

    if options.use_apt_algorithms {
        resolver_install(cache, pkg);
    } else {
        mark_for_install_1(cache, pkg, 0);
        fix_soft_packages(cache);
    }
}

/// Mark the named package for removal, honoring the cache memo.
pub fn mark_for_remove(cache: &mut Cache, options: &Options, pkg: PackageId) {
    debug!("remove {}", cache.name(pkg));

    let name = cache.name(pkg).to_owned();
    if cache.check_state(&name, false) {
        return;
    }

    if options.use_apt_algorithms {
        cache.mark_delete(pkg);
        cache.marks[pkg].auto = false;
    } else {
        mark_for_remove_1(cache, pkg, false);
        fix_soft_packages(cache);
    }
}

/// Mark every upgradeable non-user package for installation
pub fn mark_sys_upgrades(cache: &mut Cache) {
    debug!("upgrade all system packages");

    for pkg in cache.db.package_ids() {
        let Some(current) = cache.current(pkg) else {
            continue;
        };
        if !cache.db.version(current).is_user() && cache.is_keep(pkg) {
            mark_for_install_1(cache, pkg, 0);
        }
    }
    fix_soft_packages(cache);
}

/// Mark a version and, while anything needs unpacking or configuring,
/// its dependency closure as related to the current operation.
fn mark_related(cache: &mut Cache, version: VersionId) {
    let pkg = cache.db.version(version).package;
    if cache.extra[pkg].related {
        return;
    }
    cache.extra[pkg].related = true;

    if cache.state(pkg) == InstState::NeedsUnpack {
        cache.set_reinstall(pkg, true);
    }

    if cache.broken_count() > 0 {
        let clauses = cache.db.version(version).depends.clone();
        for clause in clauses {
            for alternative in &clause.alternatives {
                let current = cache
                    .db
                    .find_package(&alternative.name)
                    .and_then(|dep| cache.current(dep));
                if let Some(dep_version) = current {
                    mark_related(cache, dep_version);
                }
            }
        }
    }
}

fn mark_for_install_1(cache: &mut Cache, pkg: PackageId, level: u32) {
    // Extra robustness against dependency cycles.
    if level > INSTALL_RECURSION_LIMIT {
        return;
    }

    if let Some(candidate) = cache.candidate(pkg) {
        mark_related(cache, candidate);
    }

    // Already scheduled and consistent; nothing to do.
    if cache.mode(pkg) == Mode::Install && !cache.inst_broken(pkg) {
        return;
    }

    debug!("+ {}", cache.name(pkg));

    // Both Install and Keep are fine: Keep happens when the candidate is
    // the installed version of a package that merely needs fixing.
    match cache.mark_install_one(pkg) {
        Some(Mode::Install) | Some(Mode::Keep) => {}
        _ => return,
    }

    // Satisfy dependencies ourselves instead of letting the library
    // auto-install: conflict handling and uninstalls follow our rules.
    let Some(version) = cache.desired(pkg) else {
        return;
    };
    let clauses = cache.db.version(version).depends.clone();

    for clause in clauses {
        if cache.clause_holds(pkg, &clause, World::Desired) {
            continue;
        }

        match clause.kind {
            DepKind::PreDepends | DepKind::Depends => {
                if !cache.clause_satisfiable_by_candidates(&clause) {
                    continue;
                }
                if let Some((target, auto)) = select_install_target(cache, &clause) {
                    mark_for_install_1(cache, target, level + 1);

                    // Set the auto flag after the recursion; marking
                    // clears it.
                    if auto {
                        cache.marks[target].auto = true;
                    }
                }
            }
            DepKind::Conflicts | DepKind::Breaks => {
                // De-install replaced non-user packages, softly.
                for alternative in &clause.alternatives {
                    let Some(target) = cache.db.find_package(&alternative.name) else {
                        continue;
                    };
                    if target == pkg {
                        continue;
                    }
                    let Some(current) = cache.current(target) else {
                        continue;
                    };
                    if !alternative.matches_version(&cache.db.version(current).version) {
                        continue;
                    }
                    if !cache.db.version(current).is_user() && cache.package_replaces(pkg, target)
                    {
                        mark_for_remove_1(cache, target, true);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Choose the package that satisfies an unsatisfied clause: the first
/// alternative whose candidate matches directly, else the best provider.
/// The boolean reports whether the chosen package should carry the auto
/// flag (the named dependency is not installed yet).
fn select_install_target(cache: &Cache, clause: &DepClause) -> Option<(PackageId, bool)> {
    for alternative in &clause.alternatives {
        let named = cache.db.find_package(&alternative.name);
        let auto = named
            .map(|pkg| cache.current(pkg).is_none())
            .unwrap_or(true);

        // Direct match on the named package.
        if let Some(pkg) = named {
            if let Some(candidate) = cache.candidate(pkg) {
                if alternative.matches_version(&cache.db.version(candidate).version) {
                    return Some((pkg, auto));
                }
            }
        }

        // Highest-priority provider whose version is its candidate.
        if alternative.constraint.is_none() {
            let best = cache
                .db
                .providers(&alternative.name)
                .iter()
                .filter(|&&provider| {
                    cache.candidate(cache.db.version(provider).package) == Some(provider)
                })
                .max_by_key(|&&provider| {
                    cache
                        .db
                        .version(provider)
                        .locations
                        .iter()
                        .map(|location| cache.db.index(location.index).priority)
                        .max()
                        .unwrap_or(0)
                });
            if let Some(&provider) = best {
                return Some((cache.db.version(provider).package, auto));
            }
        }
    }

    None
}

/// Mark for removal, recursively soft-removing auto-installed non-user
/// dependencies.
fn mark_for_remove_1(cache: &mut Cache, pkg: PackageId, soft: bool) {
    if cache.is_delete(pkg) {
        return;
    }

    debug!("- {}{}", cache.name(pkg), if soft { " (soft)" } else { "" });

    cache.mark_delete(pkg);
    cache.marks[pkg].auto = false;
    cache.extra[pkg].soft = soft;

    if !cache.is_delete(pkg) {
        return;
    }

    let Some(current) = cache.current(pkg) else {
        return;
    };
    let clauses = cache.db.version(current).depends.clone();

    for clause in clauses {
        if !clause.kind.is_critical() {
            continue;
        }
        for alternative in &clause.alternatives {
            let Some(target) = cache.db.find_package(&alternative.name) else {
                continue;
            };
            let Some(target_current) = cache.current(target) else {
                continue;
            };
            if cache.marks[target].auto && !cache.db.version(target_current).is_user() {
                mark_for_remove_1(cache, target, true);
            }
        }
    }
}

/// Undo soft removals that break the plan, to a fixed point.
pub fn fix_soft_packages(cache: &mut Cache) {
    loop {
        let mut something_changed = false;

        for pkg in cache.db.package_ids() {
            if !cache.inst_broken(pkg) {
                continue;
            }
            let Some(version) = cache.desired(pkg) else {
                continue;
            };
            let clauses = cache.db.version(version).depends.clone();

            for clause in clauses {
                if !clause.kind.is_critical() {
                    continue;
                }
                if cache.clause_satisfied(&clause, World::Desired) {
                    continue;
                }

                // Put back the first softly removed target of the group.
                for alternative in &clause.alternatives {
                    let Some(target) = cache.db.find_package(&alternative.name) else {
                        continue;
                    };
                    if cache.is_delete(target) && cache.extra[target].soft {
                        debug!("= {}", cache.name(target));
                        cache.reset_package(target);
                        something_changed = true;
                        break;
                    }
                }
            }
        }

        if !something_changed {
            return;
        }
    }
}

/// Resolver-flavored marking: protect the target, install with automatic
/// dependency handling, and allow the conflict removals the resolver
/// would make.
fn resolver_install(cache: &mut Cache, pkg: PackageId) {
    if cache.mark_install_one(pkg).is_none() {
        return;
    }

    let Some(version) = cache.desired(pkg) else {
        return;
    };
    let clauses = cache.db.version(version).depends.clone();

    for clause in clauses {
        if cache.clause_holds(pkg, &clause, World::Desired) {
            continue;
        }
        match clause.kind {
            DepKind::PreDepends | DepKind::Depends => {
                if let Some((target, auto)) = select_install_target(cache, &clause) {
                    resolver_install(cache, target);
                    if auto {
                        cache.marks[target].auto = true;
                    }
                }
            }
            DepKind::Conflicts | DepKind::Breaks => {
                for alternative in &clause.alternatives {
                    if let Some(target) = cache.db.find_package(&alternative.name) {
                        if target != pkg && cache.is_installed(target) {
                            cache.mark_delete(target);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::FixtureBuilder;

    fn options() -> Options {
        Options::default()
    }

    #[test]
    fn install_pulls_dependencies_as_auto() {
        let fixture = FixtureBuilder::new()
            .available_with("app", "1.0", &["libnew (>= 1.0)"], &[("Section", "user/apps")])
            .available("libnew", "1.0", &[])
            .build();
        let mut cache = fixture.open_cache();

        assert!(mark_named_for_install(&mut cache, &options(), "app"));

        let app = cache.db.find_package("app").unwrap();
        let libnew = cache.db.find_package("libnew").unwrap();
        assert_eq!(cache.mode(app), Mode::Install);
        assert_eq!(cache.mode(libnew), Mode::Install);
        assert!(cache.marks[libnew].auto);
        assert!(!cache.marks[app].auto);
        assert!(!cache.any_newly_or_related_broken());
    }

    #[test]
    fn install_is_idempotent() {
        let fixture = FixtureBuilder::new()
            .available("app", "1.0", &["libnew"])
            .available("libnew", "1.0", &[])
            .build();
        let mut cache = fixture.open_cache();

        assert!(mark_named_for_install(&mut cache, &options(), "app"));
        let first: Vec<_> = cache.marks.iter().map(|m| (m.mode, m.auto)).collect();

        assert!(mark_named_for_install(&mut cache, &options(), "app"));
        let second: Vec<_> = cache.marks.iter().map(|m| (m.mode, m.auto)).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn install_never_uninstalls_user_packages() {
        // app conflicts with (and replaces) rival, but rival is a user
        // package: the plan must not remove it, leaving app broken.
        let fixture = FixtureBuilder::new()
            .installed_with("rival", "1.0", &[], &[("Section", "user/apps")])
            .available_with(
                "app",
                "1.0",
                &[],
                &[
                    ("Section", "user/apps"),
                    ("Conflicts", "rival"),
                    ("Replaces", "rival"),
                ],
            )
            .build();
        let mut cache = fixture.open_cache();

        assert!(mark_named_for_install(&mut cache, &options(), "app"));

        let rival = cache.db.find_package("rival").unwrap();
        let app = cache.db.find_package("app").unwrap();
        assert_eq!(cache.mode(rival), Mode::Keep);
        assert!(cache.inst_broken(app));
    }

    #[test]
    fn install_soft_removes_replaced_system_package() {
        let fixture = FixtureBuilder::new()
            .installed("oldlib", "1.0", &[])
            .available_with(
                "newlib",
                "1.0",
                &[],
                &[("Conflicts", "oldlib"), ("Replaces", "oldlib")],
            )
            .build();
        let mut cache = fixture.open_cache();

        assert!(mark_named_for_install(&mut cache, &options(), "newlib"));

        let oldlib = cache.db.find_package("oldlib").unwrap();
        assert_eq!(cache.mode(oldlib), Mode::Delete);
        assert!(cache.extra[oldlib].soft);
    }

    #[test]
    fn fix_soft_undoes_breaking_removal() {
        // newlib replaces oldlib, but keeper still depends on oldlib:
        // the soft removal must be undone again.
        let fixture = FixtureBuilder::new()
            .installed("oldlib", "1.0", &[])
            .installed("keeper", "1.0", &["oldlib"])
            .available_with(
                "newlib",
                "1.0",
                &[],
                &[("Conflicts", "oldlib"), ("Replaces", "oldlib")],
            )
            .build();
        let mut cache = fixture.open_cache();

        assert!(mark_named_for_install(&mut cache, &options(), "newlib"));

        let oldlib = cache.db.find_package("oldlib").unwrap();
        assert_eq!(cache.mode(oldlib), Mode::Keep);
    }

    #[test]
    fn remove_recurses_into_auto_dependencies() {
        let fixture = FixtureBuilder::new()
            .installed_with("app", "1.0", &["helperlib"], &[("Section", "user/apps")])
            .installed("helperlib", "1.0", &[])
            .installed("sharedlib", "1.0", &[])
            .installed_with("other", "1.0", &["sharedlib"], &[("Section", "user/apps")])
            .build();
        let mut cache = fixture.open_cache();

        let app = cache.db.find_package("app").unwrap();
        let helperlib = cache.db.find_package("helperlib").unwrap();
        cache.marks[helperlib].auto = true;
        cache.extra[helperlib].autoinst = true;

        mark_for_remove(&mut cache, &options(), app);

        assert_eq!(cache.mode(app), Mode::Delete);
        assert_eq!(cache.mode(helperlib), Mode::Delete);

        // A manually installed library is left alone.
        let sharedlib = cache.db.find_package("sharedlib").unwrap();
        assert_eq!(cache.mode(sharedlib), Mode::Keep);
    }

    #[test]
    fn remove_undoes_soft_removal_still_needed() {
        // helperlib is auto but another user package still needs it.
        let fixture = FixtureBuilder::new()
            .installed_with("app", "1.0", &["helperlib"], &[("Section", "user/apps")])
            .installed("helperlib", "1.0", &[])
            .installed_with("other", "1.0", &["helperlib"], &[("Section", "user/apps")])
            .build();
        let mut cache = fixture.open_cache();

        let app = cache.db.find_package("app").unwrap();
        let helperlib = cache.db.find_package("helperlib").unwrap();
        cache.marks[helperlib].auto = true;

        mark_for_remove(&mut cache, &options(), app);

        assert_eq!(cache.mode(app), Mode::Delete);
        assert_eq!(cache.mode(helperlib), Mode::Keep);
    }

    #[test]
    fn magic_sys_upgrades_non_user_packages_only() {
        let fixture = FixtureBuilder::new()
            .installed("syslib", "1.0", &[])
            .installed_with("app", "1.0", &[], &[("Section", "user/apps")])
            .available("syslib", "2.0", &[])
            .available_with("app", "2.0", &[], &[("Section", "user/apps")])
            .build();
        let mut cache = fixture.open_cache();

        assert!(mark_named_for_install(&mut cache, &options(), MAGIC_SYS));

        let syslib = cache.db.find_package("syslib").unwrap();
        let app = cache.db.find_package("app").unwrap();
        assert_eq!(cache.mode(syslib), Mode::Install);
        assert_eq!(cache.mode(app), Mode::Keep);
    }

    #[test]
    fn unknown_package_reports_not_found() {
        let fixture = FixtureBuilder::new().build();
        let mut cache = fixture.open_cache();
        assert!(!mark_named_for_install(&mut cache, &options(), "nope"));
    }

    #[test]
    fn provider_satisfies_dependency() {
        let fixture = FixtureBuilder::new()
            .available("app", "1.0", &["mail-reader"])
            .available_with("postler", "1.0", &[], &[("Provides", "mail-reader")])
            .build();
        let mut cache = fixture.open_cache();

        assert!(mark_named_for_install(&mut cache, &options(), "app"));

        let postler = cache.db.find_package("postler").unwrap();
        assert_eq!(cache.mode(postler), Mode::Install);
        assert!(cache.marks[postler].auto);
    }
}
