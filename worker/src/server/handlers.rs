// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! One handler per command. Handlers read arguments from the request
//! decoder, write reply fields into the response encoder, and stay
//! silent about transport concerns; the loop in the parent module ships
//! the frames.

use std::path::PathBuf;

use log::{info, warn};
use xexp::Xexp;

use crate::{
    cache::{policy, Cache, Mode},
    catalogue, deploy,
    db::{control::Stanza, parse_clauses, DepKind, InstState, PackageId, VersionId},
    environment::{self, MAGIC_SYS},
    fetch::Fetcher,
    journal,
    operation::{self, Params},
    planner,
    protocol::{Command, Decoder, Encoder, PackageFlags, ResultCode, Status, SumType},
    rescue,
    status::Monitor,
    worker::Worker,
};

use super::Flow;

pub(super) fn dispatch(
    worker: &mut Worker,
    command: Command,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) -> Flow {
    match command {
        Command::Noop => {}
        Command::Status => {}
        Command::GetPackageList => get_package_list(worker, request, response, monitor),
        Command::GetPackageInfo => get_package_info(worker, request, response, monitor),
        Command::GetPackageDetails => get_package_details(worker, request, response, monitor),
        Command::CheckUpdates => {
            check_updates(worker, response, monitor);
        }
        Command::GetCatalogues => get_catalogues(worker, response),
        Command::SetCatalogues => set_catalogues(worker, request, response),
        Command::AddTempCatalogues => add_temp_catalogues(worker, request, response),
        Command::RmTempCatalogues => rm_temp_catalogues(worker, response),
        Command::GetFreeSpace => {
            response.int64(operation::get_free_space(&worker.installation.root));
        }
        Command::InstallCheck => install_check(worker, request, response, monitor),
        Command::DownloadPackage => download_package(worker, request, response, monitor),
        Command::InstallPackage => install_package(worker, request, response, monitor),
        Command::RemoveCheck => remove_check(worker, request, response, monitor),
        Command::RemovePackage => remove_package(worker, request, response, monitor),
        Command::Clean => clean(worker, response),
        Command::GetFileDetails => get_file_details(worker, request, response, monitor),
        Command::InstallFile => install_file(worker, request, response),
        Command::SaveBackupData => save_backup_data(worker, monitor),
        Command::GetSystemUpdatePackages => get_system_update_packages(worker, response, monitor),
        Command::Reboot => rescue::reboot_device(),
        Command::SetOptions => {
            if let Some(options) = request.string() {
                worker.options.merge(&options);
            }
        }
        Command::SetEnv => set_env(request),
        Command::ThirdPartyPolicyCheck => third_party_policy_check(worker, request, response, monitor),
        Command::Autoremove => autoremove(worker, response, monitor),
        Command::Exit => return Flow::Exit,
    }

    Flow::Continue
}

fn encode_version_info(
    response: &mut Encoder,
    cache: &Cache,
    version: Option<VersionId>,
    include_size: bool,
    upgrade: bool,
    lc_messages: Option<&str>,
) {
    match version {
        Some(version) => {
            let version = cache.db.version(version);
            response.string(Some(version.version.as_str()));
            if include_size {
                response.int64(version.installed_size);
            }
            response.string(version.section.as_deref());
            response.string(version.pretty_name(lc_messages));
            response.string(Some(version.short_description(upgrade, lc_messages).as_str()));
            response.string(version.icon());
        }
        None => {
            response.string(None);
            if include_size {
                response.int64(0);
            }
            response.string(None);
            response.string(None);
            response.string(None);
            response.string(None);
        }
    }
}

fn get_package_list(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let only_user = request.int32() != 0;
    let only_installed = request.int32() != 0;
    let only_available = request.int32() != 0;
    let pattern = request.string();
    let show_magic_sys = request.int32() != 0;

    if !worker.ensure_cache(monitor) {
        response.int32(0);
        return;
    }
    response.int32(1);

    let lc = worker.lc_messages.clone();
    let Some(cache) = worker.cache.as_ref() else {
        return;
    };

    for pkg in cache.db.package_ids() {
        // The client may lose interest in a long listing.
        if monitor.cancelled() {
            return;
        }

        let installed = cache.current(pkg);
        let candidate = cache.candidate(pkg).filter(|&c| Some(c) != installed);

        let is_user = |v: Option<VersionId>| v.is_some_and(|v| cache.db.version(v).is_user());
        if only_user && !is_user(installed) && !is_user(candidate) {
            continue;
        }
        if only_installed && installed.is_none() {
            continue;
        }
        if only_available && candidate.is_none() {
            continue;
        }
        if installed.is_none() && cache.candidate(pkg).is_none() {
            continue;
        }

        // Skip foreign-architecture entries unless they are installed.
        if !only_installed {
            let shown = installed.or(cache.candidate(pkg));
            if shown.is_some_and(|v| !crate::db::arch_matches(&cache.db.version(v).architecture))
            {
                continue;
            }
        }

        if let Some(pattern) = &pattern {
            if !matches_pattern(cache, pkg, installed, candidate, pattern, lc.as_deref()) {
                continue;
            }
        }

        let flags = candidate
            .or(installed)
            .map(|v| cache.db.version(v).flags())
            .unwrap_or_default();

        // System-update meta-packages that are merely available do not
        // belong in the user listing.
        if flags.contains(PackageFlags::SYSTEM_UPDATE)
            && only_user
            && installed.is_none()
            && candidate.is_some()
        {
            continue;
        }

        response.string(Some(cache.name(pkg)));

        let broken = cache.now_broken(pkg) || cache.state(pkg) != InstState::NeedsNothing;
        response.int32(broken as i32);

        encode_version_info(response, cache, installed, true, false, lc.as_deref());

        // Offer the candidate only when it is new, newer, or a repair.
        let offer = candidate.filter(|&c| {
            installed.map_or(true, |i| {
                broken
                    || crate::db::version::compare(
                        &cache.db.version(i).version,
                        &cache.db.version(c).version,
                    ) == std::cmp::Ordering::Less
            })
        });
        encode_version_info(response, cache, offer, false, true, lc.as_deref());

        response.int32(flags.bits());
    }

    if show_magic_sys {
        // The artificial package standing for all system packages.
        response.string(Some(MAGIC_SYS));
        response.int32(0);

        response.string(Some(""));
        response.int64(1000);
        response.string(Some("user/system"));
        response.string(Some("Operating System"));
        response.string(Some("All system packages"));
        response.string(None);

        response.string(Some(""));
        response.string(Some("user/system"));
        response.string(Some("Operating System"));
        response.string(Some("Updates to all system packages"));
        response.string(None);

        response.int32(0);
    }
}

fn matches_pattern(
    cache: &Cache,
    pkg: PackageId,
    installed: Option<VersionId>,
    candidate: Option<VersionId>,
    pattern: &str,
    lc: Option<&str>,
) -> bool {
    let words: Vec<String> = pattern.split(' ').map(str::to_lowercase).collect();

    let name = cache.name(pkg).to_lowercase();
    if words.iter().all(|w| name.contains(w)) {
        return true;
    }

    [installed, candidate].into_iter().flatten().any(|v| {
        let description = cache.db.version(v).description(false, lc).to_lowercase();
        words.iter().all(|w| description.contains(w))
    })
}

fn installable_status_one(cache: &Cache, pkg: PackageId) -> Status {
    let Some(version) = cache.desired(pkg) else {
        return Status::Unable;
    };

    let mut some_missing = false;
    let mut some_conflicting = false;

    for clause in &cache.db.version(version).depends {
        if cache.clause_holds(pkg, clause, crate::cache::World::Desired) {
            continue;
        }
        match clause.kind {
            DepKind::PreDepends | DepKind::Depends => some_missing = true,
            DepKind::Conflicts | DepKind::Breaks => some_conflicting = true,
            _ => {}
        }
    }

    if some_missing {
        Status::Missing
    } else if some_conflicting {
        Status::Conflicting
    } else {
        Status::Unable
    }
}

fn installable_verdict(cache: &Cache) -> Status {
    let mut status = Status::Unable;

    for pkg in cache.db.package_ids() {
        if !cache.inst_broken(pkg) {
            continue;
        }
        // A related broken package gets a closer look; an unrelated one
        // newly broken counts as a conflict.
        if cache.extra[pkg].related {
            status = status.max(installable_status_one(cache, pkg));
        } else if !cache.now_broken(pkg) {
            status = status.max(Status::Conflicting);
        }
    }

    status
}

fn removable_verdict(cache: &Cache) -> Status {
    if cache.db.package_ids().any(|pkg| cache.inst_broken(pkg)) {
        Status::Needed
    } else {
        Status::Unable
    }
}

fn get_package_info(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let package = request.string().unwrap_or_default();
    let only_installable_info = request.int32() != 0;

    let mut installable_status = Status::Unknown;
    let mut download_size: i64 = 0;
    let mut install_user_size_delta: i64 = 0;
    let mut required_free_space: i64 = 0;
    let mut install_flags = PackageFlags::empty();
    let mut removable_status = Status::Unknown;
    let mut remove_user_size_delta: i64 = 0;

    if worker.ensure_cache(monitor) {
        let options = worker.options;
        let domains = worker.domains.clone();
        if let Some(cache) = worker.cache.as_mut() {
            // Simulate the install.
            planner::mark_named_for_install(cache, &options, &package);

            installable_status = if cache.any_newly_or_related_broken() {
                installable_verdict(cache)
            } else {
                Status::Able
            };

            // An upgrade suppressed by the domain guard is not
            // installable either, and the client should not offer it.
            if !options.allow_wrong_domains && installable_status == Status::Able {
                if let Some(pkg) = cache.db.find_package(&package) {
                    if cache.is_keep(pkg)
                        && policy::blocked_by_domain(
                            &cache.db,
                            pkg,
                            &cache.extra,
                            &cache.index_domains,
                            &domains,
                        )
                    {
                        installable_status = Status::Unable;
                    }
                }
            }

            download_size = cache.deb_size();
            install_user_size_delta = cache.usr_size_delta();
            install_flags = cache.related_flags();
            required_free_space = cache.required_free_space();

            if !only_installable_info {
                // Simulate the removal.
                if package == MAGIC_SYS {
                    removable_status = Status::SystemUpdateUnremovable;
                } else {
                    if let Some(pkg) = cache.db.find_package(&package) {
                        planner::mark_for_remove(cache, &options, pkg);
                    }

                    let deletes_system_update = cache.db.package_ids().any(|pkg| {
                        cache.is_delete(pkg)
                            && cache.current(pkg).is_some_and(|v| {
                                cache
                                    .db
                                    .version(v)
                                    .flags()
                                    .contains(PackageFlags::SYSTEM_UPDATE)
                            })
                    });

                    removable_status = if deletes_system_update {
                        Status::SystemUpdateUnremovable
                    } else if cache.any_newly_or_related_broken() {
                        removable_verdict(cache)
                    } else {
                        Status::Able
                    };
                    remove_user_size_delta = cache.usr_size_delta();
                }
            }
        }
    }

    response.int32(installable_status as i32);
    response.int64(download_size);
    response.int64(install_user_size_delta);
    response.int64(required_free_space);
    response.int32(install_flags.bits());
    response.int32(removable_status as i32);
    response.int64(remove_user_size_delta);
}

fn get_package_details(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let package = request.string().unwrap_or_default();
    let version = request.string();
    let summary_kind = request.int32();

    if !worker.ensure_cache(monitor) {
        response.string(None);
        response.string(None);
        response.int32(0);
        response.int32(SumType::End as i32);
        return;
    }

    let options = worker.options;
    let lc = worker.lc_messages.clone();
    let Some(cache) = worker.cache.as_mut() else {
        return;
    };

    let found = cache.db.find_package(&package).and_then(|pkg| {
        cache
            .db
            .package(pkg)
            .versions
            .iter()
            .copied()
            .find(|&v| match &version {
                Some(wanted) => &cache.db.version(v).version == wanted,
                None => true,
            })
            .map(|v| (pkg, v))
    });

    let Some((pkg, ver)) = found else {
        response.string(None);
        response.string(None);
        response.int32(0);
        response.int32(SumType::End as i32);
        return;
    };

    {
        let shown = cache.db.version(ver);
        response.string(shown.maintainer());
        let upgrade = summary_kind == 1 && cache.is_installed(pkg);
        response.string(Some(shown.description(upgrade, lc.as_deref()).as_str()));

        // Dependency listing: one entry per clause.
        for clause in &shown.depends {
            let code = match clause.kind {
                DepKind::Conflicts | DepKind::Breaks => 2,
                _ => 1,
            };
            let rendered = clause
                .alternatives
                .iter()
                .map(|alt| match &alt.constraint {
                    Some((_, reference)) => format!("{} ({reference})", alt.name),
                    None => alt.name.clone(),
                })
                .collect::<Vec<_>>()
                .join(" | ");
            response.int32(code);
            response.string(Some(rendered.as_str()));
        }
        response.int32(0);
    }

    // Operation summary by simulation.
    match summary_kind {
        1 => {
            planner::mark_named_for_install(cache, &options, &package);
            encode_install_summary(cache, response);
        }
        2 => {
            planner::mark_for_remove(cache, &options, pkg);
            encode_remove_summary(cache, response);
        }
        _ => response.int32(SumType::End as i32),
    }
}

fn encode_install_summary(cache: &Cache, response: &mut Encoder) {
    for pkg in cache.db.package_ids() {
        match cache.mode(pkg) {
            Mode::Install => {
                let code = if cache.is_installed(pkg) {
                    SumType::Upgrading
                } else {
                    SumType::Installing
                };
                if let Some(candidate) = cache.candidate(pkg) {
                    let entry =
                        format!("{} {}", cache.name(pkg), cache.db.version(candidate).version);
                    response.int32(code as i32);
                    response.string(Some(entry.as_str()));
                }
            }
            Mode::Delete => {
                response.int32(SumType::Removing as i32);
                response.string(Some(cache.name(pkg)));
            }
            Mode::Keep => {}
        }
    }

    // Unsatisfiable pieces of the plan.
    for pkg in cache.db.package_ids() {
        if !cache.inst_broken(pkg) || !cache.extra[pkg].related {
            continue;
        }
        let Some(version) = cache.desired(pkg) else {
            continue;
        };
        for clause in &cache.db.version(version).depends {
            if cache.clause_holds(pkg, clause, crate::cache::World::Desired) {
                continue;
            }
            let code = match clause.kind {
                DepKind::Conflicts | DepKind::Breaks => SumType::Conflicting,
                _ => SumType::Missing,
            };
            for alternative in &clause.alternatives {
                response.int32(code as i32);
                response.string(Some(alternative.name.as_str()));
            }
        }
    }

    response.int32(SumType::End as i32);
}

fn encode_remove_summary(cache: &Cache, response: &mut Encoder) {
    for pkg in cache.db.package_ids() {
        if cache.is_delete(pkg) {
            response.int32(SumType::Removing as i32);
            response.string(Some(cache.name(pkg)));
        }
    }

    for pkg in cache.db.package_ids() {
        if cache.inst_broken(pkg) {
            response.int32(SumType::NeededBy as i32);
            response.string(Some(cache.name(pkg)));
        }
    }

    response.int32(SumType::End as i32);
}

/// Shared by the backend command and the command line mode.
pub fn check_updates(
    worker: &mut Worker,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) -> ResultCode {
    let installation = worker.installation.clone();

    let mut catalogues = catalogue::read_catalogues(&installation);
    catalogue::reset_catalogue_errors(&installation, &mut catalogues);

    // Regenerate the sources list before refreshing.
    if let Err(e) = catalogue::update_sources_list(&installation, &catalogues) {
        warn!("can't update sources list: {e}");
    }

    let sources = catalogue::active_sources(&installation);
    let code = crate::refresh::update_package_lists(
        &installation,
        &mut catalogues,
        &sources,
        worker.options.break_locks,
        monitor,
    );

    if code.is_success() {
        worker.cache_init(monitor);
    }

    catalogue::save_failed_catalogues(&installation, &catalogues);

    response.xexp(Some(&catalogues));
    response.int32(code as i32);

    code
}

fn get_catalogues(worker: &mut Worker, response: &mut Encoder) {
    let installation = &worker.installation;

    let mut catalogues = if installation.catalogues_path().exists() {
        let stored = catalogue::read_catalogues(installation);
        let mut mapped = stored.map_children(|child| {
            if child.is("catalogue") {
                Some(catalogue::without_errors(child))
            } else {
                Some(child.clone())
            }
        });
        catalogue::merge_catalogues_with_errors(installation, &mut mapped);
        mapped
    } else {
        // No configuration yet: persist an empty one.
        let catalogues = catalogue::read_catalogues(installation);
        if let Err(e) = catalogue::write_user_catalogues(installation, &catalogues) {
            warn!("can't write catalogues: {e}");
        }
        catalogues
    };

    catalogue::append_system_sources(installation, &mut catalogues);
    response.xexp(Some(&catalogues));
}

fn set_catalogues(worker: &mut Worker, request: &mut Decoder<'_>, response: &mut Encoder) {
    let Some(mut catalogues) = request.xexp() else {
        response.int32(0);
        return;
    };
    catalogues.adel("source");

    // Keep the failure report consistent with the new configuration.
    catalogue::save_failed_catalogues(&worker.installation, &catalogues);

    let stripped = catalogues.map_children(|child| {
        if child.is("catalogue") {
            Some(catalogue::without_errors(child))
        } else {
            Some(child.clone())
        }
    });

    let success = catalogue::update_sources_list(&worker.installation, &stripped).is_ok();
    worker.need_cache_init();
    response.int32(success as i32);
}

fn add_temp_catalogues(worker: &mut Worker, request: &mut Decoder<'_>, response: &mut Encoder) {
    let Some(mut temp) = request.xexp() else {
        response.int32(0);
        return;
    };
    temp.adel("source");

    let success = catalogue::add_temp_sources_list(&worker.installation, &temp).is_ok();
    response.int32(success as i32);
}

fn rm_temp_catalogues(worker: &mut Worker, response: &mut Encoder) {
    catalogue::clean_temp_catalogues(&worker.installation);
    response.int32(1);
}

fn install_check(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let package = request.string().unwrap_or_default();

    let mut found = false;
    let mut code = ResultCode::Failure;

    if worker.ensure_cache(monitor) {
        let options = worker.options;
        if let Some(cache) = worker.cache.as_mut() {
            found = planner::mark_named_for_install(cache, &options, &package);
        }
        code = operation::operation(worker, response, monitor, &Params::check());
    }

    response.int32((found && code == ResultCode::Success) as i32);
}

fn download_package(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let package = request.string().unwrap_or_default();

    let mut code = ResultCode::OutOfSpace;
    let mut alt_download_root: Option<String> = None;

    let internal = environment::internal_mmc_mountpoint();
    let removable = environment::removable_mmc_mountpoint();

    if worker.ensure_cache(monitor) {
        let options = worker.options;
        let marked = match worker.cache.as_mut() {
            Some(cache) => planner::mark_named_for_install(cache, &options, &package),
            None => false,
        };

        if marked {
            let mut try_root = |worker: &mut Worker, root: Option<&str>| {
                operation::operation(
                    worker,
                    response,
                    monitor,
                    &Params::download(root.map(PathBuf::from)),
                )
            };

            if options.download_to_mmc && rescue::path_is_writable(internal.as_ref()) {
                alt_download_root = Some(internal.clone());
                code = try_root(worker, Some(&internal));
            }

            if options.download_to_mmc
                && code == ResultCode::OutOfSpace
                && rescue::path_is_writable(removable.as_ref())
            {
                alt_download_root = Some(removable.clone());
                code = try_root(worker, Some(&removable));
            }

            if code == ResultCode::OutOfSpace
                && rescue::path_is_writable(environment::HOME_MOUNTPOINT.as_ref())
            {
                alt_download_root = Some(environment::HOME_MOUNTPOINT.to_owned());
                code = try_root(worker, Some(environment::HOME_MOUNTPOINT));
            }

            // Default location, also the bailout when cards ran out of
            // room.
            if !options.download_to_mmc || code == ResultCode::OutOfSpace {
                alt_download_root = None;
                code = try_root(worker, None);
            }
        } else {
            code = ResultCode::PackagesNotFound;
        }
    }

    response.int32(code as i32);
    response.int64(worker.download_size);
    response.string(alt_download_root.as_deref());

    worker.download_size = 0;
}

fn install_package(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let package = request.string().unwrap_or_default();
    let alt_download_root = request.string();

    let mut code = ResultCode::Failure;

    if worker.ensure_cache(monitor) {
        let options = worker.options;
        let marked = match worker.cache.as_mut() {
            Some(cache) => planner::mark_named_for_install(cache, &options, &package),
            None => false,
        };

        if marked {
            let is_ssu = worker.is_ssu(&package);

            // A system update diverts docs off the rootfs and raises the
            // rootfs compression while it runs.
            let tmpfs = if is_ssu {
                let tmpfs = rescue::choose_tmpfs_for_docs();
                rescue::bindmount_docs(tmpfs.as_deref());
                rescue::rootfs_set_compression(true);
                tmpfs
            } else {
                None
            };

            std::env::set_var(environment::PKGNAME_ENVVAR, &package);
            journal::save(&worker.installation, &package, alt_download_root.as_deref());

            code = operation::operation(
                worker,
                response,
                monitor,
                &Params::install(alt_download_root.map(PathBuf::from)),
            );

            // The journal survives a failed system update so the rescue
            // path can retry it after the reboot.
            if code == ResultCode::Success || !is_ssu {
                journal::erase(&worker.installation);
            }

            std::env::remove_var(environment::PKGNAME_ENVVAR);

            if is_ssu {
                rescue::bindumount_docs(tmpfs.as_deref());
                rescue::rootfs_set_compression(false);
            }
        } else {
            code = ResultCode::PackagesNotFound;
        }
    }

    worker.need_cache_init();
    response.int32(code as i32);
}

fn remove_check(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let package = request.string().unwrap_or_default();

    if worker.ensure_cache(monitor) {
        let options = worker.options;
        if let Some(cache) = worker.cache.as_mut() {
            if let Some(pkg) = cache.db.find_package(&package) {
                planner::mark_for_remove(cache, &options, pkg);

                for pkg in cache.db.package_ids() {
                    if cache.is_delete(pkg) {
                        response.string(Some(cache.name(pkg)));
                    }
                }
            }
        }
    }

    response.string(None);
}

fn remove_package(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let package = request.string().unwrap_or_default();

    let mut code = ResultCode::Failure;

    if worker.ensure_cache(monitor) {
        let options = worker.options;
        let found = match worker.cache.as_mut() {
            Some(cache) => match cache.db.find_package(&package) {
                Some(pkg) => {
                    planner::mark_for_remove(cache, &options, pkg);
                    true
                }
                None => false,
            },
            None => false,
        };

        if found {
            code = operation::operation(worker, response, monitor, &Params::install(None));
        }
    }

    worker.need_cache_init();
    response.int32((code == ResultCode::Success) as i32);
}

fn clean(worker: &mut Worker, response: &mut Encoder) {
    let archives = worker.installation.archives_dir();
    let mut success = true;

    // Locking can fail for lack of space; clean anyway, freeing flash is
    // critical then.
    let lock = crate::lock::lock_directory(archives.join("lock"), worker.options.break_locks);
    if let Err(e) = &lock {
        warn!("unable to lock the download directory, cleaning anyway: {e}");
    }

    for dir in [archives.clone(), archives.join("partial")] {
        if dir.exists() {
            if let Err(e) = Fetcher::clean(&dir) {
                warn!("can't clean {dir:?}: {e}");
                success = false;
            }
        }
    }

    nix::unistd::sync();

    response.int32(success as i32);

    // Chances are good the cache can be built now that space is free.
    if worker.cache.is_none() {
        worker.need_cache_init();
    }
}

fn get_file_details(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let only_user = request.int32() != 0;
    let filename = request.string().unwrap_or_default();

    let stanza = deploy::deb_control(filename.as_ref());
    let Some(stanza) = stanza else {
        encode_file_details_header(response, None, None, worker.lc_messages.as_deref());
        response.int32(Status::Unable as i32);
        response.string(None);
        response.string(None);
        response.string(None);
        return;
    };

    worker.ensure_cache(monitor);
    let lc = worker.lc_messages.clone();

    let installed_version = worker.cache.as_ref().and_then(|cache| {
        let pkg = cache.db.find_package(stanza.get("Package").unwrap_or_default())?;
        let current = cache.current(pkg)?;
        Some(cache.db.version(current).version.clone())
    });

    encode_file_details_header(
        response,
        Some(&stanza),
        installed_version.as_deref(),
        lc.as_deref(),
    );

    // Installability of the file: user section required (if asked), all
    // dependencies present or at least available.
    let user = stanza
        .get("Section")
        .is_some_and(|s| {
            s.starts_with(environment::USER_SECTION_PREFIX)
                || s.starts_with(environment::OLD_USER_SECTION_PREFIX)
        });

    let mut missing: Vec<String> = vec![];
    if let Some(cache) = worker.cache.as_ref() {
        if let Some(depends) = stanza.get("Depends") {
            for clause in parse_clauses(DepKind::Depends, depends) {
                let satisfied = cache.clause_satisfied(&clause, crate::cache::World::Current)
                    || cache.clause_satisfiable_by_candidates(&clause);
                if !satisfied {
                    missing.push(
                        clause
                            .alternatives
                            .iter()
                            .map(|alt| alt.name.clone())
                            .collect::<Vec<_>>()
                            .join(" | "),
                    );
                }
            }
        }
    }

    let status = if only_user && !user {
        Status::Unable
    } else if !missing.is_empty() {
        Status::Missing
    } else {
        Status::Able
    };
    response.int32(status as i32);

    response.string(Some(
        stanza.get_localized("Description", lc.as_deref()).unwrap_or_default(),
    ));
    response.string(stanza.get("Maemo-Icon-26"));

    for dep in &missing {
        response.string(Some(dep.as_str()));
    }
    response.string(None);
}

fn encode_file_details_header(
    response: &mut Encoder,
    stanza: Option<&Stanza>,
    installed_version: Option<&str>,
    lc: Option<&str>,
) {
    let get = |field: &str| stanza.and_then(|s| s.get(field));

    response.string(get("Package"));
    response.string(stanza.and_then(|s| s.get_localized("Maemo-Display-Name", lc)));
    response.string(installed_version);
    response.int64(
        1024 * stanza
            .map(|s| s.get_int("Installed-Size", 0))
            .unwrap_or(0),
    );
    response.string(get("Version"));
    response.string(get("Maintainer"));
    response.string(get("Section"));
}

fn install_file(worker: &mut Worker, request: &mut Decoder<'_>, response: &mut Encoder) {
    let filename = request.string().unwrap_or_default();

    let success = deploy::install_file(&worker.installation, filename.as_ref()).is_ok();

    worker.need_cache_init();
    response.int32(success as i32);
}

fn save_backup_data(worker: &mut Worker, monitor: &mut dyn Monitor) {
    catalogue::backup_catalogues(&worker.installation);

    if !worker.ensure_cache(monitor) {
        return;
    }
    let Some(cache) = worker.cache.as_ref() else {
        return;
    };

    let mut packages = Xexp::list("backup");
    for pkg in cache.db.package_ids() {
        let Some(current) = cache.current(pkg) else {
            continue;
        };
        if cache.db.version(current).is_user() {
            packages.append(Xexp::text("pkg", cache.name(pkg)));
        }
    }

    if let Err(e) = xexp::write_file(worker.installation.backup_packages_path(), &packages) {
        warn!("can't save backup data: {e}");
    }
}

fn get_system_update_packages(
    worker: &mut Worker,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    if worker.ensure_cache(monitor) {
        for name in worker.system_update_packages() {
            response.string(Some(name.as_str()));
        }
    }
    response.string(None);
}

fn set_env(request: &mut Decoder<'_>) {
    let http_proxy = request.string();
    let https_proxy = request.string();
    let internal_mmc = request.string();
    let removable_mmc = request.string();

    match http_proxy {
        Some(proxy) => std::env::set_var("http_proxy", proxy),
        None => std::env::remove_var("http_proxy"),
    }
    match https_proxy {
        Some(proxy) => std::env::set_var("https_proxy", proxy),
        None => std::env::remove_var("https_proxy"),
    }
    if let Some(internal) = internal_mmc {
        std::env::set_var("INTERNAL_MMC_MOUNTPOINT", internal);
    }
    if let Some(removable) = removable_mmc {
        std::env::set_var("REMOVABLE_MMC_MOUNTPOINT", removable);
    }
}

fn third_party_policy_check(
    worker: &mut Worker,
    request: &mut Decoder<'_>,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
) {
    let package = request.string().unwrap_or_default();
    let version = request.string();

    // 1 = compliant; 0 = a third-party package meddling with the system
    // update set.
    let mut compliant = 1;

    if worker.ensure_cache(monitor) {
        let ssu_packages = worker.system_update_packages();
        if let Some(cache) = worker.cache.as_ref() {
            let found = cache.db.find_package(&package).and_then(|pkg| {
                cache
                    .db
                    .package(pkg)
                    .versions
                    .iter()
                    .copied()
                    .find(|&v| match &version {
                        Some(wanted) => &cache.db.version(v).version == wanted,
                        None => cache.candidate(pkg) == Some(v),
                    })
            });

            if let Some(ver) = found {
                let version = cache.db.version(ver);
                let pkg = version.package;
                let certified = cache.extra[pkg]
                    .cur_domain
                    .is_some_and(|domain| worker.domains.get(domain).certified);

                if version.is_user() && !certified {
                    let touches_ssu = version.depends.iter().any(|clause| {
                        matches!(
                            clause.kind,
                            DepKind::PreDepends
                                | DepKind::Depends
                                | DepKind::Conflicts
                                | DepKind::Breaks
                        ) && clause
                            .alternatives
                            .iter()
                            .any(|alt| ssu_packages.contains(&alt.name))
                    });
                    if touches_ssu {
                        info!("{package} manipulates the system update set");
                        compliant = 0;
                    }
                }
            }
        }
    }

    response.int32(compliant);
}

fn autoremove(worker: &mut Worker, response: &mut Encoder, monitor: &mut dyn Monitor) {
    let mut ok = false;

    if worker.ensure_cache(monitor) {
        if let Some(cache) = worker.cache.as_mut() {
            mark_garbage(cache);

            if cache.db.package_ids().any(|pkg| cache.inst_broken(pkg)) {
                warn!("autoremove would break packages, refusing");
                response.int32(0);
                return;
            }
            ok = true;
        }

        if ok {
            let code = operation::operation(worker, response, monitor, &Params::install(None));
            ok = code == ResultCode::Success;
        }
    }

    worker.need_cache_init();
    response.int32(ok as i32);
}

/// Mark auto-installed packages nothing reachable depends on.
fn mark_garbage(cache: &mut Cache) {
    let count = cache.db.packages.len();
    let mut reachable = vec![false; count];
    let mut stack: Vec<PackageId> = cache
        .db
        .package_ids()
        .filter(|&pkg| cache.current(pkg).is_some() && !cache.marks[pkg].auto)
        .collect();

    while let Some(pkg) = stack.pop() {
        if reachable[pkg] {
            continue;
        }
        reachable[pkg] = true;

        let Some(current) = cache.current(pkg) else {
            continue;
        };
        for clause in &cache.db.version(current).depends {
            if !clause.kind.is_critical() {
                continue;
            }
            for alternative in &clause.alternatives {
                if let Some(target) = cache.db.find_package(&alternative.name) {
                    if cache.current(target).is_some() && !reachable[target] {
                        stack.push(target);
                    }
                }
                for &provider in cache.db.providers(&alternative.name) {
                    let owner = cache.db.version(provider).package;
                    if cache.current(owner) == Some(provider) && !reachable[owner] {
                        stack.push(owner);
                    }
                }
            }
        }
    }

    for pkg in 0..count {
        if cache.current(pkg).is_some() && !reachable[pkg] {
            info!("autoremove: {}", cache.name(pkg));
            cache.mark_delete(pkg);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        options::Options, status::NullMonitor, test_fixtures::FixtureBuilder, worker::Worker,
    };

    fn worker_for(fixture: &crate::test_fixtures::Fixture) -> Worker {
        let mut worker = Worker::new(fixture.installation.clone(), Options::default());
        worker.domains = fixture.domains.clone();
        worker.cache = Some(fixture.open_cache());
        worker
    }

    fn run(worker: &mut Worker, command: Command, request: &[u8]) -> Encoder {
        let mut decoder = Decoder::new(request);
        let mut response = Encoder::new();
        let flow = dispatch(
            worker,
            command,
            &mut decoder,
            &mut response,
            &mut NullMonitor,
        );
        assert!(matches!(flow, Flow::Continue));
        response
    }

    #[test]
    fn package_list_roundtrip() {
        let fixture = FixtureBuilder::new()
            .installed_with("browser", "1.0", &[], &[("Section", "user/network")])
            .available_with("browser", "2.0", &[], &[("Section", "user/network")])
            .installed("plainlib", "1.0", &[])
            .build();
        let mut worker = worker_for(&fixture);

        let mut request = Encoder::new();
        request.int32(1); // only_user
        request.int32(0);
        request.int32(0);
        request.string(None);
        request.int32(1); // show magic:sys

        let response = run(&mut worker, Command::GetPackageList, request.as_slice());

        let mut dec = Decoder::new(response.as_slice());
        assert_eq!(dec.int32(), 1);

        // browser: name, broken, installed info, candidate info, flags.
        assert_eq!(dec.string().as_deref(), Some("browser"));
        assert_eq!(dec.int32(), 0);
        assert_eq!(dec.string().as_deref(), Some("1.0"));
        let _size = dec.int64();
        let _section = dec.string();
        let _pretty = dec.string();
        let _desc = dec.string();
        let _icon = dec.string();
        assert_eq!(dec.string().as_deref(), Some("2.0"));
        let _ = (dec.string(), dec.string(), dec.string(), dec.string());
        let _flags = dec.int32();

        // plainlib is not a user package; next is magic:sys.
        assert_eq!(dec.string().as_deref(), Some(MAGIC_SYS));
    }

    #[test]
    fn package_info_magic_sys_is_unremovable() {
        let fixture = FixtureBuilder::new()
            .installed("syslib", "1.0", &[])
            .available("syslib", "2.0", &[])
            .build();
        let mut worker = worker_for(&fixture);

        let mut request = Encoder::new();
        request.string(Some(MAGIC_SYS));
        request.int32(0);

        let response = run(&mut worker, Command::GetPackageInfo, request.as_slice());

        let mut dec = Decoder::new(response.as_slice());
        let installable = dec.int32();
        let download_size = dec.int64();
        let _install_delta = dec.int64();
        let _required = dec.int64();
        let _flags = dec.int32();
        let removable = dec.int32();
        let _remove_delta = dec.int64();

        assert_eq!(installable, Status::Able as i32);
        assert_eq!(download_size, 1000);
        assert_eq!(removable, Status::SystemUpdateUnremovable as i32);
    }

    #[test]
    fn remove_check_lists_victims() {
        let fixture = FixtureBuilder::new()
            .installed_with("app", "1.0", &["helperlib"], &[("Section", "user/apps")])
            .installed("helperlib", "1.0", &[])
            .build();
        let mut worker = worker_for(&fixture);
        {
            let cache = worker.cache.as_mut().unwrap();
            let helperlib = cache.db.find_package("helperlib").unwrap();
            cache.extra[helperlib].autoinst = true;
            cache.marks[helperlib].auto = true;
        }

        let mut request = Encoder::new();
        request.string(Some("app"));

        let response = run(&mut worker, Command::RemoveCheck, request.as_slice());

        let mut dec = Decoder::new(response.as_slice());
        let mut names = vec![];
        while let Some(name) = dec.string() {
            names.push(name);
        }
        names.sort();
        assert_eq!(names, vec!["app".to_owned(), "helperlib".to_owned()]);
    }

    #[test]
    fn zero_length_payload_yields_well_formed_replies() {
        let fixture = FixtureBuilder::new().build();
        let mut worker = worker_for(&fixture);

        // NOOP: empty reply.
        let response = run(&mut worker, Command::Noop, &[]);
        assert!(response.is_empty());

        // Mutating commands still answer with their reply shape.
        let response = run(&mut worker, Command::RemovePackage, &[]);
        let mut dec = Decoder::new(response.as_slice());
        assert_eq!(dec.int32(), 0);

        let response = run(&mut worker, Command::GetPackageInfo, &[]);
        let mut dec = Decoder::new(response.as_slice());
        let _ = dec.int32();
        assert!(!dec.corrupted());
    }

    #[test]
    fn set_and_rm_temp_catalogues() {
        let fixture = FixtureBuilder::new().build();
        let mut worker = worker_for(&fixture);

        let mut temp = Xexp::list("catalogues");
        let mut cat = Xexp::list("catalogue");
        cat.append(Xexp::text("uri", "http://temp.example.com"));
        cat.append(Xexp::text("dist", "stable"));
        cat.append(Xexp::text("components", "main"));
        temp.append(cat);

        let mut request = Encoder::new();
        request.xexp(Some(&temp));

        let response = run(&mut worker, Command::AddTempCatalogues, request.as_slice());
        let mut dec = Decoder::new(response.as_slice());
        assert_eq!(dec.int32(), 1);
        assert!(worker.installation.temp_catalogues_path().exists());
        assert!(worker.installation.temp_sources_list_path().exists());

        let response = run(&mut worker, Command::RmTempCatalogues, &[]);
        let mut dec = Decoder::new(response.as_slice());
        assert_eq!(dec.int32(), 1);
        assert!(!worker.installation.temp_catalogues_path().exists());
    }

    #[test]
    fn garbage_marking_spares_reachable_packages() {
        let fixture = FixtureBuilder::new()
            .installed_with("app", "1.0", &["usedlib"], &[("Section", "user/apps")])
            .installed("usedlib", "1.0", &[])
            .installed("orphanlib", "1.0", &[])
            .build();
        let mut worker = worker_for(&fixture);

        let cache = worker.cache.as_mut().unwrap();
        for name in ["usedlib", "orphanlib"] {
            let pkg = cache.db.find_package(name).unwrap();
            cache.marks[pkg].auto = true;
        }

        mark_garbage(cache);

        let usedlib = cache.db.find_package("usedlib").unwrap();
        let orphanlib = cache.db.find_package("orphanlib").unwrap();
        assert_eq!(cache.mode(usedlib), Mode::Keep);
        assert_eq!(cache.mode(orphanlib), Mode::Delete);
    }
}
