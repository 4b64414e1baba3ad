// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The operation executor: check → download → install.
//!
//! One driver serves `INSTALL_CHECK`, `DOWNLOAD_PACKAGE`,
//! `INSTALL_PACKAGE`, `REMOVE_PACKAGE` and the rescue path, switching on
//! its parameters. Downloads enforce free space first and verify every
//! archive checksum before dpkg runs; cancellation is honored between
//! fetch pulses and ignored once the install begins.

use std::{collections::HashMap, fs, path::PathBuf};

use log::{info, warn};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::{
    cache::{policy, Cache},
    db::{InstState, PackageId, VersionId},
    deploy,
    domain::Domains,
    environment::{self, STATUS_MIN_CHANGE_DOWNLOAD},
    fetch::{Fetcher, Item, Outcome, Pulse},
    installation::Installation,
    lock,
    protocol::{Encoder, ResultCode, TrustCode},
    status::Monitor,
    worker::Worker,
};

#[derive(Debug, Clone, Default)]
pub struct Params {
    pub check_only: bool,
    pub download_only: bool,
    pub allow_download: bool,
    pub alt_download_root: Option<PathBuf>,
}

impl Params {
    pub fn check() -> Self {
        Self {
            check_only: true,
            allow_download: true,
            ..Default::default()
        }
    }

    pub fn download(alt_download_root: Option<PathBuf>) -> Self {
        Self {
            download_only: true,
            allow_download: true,
            alt_download_root,
            ..Default::default()
        }
    }

    pub fn install(alt_download_root: Option<PathBuf>) -> Self {
        Self {
            allow_download: true,
            alt_download_root,
            ..Default::default()
        }
    }

    /// The rescue path installs strictly from already-downloaded archives
    pub fn offline_install(download_root: Option<PathBuf>) -> Self {
        Self {
            allow_download: false,
            alt_download_root: download_root,
            ..Default::default()
        }
    }
}

/// Run the pending marks. `response` receives the trust summary and
/// upgrade list in check-only mode.
pub fn operation(
    worker: &mut Worker,
    response: &mut Encoder,
    monitor: &mut dyn Monitor,
    params: &Params,
) -> ResultCode {
    let Worker {
        installation,
        options,
        domains,
        cache,
        download_size,
        ..
    } = worker;

    let Some(cache) = cache.as_mut() else {
        return ResultCode::Failure;
    };

    if cache.del_count() == 0 && cache.inst_count() == 0 && cache.broken_count() == 0 {
        // Even with nothing to do, a check wants its (empty) summaries.
        if params.check_only {
            encode_trust_summary(cache, domains, options.allow_wrong_domains, response);
            encode_upgrades(cache, response);
        }
        return ResultCode::Success;
    }

    let archives = select_archives_dir(installation, params.alt_download_root.as_deref());

    let _lock = match lock::lock_directory(archives.join("lock"), options.break_locks) {
        Ok(lock) => lock,
        Err(e) => {
            warn!("unable to lock the download directory: {e}");
            return ResultCode::Failure;
        }
    };

    policy::reset_new_domains(&mut cache.extra);
    let order = cache.order_list();

    let (mut fetcher, archive_paths) =
        match populate_fetcher(cache, domains, &order, &archives, params.check_only) {
            Ok(population) => population,
            Err(pkg) => {
                warn!("no source to fetch {} from", cache.name(pkg));
                return ResultCode::Failure;
            }
        };

    if params.check_only {
        encode_trust_summary(cache, domains, options.allow_wrong_domains, response);
        encode_upgrades(cache, response);
        return ResultCode::Success;
    }

    policy::collect_new_domains(&mut cache.extra);

    let needed = fetcher.fetch_needed().saturating_sub(fetcher.partial_present()) as i64;
    if needed > 0 {
        if !params.allow_download {
            info!("would need to download, but it's not allowed");
            return ResultCode::PackagesNotFound;
        }

        *download_size = needed;

        if !enough_free_space(cache, &archives, needed) {
            return ResultCode::OutOfSpace;
        }

        // Report before the first pulse so a slow connection still shows
        // a progress dialog promptly.
        monitor.status(crate::protocol::StatusOp::Downloading, 0, needed as i32, 0);
    }

    let mut pulse = |already: u64, total: u64| {
        monitor.status(
            crate::protocol::StatusOp::Downloading,
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
        Outcome::Aborted => return ResultCode::Failure,
        Outcome::Complete => {}
        Outcome::SomeFailed => {
            let mut result = ResultCode::Success;
            for item in fetcher.failed_items() {
                let text = item.error.as_deref().unwrap_or("");
                result = result.combine(classify_fetch_error(text));
            }
            return match result {
                ResultCode::Failure | ResultCode::Success => ResultCode::DownloadFailed,
                other => other,
            };
        }
    }

    monitor.status(crate::protocol::StatusOp::Downloading, -1, 0, 0);

    if params.download_only {
        return ResultCode::Success;
    }

    monitor.status(crate::protocol::StatusOp::General, -1, 0, 0);

    if !check_downloaded_archives(cache, &archive_paths) {
        return ResultCode::PackageCorrupted;
    }

    // Everything on disk before dpkg starts; an interrupted install can
    // then retry from the archives.
    nix::unistd::sync();

    let mut plan = deploy::Plan::default();
    for &pkg in &order {
        if cache.is_delete(pkg) {
            plan.remove.push(cache.name(pkg).to_owned());
        } else if let Some((_, path)) = archive_paths.iter().find(|(p, _)| p.0 == pkg) {
            plan.unpack.push(path.clone());
        }
    }

    let deployed = deploy::run(&plan, installation, monitor);

    if let Err(e) = cache.save_extra_info(domains, installation) {
        warn!("can't save extra info: {e}");
    }

    match deployed {
        Ok(()) => ResultCode::Success,
        Err(e) => {
            warn!("install failed: {e}");
            ResultCode::Failure
        }
    }
}

/// Free space at `path`, after syncing so the number is honest
pub fn get_free_space(path: &std::path::Path) -> i64 {
    nix::unistd::sync();

    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let free = stat.blocks_available() as i64 * stat.fragment_size() as i64;
            info!("free space ({}) = {free}", path.display());
            free
        }
        Err(_) => -1,
    }
}

fn select_archives_dir(
    installation: &Installation,
    alt_download_root: Option<&std::path::Path>,
) -> PathBuf {
    let dir = match alt_download_root {
        None => installation.archives_dir(),
        Some(root) => Installation::alt_archives_dir(root),
    };

    match fs::create_dir_all(dir.join("partial")) {
        Ok(()) => dir,
        Err(e) => {
            // Keep working with the default location.
            warn!("failed using {dir:?} to download packages: {e}");
            let fallback = installation.archives_dir();
            let _ = fs::create_dir_all(fallback.join("partial"));
            fallback
        }
    }
}

type ArchivePaths = Vec<((PackageId, VersionId), PathBuf)>;

/// Fill the fetcher from the order list, computing per-version trust and
/// masking version files that lost the comparison.
fn populate_fetcher(
    cache: &mut Cache,
    domains: &Domains,
    order: &[PackageId],
    archives: &std::path::Path,
    check_only: bool,
) -> Result<(Fetcher, ArchivePaths), PackageId> {
    let mut fetcher = Fetcher::new();
    let mut paths = Vec::new();

    for &pkg in order {
        if cache.is_delete(pkg) {
            continue;
        }
        if cache.state(pkg) == InstState::NeedsConfigure && cache.is_keep(pkg) {
            continue;
        }
        let Some(ver) = cache.version_to_fetch(pkg) else {
            continue;
        };

        // Keep only the most trusted locations as acquisition sources.
        let new_install = cache.is_new_install(pkg);
        let locations = cache.db.versions[ver].locations.clone();
        let mut best = 0;
        let mut levels: HashMap<usize, Option<i64>> = HashMap::new();
        for (slot, location) in locations.iter().enumerate() {
            if cache.db.index(location.index).not_source {
                continue;
            }
            let level = policy::index_trust_level_for_package(
                &mut cache.extra,
                pkg,
                cache.index_domains[location.index],
                new_install,
                domains,
            );
            if let Some(level) = level {
                best = best.max(level);
            }
            levels.insert(slot, level);
        }
        for (slot, level) in levels {
            if level != Some(best) {
                cache.db.versions[ver].locations[slot].masked = true;
            }
        }

        let version = cache.db.version(ver);
        let dest = archives.join(archive_file_name(
            cache.name(pkg),
            &version.version,
            &version.architecture,
        ));

        let source = version.source_location(&cache.db);
        match (source, &version.filename) {
            (Some(index), Some(filename)) => {
                let uri = format!(
                    "{}/{}",
                    cache.db.index(index).uri.trim_end_matches('/'),
                    filename
                );
                fetcher.add(Item::new(
                    uri,
                    &dest,
                    Some(version.download_size as u64),
                ));
                paths.push(((pkg, ver), dest));
            }
            _ => {
                // Nothing to fetch from; tolerable only when the archive
                // is already on disk or we are merely checking.
                if dest.exists() {
                    paths.push(((pkg, ver), dest));
                } else if !check_only {
                    return Err(pkg);
                }
            }
        }
    }

    Ok((fetcher, paths))
}

fn archive_file_name(name: &str, version: &str, architecture: &str) -> String {
    let version = version.replace(':', "%3a");
    format!("{name}_{version}_{architecture}.deb")
}

/// Classification of a fetch failure by its error text prefix
fn classify_fetch_error(text: &str) -> ResultCode {
    if text.starts_with("404") {
        ResultCode::PackagesNotFound
    } else if text.starts_with("Size mismatch") || text.starts_with("MD5Sum mismatch") {
        ResultCode::PackageCorrupted
    } else {
        ResultCode::Failure
    }
}

/// Is there room for the download (plus install extras when the archives
/// live on the rootfs)?
fn enough_free_space(cache: &Cache, archives: &std::path::Path, download_size: i64) -> bool {
    let free = get_free_space(archives);
    if free < 0 {
        warn!("couldn't determine free space in {archives:?}");
        return false;
    }

    let mut required = download_size;

    let dir = archives.to_string_lossy();
    let internal = environment::internal_mmc_mountpoint();
    let removable = environment::removable_mmc_mountpoint();
    let on_card = dir.contains(internal.as_str())
        || dir.contains(removable.as_str())
        || dir.contains(environment::HOME_MOUNTPOINT);

    if !on_card {
        required += cache.required_free_space();
    }

    if required > free {
        warn!("not enough free space in {archives:?}: {required} > {free}");
        return false;
    }

    true
}

/// Verify every downloaded archive against its strongest known digest.
/// Corrupted files are removed so a retry downloads them afresh.
fn check_downloaded_archives(cache: &Cache, paths: &ArchivePaths) -> bool {
    let mut ok = true;

    for ((_, ver), path) in paths {
        let version = cache.db.version(*ver);

        let matches = if let Some(expected) = &version.sha256 {
            digest_matches::<Sha256>(path, expected)
        } else if let Some(expected) = &version.sha1 {
            digest_matches::<Sha1>(path, expected)
        } else if let Some(expected) = &version.md5 {
            digest_matches::<Md5>(path, expected)
        } else {
            Some(true)
        };

        if matches != Some(true) {
            warn!("file {path:?} is corrupted");
            let _ = fs::remove_file(path);
            ok = false;
        }
    }

    ok
}

fn digest_matches<D: Digest>(path: &std::path::Path, expected: &str) -> Option<bool> {
    let data = fs::read(path).ok()?;
    let mut hasher = D::new();
    hasher.update(&data);
    let actual = hex::encode(hasher.finalize());
    Some(actual.eq_ignore_ascii_case(expected))
}

/// Trust summary entries: uncertified incoming packages, and upgrades
/// the domain guard refused. With wrong domains allowed the guard is
/// off, so no violations are reported either.
pub fn encode_trust_summary(
    cache: &Cache,
    domains: &Domains,
    allow_wrong_domains: bool,
    response: &mut Encoder,
) {
    for pkg in cache.db.package_ids() {
        if cache.marks[pkg].mode == crate::cache::Mode::Install {
            let new_domain = cache.extra[pkg].new_domain;
            if !domains.get(new_domain).certified {
                response.int32(TrustCode::NotCertified as i32);
                response.string(Some(cache.name(pkg)));
            }
            continue;
        }

        if allow_wrong_domains || !cache.extra[pkg].related || !cache.is_keep(pkg) {
            continue;
        }

        // The upgrade the client asked about exists but was suppressed
        // by the domain guard; name the package so the refusal can be
        // explained.
        if policy::blocked_by_domain(
            &cache.db,
            pkg,
            &cache.extra,
            &cache.index_domains,
            domains,
        ) {
            let cur_domain = cache.extra[pkg].cur_domain.unwrap_or(crate::domain::UNSIGNED);
            info!(
                "domain violation: {} (current domain {})",
                cache.name(pkg),
                domains.get(cur_domain).name
            );
            response.int32(TrustCode::DomainsViolated as i32);
            response.string(Some(cache.name(pkg)));
        }
    }

    response.int32(TrustCode::End as i32);
}

/// Upgrade list: every upgrading package with its candidate version
pub fn encode_upgrades(cache: &Cache, response: &mut Encoder) {
    for pkg in cache.db.package_ids() {
        if cache.is_upgrade(pkg) {
            if let Some(candidate) = cache.candidate(pkg) {
                response.string(Some(cache.name(pkg)));
                response.string(Some(cache.db.version(candidate).version.as_str()));
            }
        }
    }
    response.string(None);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        options::Options, planner, protocol::Decoder, status::NullMonitor,
        test_fixtures::FixtureBuilder,
    };

    fn run_check(worker: &mut Worker, package: &str) -> (ResultCode, Encoder) {
        let mut response = Encoder::new();
        let cache = worker.cache.as_mut().unwrap();
        assert!(planner::mark_named_for_install(
            cache,
            &Options::default(),
            package
        ));
        let code = operation(worker, &mut response, &mut NullMonitor, &Params::check());
        (code, response)
    }

    fn worker_for(fixture: &crate::test_fixtures::Fixture) -> Worker {
        let mut worker = Worker::new(fixture.installation.clone(), Options::default());
        worker.domains = fixture.domains.clone();
        worker.cache = Some(fixture.open_cache());
        worker
    }

    #[test]
    fn clean_install_check_has_no_violations() {
        let fixture = FixtureBuilder::new()
            .available_with("app", "1.0", &[], &[("Section", "user/apps")])
            .build();
        let mut worker = worker_for(&fixture);

        let (code, response) = run_check(&mut worker, "app");
        assert_eq!(code, ResultCode::Success);

        // Not certified (plain signed source), but no domain violation.
        let mut dec = Decoder::new(response.as_slice());
        let mut saw_violation = false;
        loop {
            let code = dec.int32();
            if code == TrustCode::End as i32 {
                break;
            }
            if code == TrustCode::DomainsViolated as i32 {
                saw_violation = true;
            }
            let _name = dec.string();
        }
        assert!(!saw_violation);
    }

    #[test]
    fn cross_domain_upgrade_is_flagged() {
        // Installed from a certified domain; the upgrade arrives from an
        // untrusted source.
        let fixture = FixtureBuilder::new()
            .domain(
                "vendor-certified",
                10,
                true,
                None,
                Some("certified.example.com"),
            )
            .installed_with("q", "1.0", &[], &[("Section", "user/apps")])
            .add_source("http://wild.example.com", false, None)
            .available_with("q", "2.0", &[], &[("Section", "user/apps")])
            .build();

        // Assign the installed domain by hand: the domain files normally
        // carry this across runs.
        let certified_file = fixture
            .installation
            .domain_file_path("vendor-certified");
        std::fs::write(&certified_file, "q\n").unwrap();

        let mut worker = worker_for(&fixture);
        worker.cache = Some(fixture.open_cache());

        {
            // Domain guard: the unsigned candidate is not eligible, so the
            // candidate stays the installed version.
            let cache = worker.cache.as_ref().unwrap();
            let q = cache.db.find_package("q").unwrap();
            let candidate = cache.candidate(q).unwrap();
            assert_eq!(cache.db.version(candidate).version, "1.0");
        }

        // The check names the package whose upgrade the guard refused.
        let (code, response) = run_check(&mut worker, "q");
        assert_eq!(code, ResultCode::Success);
        assert_eq!(violations(&response), vec!["q".to_owned()]);

        // With wrong domains allowed the upgrade proceeds quietly.
        worker.options.allow_wrong_domains = true;
        worker.cache = Some(fixture.open_cache_with(true));
        let (code, response) = run_check(&mut worker, "q");
        assert_eq!(code, ResultCode::Success);
        assert!(violations(&response).is_empty());
    }

    fn violations(response: &Encoder) -> Vec<String> {
        let mut dec = Decoder::new(response.as_slice());
        let mut violated = vec![];
        loop {
            let code = dec.int32();
            if code == TrustCode::End as i32 {
                break;
            }
            let name = dec.string().unwrap();
            if code == TrustCode::DomainsViolated as i32 {
                violated.push(name);
            }
        }
        violated
    }

    #[test]
    fn out_of_space_refuses_download() {
        let fixture = FixtureBuilder::new()
            .available_with(
                "bigapp",
                "1.0",
                &[],
                &[("Section", "user/apps"), ("Size", "9223372036854775")],
            )
            .build();
        let mut worker = worker_for(&fixture);

        {
            let cache = worker.cache.as_mut().unwrap();
            assert!(planner::mark_named_for_install(
                cache,
                &Options::default(),
                "bigapp"
            ));
        }

        let mut response = Encoder::new();
        let code = operation(
            &mut worker,
            &mut response,
            &mut NullMonitor,
            &Params::download(None),
        );
        assert_eq!(code, ResultCode::OutOfSpace);
        assert_eq!(worker.download_size, 9223372036854775);

        // Nothing was written under archives/.
        let archives = fixture.installation.archives_dir();
        let entries: Vec<_> = std::fs::read_dir(&archives)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "partial" && e.file_name() != "lock")
            .collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn offline_install_without_archives_reports_not_found() {
        let fixture = FixtureBuilder::new()
            .available_with("app", "1.0", &[], &[("Section", "user/apps")])
            .build();
        let mut worker = worker_for(&fixture);

        {
            let cache = worker.cache.as_mut().unwrap();
            assert!(planner::mark_named_for_install(
                cache,
                &Options::default(),
                "app"
            ));
        }

        let mut response = Encoder::new();
        let code = operation(
            &mut worker,
            &mut response,
            &mut NullMonitor,
            &Params::offline_install(None),
        );
        assert_eq!(code, ResultCode::PackagesNotFound);
    }

    #[test]
    fn fetch_error_classification() {
        assert_eq!(
            classify_fetch_error("404 Not Found"),
            ResultCode::PackagesNotFound
        );
        assert_eq!(
            classify_fetch_error("Size mismatch (expected 10, got 4)"),
            ResultCode::PackageCorrupted
        );
        assert_eq!(
            classify_fetch_error("MD5Sum mismatch"),
            ResultCode::PackageCorrupted
        );
        assert_eq!(classify_fetch_error("connection reset"), ResultCode::Failure);
    }

    #[test]
    fn archive_names_escape_epochs() {
        assert_eq!(
            archive_file_name("app", "1:2.0-1", "armel"),
            "app_1%3a2.0-1_armel.deb"
        );
    }
}
