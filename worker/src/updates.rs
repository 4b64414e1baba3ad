// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The available-updates file consumed by the update notifier.
//!
//! A package is listed when it is installed, a newer user-visible
//! version is available, and nothing about it is broken. Entries are
//! categorized as `os` (system update), `certified` (certified domain)
//! or `other`.

use log::warn;
use xexp::Xexp;

use crate::{
    cache::Cache,
    db::version,
    domain::Domains,
    installation::Installation,
    protocol::PackageFlags,
};

pub fn write_available_updates(
    cache: &Cache,
    domains: &Domains,
    installation: &Installation,
    lc_messages: Option<&str>,
) {
    let mut updates = Xexp::list("updates");

    for pkg in cache.db.package_ids() {
        let (Some(installed), Some(candidate)) = (cache.current(pkg), cache.candidate(pkg)) else {
            continue;
        };
        let installed = cache.db.version(installed);
        let candidate_version = cache.db.version(candidate);

        let newer = version::compare(&installed.version, &candidate_version.version)
            == std::cmp::Ordering::Less;
        let broken = cache.now_broken(pkg)
            || cache.state(pkg) != crate::db::InstState::NeedsNothing;

        if !newer || broken || !candidate_version.is_user() {
            continue;
        }

        let name = candidate_version
            .pretty_name(lc_messages)
            .unwrap_or(&cache.db.package(pkg).name);

        let category = if candidate_version.flags().contains(PackageFlags::SYSTEM_UPDATE) {
            "os"
        } else if cache.extra[pkg]
            .cur_domain
            .is_some_and(|domain| domains.get(domain).certified)
        {
            "certified"
        } else {
            "other"
        };

        updates.append(Xexp::text(category, name));
    }

    if let Err(e) = xexp::write_file(installation.available_updates_path(), &updates) {
        warn!("can't write available updates: {e}");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::FixtureBuilder;

    #[test]
    fn categorizes_updates() {
        let fixture = FixtureBuilder::new()
            .installed_with("app", "1.0", &[], &[("Section", "user/apps")])
            .installed_with("osbits", "1.0", &[], &[("Section", "user/system")])
            .installed("plainlib", "1.0", &[])
            .available_with("app", "2.0", &[], &[("Section", "user/apps")])
            .available_with(
                "osbits",
                "2.0",
                &[],
                &[("Section", "user/system"), ("Maemo-Flags", "system-update")],
            )
            .available("plainlib", "2.0", &[])
            .build();
        let cache = fixture.open_cache();

        write_available_updates(&cache, &fixture.domains, &fixture.installation, None);

        let updates = xexp::read_file(fixture.installation.available_updates_path()).unwrap();
        let entries: Vec<(&str, &str)> = updates
            .children()
            .iter()
            .map(|e| (e.tag(), e.text_value().unwrap()))
            .collect();

        assert!(entries.contains(&("other", "app")));
        assert!(entries.contains(&("os", "osbits")));
        // A non-user library never shows up.
        assert!(!entries.iter().any(|(_, name)| *name == "plainlib"));
    }
}
