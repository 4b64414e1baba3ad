// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The package database: the union of the installed status file and the
//! downloaded repository index files, held as integer-indexed arrays.
//!
//! Iterator handles never survive a reload; everything refers to
//! packages, versions and index files by id.

use std::{collections::HashMap, io, path::Path};

use fs_err as fs;
use log::{debug, warn};
use thiserror::Error;

use crate::{
    environment::{HOST_ARCH, OLD_USER_SECTION_PREFIX, USER_SECTION_PREFIX},
    installation::Installation,
    protocol::PackageFlags,
    source::{uri_to_filename, SourceList},
};

pub mod control;
pub mod version;

pub use self::version::Relation;

pub type PackageId = usize;
pub type VersionId = usize;
pub type IndexId = usize;

/// The status pseudo-index is always present and always index zero
pub const STATUS_INDEX: IndexId = 0;

/// Priority of real repository indexes
pub const SOURCE_PRIORITY: i32 = 500;
/// Priority of the status pseudo-index
pub const STATUS_PRIORITY: i32 = 100;
/// Priority the installed version is elevated to after selection
pub const PSEUDO_STATUS_PRIORITY: i32 = 1000;

/// Dependency clause kinds we track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    PreDepends,
    Depends,
    Recommends,
    Conflicts,
    Breaks,
    Replaces,
}

impl DepKind {
    fn parse(field: &str) -> Option<Self> {
        match field {
            "Pre-Depends" => Some(Self::PreDepends),
            "Depends" => Some(Self::Depends),
            "Recommends" => Some(Self::Recommends),
            "Conflicts" => Some(Self::Conflicts),
            "Breaks" => Some(Self::Breaks),
            "Replaces" => Some(Self::Replaces),
            _ => None,
        }
    }

    /// Critical clauses must hold for a consistent plan
    pub fn is_critical(self) -> bool {
        matches!(self, Self::PreDepends | Self::Depends)
    }

    pub fn is_negative(self) -> bool {
        matches!(self, Self::Conflicts | Self::Breaks)
    }
}

/// One alternative inside an OR-group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepTarget {
    pub name: String,
    pub constraint: Option<(Relation, String)>,
}

impl DepTarget {
    pub fn matches_version(&self, version: &str) -> bool {
        match &self.constraint {
            None => true,
            Some((relation, reference)) => version::satisfies(version, *relation, reference),
        }
    }
}

/// An OR-group of alternatives under one kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepClause {
    pub kind: DepKind,
    pub alternatives: Vec<DepTarget>,
}

/// Installed-state classification from the dpkg status triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstState {
    #[default]
    NeedsNothing,
    NeedsConfigure,
    NeedsUnpack,
}

/// One `Packages` file (or the status pseudo-file)
#[derive(Debug, Clone)]
pub struct IndexFile {
    pub uri: String,
    pub dist: String,
    pub component: Option<String>,
    pub trusted: bool,
    pub priority: i32,
    /// True for the status pseudo-index, which never sources archives
    pub not_source: bool,
}

/// Where a version was seen; the executor masks locations that lose the
/// trust comparison so they cannot source the archive
#[derive(Debug, Clone)]
pub struct Location {
    pub index: IndexId,
    pub masked: bool,
}

/// One version of one package
#[derive(Debug, Clone)]
pub struct Version {
    pub package: PackageId,
    pub version: String,
    pub architecture: String,
    pub section: Option<String>,
    pub installed_size: i64,
    pub download_size: i64,
    pub filename: Option<String>,
    pub sha256: Option<String>,
    pub sha1: Option<String>,
    pub md5: Option<String>,
    pub depends: Vec<DepClause>,
    pub provides: Vec<String>,
    pub locations: Vec<Location>,
    pub fields: control::Stanza,
}

impl Version {
    pub fn is_user(&self) -> bool {
        self.section.as_deref().is_some_and(|section| {
            section.starts_with(USER_SECTION_PREFIX) || section.starts_with(OLD_USER_SECTION_PREFIX)
        })
    }

    pub fn flags(&self) -> PackageFlags {
        self.fields
            .get("Maemo-Flags")
            .map(PackageFlags::parse)
            .unwrap_or_default()
    }

    pub fn pretty_name(&self, lc_messages: Option<&str>) -> Option<&str> {
        self.fields
            .get_localized("Maemo-Display-Name", lc_messages)
            .filter(|name| !name.trim().is_empty())
    }

    pub fn icon(&self) -> Option<&str> {
        self.fields.get("Maemo-Icon-26")
    }

    /// Extra space the install needs beyond the archive, bytes
    pub fn required_free_space(&self) -> i64 {
        1024 * self.fields.get_int("Maemo-Required-Free-Space", 0)
    }

    pub fn maintainer(&self) -> Option<&str> {
        self.fields.get("Maintainer")
    }

    /// Description selection: upgrades prefer the dedicated upgrade text
    pub fn description(&self, upgrade: bool, lc_messages: Option<&str>) -> String {
        if upgrade {
            if let Some(text) = self
                .fields
                .get_localized("Maemo-Upgrade-Description", lc_messages)
            {
                return text.to_owned();
            }
        }
        self.fields
            .get_localized("Description", lc_messages)
            .unwrap_or_default()
            .to_owned()
    }

    pub fn short_description(&self, upgrade: bool, lc_messages: Option<&str>) -> String {
        let full = self.description(upgrade, lc_messages);
        full.lines().next().unwrap_or_default().to_owned()
    }

    /// Clauses of one kind
    pub fn clauses(&self, kind: DepKind) -> impl Iterator<Item = &DepClause> {
        self.depends.iter().filter(move |clause| clause.kind == kind)
    }

    /// An unmasked location that can source the archive
    pub fn source_location(&self, db: &Database) -> Option<IndexId> {
        self.locations
            .iter()
            .filter(|location| !location.masked && !db.indexes[location.index].not_source)
            .map(|location| location.index)
            .next()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Package {
    pub name: String,
    pub versions: Vec<VersionId>,
    pub current: Option<VersionId>,
    pub state: InstState,
}

/// The loaded database
#[derive(Debug, Default)]
pub struct Database {
    pub packages: Vec<Package>,
    pub versions: Vec<Version>,
    pub indexes: Vec<IndexFile>,
    by_name: HashMap<String, PackageId>,
    providers: HashMap<String, Vec<VersionId>>,
}

impl Database {
    /// Load the current world: the dpkg status file plus every readable
    /// `Packages` file named by the source list.
    pub fn load(installation: &Installation, sources: &SourceList) -> Result<Self, Error> {
        let mut db = Database::default();

        db.indexes.push(IndexFile {
            uri: "status".into(),
            dist: String::new(),
            component: None,
            trusted: false,
            priority: STATUS_PRIORITY,
            not_source: true,
        });

        db.load_status(&installation.status_path())?;

        let lists = installation.lists_dir();
        for source in &sources.sources {
            let trusted = lists
                .join(uri_to_filename(&source.release_uri()))
                .exists();

            for (component, uri) in source.packages_uris() {
                let path = lists.join(uri_to_filename(&uri));
                let index = db.indexes.len();
                db.indexes.push(IndexFile {
                    uri: source.uri.clone(),
                    dist: source.dist.clone(),
                    component,
                    trusted,
                    priority: SOURCE_PRIORITY,
                    not_source: false,
                });
                if let Err(e) = db.load_index(&path, index) {
                    debug!("no usable index at {path:?}: {e}");
                }
            }
        }

        debug!(
            "database: {} packages, {} versions, {} indexes",
            db.packages.len(),
            db.versions.len(),
            db.indexes.len()
        );

        Ok(db)
    }

    pub fn find_package(&self, name: &str) -> Option<PackageId> {
        self.by_name.get(name).copied()
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.packages[id]
    }

    pub fn version(&self, id: VersionId) -> &Version {
        &self.versions[id]
    }

    pub fn index(&self, id: IndexId) -> &IndexFile {
        &self.indexes[id]
    }

    /// Versions that provide the given (virtual) name
    pub fn providers(&self, name: &str) -> &[VersionId] {
        self.providers.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn package_ids(&self) -> std::ops::Range<PackageId> {
        0..self.packages.len()
    }

    fn intern_package(&mut self, name: &str) -> PackageId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = self.packages.len();
        self.packages.push(Package {
            name: name.to_owned(),
            ..Default::default()
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    fn load_status(&mut self, path: &Path) -> Result<(), Error> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("no status file at {path:?}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for stanza in control::parse(&text) {
            let Some(status) = stanza.get("Status") else {
                continue;
            };
            let Some(state) = installed_state(status) else {
                continue;
            };

            let Some(version_id) = self.add_version(&stanza, STATUS_INDEX) else {
                continue;
            };
            let package = self.versions[version_id].package;
            self.packages[package].current = Some(version_id);
            self.packages[package].state = state;
        }

        Ok(())
    }

    fn load_index(&mut self, path: &Path, index: IndexId) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        for stanza in control::parse(&text) {
            self.add_version(&stanza, index);
        }
        Ok(())
    }

    /// Insert one stanza, merging with an identical version seen in
    /// another index file.
    fn add_version(&mut self, stanza: &control::Stanza, index: IndexId) -> Option<VersionId> {
        let name = stanza.get("Package")?.to_owned();
        let version = stanza.get("Version")?.to_owned();
        let architecture = stanza.get("Architecture").unwrap_or("all").to_owned();

        let package = self.intern_package(&name);

        if let Some(&existing) = self.packages[package]
            .versions
            .iter()
            .find(|&&v| self.versions[v].version == version && self.versions[v].architecture == architecture)
        {
            let slot = &mut self.versions[existing];
            if !slot.locations.iter().any(|l| l.index == index) {
                slot.locations.push(Location {
                    index,
                    masked: false,
                });
            }
            // Index records are richer than status records; upgrade in
            // place so download metadata is available.
            if slot.filename.is_none() {
                if let Some(filename) = stanza.get("Filename") {
                    slot.filename = Some(filename.to_owned());
                    slot.download_size = stanza.get_int("Size", 0);
                    slot.sha256 = stanza.get("SHA256").map(str::to_owned);
                    slot.sha1 = stanza.get("SHA1").map(str::to_owned);
                    slot.md5 = stanza.get("MD5sum").map(str::to_owned);
                }
            }
            return Some(existing);
        }

        let id = self.versions.len();
        let mut depends = Vec::new();
        for field in [
            "Pre-Depends",
            "Depends",
            "Recommends",
            "Conflicts",
            "Breaks",
            "Replaces",
        ] {
            if let Some(value) = stanza.get(field) {
                let kind = DepKind::parse(field).unwrap_or(DepKind::Depends);
                depends.extend(parse_clauses(kind, value));
            }
        }

        let provides: Vec<String> = stanza
            .get("Provides")
            .map(|value| {
                value
                    .split(',')
                    .map(|name| strip_arch(name.trim()).to_owned())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        for provided in &provides {
            self.providers.entry(provided.clone()).or_default().push(id);
        }

        self.versions.push(Version {
            package,
            version,
            architecture,
            section: stanza.get("Section").map(str::to_owned),
            installed_size: 1024 * stanza.get_int("Installed-Size", 0),
            download_size: stanza.get_int("Size", 0),
            filename: stanza.get("Filename").map(str::to_owned),
            sha256: stanza.get("SHA256").map(str::to_owned),
            sha1: stanza.get("SHA1").map(str::to_owned),
            md5: stanza.get("MD5sum").map(str::to_owned),
            depends,
            provides,
            locations: vec![Location {
                index,
                masked: false,
            }],
            fields: stanza.clone(),
        });
        self.packages[package].versions.push(id);

        Some(id)
    }
}

/// Foreign-architecture entries are ignored unless installed
pub fn arch_matches(architecture: &str) -> bool {
    architecture == HOST_ARCH || architecture == "all"
}

fn installed_state(status: &str) -> Option<InstState> {
    // "Status: want flag state"
    match status.split_whitespace().nth(2)? {
        "installed" => Some(InstState::NeedsNothing),
        "unpacked" | "half-installed" => Some(InstState::NeedsUnpack),
        "half-configured" | "triggers-awaited" | "triggers-pending" => {
            Some(InstState::NeedsConfigure)
        }
        _ => None,
    }
}

/// Parse a dependency field into OR-group clauses
pub fn parse_clauses(kind: DepKind, field: &str) -> Vec<DepClause> {
    field
        .split(',')
        .filter_map(|group| {
            let alternatives: Vec<_> = group.split('|').filter_map(parse_target).collect();
            (!alternatives.is_empty()).then_some(DepClause { kind, alternatives })
        })
        .collect()
}

fn parse_target(target: &str) -> Option<DepTarget> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    let (name, constraint) = match target.split_once('(') {
        None => (target, None),
        Some((name, rest)) => {
            let inner = rest.trim_end().trim_end_matches(')').trim();
            let mut parts = inner.splitn(2, char::is_whitespace);
            let op = parts.next()?;
            let reference = parts.next()?.trim();
            (
                name,
                Relation::parse(op).map(|relation| (relation, reference.to_owned())),
            )
        }
    };

    Some(DepTarget {
        name: strip_arch(name.trim()).to_owned(),
        constraint,
    })
}

fn strip_arch(name: &str) -> &str {
    name.split_once(':').map(|(n, _)| n).unwrap_or(name)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clause_parsing() {
        let clauses = parse_clauses(
            DepKind::Depends,
            "libgtkcore (>= 2.0), osso-core | osso-base, weird:any",
        );
        assert_eq!(clauses.len(), 3);
        assert_eq!(clauses[0].alternatives[0].name, "libgtkcore");
        assert_eq!(
            clauses[0].alternatives[0].constraint,
            Some((Relation::LaterEqual, "2.0".to_owned()))
        );
        assert_eq!(clauses[1].alternatives.len(), 2);
        assert_eq!(clauses[2].alternatives[0].name, "weird");
    }

    #[test]
    fn target_version_match() {
        let target = DepTarget {
            name: "x".into(),
            constraint: Some((Relation::Later, "1.0".into())),
        };
        assert!(target.matches_version("1.1"));
        assert!(!target.matches_version("1.0"));

        let unconstrained = DepTarget {
            name: "x".into(),
            constraint: None,
        };
        assert!(unconstrained.matches_version("0.0.1"));
    }

    #[test]
    fn status_states() {
        assert_eq!(
            installed_state("install ok installed"),
            Some(InstState::NeedsNothing)
        );
        assert_eq!(
            installed_state("install ok unpacked"),
            Some(InstState::NeedsUnpack)
        );
        assert_eq!(
            installed_state("install ok half-configured"),
            Some(InstState::NeedsConfigure)
        );
        assert_eq!(installed_state("deinstall ok config-files"), None);
        assert_eq!(installed_state("purge ok not-installed"), None);
    }

    #[test]
    fn user_section_detection() {
        let mut version = Version {
            package: 0,
            version: "1.0".into(),
            architecture: "armel".into(),
            section: Some("user/network".into()),
            installed_size: 0,
            download_size: 0,
            filename: None,
            sha256: None,
            sha1: None,
            md5: None,
            depends: vec![],
            provides: vec![],
            locations: vec![],
            fields: control::Stanza::default(),
        };
        assert!(version.is_user());
        version.section = Some("maemo/tools".into());
        assert!(version.is_user());
        version.section = Some("libs".into());
        assert!(!version.is_user());
        version.section = None;
        assert!(!version.is_user());
    }
}
