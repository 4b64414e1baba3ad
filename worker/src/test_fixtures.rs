// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures: a scratch installation root populated with a status
//! database, catalogues and index files, ready to open a cache against.

use std::fmt::Write as _;

use base64::Engine;
use xexp::Xexp;

use crate::{
    cache::Cache,
    domain::Domains,
    environment::HOST_ARCH,
    installation::Installation,
    source::{uri_to_filename, Source},
};

pub struct FixtureBuilder {
    status: Vec<String>,
    sources: Vec<SourceFixture>,
    domains: Vec<Xexp>,
}

struct SourceFixture {
    uri: String,
    trusted: bool,
    key: Option<String>,
    packages: Vec<String>,
}

pub struct Fixture {
    _dir: tempfile::TempDir,
    pub installation: Installation,
    pub domains: Domains,
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            status: vec![],
            sources: vec![SourceFixture {
                uri: "http://repo.example.com".into(),
                trusted: true,
                key: None,
                packages: vec![],
            }],
            domains: vec![],
        }
    }

    /// Add another source; subsequent `available` calls land in it
    pub fn add_source(mut self, uri: &str, trusted: bool, key: Option<&str>) -> Self {
        self.sources.push(SourceFixture {
            uri: uri.into(),
            trusted,
            key: key.map(str::to_owned),
            packages: vec![],
        });
        self
    }

    /// Declare an explicit domain in the config file
    pub fn domain(
        mut self,
        name: &str,
        trust_level: i64,
        certified: bool,
        key_suffix: Option<&str>,
        uri_suffix: Option<&str>,
    ) -> Self {
        let mut entry = Xexp::list("domain");
        entry.append(Xexp::text("name", name));
        entry.append(Xexp::text("trust-level", trust_level));
        if certified {
            entry.append(Xexp::list("certified"));
        }
        if let Some(key) = key_suffix {
            entry.append(Xexp::text("key", key));
        }
        if let Some(uri) = uri_suffix {
            entry.append(Xexp::text("uri", uri));
        }
        self.domains.push(entry);
        self
    }

    pub fn installed(self, name: &str, version: &str, depends: &[&str]) -> Self {
        self.installed_with(name, version, depends, &[])
    }

    pub fn installed_with(
        mut self,
        name: &str,
        version: &str,
        depends: &[&str],
        fields: &[(&str, &str)],
    ) -> Self {
        let mut stanza = String::new();
        let _ = writeln!(stanza, "Package: {name}");
        if !fields.iter().any(|(k, _)| *k == "Status") {
            let _ = writeln!(stanza, "Status: install ok installed");
        }
        push_common(&mut stanza, version, depends, fields);
        self.status.push(stanza);
        self
    }

    pub fn available(self, name: &str, version: &str, depends: &[&str]) -> Self {
        self.available_with(name, version, depends, &[])
    }

    pub fn available_with(
        mut self,
        name: &str,
        version: &str,
        depends: &[&str],
        fields: &[(&str, &str)],
    ) -> Self {
        let mut stanza = String::new();
        let _ = writeln!(stanza, "Package: {name}");
        if !fields.iter().any(|(k, _)| *k == "Filename") {
            let _ = writeln!(stanza, "Filename: pool/{name}_{version}_{HOST_ARCH}.deb");
        }
        if !fields.iter().any(|(k, _)| *k == "Size") {
            let _ = writeln!(stanza, "Size: 1000");
        }
        push_common(&mut stanza, version, depends, fields);
        self.sources
            .last_mut()
            .expect("fixture has a source")
            .packages
            .push(stanza);
        self
    }

    pub fn build(self) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        std::fs::create_dir_all(installation.dpkg_admin_dir()).unwrap();
        std::fs::write(installation.status_path(), self.status.join("\n")).unwrap();

        let mut catalogues = Xexp::list("catalogues");
        for fixture_source in &self.sources {
            let mut catalogue = Xexp::list("catalogue");
            catalogue.append(Xexp::text("uri", &fixture_source.uri));
            catalogue.append(Xexp::text("dist", "stable"));
            catalogue.append(Xexp::text("components", "main"));
            catalogues.append(catalogue);

            let source = Source {
                uri: fixture_source.uri.clone(),
                dist: "stable".into(),
                components: vec!["main".into()],
            };

            let lists = installation.lists_dir();
            if fixture_source.trusted {
                let release = lists.join(uri_to_filename(&source.release_uri()));
                std::fs::write(&release, armored_release(fixture_source.key.as_deref())).unwrap();
            }
            for (_, uri) in source.packages_uris() {
                let path = lists.join(uri_to_filename(&uri));
                std::fs::write(&path, fixture_source.packages.join("\n")).unwrap();
            }
        }
        xexp::write_file(installation.catalogues_path(), &catalogues).unwrap();

        if !self.domains.is_empty() {
            let mut conf = Xexp::list("domains");
            for entry in self.domains {
                conf.append(entry);
            }
            std::fs::create_dir_all(installation.domains_conf_path().parent().unwrap()).unwrap();
            xexp::write_file(installation.domains_conf_path(), &conf).unwrap();
        }

        let domains = Domains::load(installation.domains_conf_path());

        Fixture {
            _dir: dir,
            installation,
            domains,
        }
    }
}

impl Fixture {
    pub fn open_cache(&self) -> Cache {
        self.open_cache_with(false)
    }

    pub fn open_cache_with(&self, allow_wrong_domains: bool) -> Cache {
        Cache::open(&self.installation, &self.domains, allow_wrong_domains)
            .expect("fixture cache opens")
    }
}

fn push_common(stanza: &mut String, version: &str, depends: &[&str], fields: &[(&str, &str)]) {
    let _ = writeln!(stanza, "Version: {version}");
    if !fields.iter().any(|(k, _)| *k == "Architecture") {
        let _ = writeln!(stanza, "Architecture: {HOST_ARCH}");
    }
    if !fields.iter().any(|(k, _)| *k == "Section") {
        let _ = writeln!(stanza, "Section: libs");
    }
    if !fields.iter().any(|(k, _)| *k == "Installed-Size") {
        let _ = writeln!(stanza, "Installed-Size: 100");
    }
    if !depends.is_empty() {
        let _ = writeln!(stanza, "Depends: {}", depends.join(", "));
    }
    for (key, value) in fields {
        let _ = writeln!(stanza, "{key}: {value}");
    }
    if !fields.iter().any(|(k, _)| *k == "Description") {
        let _ = writeln!(stanza, "Description: test package");
    }
}

/// An InRelease body whose armored signature yields `fingerprint`
fn armored_release(fingerprint: Option<&str>) -> String {
    let fingerprint = fingerprint.unwrap_or("00112233445566778899AABBCCDDEEFF00112233");
    let mut packet = vec![0u8; 12];
    packet.extend(hex::decode(fingerprint).expect("hex fingerprint"));
    packet.extend([0u8; 9]);
    let body = base64::engine::general_purpose::STANDARD.encode(packet);

    format!(
        "Origin: Test\nSuite: stable\n-----BEGIN PGP SIGNATURE-----\n{body}\n-----END PGP SIGNATURE-----\n"
    )
}
