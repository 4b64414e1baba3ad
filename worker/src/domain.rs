// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Trust domains.
//!
//! Every package source belongs to exactly one domain. Two domains are
//! implicit and always present: `unsigned` (level 0) and `signed`
//! (level 1). Explicit domains come from the domain configuration file
//! and match sources by signing-key or URI suffix. A dominates B iff
//! `trust_level(A) >= trust_level(B)`.

use std::{path::Path, time::SystemTime};

use log::warn;
use xexp::Xexp;

pub type DomainId = usize;

pub const UNSIGNED: DomainId = 0;
pub const SIGNED: DomainId = 1;

/// Default trust level of an explicit domain
const EXPLICIT_DEFAULT_LEVEL: i64 = 2;

#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    pub trust_level: i64,
    pub certified: bool,
    key_suffixes: Vec<String>,
    uri_suffixes: Vec<String>,
}

/// The loaded domain set, reloaded when the config file changes
#[derive(Debug, Clone)]
pub struct Domains {
    domains: Vec<Domain>,
    last_modified: Option<SystemTime>,
}

impl Default for Domains {
    fn default() -> Self {
        Self {
            domains: implicit_domains(),
            last_modified: None,
        }
    }
}

fn implicit_domains() -> Vec<Domain> {
    vec![
        Domain {
            name: "unsigned".into(),
            trust_level: 0,
            certified: false,
            key_suffixes: vec![],
            uri_suffixes: vec![],
        },
        Domain {
            name: "signed".into(),
            trust_level: 1,
            certified: false,
            key_suffixes: vec![],
            uri_suffixes: vec![],
        },
    ]
}

impl Domains {
    /// Read the configuration file; a missing or unreadable file leaves
    /// only the implicit domains.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut domains = implicit_domains();

        match xexp::read_file(path) {
            Ok(conf) => {
                for entry in conf.children() {
                    if !entry.is("domain") {
                        continue;
                    }
                    let Some(name) = entry.aref_text("name") else {
                        continue;
                    };

                    domains.push(Domain {
                        name: name.to_owned(),
                        trust_level: entry.aref_int("trust-level", EXPLICIT_DEFAULT_LEVEL),
                        certified: entry.aref_bool("certified"),
                        key_suffixes: texts_of(entry, "key"),
                        uri_suffixes: texts_of(entry, "uri"),
                    });
                }
            }
            Err(xexp::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("unreadable domain config {path:?}: {e}"),
        }

        Self {
            domains,
            last_modified: mtime(path),
        }
    }

    /// Reload when the file's mtime moved; returns whether it did.
    pub fn reload_if_modified(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if mtime(path) == self.last_modified {
            return false;
        }
        *self = Self::load(path);
        true
    }

    pub fn get(&self, id: DomainId) -> &Domain {
        &self.domains[id]
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (DomainId, &Domain)> {
        self.domains.iter().enumerate()
    }

    pub fn by_name(&self, name: &str) -> Option<DomainId> {
        self.domains.iter().position(|d| d.name == name)
    }

    /// A dominates B iff its trust level is at least B's
    pub fn dominates(&self, a: DomainId, b: DomainId) -> bool {
        self.domains[a].trust_level >= self.domains[b].trust_level
    }

    pub fn trust_level(&self, id: DomainId) -> i64 {
        self.domains[id].trust_level
    }

    /// First explicit domain with a key suffix matching; `signed` otherwise
    pub fn find_by_key(&self, key: &str) -> DomainId {
        self.find_by(|d| &d.key_suffixes, key)
    }

    /// First explicit domain with a URI suffix matching; `signed` otherwise
    pub fn find_by_uri(&self, uri: &str) -> DomainId {
        self.find_by(|d| &d.uri_suffixes, uri)
    }

    fn find_by(&self, suffixes: impl Fn(&Domain) -> &Vec<String>, value: &str) -> DomainId {
        self.domains
            .iter()
            .position(|domain| suffixes(domain).iter().any(|s| value.ends_with(s.as_str())))
            .unwrap_or(SIGNED)
    }
}

fn texts_of(entry: &Xexp, tag: &str) -> Vec<String> {
    entry
        .children()
        .iter()
        .filter(|child| child.is(tag))
        .filter_map(Xexp::text_value)
        .map(str::to_owned)
        .collect()
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_conf() -> Xexp {
        let mut root = Xexp::list("domains");

        let mut certified = Xexp::list("domain");
        certified.append(Xexp::text("name", "vendor-certified"));
        certified.append(Xexp::text("trust-level", "10"));
        certified.append(Xexp::list("certified"));
        certified.append(Xexp::text("key", "AABBCCDD"));
        certified.append(Xexp::text("uri", "downloads.vendor.example.com"));
        root.append(certified);

        let mut extras = Xexp::list("domain");
        extras.append(Xexp::text("name", "vendor-extras"));
        extras.append(Xexp::text("key", "11223344"));
        root.append(extras);

        root
    }

    fn load_sample() -> Domains {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains");
        xexp::write_file(&path, &sample_conf()).unwrap();
        Domains::load(&path)
    }

    #[test]
    fn implicit_domains_always_present() {
        let domains = Domains::default();
        assert_eq!(domains.get(UNSIGNED).name, "unsigned");
        assert_eq!(domains.get(SIGNED).name, "signed");
        assert_eq!(domains.trust_level(UNSIGNED), 0);
        assert_eq!(domains.trust_level(SIGNED), 1);
    }

    #[test]
    fn explicit_domains_load_with_defaults() {
        let domains = load_sample();
        assert_eq!(domains.len(), 4);

        let certified = domains.by_name("vendor-certified").unwrap();
        assert_eq!(domains.trust_level(certified), 10);
        assert!(domains.get(certified).certified);

        let extras = domains.by_name("vendor-extras").unwrap();
        assert_eq!(domains.trust_level(extras), 2);
        assert!(!domains.get(extras).certified);
    }

    #[test]
    fn suffix_matching() {
        let domains = load_sample();
        let certified = domains.by_name("vendor-certified").unwrap();

        assert_eq!(
            domains.find_by_key("0123456789ABCDEF0123456789ABAABBCCDD"),
            certified
        );
        assert_eq!(domains.find_by_key("FFFFFFFF"), SIGNED);
        assert_eq!(
            domains.find_by_uri("https://downloads.vendor.example.com"),
            certified
        );
        assert_eq!(domains.find_by_uri("https://elsewhere.example.org"), SIGNED);
    }

    #[test]
    fn dominance_is_transitive() {
        let domains = load_sample();
        let ids: Vec<DomainId> = (0..domains.len()).collect();

        for &a in &ids {
            for &b in &ids {
                for &c in &ids {
                    if domains.dominates(a, b) && domains.dominates(b, c) {
                        assert!(domains.dominates(a, c));
                    }
                }
            }
        }
    }

    #[test]
    fn explicit_dominates_implicit() {
        let domains = load_sample();
        let extras = domains.by_name("vendor-extras").unwrap();
        assert!(domains.dominates(extras, SIGNED));
        assert!(domains.dominates(extras, UNSIGNED));
        assert!(!domains.dominates(SIGNED, extras));
        assert!(domains.dominates(SIGNED, UNSIGNED));
    }

    #[test]
    fn missing_config_leaves_implicit_only() {
        let domains = Domains::load("/nonexistent/domains");
        assert_eq!(domains.len(), 2);
    }
}
