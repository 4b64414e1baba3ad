// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Repository sources derived from the catalogue configuration.
//!
//! A catalogue names a repository (`uri`, `dist`, `components`); a source
//! expands that into the concrete index files to fetch and read. A
//! trivial repository has a `dist` ending in `/` and carries a single
//! `Packages` file next to its release metadata.

use xexp::Xexp;

use crate::environment::{DEFAULT_DISTRIBUTION, HOST_ARCH};

/// One repository entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub uri: String,
    pub dist: String,
    pub components: Vec<String>,
}

impl Source {
    pub fn from_catalogue(catalogue: &Xexp) -> Option<Self> {
        if !catalogue.is("catalogue") || catalogue.aref_bool("disabled") {
            return None;
        }

        let uri = catalogue.aref_text("uri")?.trim_end_matches('/').to_owned();
        let dist = catalogue
            .aref_text("dist")
            .unwrap_or(DEFAULT_DISTRIBUTION)
            .to_owned();
        let components = catalogue
            .aref_text("components")
            .map(|c| c.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();

        Some(Self {
            uri,
            dist,
            components,
        })
    }

    /// Trivial repositories name their index files relative to the dist
    pub fn is_trivial(&self) -> bool {
        self.dist.ends_with('/')
    }

    /// URI of a file next to the release metadata (`InRelease`,
    /// `Packages`, …)
    pub fn meta_index_uri(&self, name: &str) -> String {
        if self.dist == "/" {
            format!("{}/{name}", self.uri)
        } else if self.is_trivial() {
            format!("{}/{}{name}", self.uri, self.dist)
        } else {
            format!("{}/dists/{}/{name}", self.uri, self.dist)
        }
    }

    pub fn release_uri(&self) -> String {
        self.meta_index_uri("InRelease")
    }

    /// URIs of every `Packages` file this source contributes
    pub fn packages_uris(&self) -> Vec<(Option<String>, String)> {
        if self.is_trivial() {
            vec![(None, self.meta_index_uri("Packages"))]
        } else {
            self.components
                .iter()
                .map(|component| {
                    (
                        Some(component.clone()),
                        self.meta_index_uri(&format!("{component}/binary-{HOST_ARCH}/Packages")),
                    )
                })
                .collect()
        }
    }

    /// The sources.list line for this source
    pub fn deb_line(&self) -> String {
        if self.is_trivial() {
            format!("deb {} {}", self.uri, self.dist)
        } else {
            format!("deb {} {} {}", self.uri, self.dist, self.components.join(" "))
        }
    }
}

/// Every active source: the user catalogues plus temporary ones
#[derive(Debug, Clone, Default)]
pub struct SourceList {
    pub sources: Vec<Source>,
}

impl SourceList {
    pub fn from_catalogues(catalogues: &Xexp) -> Self {
        Self {
            sources: catalogues
                .children()
                .iter()
                .filter_map(Source::from_catalogue)
                .collect(),
        }
    }

    pub fn merged(mut self, other: Self) -> Self {
        self.sources.extend(other.sources);
        self
    }
}

/// Map a URI onto the flat file name used inside the lists directory
pub fn uri_to_filename(uri: &str) -> String {
    let stripped = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    stripped.replace('/', "_")
}

#[cfg(test)]
mod test {
    use super::*;

    fn catalogue(uri: &str, dist: &str, components: Option<&str>) -> Xexp {
        let mut cat = Xexp::list("catalogue");
        cat.append(Xexp::text("uri", uri));
        cat.append(Xexp::text("dist", dist));
        if let Some(components) = components {
            cat.append(Xexp::text("components", components));
        }
        cat
    }

    #[test]
    fn component_repository_uris() {
        let source =
            Source::from_catalogue(&catalogue("http://repo.example.com/", "stable", Some("free non-free")))
                .unwrap();

        assert_eq!(
            source.release_uri(),
            "http://repo.example.com/dists/stable/InRelease"
        );
        let packages = source.packages_uris();
        assert_eq!(packages.len(), 2);
        assert_eq!(
            packages[0].1,
            format!("http://repo.example.com/dists/stable/free/binary-{HOST_ARCH}/Packages")
        );
    }

    #[test]
    fn trivial_repository_uris() {
        let source = Source::from_catalogue(&catalogue("http://repo.example.com", "updates/", None)).unwrap();
        assert!(source.is_trivial());
        assert_eq!(
            source.release_uri(),
            "http://repo.example.com/updates/InRelease"
        );
        assert_eq!(
            source.packages_uris(),
            vec![(None, "http://repo.example.com/updates/Packages".to_owned())]
        );
    }

    #[test]
    fn root_dist_repository() {
        let source = Source::from_catalogue(&catalogue("http://repo.example.com", "/", None)).unwrap();
        assert_eq!(source.release_uri(), "http://repo.example.com/InRelease");
    }

    #[test]
    fn disabled_catalogues_are_skipped() {
        let mut cat = catalogue("http://repo.example.com", "stable", None);
        cat.append(Xexp::list("disabled"));
        assert_eq!(Source::from_catalogue(&cat), None);
    }

    #[test]
    fn filenames_are_flat() {
        assert_eq!(
            uri_to_filename("http://repo.example.com/dists/stable/InRelease"),
            "repo.example.com_dists_stable_InRelease"
        );
    }
}
