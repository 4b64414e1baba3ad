// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Catalogue configuration and refresh-error bookkeeping.
//!
//! Catalogues are the user-level repository objects. They persist as an
//! xexp tree, generate the sources list consumed by other tooling, and
//! collect `{errors {error {uri, msg}}}` sub-trees when a refresh fails.

use std::io::{self, Write};

use fs_err as fs;
use log::warn;
use xexp::Xexp;

use crate::{
    environment::DEFAULT_DISTRIBUTION,
    installation::Installation,
    source::{Source, SourceList},
};

/// Read the user catalogues; a missing file is an empty set
pub fn read_catalogues(installation: &Installation) -> Xexp {
    read_or_empty(installation.catalogues_path())
}

/// Read the temporary catalogues added for the current session
pub fn read_temp_catalogues(installation: &Installation) -> Xexp {
    read_or_empty(installation.temp_catalogues_path())
}

fn read_or_empty(path: std::path::PathBuf) -> Xexp {
    match xexp::read_file(&path) {
        Ok(x) if x.is("catalogues") => x,
        Ok(_) => {
            warn!("unexpected root in {path:?}");
            Xexp::list("catalogues")
        }
        Err(xexp::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => Xexp::list("catalogues"),
        Err(e) => {
            warn!("unreadable catalogues {path:?}: {e}");
            Xexp::list("catalogues")
        }
    }
}

/// Every active source: user catalogues plus temporary ones
pub fn active_sources(installation: &Installation) -> SourceList {
    let user = SourceList::from_catalogues(&read_catalogues(installation));
    let temp = SourceList::from_catalogues(&read_temp_catalogues(installation));
    user.merged(temp)
}

pub fn write_user_catalogues(installation: &Installation, catalogues: &Xexp) -> Result<(), Error> {
    xexp::write_file(installation.catalogues_path(), catalogues)?;
    Ok(())
}

pub fn write_temp_catalogues(installation: &Installation, catalogues: &Xexp) -> Result<(), Error> {
    xexp::write_file(installation.temp_catalogues_path(), catalogues)?;
    Ok(())
}

/// Generate a sources list file from a catalogue set
pub fn write_sources_list(
    path: impl AsRef<std::path::Path>,
    catalogues: &Xexp,
) -> Result<(), Error> {
    let mut out = fs::File::create(path.as_ref())?;
    for source in SourceList::from_catalogues(catalogues).sources {
        writeln!(out, "{}", source.deb_line())?;
    }
    out.flush()?;
    out.sync_all()?;
    Ok(())
}

/// Regenerate the sources list from the user catalogues
pub fn update_sources_list(installation: &Installation, catalogues: &Xexp) -> Result<(), Error> {
    write_user_catalogues(installation, catalogues)?;
    write_sources_list(installation.sources_list_path(), catalogues)
}

/// Store temporary catalogues and their sources list
pub fn add_temp_sources_list(installation: &Installation, temp: &Xexp) -> Result<(), Error> {
    write_temp_catalogues(installation, temp)?;
    write_sources_list(installation.temp_sources_list_path(), temp)
}

/// Drop the temporary catalogues and their sources list
pub fn clean_temp_catalogues(installation: &Installation) {
    for path in [
        installation.temp_sources_list_path(),
        installation.temp_catalogues_path(),
    ] {
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("error unlinking {path:?}: {e}");
            }
        }
    }
}

/// Remove `errors` sub-trees everywhere and forget the stored failures
pub fn reset_catalogue_errors(installation: &Installation, catalogues: &mut Xexp) {
    clean_failed_catalogues(installation);
    for catalogue in catalogue_children(catalogues) {
        catalogue.adel("errors");
    }
}

/// A copy of the catalogue without its error report
pub fn without_errors(catalogue: &Xexp) -> Xexp {
    let mut mapped = catalogue.clone();
    mapped.adel("errors");
    mapped
}

/// Attach a fetch failure to every catalogue matching the item URI.
///
/// `item_uri` matches a catalogue when it has one of the shapes
/// `uri/dists/dist/<file>`, `uri/dists/dist/component/<path>`,
/// `uri/dist<path>` for a trivial dist, or `uri<path>` when the dist is
/// just `/`. Returns how many catalogues matched.
pub fn attach_error(catalogues: &mut Xexp, item_uri: &str, message: &str) -> usize {
    let mut matched = 0;

    for catalogue in catalogue_children(catalogues) {
        if !catalogue_matches(catalogue, item_uri) {
            continue;
        }

        if catalogue.aref("errors").is_none() {
            catalogue.append(Xexp::list("errors"));
        }
        let mut error = Xexp::list("error");
        error.append(Xexp::text("uri", item_uri));
        error.append(Xexp::text("msg", message));
        if let Some(errors) = catalogue.aref_mut("errors") {
            errors.append(error);
        }

        matched += 1;
    }

    matched
}

fn catalogue_matches(catalogue: &Xexp, item_uri: &str) -> bool {
    let Some(uri) = catalogue.aref_text("uri") else {
        return false;
    };
    let uri = uri.trim_end_matches('/');
    let dist = catalogue.aref_text("dist").unwrap_or(DEFAULT_DISTRIBUTION);

    if dist.ends_with('/') {
        // A simple repository without components
        let prefix = if dist == "/" {
            format!("{uri}{dist}")
        } else {
            format!("{uri}/{dist}")
        };
        return item_uri.starts_with(&prefix);
    }

    let prefix = format!("{uri}/dists/{dist}/");
    let Some(rest) = item_uri.strip_prefix(prefix.as_str()) else {
        return false;
    };

    if !rest.contains('/') {
        return true;
    }

    catalogue
        .aref_text("components")
        .map(|components| {
            components
                .split_whitespace()
                .any(|component| {
                    rest.strip_prefix(component)
                        .is_some_and(|tail| tail.starts_with('/'))
                })
        })
        .unwrap_or(false)
}

fn catalogue_children(catalogues: &mut Xexp) -> impl Iterator<Item = &mut Xexp> {
    catalogues
        .children_mut()
        .iter_mut()
        .filter(|child| child.is("catalogue"))
}

/// Persist only the catalogues that carry errors; an empty report removes
/// the file.
pub fn save_failed_catalogues(installation: &Installation, catalogues: &Xexp) {
    let mut failed = Xexp::list("catalogues");
    for catalogue in catalogues.children() {
        if catalogue.is("catalogue") && catalogue.aref("errors").is_some() {
            failed.append(catalogue.clone());
        }
    }

    if failed.is_empty() {
        clean_failed_catalogues(installation);
    } else if let Err(e) = xexp::write_file(installation.failed_catalogues_path(), &failed) {
        warn!("can't save failed catalogues: {e}");
    }
}

pub fn load_failed_catalogues(installation: &Installation) -> Option<Xexp> {
    let path = installation.failed_catalogues_path();
    match xexp::read_file(&path) {
        Ok(x) if !x.is_empty() => Some(x),
        Ok(_) => {
            clean_failed_catalogues(installation);
            None
        }
        Err(xexp::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("error reading {path:?}: {e}");
            None
        }
    }
}

pub fn clean_failed_catalogues(installation: &Installation) {
    let path = installation.failed_catalogues_path();
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("error unlinking {path:?}: {e}");
        }
    }
}

/// Merge stored refresh errors back into a catalogue set, consuming each
/// stored entry at most once.
pub fn merge_catalogues_with_errors(installation: &Installation, catalogues: &mut Xexp) {
    let Some(mut failed) = load_failed_catalogues(installation) else {
        return;
    };

    for catalogue in catalogue_children(catalogues) {
        let matching = failed.children().iter().position(|f| {
            f.aref_text("uri") == catalogue.aref_text("uri")
                && f.aref_text("dist") == catalogue.aref_text("dist")
                && f.aref_text("components") == catalogue.aref_text("components")
        });

        if let Some(pos) = matching {
            let entry = failed.children()[pos].clone();
            if let Some(errors) = entry.aref("errors") {
                catalogue.append(errors.clone());
            }
            failed.remove(&entry);
        }
    }
}

/// Append foreign, non-comment source lines so the client can see sources
/// not under catalogue control.
pub fn append_system_sources(installation: &Installation, catalogues: &mut Xexp) {
    let mut files = vec![installation.main_sources_path()];

    if let Ok(entries) = std::fs::read_dir(installation.sources_parts_dir()) {
        let own = installation.sources_list_path();
        let temp = installation.temp_sources_list_path();
        let mut parts: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "list"))
            .filter(|path| *path != own && *path != temp)
            .collect();
        parts.sort();
        files.extend(parts);
    }

    for file in files {
        let Ok(text) = std::fs::read_to_string(&file) else {
            continue;
        };
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            catalogues.append(Xexp::text("source", line));
        }
    }
}

/// Backup the catalogue configuration for restore flows
pub fn backup_catalogues(installation: &Installation) {
    let catalogues = read_catalogues(installation);
    if let Err(e) = xexp::write_file(installation.backup_catalogues_path(), &catalogues) {
        warn!("can't back up catalogues: {e}");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("xexp")]
    Xexp(#[from] xexp::Error),
    #[error("io")]
    Io(#[from] io::Error),
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

    fn set(cats: Vec<Xexp>) -> Xexp {
        let mut root = Xexp::list("catalogues");
        for cat in cats {
            root.append(cat);
        }
        root
    }

    #[test]
    fn error_attribution_release_file() {
        let mut cats = set(vec![
            catalogue("http://a.example.com", "stable", Some("main")),
            catalogue("http://b.example.com", "stable", Some("main")),
        ]);

        let matched = attach_error(
            &mut cats,
            "http://a.example.com/dists/stable/InRelease",
            "404 Not Found",
        );

        assert_eq!(matched, 1);
        let first = &cats.children()[0];
        let errors = first.aref("errors").unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.children()[0].aref_text("msg"),
            Some("404 Not Found")
        );
        assert!(cats.children()[1].aref("errors").is_none());
    }

    #[test]
    fn error_attribution_component_path() {
        let mut cats = set(vec![catalogue(
            "http://a.example.com",
            "stable",
            Some("main extras"),
        )]);

        assert_eq!(
            attach_error(
                &mut cats,
                "http://a.example.com/dists/stable/extras/binary-armel/Packages",
                "timeout",
            ),
            1
        );
        assert_eq!(
            attach_error(
                &mut cats,
                "http://a.example.com/dists/stable/other/binary-armel/Packages",
                "timeout",
            ),
            0
        );
    }

    #[test]
    fn error_attribution_trivial_dist() {
        let mut cats = set(vec![catalogue("http://a.example.com", "updates/", None)]);
        assert_eq!(
            attach_error(&mut cats, "http://a.example.com/updates/Packages", "bad"),
            1
        );

        let mut root_dist = set(vec![catalogue("http://a.example.com", "/", None)]);
        assert_eq!(
            attach_error(&mut root_dist, "http://a.example.com/Packages", "bad"),
            1
        );
    }

    #[test]
    fn failed_catalogue_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        let mut cats = set(vec![
            catalogue("http://a.example.com", "stable", Some("main")),
            catalogue("http://b.example.com", "stable", Some("main")),
        ]);
        attach_error(
            &mut cats,
            "http://a.example.com/dists/stable/InRelease",
            "404",
        );

        save_failed_catalogues(&installation, &cats);
        assert!(installation.failed_catalogues_path().exists());

        // A fresh read of the config has no errors; merging restores them.
        let mut fresh = set(vec![
            catalogue("http://a.example.com", "stable", Some("main")),
            catalogue("http://b.example.com", "stable", Some("main")),
        ]);
        merge_catalogues_with_errors(&installation, &mut fresh);
        assert!(fresh.children()[0].aref("errors").is_some());
        assert!(fresh.children()[1].aref("errors").is_none());

        // No errors anywhere removes the stored file.
        let clean = set(vec![catalogue("http://b.example.com", "stable", None)]);
        save_failed_catalogues(&installation, &clean);
        assert!(!installation.failed_catalogues_path().exists());
    }

    #[test]
    fn sources_list_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appman.list");

        let mut disabled = catalogue("http://c.example.com", "stable", None);
        disabled.append(Xexp::list("disabled"));

        let cats = set(vec![
            catalogue("http://a.example.com", "stable", Some("main extras")),
            disabled,
        ]);

        write_sources_list(&path, &cats).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "deb http://a.example.com stable main extras\n");
    }
}
