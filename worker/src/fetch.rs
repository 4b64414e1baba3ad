// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The fetcher: sequential downloads with progress pulses, cancellation
//! polling between pulses, and per-item error attribution.
//!
//! Files are downloaded into a `partial/` directory next to their final
//! location and renamed on completion, so an interrupted run leaves at
//! most one partial file behind and can resume it later.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use futures_util::StreamExt;
use log::{info, warn};
use thiserror::Error;
use url::Url;

use crate::{request, runtime};

/// One file to download
#[derive(Debug)]
pub struct Item {
    pub uri: String,
    /// Final destination; the partial file lives in `partial/` beside it
    pub dest: PathBuf,
    /// Expected size, when the index declared one
    pub size: Option<u64>,
    pub status: ItemStatus,
    /// Failure text; classification keys off its prefix
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Queued,
    Done,
    Failed,
}

impl Item {
    pub fn new(uri: impl ToString, dest: impl Into<PathBuf>, size: Option<u64>) -> Self {
        Self {
            uri: uri.to_string(),
            dest: dest.into(),
            size,
            status: ItemStatus::Queued,
            error: None,
        }
    }

    fn partial_path(&self) -> PathBuf {
        let name = self.dest.file_name().unwrap_or_default();
        self.dest
            .parent()
            .unwrap_or(Path::new("."))
            .join("partial")
            .join(name)
    }

    fn partial_size(&self) -> u64 {
        fs::metadata(self.partial_path()).map(|m| m.len()).unwrap_or(0)
    }
}

/// Reported between chunks; returning `Abort` stops the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    Continue,
    Abort,
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every item completed
    Complete,
    /// Some items failed; their error text is attached
    SomeFailed,
    /// The run was aborted by the cancel stream
    Aborted,
}

#[derive(Debug, Default)]
pub struct Fetcher {
    pub items: Vec<Item>,
}

impl Fetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: Item) {
        self.items.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bytes that still must come over the network
    pub fn fetch_needed(&self) -> u64 {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Queued && !item.dest.exists())
            .filter_map(|item| item.size)
            .sum()
    }

    /// Bytes already present in partial files
    pub fn partial_present(&self) -> u64 {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Queued && !item.dest.exists())
            .map(Item::partial_size)
            .sum()
    }

    /// Download every queued item. The pulse callback receives
    /// `(bytes_so_far, bytes_total)` and may abort the run.
    pub fn run(&mut self, pulse: &mut dyn FnMut(u64, u64) -> Pulse) -> Outcome {
        let total: u64 = self
            .items
            .iter()
            .filter_map(|item| item.size)
            .sum();
        let mut already: u64 = 0;
        let mut some_failed = false;

        let client = request::client();

        for item in &mut self.items {
            if item.status != ItemStatus::Queued {
                continue;
            }

            if item.dest.exists() {
                item.status = ItemStatus::Done;
                already += item.size.unwrap_or(0);
                continue;
            }

            match fetch_one(&client, item, &mut already, total, pulse) {
                Ok(true) => item.status = ItemStatus::Done,
                Ok(false) => return Outcome::Aborted,
                Err(e) => {
                    warn!("failed to fetch {}: {e}", item.uri);
                    item.status = ItemStatus::Failed;
                    item.error = Some(e.to_string());
                    some_failed = true;
                }
            }
        }

        if some_failed {
            Outcome::SomeFailed
        } else {
            Outcome::Complete
        }
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &Item> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
    }

    /// Remove every file under `dir` that no item accounts for
    pub fn clean(dir: &Path) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.file_name().is_some_and(|n| n != "lock") {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Download one item; `Ok(false)` means the pulse aborted the run.
fn fetch_one(
    client: &reqwest::Client,
    item: &mut Item,
    already: &mut u64,
    total: u64,
    pulse: &mut dyn FnMut(u64, u64) -> Pulse,
) -> Result<bool, Error> {
    let url: Url = item.uri.parse()?;

    let partial = item.partial_path();
    if let Some(parent) = partial.parent() {
        fs::create_dir_all(parent)?;
    }

    let offset = item.partial_size();
    let resuming = offset > 0;
    if resuming {
        info!("resuming {} at {offset}", item.uri);
    }

    let completed = runtime::block_on(async {
        let (_, mut stream) = request::get(client, url, offset).await.map_err(map_status)?;

        let mut out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial)?;

        let mut written = offset;
        *already += offset;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk)?;
            written += chunk.len() as u64;
            *already += chunk.len() as u64;

            if pulse(*already, total) == Pulse::Abort {
                out.flush()?;
                return Ok::<_, Error>(None);
            }
        }

        out.flush()?;
        Ok(Some(written))
    })?;

    let Some(written) = completed else {
        return Ok(false);
    };

    if let Some(expected) = item.size {
        if written != expected {
            fs::remove_file(&partial)?;
            return Err(Error::SizeMismatch {
                expected,
                actual: written,
            });
        }
    }

    fs::rename(&partial, &item.dest)?;
    Ok(true)
}

/// Keep the HTTP status at the front of the error text; the executor
/// classifies failures by prefix ("404" means not found).
fn map_status(e: reqwest::Error) -> Error {
    match e.status() {
        Some(status) => Error::Http(status.as_u16(), e),
        None => Error::Request(e),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} {1}")]
    Http(u16, #[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Size mismatch (expected {expected}, got {actual})")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_path_is_sibling_dir() {
        let item = Item::new("http://x/pool/a.deb", "/var/cache/appman/archives/a.deb", None);
        assert_eq!(
            item.partial_path(),
            PathBuf::from("/var/cache/appman/archives/partial/a.deb")
        );
    }

    #[test]
    fn fetch_needed_skips_complete_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.deb");
        std::fs::write(&present, b"data").unwrap();

        let mut fetcher = Fetcher::new();
        fetcher.add(Item::new("http://x/present.deb", &present, Some(4)));
        fetcher.add(Item::new(
            "http://x/absent.deb",
            dir.path().join("absent.deb"),
            Some(1000),
        ));

        assert_eq!(fetcher.fetch_needed(), 1000);
    }

    #[test]
    fn partial_present_counts_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("partial")).unwrap();
        std::fs::write(dir.path().join("partial/a.deb"), vec![0u8; 300]).unwrap();

        let mut fetcher = Fetcher::new();
        fetcher.add(Item::new(
            "http://x/a.deb",
            dir.path().join("a.deb"),
            Some(1000),
        ));

        assert_eq!(fetcher.partial_present(), 300);
        assert_eq!(fetcher.fetch_needed(), 1000);
    }

    #[test]
    fn error_text_prefixes() {
        let e = Error::SizeMismatch {
            expected: 10,
            actual: 4,
        };
        assert!(e.to_string().starts_with("Size mismatch"));
    }
}
