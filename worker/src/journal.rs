// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The operation journal: an on-disk record of an in-progress install,
//! written before the operation starts and erased only after success.
//! The rescue boot path replays it from removable media.

use std::io;

use log::warn;
use xexp::Xexp;

use crate::installation::Installation;

/// A journalled operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub package: String,
    pub download_root: Option<String>,
}

pub fn save(installation: &Installation, package: &str, download_root: Option<&str>) {
    let mut record = Xexp::list("install");
    record.aset_text("package", Some(package));
    record.aset_text("download-root", download_root);

    if let Err(e) = xexp::write_file(installation.journal_path(), &record) {
        warn!("can't write operation record: {e}");
    }
}

pub fn erase(installation: &Installation) {
    if let Err(e) = std::fs::remove_file(installation.journal_path()) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("can't erase operation record: {e}");
        }
    }
}

pub fn read(installation: &Installation) -> Option<Record> {
    let path = installation.journal_path();
    if !path.exists() {
        return None;
    }

    match xexp::read_file(&path) {
        Ok(record) if record.is("install") => {
            let package = record.aref_text("package")?.to_owned();
            let download_root = record.aref_text("download-root").map(str::to_owned);
            Some(Record {
                package,
                download_root,
            })
        }
        Ok(_) => None,
        Err(e) => {
            warn!("unreadable operation record: {e}");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_and_erase() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        assert_eq!(read(&installation), None);

        save(&installation, "osso-update", Some("/media/mmc1"));
        assert_eq!(
            read(&installation),
            Some(Record {
                package: "osso-update".into(),
                download_root: Some("/media/mmc1".into()),
            })
        );

        erase(&installation);
        assert_eq!(read(&installation), None);
        assert!(!installation.journal_path().exists());

        // Erasing twice is quiet.
        erase(&installation);
    }

    #[test]
    fn record_without_root() {
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        save(&installation, "app", None);
        let record = read(&installation).unwrap();
        assert_eq!(record.download_root, None);
    }
}
