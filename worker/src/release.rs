// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Source classification: mapping an index file onto a trust domain.
//!
//! Trusted indexes are classified by the URI first, then by the
//! fingerprint of the key that signed their `InRelease`, and fall back
//! to the implicit `signed` domain. Untrusted indexes are `unsigned`.

use std::path::Path;

use base64::Engine;
use fs_err as fs;

use crate::{
    db::{Database, IndexId},
    domain::{DomainId, Domains, SIGNED, UNSIGNED},
    installation::Installation,
    source::{uri_to_filename, Source},
};

/// Classify one index file
pub fn classify(
    db: &Database,
    index: IndexId,
    domains: &Domains,
    installation: &Installation,
) -> DomainId {
    let index = db.index(index);

    if !index.trusted {
        return UNSIGNED;
    }

    let by_uri = domains.find_by_uri(&index.uri);
    if by_uri != SIGNED {
        return by_uri;
    }

    let source = Source {
        uri: index.uri.clone(),
        dist: index.dist.clone(),
        components: vec![],
    };
    let release = installation
        .lists_dir()
        .join(uri_to_filename(&source.release_uri()));

    match signing_key_fingerprint(&release) {
        Some(key) => domains.find_by_key(&key),
        None => SIGNED,
    }
}

/// Fingerprint of the key that signed an `InRelease` file.
///
/// The fingerprint is carried in the OpenPGP signature packet: decode the
/// armored signature block and render the 20 bytes following the packet
/// header as 40 uppercase hex digits.
pub fn signing_key_fingerprint(release_path: impl AsRef<Path>) -> Option<String> {
    let text = fs::read_to_string(release_path.as_ref()).ok()?;
    fingerprint_from_armor(&text)
}

fn fingerprint_from_armor(text: &str) -> Option<String> {
    let mut in_signature = false;
    let mut armor = String::new();

    for line in text.lines() {
        if in_signature {
            armor.push_str(line.trim());
            if armor.len() >= 44 {
                let packet = base64::engine::general_purpose::STANDARD
                    .decode(&armor[16..44])
                    .ok()?;
                if packet.len() < 20 {
                    return None;
                }
                return Some(hex::encode_upper(&packet[..20]));
            }
        } else if line == "-----BEGIN PGP SIGNATURE-----" {
            in_signature = true;
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use base64::Engine;

    fn armored(packet: &[u8]) -> String {
        let body = base64::engine::general_purpose::STANDARD.encode(packet);
        format!(
            "Origin: Example\nSuite: stable\n-----BEGIN PGP SIGNATURE-----\n{body}\n-----END PGP SIGNATURE-----\n"
        )
    }

    #[test]
    fn fingerprint_extraction() {
        // 12 header bytes, then the 20-byte fingerprint, then padding.
        let mut packet = vec![0u8; 12];
        packet.extend((0..20).map(|i| i as u8));
        packet.extend([0u8; 9]);

        let fingerprint = fingerprint_from_armor(&armored(&packet)).unwrap();
        assert_eq!(fingerprint.len(), 40);
        assert!(fingerprint.starts_with("000102030405"));
        assert!(fingerprint.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn unsigned_text_yields_nothing() {
        assert_eq!(fingerprint_from_armor("Origin: Example\n"), None);
        assert_eq!(
            fingerprint_from_armor("-----BEGIN PGP SIGNATURE-----\nshort\n"),
            None
        );
    }
}
