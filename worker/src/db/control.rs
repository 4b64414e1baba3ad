// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Control-file stanza parsing.
//!
//! Both the installed status database and downloaded `Packages` index
//! files are sequences of RFC822-style stanzas separated by blank lines,
//! with continuation lines introduced by whitespace.

/// One parsed stanza; field order is preserved, lookup is
/// case-insensitive as dpkg treats field names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stanza {
    fields: Vec<(String, String)>,
}

impl Stanza {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.get(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Field value with an `LC_MESSAGES` suffix when one is present,
    /// falling back to the plain field.
    pub fn get_localized(&self, name: &str, lc_messages: Option<&str>) -> Option<&str> {
        if let Some(locale) = lc_messages.filter(|l| !l.is_empty()) {
            if let Some(value) = self.get(&format!("{name}-{locale}")) {
                return Some(value);
            }
        }
        self.get(name)
    }

    /// First line of a multi-line field
    pub fn get_first_line(&self, name: &str) -> Option<&str> {
        self.get(name).map(|v| v.lines().next().unwrap_or(""))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn push(&mut self, key: String, value: String) {
        self.fields.push((key, value));
    }
}

/// Parse a whole file into stanzas, skipping empty ones
pub fn parse(text: &str) -> Vec<Stanza> {
    let mut stanzas = Vec::new();
    let mut current = Stanza::default();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                stanzas.push(std::mem::take(&mut current));
            }
            continue;
        }

        if line.starts_with([' ', '\t']) {
            // Continuation of the previous field; a lone dot marks a
            // blank line in the original text.
            if let Some((_, value)) = current.fields.last_mut() {
                let cont = line.trim_start();
                value.push('\n');
                value.push_str(if cont == "." { "" } else { cont });
            }
            continue;
        }

        if let Some((key, value)) = line.split_once(':') {
            current.push(key.trim().to_owned(), value.trim().to_owned());
        }
    }

    if !current.is_empty() {
        stanzas.push(current);
    }

    stanzas
}

/// Parse a single stanza (e.g. `dpkg-deb -f` output)
pub fn parse_one(text: &str) -> Option<Stanza> {
    parse(text).into_iter().next()
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
Package: osso-browser
Status: install ok installed
Section: user/network
Version: 2.1-3
Depends: libgtkcore (>= 2.0), osso-core | osso-base
Description: Web browser
 Browses the web.
 .
 Second paragraph.

Package: libgtkcore
Version: 2.0
";

    #[test]
    fn stanza_split_and_lookup() {
        let stanzas = parse(SAMPLE);
        assert_eq!(stanzas.len(), 2);
        assert_eq!(stanzas[0].get("Package"), Some("osso-browser"));
        assert_eq!(stanzas[0].get("package"), Some("osso-browser"));
        assert_eq!(stanzas[1].get("Version"), Some("2.0"));
        assert!(!stanzas[1].has("Depends"));
    }

    #[test]
    fn continuation_lines() {
        let stanzas = parse(SAMPLE);
        assert_eq!(
            stanzas[0].get("Description"),
            Some("Web browser\nBrowses the web.\n\nSecond paragraph.")
        );
        assert_eq!(stanzas[0].get_first_line("Description"), Some("Web browser"));
    }

    #[test]
    fn localized_lookup() {
        let stanza = parse_one(
            "Package: x\nDescription: plain\nDescription-fi_FI: suomeksi\n",
        )
        .unwrap();
        assert_eq!(
            stanza.get_localized("Description", Some("fi_FI")),
            Some("suomeksi")
        );
        assert_eq!(stanza.get_localized("Description", None), Some("plain"));
        assert_eq!(
            stanza.get_localized("Description", Some("de_DE")),
            Some("plain")
        );
    }

    #[test]
    fn get_int_parses_or_defaults() {
        let stanza = parse_one("Package: x\nInstalled-Size: 204\n").unwrap();
        assert_eq!(stanza.get_int("Installed-Size", 0), 204);
        assert_eq!(stanza.get_int("Missing", 7), 7);
    }
}
