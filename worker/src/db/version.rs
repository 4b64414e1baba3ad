// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Debian version ordering.
//!
//! A version is `[epoch:]upstream[-revision]`. Within upstream and
//! revision, alternating non-digit and digit chunks are compared; in
//! non-digit chunks letters sort before everything else and `~` sorts
//! before anything, including the end of the string.

use std::cmp::Ordering;

/// Compare two full version strings
pub fn compare(a: &str, b: &str) -> Ordering {
    let (epoch_a, rest_a) = split_epoch(a);
    let (epoch_b, rest_b) = split_epoch(b);

    epoch_a
        .cmp(&epoch_b)
        .then_with(|| {
            let (up_a, rev_a) = split_revision(rest_a);
            let (up_b, rev_b) = split_revision(rest_b);
            compare_fragment(up_a, up_b).then_with(|| compare_fragment(rev_a, rev_b))
        })
}

/// Does `candidate` satisfy `relation` against `reference`?
pub fn satisfies(candidate: &str, relation: Relation, reference: &str) -> bool {
    let order = compare(candidate, reference);
    match relation {
        Relation::Earlier => order == Ordering::Less,
        Relation::EarlierEqual => order != Ordering::Greater,
        Relation::Equal => order == Ordering::Equal,
        Relation::LaterEqual => order != Ordering::Less,
        Relation::Later => order == Ordering::Greater,
    }
}

/// A dependency relation operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Earlier,
    EarlierEqual,
    Equal,
    LaterEqual,
    Later,
}

impl Relation {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "<<" => Some(Self::Earlier),
            "<=" | "<" => Some(Self::EarlierEqual),
            "=" => Some(Self::Equal),
            ">=" | ">" => Some(Self::LaterEqual),
            ">>" => Some(Self::Later),
            _ => None,
        }
    }
}

fn split_epoch(version: &str) -> (u64, &str) {
    match version.split_once(':') {
        Some((epoch, rest)) if epoch.chars().all(|c| c.is_ascii_digit()) => {
            (epoch.parse().unwrap_or(0), rest)
        }
        _ => (0, version),
    }
}

fn split_revision(version: &str) -> (&str, &str) {
    match version.rsplit_once('-') {
        Some((upstream, revision)) => (upstream, revision),
        None => (version, ""),
    }
}

fn compare_fragment(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    loop {
        let order = compare_nondigits(&mut a, &mut b);
        if order != Ordering::Equal {
            return order;
        }

        let order = compare_digits(&mut a, &mut b);
        if order != Ordering::Equal {
            return order;
        }

        if a.is_empty() && b.is_empty() {
            return Ordering::Equal;
        }
    }
}

fn compare_nondigits(a: &mut &[u8], b: &mut &[u8]) -> Ordering {
    loop {
        let ca = a.first().copied().filter(|c| !c.is_ascii_digit());
        let cb = b.first().copied().filter(|c| !c.is_ascii_digit());

        match (ca, cb) {
            (None, None) => return Ordering::Equal,
            _ => {
                let order = char_weight(ca).cmp(&char_weight(cb));
                if order != Ordering::Equal {
                    return order;
                }
                *a = &a[1..];
                *b = &b[1..];
            }
        }
    }
}

/// Tilde before end-of-string, letters before other characters
fn char_weight(c: Option<u8>) -> i32 {
    match c {
        Some(b'~') => -1,
        None => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

fn compare_digits(a: &mut &[u8], b: &mut &[u8]) -> Ordering {
    fn take<'a>(s: &mut &'a [u8]) -> &'a [u8] {
        let len = s.iter().take_while(|c| c.is_ascii_digit()).count();
        let (digits, rest) = s.split_at(len);
        *s = rest;
        digits
    }

    let da = take(a);
    let db = take(b);

    let trim = |d: &[u8]| {
        let start = d.iter().take_while(|&&c| c == b'0').count();
        d[start..].to_vec()
    };

    let da = trim(da);
    let db = trim(db);

    da.len().cmp(&db.len()).then_with(|| da.cmp(&db))
}

#[cfg(test)]
mod test {
    use super::*;

    fn less(a: &str, b: &str) {
        assert_eq!(compare(a, b), Ordering::Less, "{a} < {b}");
        assert_eq!(compare(b, a), Ordering::Greater, "{b} > {a}");
    }

    #[test]
    fn numeric_ordering() {
        less("1.0", "1.1");
        less("1.9", "1.10");
        less("2.0", "10.0");
        assert_eq!(compare("1.00", "1.0"), Ordering::Equal);
    }

    #[test]
    fn epochs_dominate() {
        less("9.9", "1:0.1");
        less("1:2.0", "2:1.0");
        assert_eq!(compare("0:1.0", "1.0"), Ordering::Equal);
    }

    #[test]
    fn revisions_break_ties() {
        less("1.0-1", "1.0-2");
        less("1.0", "1.0-1");
        less("1.0-1", "1.0-1.1");
    }

    #[test]
    fn tilde_sorts_first() {
        less("1.0~rc1", "1.0");
        less("1.0~~", "1.0~");
        less("1.0~rc1-1", "1.0-1");
    }

    #[test]
    fn letters_before_symbols() {
        less("1.0a", "1.0+");
        less("1.0alpha", "1.0b");
    }

    #[test]
    fn relations() {
        assert!(satisfies("2.0", Relation::Later, "1.0"));
        assert!(satisfies("2.0", Relation::LaterEqual, "2.0"));
        assert!(!satisfies("2.0", Relation::Earlier, "2.0"));
        assert!(satisfies("1.0", Relation::EarlierEqual, "1.0"));
        assert!(satisfies("1.0", Relation::Equal, "1.0"));
        assert_eq!(Relation::parse(">="), Some(Relation::LaterEqual));
        assert_eq!(Relation::parse("~"), None);
    }
}
