// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Payload encoder and decoder.
//!
//! Integers are native-endian and every primitive is padded so the cursor
//! stays aligned to four bytes. Strings are a length prefix (−1 = null)
//! followed by the bytes plus a NUL, padded. A decoder that under-reads
//! becomes corrupted; every later read is a no-op yielding zero/null.

use xexp::Xexp;

fn roundup(value: usize, factor: usize) -> usize {
    value.div_ceil(factor) * factor
}

/// Builds a payload, growing as needed
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn mem_plus_zeros(&mut self, bytes: &[u8], zeros: usize) {
        let padded = roundup(bytes.len() + zeros, 4);
        self.buf.extend_from_slice(bytes);
        self.buf.resize(self.buf.len() + (padded - bytes.len()), 0);
    }

    pub fn mem(&mut self, bytes: &[u8]) {
        self.mem_plus_zeros(bytes, 0);
    }

    pub fn int32(&mut self, value: i32) {
        self.mem(&value.to_ne_bytes());
    }

    pub fn int64(&mut self, value: i64) {
        self.mem(&value.to_ne_bytes());
    }

    pub fn string(&mut self, value: Option<&str>) {
        match value {
            None => self.int32(-1),
            Some(text) => {
                self.int32(text.len() as i32);
                self.mem_plus_zeros(text.as_bytes(), 1);
            }
        }
    }

    pub fn xexp(&mut self, value: Option<&Xexp>) {
        match value {
            None => self.string(None),
            Some(x) => {
                self.string(Some(x.tag()));
                if x.is_list() {
                    self.int32(x.len() as i32);
                    for child in x.children() {
                        self.xexp(Some(child));
                    }
                } else {
                    self.int32(-1);
                    self.string(x.text_value());
                }
            }
        }
    }
}

/// Walks a payload; under-reads poison it instead of panicking
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    corrupted: bool,
    at_end: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            corrupted: false,
            at_end: buf.is_empty(),
        }
    }

    pub fn corrupted(&self) -> bool {
        self.corrupted
    }

    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Advance over `n` payload bytes, returning them before padding
    fn mem(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.corrupted {
            return None;
        }

        let padded = roundup(n, 4);
        if self.pos + padded > self.buf.len() {
            self.corrupted = true;
            self.at_end = true;
            return None;
        }

        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += padded;
        if self.pos == self.buf.len() {
            self.at_end = true;
        }
        Some(bytes)
    }

    pub fn int32(&mut self) -> i32 {
        self.mem(4)
            .map(|b| i32::from_ne_bytes(b.try_into().unwrap()))
            .unwrap_or(0)
    }

    pub fn int64(&mut self) -> i64 {
        self.mem(8)
            .map(|b| i64::from_ne_bytes(b.try_into().unwrap()))
            .unwrap_or(0)
    }

    /// Decode a string.
    ///
    /// Invalid UTF-8 is repaired deterministically: every byte above 127
    /// becomes `?`. The data is recovered for display, never rejected.
    pub fn string(&mut self) -> Option<String> {
        let len = self.int32();
        if len < 0 || self.corrupted {
            return None;
        }

        let bytes = self.mem(len as usize + 1)?;
        let text = &bytes[..len as usize];

        match std::str::from_utf8(text) {
            Ok(s) => Some(s.to_owned()),
            Err(_) => Some(
                text.iter()
                    .map(|&b| if b > 127 { '?' } else { b as char })
                    .collect(),
            ),
        }
    }

    pub fn xexp(&mut self) -> Option<Xexp> {
        let tag = self.string()?;
        let len = self.int32();
        if len >= 0 {
            let mut node = Xexp::list(&tag);
            for _ in 0..len {
                if self.corrupted {
                    break;
                }
                if let Some(child) = self.xexp() {
                    node.append(child);
                }
            }
            Some(node)
        } else {
            Some(Xexp::text(&tag, self.string().unwrap_or_default()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primitive_roundtrip() {
        let mut enc = Encoder::new();
        enc.int32(-7);
        enc.int64(1 << 40);
        enc.string(Some("hello"));
        enc.string(None);
        enc.string(Some(""));

        let mut dec = Decoder::new(enc.as_slice());
        assert_eq!(dec.int32(), -7);
        assert_eq!(dec.int64(), 1 << 40);
        assert_eq!(dec.string().as_deref(), Some("hello"));
        assert_eq!(dec.string(), None);
        assert_eq!(dec.string().as_deref(), Some(""));
        assert!(dec.at_end());
        assert!(!dec.corrupted());
    }

    #[test]
    fn cursor_stays_aligned() {
        let mut enc = Encoder::new();
        enc.string(Some("ab"));
        // 4 length + 3 bytes padded to 4
        assert_eq!(enc.len(), 8);
        enc.int32(1);
        assert_eq!(enc.len(), 12);
    }

    #[test]
    fn xexp_roundtrip() {
        let mut root = Xexp::list("catalogues");
        let mut cat = Xexp::list("catalogue");
        cat.append(Xexp::text("uri", "http://repo.example.com"));
        cat.append(Xexp::list("errors"));
        root.append(cat);
        root.append(Xexp::text("note", ""));

        let mut enc = Encoder::new();
        enc.xexp(Some(&root));

        let mut dec = Decoder::new(enc.as_slice());
        assert_eq!(dec.xexp(), Some(root));
        assert!(!dec.corrupted());
    }

    #[test]
    fn null_xexp() {
        let mut enc = Encoder::new();
        enc.xexp(None);
        let mut dec = Decoder::new(enc.as_slice());
        assert_eq!(dec.xexp(), None);
    }

    #[test]
    fn truncation_poisons_decoder() {
        let mut enc = Encoder::new();
        enc.string(Some("a longer string for truncation"));
        enc.int32(5);

        for cut in 0..enc.len() - 1 {
            let mut dec = Decoder::new(&enc.as_slice()[..cut]);
            let _ = dec.string();
            let _ = dec.int32();
            assert!(dec.corrupted(), "cut at {cut} must corrupt");
            assert!(dec.at_end());
            // Poisoned decoders keep returning zero/null without panicking.
            assert_eq!(dec.int32(), 0);
            assert_eq!(dec.int64(), 0);
            assert_eq!(dec.string(), None);
            assert_eq!(dec.xexp(), None);
        }
    }

    #[test]
    fn invalid_utf8_is_repaired() {
        let mut enc = Encoder::new();
        enc.int32(4);
        enc.mem(&[b'a', 0xff, b'b', 0xfe, 0]);

        let mut dec = Decoder::new(enc.as_slice());
        assert_eq!(dec.string().as_deref(), Some("a?b?"));
        assert!(!dec.corrupted());
    }

    #[test]
    fn empty_payload_is_at_end() {
        let dec = Decoder::new(&[]);
        assert!(dec.at_end());
        assert!(!dec.corrupted());
    }
}
