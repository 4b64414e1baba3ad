// SPDX-FileCopyrightText: Copyright © 2024-2026 Appman Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The worker's recursive tagged value type.
//!
//! Every node carries a tag and is either a text leaf or a list of child
//! nodes. Catalogue configurations, backup manifests, error reports and
//! the operation journal are all xexp trees, serialized as an XML-shaped
//! document with tags and text leaves.

use std::{
    fmt,
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs_err as fs;
use thiserror::Error;

/// A tagged node: a text leaf or an ordered list of children.
///
/// List order is significant for serialization, but lookups via [`Xexp::aref`]
/// always return the first match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xexp {
    tag: String,
    content: Content,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Content {
    Text(String),
    List(Vec<Xexp>),
}

impl Xexp {
    /// Construct an empty list node
    pub fn list(tag: impl ToString) -> Self {
        Self {
            tag: tag.to_string(),
            content: Content::List(vec![]),
        }
    }

    /// Construct a text leaf
    pub fn text(tag: impl ToString, text: impl ToString) -> Self {
        Self {
            tag: tag.to_string(),
            content: Content::Text(text.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag == tag
    }

    pub fn is_list(&self) -> bool {
        matches!(self.content, Content::List(_))
    }

    pub fn is_text(&self) -> bool {
        matches!(self.content, Content::Text(_))
    }

    /// Leaf text, `None` for list nodes
    pub fn text_value(&self) -> Option<&str> {
        match &self.content {
            Content::Text(t) => Some(t),
            Content::List(_) => None,
        }
    }

    /// Child nodes, empty for text leaves
    pub fn children(&self) -> &[Xexp] {
        match &self.content {
            Content::List(items) => items,
            Content::Text(_) => &[],
        }
    }

    pub fn children_mut(&mut self) -> &mut [Xexp] {
        match &mut self.content {
            Content::List(items) => items,
            Content::Text(_) => &mut [],
        }
    }

    pub fn len(&self) -> usize {
        self.children().len()
    }

    pub fn is_empty(&self) -> bool {
        match &self.content {
            Content::List(items) => items.is_empty(),
            Content::Text(t) => t.is_empty(),
        }
    }

    /// Append a child, turning a text leaf into a list if needed
    pub fn append(&mut self, child: Xexp) {
        match &mut self.content {
            Content::List(items) => items.push(child),
            Content::Text(_) => self.content = Content::List(vec![child]),
        }
    }

    /// First child with the given tag
    pub fn aref(&self, tag: &str) -> Option<&Xexp> {
        self.children().iter().find(|c| c.is(tag))
    }

    pub fn aref_mut(&mut self, tag: &str) -> Option<&mut Xexp> {
        match &mut self.content {
            Content::List(items) => items.iter_mut().find(|c| c.is(tag)),
            Content::Text(_) => None,
        }
    }

    /// Text of the first child with the given tag
    pub fn aref_text(&self, tag: &str) -> Option<&str> {
        self.aref(tag).and_then(Xexp::text_value)
    }

    pub fn aref_int(&self, tag: &str, default: i64) -> i64 {
        self.aref_text(tag)
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or(default)
    }

    /// True when a child with the tag exists and is not the text "false"
    pub fn aref_bool(&self, tag: &str) -> bool {
        match self.aref(tag) {
            Some(x) => x.text_value() != Some("false"),
            None => false,
        }
    }

    /// Replace the first child with the same tag, or append
    pub fn aset(&mut self, child: Xexp) {
        if let Some(slot) = self.aref_mut(child.tag()) {
            *slot = child;
        } else {
            self.append(child);
        }
    }

    /// Set a text child, or delete it when `value` is `None`
    pub fn aset_text(&mut self, tag: &str, value: Option<&str>) {
        match value {
            Some(v) => self.aset(Xexp::text(tag, v)),
            None => self.adel(tag),
        }
    }

    pub fn aset_int(&mut self, tag: &str, value: i64) {
        self.aset(Xexp::text(tag, value));
    }

    /// Delete every child with the given tag
    pub fn adel(&mut self, tag: &str) {
        if let Content::List(items) = &mut self.content {
            items.retain(|c| !c.is(tag));
        }
    }

    /// Remove the first child equal to `child`
    pub fn remove(&mut self, child: &Xexp) {
        if let Content::List(items) = &mut self.content {
            if let Some(pos) = items.iter().position(|c| c == child) {
                items.remove(pos);
            }
        }
    }

    /// Map every child through `f`, dropping the `None`s
    pub fn map_children(&self, f: impl Fn(&Xexp) -> Option<Xexp>) -> Xexp {
        let mut out = Xexp::list(&self.tag);
        for child in self.children() {
            if let Some(mapped) = f(child) {
                out.append(mapped);
            }
        }
        out
    }
}

impl fmt::Display for Xexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = Vec::new();
        write_node(&mut out, self, 0).map_err(|_| fmt::Error)?;
        f.write_str(&String::from_utf8_lossy(&out))
    }
}

/// Read a tree from its textual form
pub fn parse(input: &str) -> Result<Xexp, Error> {
    let mut parser = Parser {
        input: input.as_bytes(),
        pos: 0,
    };
    parser.skip_whitespace();
    let node = parser.element()?;
    parser.skip_whitespace();
    if parser.pos != parser.input.len() {
        return Err(Error::TrailingContent);
    }
    Ok(node)
}

/// Read a tree from a file
pub fn read_file(path: impl AsRef<Path>) -> Result<Xexp, Error> {
    let text = fs::read_to_string(path.as_ref())?;
    parse(&text)
}

/// Write a tree to a file, atomically.
///
/// The content lands in a sibling temporary file which is flushed, synced
/// and renamed over the target so an interrupted write never leaves a
/// half-serialized tree behind.
pub fn write_file(path: impl AsRef<Path>, x: &Xexp) -> Result<(), Error> {
    let path = path.as_ref();
    let tmp: PathBuf = {
        let mut name = path.as_os_str().to_owned();
        name.push(".tmp");
        name.into()
    };

    let mut file = fs::File::create(&tmp)?;
    write_node(&mut file, x, 0)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_node(out: &mut impl Write, x: &Xexp, depth: usize) -> io::Result<()> {
    let pad = " ".repeat(depth);
    match &x.content {
        Content::List(items) if items.is_empty() => {
            writeln!(out, "{pad}<{}/>", escape(&x.tag))
        }
        Content::List(items) => {
            writeln!(out, "{pad}<{}>", escape(&x.tag))?;
            for item in items {
                write_node(out, item, depth + 1)?;
            }
            writeln!(out, "{pad}</{}>", escape(&x.tag))
        }
        Content::Text(text) => {
            writeln!(out, "{pad}<{0}>{1}</{0}>", escape(&x.tag), escape(text))
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        if let Some(tail) = rest.strip_prefix("&amp;") {
            out.push('&');
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("&lt;") {
            out.push('<');
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("&gt;") {
            out.push('>');
            rest = tail;
        } else {
            out.push('&');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn element(&mut self) -> Result<Xexp, Error> {
        if self.input.get(self.pos) != Some(&b'<') {
            return Err(Error::ExpectedElement(self.pos));
        }
        self.pos += 1;
        let tag = self.tag_name()?;

        self.skip_whitespace();
        match self.input.get(self.pos) {
            // <tag/>
            Some(b'/') => {
                self.pos += 1;
                self.expect(b'>')?;
                Ok(Xexp::list(&tag))
            }
            Some(b'>') => {
                self.pos += 1;
                self.content(&tag)
            }
            _ => Err(Error::MalformedTag(self.pos)),
        }
    }

    /// Everything between `<tag>` and `</tag>`: either child elements
    /// (whitespace-separated) or leaf text.
    fn content(&mut self, tag: &str) -> Result<Xexp, Error> {
        let text_start = self.pos;
        let mut node = Xexp::list(tag);
        let mut saw_child = false;

        loop {
            match self.input.get(self.pos) {
                Some(b'<') if self.input.get(self.pos + 1) == Some(&b'/') => {
                    let text_end = self.pos;
                    self.pos += 2;
                    let close = self.tag_name()?;
                    self.skip_whitespace();
                    self.expect(b'>')?;
                    if close != tag {
                        return Err(Error::MismatchedClose(close));
                    }
                    if !saw_child {
                        let text = String::from_utf8_lossy(&self.input[text_start..text_end]);
                        if !text.trim().is_empty() {
                            return Ok(Xexp::text(tag, unescape(text.trim())));
                        }
                    }
                    return Ok(node);
                }
                Some(b'<') => {
                    saw_child = true;
                    node.append(self.element()?);
                }
                Some(_) => self.pos += 1,
                None => return Err(Error::UnexpectedEof),
            }
        }
    }

    fn tag_name(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'-' || *c == b'_' || *c == b'.')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(Error::MalformedTag(start));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn expect(&mut self, c: u8) -> Result<(), Error> {
        if self.input.get(self.pos) == Some(&c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::MalformedTag(self.pos))
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("expected an element at offset {0}")]
    ExpectedElement(usize),
    #[error("malformed tag at offset {0}")]
    MalformedTag(usize),
    #[error("mismatched closing tag </{0}>")]
    MismatchedClose(String),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("trailing content after the root element")]
    TrailingContent,
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Xexp {
        let mut root = Xexp::list("catalogues");
        let mut cat = Xexp::list("catalogue");
        cat.append(Xexp::text("name", "Extras"));
        cat.append(Xexp::text("uri", "http://repo.example.com/extras"));
        cat.append(Xexp::text("dist", "stable"));
        cat.append(Xexp::list("disabled"));
        root.append(cat);
        root
    }

    #[test]
    fn roundtrip() {
        let x = sample();
        let text = x.to_string();
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed, x);
    }

    #[test]
    fn escaping_roundtrip() {
        let x = Xexp::text("msg", "a < b && b > c");
        let parsed = parse(&x.to_string()).unwrap();
        assert_eq!(parsed, x);
    }

    #[test]
    fn aref_returns_first_match() {
        let mut x = Xexp::list("root");
        x.append(Xexp::text("key", "first"));
        x.append(Xexp::text("key", "second"));
        assert_eq!(x.aref_text("key"), Some("first"));
    }

    #[test]
    fn aset_replaces_in_place() {
        let mut x = sample();
        let cat = x.aref_mut("catalogue").unwrap();
        cat.aset_text("dist", Some("testing"));
        assert_eq!(cat.aref_text("dist"), Some("testing"));
        assert_eq!(cat.children().iter().filter(|c| c.is("dist")).count(), 1);
    }

    #[test]
    fn adel_removes_all() {
        let mut x = Xexp::list("root");
        x.append(Xexp::text("key", "a"));
        x.append(Xexp::text("other", "b"));
        x.append(Xexp::text("key", "c"));
        x.adel("key");
        assert_eq!(x.len(), 1);
        assert_eq!(x.aref_text("other"), Some("b"));
    }

    #[test]
    fn empty_list_parses_back_as_list() {
        let parsed = parse("<empty/>").unwrap();
        assert!(parsed.is_list());
        assert_eq!(parsed.len(), 0);
    }

    #[test]
    fn nested_depth() {
        let mut inner = Xexp::list("errors");
        let mut error = Xexp::list("error");
        error.append(Xexp::text("uri", "http://x/Release"));
        error.append(Xexp::text("msg", "404 Not Found"));
        inner.append(error);
        let mut root = Xexp::list("catalogue");
        root.append(inner);

        let parsed = parse(&root.to_string()).unwrap();
        assert_eq!(
            parsed
                .aref("errors")
                .and_then(|e| e.aref("error"))
                .and_then(|e| e.aref_text("msg")),
            Some("404 Not Found")
        );
    }

    #[test]
    fn file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("xexp-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.xexp");

        let x = sample();
        write_file(&path, &x).unwrap();
        assert_eq!(read_file(&path).unwrap(), x);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
