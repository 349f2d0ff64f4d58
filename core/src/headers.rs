//! Ordered, case-insensitive HTTP header map.
//!
//! # Design
//! Headers are kept as a `Vec` of `(name, value)` pairs in first-insertion
//! order. Lookup compares names ASCII case-insensitively. Writing an existing
//! name replaces its value and adopts the new spelling (last write wins).
//! Response headers use [`HeaderMap::append_response`], which joins repeated
//! `Set-Cookie` values with `,` instead of replacing them.

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Pseudo-header under which a response status line is recorded.
pub const STATUS_LINE_KEY: &str = "HTTP-STATUS-LINE";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Insert or replace `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => self.entries[i] = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    /// Record one header from a response. Repeated `Set-Cookie` headers are
    /// concatenated; everything else is replaced.
    pub fn append_response(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if name.eq_ignore_ascii_case("set-cookie") {
            if let Some(i) = self.position(&name) {
                let existing = &mut self.entries[i].1;
                existing.push(',');
                existing.push_str(&value);
                return;
            }
        }
        self.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }
}

impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
