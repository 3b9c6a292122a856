//! Ordered header fields and url-encoded forms

use std::fmt::{self, Display};

pub const HOST: &str = "Host";
pub const CONNECTION: &str = "Connection";
pub const USER_AGENT: &str = "User-Agent";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const LOCATION: &str = "Location";

/// A single `name: value` header field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}
impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered list of header fields.
///
/// Names are matched case-sensitively.
/// [`Header::get`] returns the first match, [`Header::set`] replaces the first match or appends,
/// and [`Header::remove`] removes every match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<HeaderEntry>,
}
impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse CRLF separated `name: value` lines.
    ///
    /// Lines without a `:` are skipped. Names and values are trimmed.
    pub fn parse(fields: &str) -> Self {
        let entries = fields
            .split("\r\n")
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| HeaderEntry::new(name.trim(), value.trim()))
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|x| x.name == name)
            .map(|x| x.value.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|x| x.name == name) {
            Some(entry) => entry.value = value,
            None => self.entries.push(HeaderEntry::new(name, value)),
        }
    }

    /// Append a field without touching existing fields of the same name.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push(HeaderEntry::new(name, value));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|x| x.name != name);
    }

    pub fn entries(&self) -> &[HeaderEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `Content-Length` field as a non-negative integer, `None` when absent or malformed.
    pub fn content_length(&self) -> Option<usize> {
        self.get(CONTENT_LENGTH)?.parse().ok()
    }

    /// Set or remove the `Content-Length` field.
    pub fn set_content_length(&mut self, content_length: Option<usize>) {
        match content_length {
            Some(x) => self.set(CONTENT_LENGTH, x.to_string()),
            None => self.remove(CONTENT_LENGTH),
        }
    }

    /// Append the wire form of every field, each terminated by CRLF.
    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        for entry in self.entries.iter() {
            buf.extend_from_slice(entry.name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(entry.value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
}
impl Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}: {}", entry.name, entry.value)?;
        }
        Ok(())
    }
}
impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| HeaderEntry::new(n, v))
                .collect(),
        }
    }
}

/// Name/value pairs encoded as an `application/x-www-form-urlencoded` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    entries: Vec<(String, String)>,
}
impl Form {
    pub const CONTENT_TYPE: &'static str = "application/x-www-form-urlencoded";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name.to_owned(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    /// Builder-style [`Form::set`]
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.entries.iter())
            .finish()
            .into_bytes()
    }
}
