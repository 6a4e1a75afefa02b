use core::fmt;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Marker for a field that was looked for but could not be extracted.
pub const SENTINEL: &str = "Not found";

/// One extracted listing: field name to value, in column order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(CompactString, String)>,
}

impl Record {
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<CompactString>,
        V: Into<String>,
    {
        let mut record = Self::new();
        for (k, v) in pairs {
            record.insert(k, v);
        }
        record
    }

    /// Sets `name`, overwriting in place if the field already exists.
    pub fn insert(&mut self, name: impl Into<CompactString>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    /// Like [`insert`](Self::insert), but an absent or blank value becomes [`SENTINEL`].
    pub fn set(&mut self, name: impl Into<CompactString>, value: Option<String>) {
        match value {
            Some(v) if !v.trim().is_empty() => self.insert(name, v),
            _ => self.insert(name, SENTINEL),
        }
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<CompactString>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub const fn len(&self) -> usize {
        self.fields.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn sentinel_count(&self) -> usize {
        self.fields.iter().filter(|(_, v)| v == SENTINEL).count()
    }

    /// Folds `other` into `self`; fields of `other` win unless they are [`SENTINEL`]
    /// and `self` already holds a real value.
    pub fn merge(&mut self, other: Self) {
        for (k, v) in other.fields {
            if v == SENTINEL && self.get(&k).is_some_and(|cur| cur != SENTINEL) {
                continue;
            }
            self.insert(k, v);
        }
    }
}

/// Composite natural key of a [`Record`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordIdentifier(CompactString);

impl RecordIdentifier {
    pub fn new(s: impl Into<CompactString>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which fields make up a [`RecordIdentifier`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySpec(Vec<CompactString>);

impl KeySpec {
    pub fn new<S: Into<CompactString>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(CompactString::as_str)
    }

    fn join<'a>(&self, mut lookup: impl FnMut(&str) -> Option<&'a str>) -> RecordIdentifier {
        let mut id = CompactString::default();
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                id.push('_');
            }
            id.push_str(lookup(field).map_or("unknown", str::trim));
        }
        RecordIdentifier(id)
    }

    /// Identifier of a fully extracted record. Missing key fields read as `unknown`.
    pub fn identify(&self, record: &Record) -> RecordIdentifier {
        self.join(|f| record.get(f))
    }

    /// Identifier of a list-level preview, or `None` when any key field is
    /// missing there and the preview cannot stand in for the full record.
    pub fn identify_partial(&self, record: &Record) -> Option<RecordIdentifier> {
        self.0
            .iter()
            .all(|f| record.get(f).is_some_and(|v| v != SENTINEL))
            .then(|| self.identify(record))
    }

    /// Identifier of a CSV row given its header.
    pub fn identify_row(&self, header: &[String], row: &[String]) -> RecordIdentifier {
        self.join(|f| {
            header
                .iter()
                .position(|h| h == f)
                .and_then(|i| row.get(i))
                .map(String::as_str)
        })
    }

    /// Whether `header` carries every key column.
    pub fn covered_by(&self, header: &[String]) -> bool {
        self.0.iter().all(|f| header.iter().any(|h| h == f))
    }
}
