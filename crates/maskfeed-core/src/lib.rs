//! Core record model, keyed datasets and the left-join merger for maskfeed.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod a1;

pub const CRATE_NAME: &str = "maskfeed-core";

/// Canonical name of the join key shared by every feed.
pub const ID_FIELD: &str = "id";

/// One normalized row: canonical field name -> cell text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.get(ID_FIELD).filter(|id| !id.is_empty())
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatasetError {
    #[error("record has no `id` value")]
    MissingId,
}

/// Records keyed by `id`, kept in first-seen order, with the declared output
/// field order used for headers and merges.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    fields: Vec<String>,
    records: Vec<Record>,
    index: HashMap<String, usize>,
}

impl Dataset {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Declared fields other than the join key.
    pub fn output_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .map(String::as_str)
            .filter(|f| *f != ID_FIELD)
    }

    /// Inserts a record under its id. A later record with the same id replaces
    /// the earlier one in place and the replaced record is returned.
    pub fn insert(&mut self, record: Record) -> Result<Option<Record>, DatasetError> {
        let id = record.id().ok_or(DatasetError::MissingId)?.to_string();
        match self.index.get(&id) {
            Some(&pos) => Ok(Some(std::mem::replace(&mut self.records[pos], record))),
            None => {
                self.index.insert(id, self.records.len());
                self.records.push(record);
                Ok(None)
            }
        }
    }

    /// Unions `other` into `self`; returns how many ids were already present.
    pub fn extend(&mut self, other: Dataset) -> usize {
        for field in &other.fields {
            if !self.fields.contains(field) {
                self.fields.push(field.clone());
            }
        }
        let mut replaced = 0;
        for record in other.records {
            if let Ok(Some(_)) = self.insert(record) {
                replaced += 1;
            }
        }
        replaced
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().filter_map(Record::id)
    }
}

/// Left-joins `secondaries` onto `primary` by `id`.
///
/// The primary dataset defines the key set and the record order. For every
/// primary record, each secondary holding the same id overlays its declared
/// output fields; secondaries later in the slice win on overlapping fields.
/// Ids only present in a secondary are dropped.
pub fn merge(primary: &Dataset, secondaries: &[&Dataset]) -> Dataset {
    let mut fields = primary.fields.clone();
    for secondary in secondaries {
        for field in secondary.output_fields() {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
    }

    let mut merged = Dataset::new(fields);
    for record in primary.iter() {
        let Some(id) = record.id() else {
            continue;
        };
        let mut out = record.clone();
        for secondary in secondaries {
            let Some(other) = secondary.get(id) else {
                continue;
            };
            for field in secondary.output_fields() {
                if let Some(value) = other.get(field) {
                    out.insert(field, value);
                }
            }
        }
        merged.index.insert(id.to_string(), merged.records.len());
        merged.records.push(out);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(fields: &[&str], rows: &[&[(&str, &str)]]) -> Dataset {
        let mut ds = Dataset::new(fields.iter().copied());
        for row in rows {
            ds.insert(Record::from_pairs(row.iter().copied())).unwrap();
        }
        ds
    }

    #[test]
    fn left_join_keeps_primary_keys_only() {
        let primary = dataset(&["id", "x"], &[&[("id", "A"), ("x", "1")]]);
        let secondary = dataset(
            &["id", "y"],
            &[&[("id", "A"), ("y", "2")], &[("id", "B"), ("y", "9")]],
        );

        let merged = merge(&primary, &[&secondary]);

        assert_eq!(merged.len(), 1);
        assert!(!merged.contains("B"));
        assert_eq!(
            merged.get("A").unwrap(),
            &Record::from_pairs([("id", "A"), ("x", "1"), ("y", "2")])
        );
        assert_eq!(merged.fields(), &["id", "x", "y"]);
    }

    #[test]
    fn later_secondary_wins_on_overlap() {
        let primary = dataset(&["id"], &[&[("id", "A")], &[("id", "C")]]);
        let first = dataset(&["id", "y"], &[&[("id", "A"), ("y", "first")]]);
        let second = dataset(&["id", "y"], &[&[("id", "A"), ("y", "second")]]);

        let merged = merge(&primary, &[&first, &second]);

        assert_eq!(merged.get("A").unwrap().get("y"), Some("second"));
        assert_eq!(merged.get("C").unwrap().get("y"), None);
        assert_eq!(merged.ids().collect::<Vec<_>>(), vec!["A", "C"]);
    }

    #[test]
    fn secondary_ignores_undeclared_fields() {
        let primary = dataset(&["id", "name"], &[&[("id", "A"), ("name", "keep")]]);
        let secondary = dataset(&["id", "y"], &[&[("id", "A"), ("y", "2"), ("name", "clobber")]]);

        let merged = merge(&primary, &[&secondary]);

        assert_eq!(merged.get("A").unwrap().get("name"), Some("keep"));
    }

    #[test]
    fn duplicate_ids_replace_in_place() {
        let mut ds = dataset(&["id", "v"], &[&[("id", "A"), ("v", "1")], &[("id", "B"), ("v", "1")]]);
        let replaced = ds
            .insert(Record::from_pairs([("id", "A"), ("v", "2")]))
            .unwrap();

        assert_eq!(replaced.unwrap().get("v"), Some("1"));
        assert_eq!(ds.ids().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(ds.get("A").unwrap().get("v"), Some("2"));
    }

    #[test]
    fn insert_without_id_is_rejected() {
        let mut ds = Dataset::new(["id"]);
        assert_eq!(
            ds.insert(Record::from_pairs([("id", "")])),
            Err(DatasetError::MissingId)
        );
        assert!(ds.is_empty());
    }

    #[test]
    fn extend_counts_duplicates_and_unions_fields() {
        let mut a = dataset(&["id", "tel"], &[&[("id", "A"), ("tel", "1")]]);
        let b = dataset(
            &["id", "tel", "type"],
            &[&[("id", "A"), ("tel", "2")], &[("id", "B"), ("tel", "3")]],
        );

        assert_eq!(a.extend(b), 1);
        assert_eq!(a.len(), 2);
        assert_eq!(a.fields(), &["id", "tel", "type"]);
        assert_eq!(a.get("A").unwrap().get("tel"), Some("2"));
    }
}
