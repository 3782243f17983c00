//! Declarative row schemas and the small interpreter that applies them.
//!
//! A schema is an ordered list of [`FieldRule`]s. For each rule the raw cell
//! goes through the rewrite rules in order, is trimmed, falls back to the
//! default when empty or a sentinel, optionally passes through a converter,
//! and is finally checked against the rule's [`Shape`]. Any required field left empty or any shape mismatch makes
//! the whole row invalid.

use std::collections::HashMap;

use maskfeed_core::{Dataset, Record};
use regex::Regex;
use thiserror::Error;

/// One CSV line: header -> cell text.
pub type RawRow = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid pattern `{pattern}` in field `{field}`: {source}")]
    Pattern {
        field: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown schema `{0}`")]
    Unknown(String),
}

/// Why a single row was rejected. Rows are dropped and counted, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required field `{field}` is empty")]
    MissingRequired { field: String },
    #[error("field `{field}` has unexpected shape: {value:?}")]
    Shape { field: String, value: String },
    #[error("field `{field}` must equal {expected:?}, found {found:?}")]
    Marker {
        field: String,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone)]
pub struct Rewrite {
    pattern: Regex,
    replacement: String,
}

impl Rewrite {
    pub fn apply(&self, input: &str) -> String {
        self.pattern
            .replace_all(input, self.replacement.as_str())
            .into_owned()
    }
}

#[derive(Debug, Clone)]
pub enum Shape {
    Any,
    Exact(String),
    Pattern(Regex),
    /// ASCII letters and digits only.
    Alphanumeric,
}

impl Shape {
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            Shape::Any => true,
            Shape::Exact(expected) => value == expected,
            Shape::Pattern(re) => re.is_match(value),
            Shape::Alphanumeric => value.chars().all(|c| c.is_ascii_alphanumeric()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Presence {
    Required,
    Optional,
    /// The cell must equal the marker and is then left out of the record.
    DropIfEqual(String),
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    name: String,
    presence: Presence,
    rewrites: Vec<Rewrite>,
    sentinels: Vec<String>,
    default: String,
    convert: Option<Converter>,
    shape: Shape,
}

/// Maps a trimmed, non-blank cell to its output text; `None` rejects the row.
pub type Converter = fn(&str) -> Option<String>;

impl FieldRule {
    fn new(name: &str, presence: Presence) -> Self {
        Self {
            name: name.to_string(),
            presence,
            rewrites: Vec::new(),
            sentinels: Vec::new(),
            default: String::new(),
            convert: None,
            shape: Shape::Any,
        }
    }

    pub fn required(name: &str) -> Self {
        Self::new(name, Presence::Required)
    }

    pub fn optional(name: &str) -> Self {
        Self::new(name, Presence::Optional)
    }

    /// Filter column: rows whose (transformed) cell differs from `marker` are
    /// invalid, and the column never reaches the output record.
    pub fn drop_if_equal(name: &str, marker: &str) -> Self {
        Self::new(name, Presence::DropIfEqual(marker.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_output(&self) -> bool {
        !matches!(self.presence, Presence::DropIfEqual(_))
    }

    pub fn rewrite(mut self, pattern: &str, replacement: &str) -> Result<Self, SchemaError> {
        let pattern = self.compile(pattern)?;
        self.rewrites.push(Rewrite {
            pattern,
            replacement: replacement.to_string(),
        });
        Ok(self)
    }

    pub fn sentinel(mut self, sentinel: &str) -> Self {
        self.sentinels.push(sentinel.to_string());
        self
    }

    pub fn default_value(mut self, default: &str) -> Self {
        self.default = default.to_string();
        self
    }

    pub fn convert(mut self, convert: Converter) -> Self {
        self.convert = Some(convert);
        self
    }

    pub fn shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    pub fn pattern(self, pattern: &str) -> Result<Self, SchemaError> {
        let re = self.compile(pattern)?;
        Ok(self.shape(Shape::Pattern(re)))
    }

    pub fn alphanumeric(self) -> Self {
        self.shape(Shape::Alphanumeric)
    }

    fn compile(&self, pattern: &str) -> Result<Regex, SchemaError> {
        Regex::new(pattern).map_err(|source| SchemaError::Pattern {
            field: self.name.clone(),
            pattern: pattern.to_string(),
            source,
        })
    }

    fn transform(&self, raw: &str) -> String {
        let rewritten = self
            .rewrites
            .iter()
            .fold(raw.to_string(), |value, rule| rule.apply(&value));
        rewritten.trim().to_string()
    }

    fn is_blank(&self, value: &str) -> bool {
        value.is_empty() || self.sentinels.iter().any(|s| s == value)
    }

    /// `Ok(None)` means the field is not part of the output record.
    fn evaluate(&self, raw: Option<&str>) -> Result<Option<String>, ValidationError> {
        if let Presence::DropIfEqual(marker) = &self.presence {
            let Some(raw) = raw else {
                return Ok(None);
            };
            let value = self.transform(raw);
            if &value == marker {
                return Ok(None);
            }
            return Err(ValidationError::Marker {
                field: self.name.clone(),
                expected: marker.clone(),
                found: value,
            });
        }

        let value = self.transform(raw.unwrap_or_default());
        if self.is_blank(&value) {
            if self.presence == Presence::Required {
                return Err(ValidationError::MissingRequired {
                    field: self.name.clone(),
                });
            }
            return Ok(Some(self.default.clone()));
        }
        let value = match self.convert {
            Some(convert) => match convert(&value) {
                Some(converted) => converted,
                None => {
                    return Err(ValidationError::Shape {
                        field: self.name.clone(),
                        value,
                    })
                }
            },
            None => value,
        };
        if !self.shape.accepts(&value) {
            return Err(ValidationError::Shape {
                field: self.name.clone(),
                value,
            });
        }
        Ok(Some(value))
    }
}

/// How the first CSV line is treated before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderPolicy {
    /// The publisher's header row is unreliable; replace it with these names.
    Replace(Vec<String>),
    /// Keep the header row as published (trimmed).
    Source,
}

impl HeaderPolicy {
    pub fn replace(columns: &[&str]) -> Self {
        HeaderPolicy::Replace(columns.iter().map(|c| c.to_string()).collect())
    }
}

/// Result of validating one feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidatedBatch {
    pub dataset: Dataset,
    pub rows: usize,
    pub invalid: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    header: HeaderPolicy,
    fields: Vec<FieldRule>,
    passthrough: bool,
}

impl Schema {
    pub fn new(name: &str, header: HeaderPolicy, fields: Vec<FieldRule>) -> Self {
        Self {
            name: name.to_string(),
            header,
            fields,
            passthrough: false,
        }
    }

    /// Keeps undeclared columns, cell text untouched, instead of dropping them.
    pub fn passthrough_unknown(mut self) -> Self {
        self.passthrough = true;
        self
    }

    pub fn passes_unknown_through(&self) -> bool {
        self.passthrough
    }

    fn declares(&self, column: &str) -> bool {
        self.fields.iter().any(|f| f.name == column)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &HeaderPolicy {
        &self.header
    }

    /// Declared output fields in declaration order.
    pub fn output_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.is_output())
            .map(|f| f.name.clone())
            .collect()
    }

    /// Dataset fields for a feed whose parsed header is `columns`. Pass-through
    /// schemas follow the header order (filter columns excluded) and append
    /// declared fields the header lacks.
    pub fn dataset_fields(&self, columns: &[String]) -> Vec<String> {
        if !self.passthrough {
            return self.output_fields();
        }
        let mut fields: Vec<String> = Vec::with_capacity(columns.len());
        let outputs = self.output_fields();
        let candidates = columns
            .iter()
            .filter(|c| !c.is_empty() && (!self.declares(c) || outputs.contains(*c)))
            .chain(outputs.iter());
        for column in candidates {
            if !fields.contains(column) {
                fields.push(column.clone());
            }
        }
        fields
    }

    /// Normalizes one row. Undeclared columns are dropped unless the schema
    /// passes them through.
    pub fn validate(&self, row: &RawRow) -> Result<Record, ValidationError> {
        let mut record = Record::new();
        for rule in &self.fields {
            if let Some(value) = rule.evaluate(row.get(&rule.name).map(String::as_str))? {
                record.insert(rule.name.clone(), value);
            }
        }
        if self.passthrough {
            for (column, cell) in row {
                if !column.is_empty() && !self.declares(column) {
                    record.insert(column.clone(), cell.clone());
                }
            }
        }
        Ok(record)
    }

    /// Validates every row, keeping the valid ones keyed by id. Rejected rows
    /// only show up in `invalid`; a repeated id replaces the earlier row and is
    /// counted in `duplicates`.
    pub fn validate_rows(&self, rows: impl IntoIterator<Item = RawRow>) -> ValidatedBatch {
        self.validate_table(&[], rows)
    }

    /// [`Schema::validate_rows`] for a feed whose parsed header is `columns`.
    pub fn validate_table(
        &self,
        columns: &[String],
        rows: impl IntoIterator<Item = RawRow>,
    ) -> ValidatedBatch {
        let mut batch = ValidatedBatch {
            dataset: Dataset::new(self.dataset_fields(columns)),
            ..Default::default()
        };
        for row in rows {
            batch.rows += 1;
            let Ok(record) = self.validate(&row) else {
                batch.invalid += 1;
                continue;
            };
            match batch.dataset.insert(record) {
                Ok(Some(_)) => batch.duplicates += 1,
                Ok(None) => {}
                // Only reachable for schemas that leave `id` optional.
                Err(_) => batch.invalid += 1,
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample_schema() -> Schema {
        Schema::new(
            "sample",
            HeaderPolicy::Source,
            vec![
                FieldRule::required("id").alphanumeric(),
                FieldRule::required("name"),
                FieldRule::required("tel").rewrite(r"\s", "").unwrap(),
                FieldRule::optional("notice").sentinel("-").default_value("none"),
                FieldRule::drop_if_equal("end", ""),
            ],
        )
    }

    #[test]
    fn required_field_is_trimmed_not_defaulted() {
        let record = sample_schema()
            .validate(&row(&[("id", "A1"), ("name", "  Good Clinic "), ("tel", "02 1234 5678")]))
            .unwrap();
        assert_eq!(record.get("name"), Some("Good Clinic"));
        assert_eq!(record.get("tel"), Some("0212345678"));
    }

    #[test]
    fn required_field_empty_is_invalid() {
        let err = sample_schema()
            .validate(&row(&[("id", "A1"), ("name", "   "), ("tel", "1")]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingRequired {
                field: "name".to_string()
            }
        );

        let err = sample_schema()
            .validate(&row(&[("id", "A1"), ("tel", "1")]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingRequired { .. }));
    }

    #[test]
    fn sentinel_maps_to_default() {
        let schema = sample_schema();
        for notice in ["-", " - ", "", "  "] {
            let record = schema
                .validate(&row(&[("id", "A1"), ("name", "n"), ("tel", "1"), ("notice", notice)]))
                .unwrap();
            assert_eq!(record.get("notice"), Some("none"));
        }
        let record = schema
            .validate(&row(&[("id", "A1"), ("name", "n"), ("tel", "1")]))
            .unwrap();
        assert_eq!(record.get("notice"), Some("none"));
    }

    #[test]
    fn shape_mismatch_is_invalid() {
        let err = sample_schema()
            .validate(&row(&[("id", "A-1"), ("name", "n"), ("tel", "1")]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Shape {
                field: "id".to_string(),
                value: "A-1".to_string()
            }
        );
    }

    #[test]
    fn drop_if_equal_filters_and_strips() {
        let schema = sample_schema();
        let kept = schema
            .validate(&row(&[("id", "A1"), ("name", "n"), ("tel", "1"), ("end", " ")]))
            .unwrap();
        assert!(!kept.contains("end"));

        let closed = schema
            .validate(&row(&[("id", "A1"), ("name", "n"), ("tel", "1"), ("end", "2019-12-31")]))
            .unwrap_err();
        assert!(matches!(closed, ValidationError::Marker { .. }));
    }

    #[test]
    fn unknown_columns_are_dropped() {
        let record = sample_schema()
            .validate(&row(&[("id", "A1"), ("name", "n"), ("tel", "1"), ("f3", "extra")]))
            .unwrap();
        assert!(!record.contains("f3"));
        assert_eq!(record.len(), 4);
    }

    #[test]
    fn passthrough_keeps_unknown_cells_verbatim_in_header_order() {
        let schema = Schema::new(
            "sample",
            HeaderPolicy::Source,
            vec![FieldRule::required("id").alphanumeric(), FieldRule::drop_if_equal("end", "")],
        )
        .passthrough_unknown();
        let columns: Vec<String> = ["tel", "id", "end", "notice", "lng"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let batch = schema.validate_table(
            &columns,
            [row(&[("tel", "(02) 1234 5678"), ("id", "A1"), ("end", ""), ("notice", "-"), ("lng", "121.5")])],
        );
        assert_eq!(batch.dataset.fields(), &["tel", "id", "notice", "lng"]);
        let record = batch.dataset.get("A1").unwrap();
        assert_eq!(record.get("tel"), Some("(02) 1234 5678"));
        assert_eq!(record.get("notice"), Some("-"));
        assert_eq!(record.get("lng"), Some("121.5"));
        assert!(!record.contains("end"));
    }

    #[test]
    fn converter_rejection_is_a_shape_error() {
        let rule = FieldRule::optional("flag")
            .convert(|v| (v == "yes").then(|| "1".to_string()));
        assert_eq!(rule.evaluate(Some(" yes ")).unwrap(), Some("1".to_string()));
        assert_eq!(rule.evaluate(Some("")).unwrap(), Some(String::new()));
        assert_eq!(
            rule.evaluate(Some("no")).unwrap_err(),
            ValidationError::Shape {
                field: "flag".to_string(),
                value: "no".to_string()
            }
        );
    }

    #[test]
    fn rewrites_apply_in_order_before_trim() {
        let rule = FieldRule::optional("time")
            .rewrite("N", "1")
            .unwrap()
            .rewrite("Y", "0")
            .unwrap()
            .pattern("^[01]{3}$")
            .unwrap();
        assert_eq!(rule.evaluate(Some(" NYN ")).unwrap(), Some("101".to_string()));
        assert!(rule.evaluate(Some("NYX")).is_err());
        assert_eq!(rule.evaluate(Some("")).unwrap(), Some(String::new()));
    }

    #[test]
    fn bad_pattern_reports_field() {
        let err = FieldRule::optional("time").pattern("([").unwrap_err();
        assert!(err.to_string().contains("`time`"));
    }

    #[test]
    fn batch_counts_invalid_and_duplicate_rows() {
        let schema = sample_schema();
        let batch = schema.validate_rows(vec![
            row(&[("id", "A1"), ("name", "first"), ("tel", "1")]),
            row(&[("id", ""), ("name", "x"), ("tel", "1")]),
            row(&[("id", "A1"), ("name", "second"), ("tel", "1")]),
            row(&[("id", "B2"), ("name", "n"), ("tel", "2"), ("end", "closed")]),
        ]);
        assert_eq!(batch.rows, 4);
        assert_eq!(batch.invalid, 2);
        assert_eq!(batch.duplicates, 1);
        assert_eq!(batch.dataset.len(), 1);
        assert_eq!(batch.dataset.get("A1").unwrap().get("name"), Some("second"));
        assert_eq!(batch.dataset.fields(), &["id", "name", "tel", "notice"]);
    }
}
