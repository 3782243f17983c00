//! Feed adapters: header normalization, CSV parsing and schema validation of
//! the portal's open-data feeds.

use std::borrow::Cow;
use std::time::Instant;

use maskfeed_storage::{CsvSource, FetchError};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub mod feeds;
pub mod schema;

pub use feeds::schema_by_name;
pub use schema::{
    Converter, FieldRule, HeaderPolicy, RawRow, Schema, SchemaError, Shape, ValidatedBatch, ValidationError,
};

pub const CRATE_NAME: &str = "maskfeed-adapters";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("csv line {line}: {source}")]
    Csv {
        line: u64,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching feed `{feed_id}`: {source}")]
    Fetch {
        feed_id: String,
        #[source]
        source: FetchError,
    },
    #[error("parsing feed `{feed_id}`: {source}")]
    Parse {
        feed_id: String,
        #[source]
        source: ParseError,
    },
}

/// Applies the header policy to raw feed text: drops a UTF-8 BOM and
/// surrounding whitespace, then swaps in canonical column names if asked.
pub fn normalize_header<'a>(text: &'a str, header: &HeaderPolicy) -> Cow<'a, str> {
    let text = text.trim_start_matches('\u{feff}').trim();
    match header {
        HeaderPolicy::Source => Cow::Borrowed(text),
        HeaderPolicy::Replace(columns) => {
            let rest = text.find('\n').map(|pos| &text[pos..]).unwrap_or("");
            Cow::Owned(format!("{}{}", columns.join(","), rest))
        }
    }
}

/// Parsed feed: the trimmed header row and the header-keyed data rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvTable {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

/// Parses CSV text into header-keyed rows. Short rows simply miss the trailing
/// columns, extra cells are ignored and all-blank lines are skipped.
pub fn parse_csv(text: &str, header: &HeaderPolicy) -> Result<Vec<RawRow>, ParseError> {
    parse_table(text, header).map(|table| table.rows)
}

/// [`parse_csv`], keeping the header order.
pub fn parse_table(text: &str, header: &HeaderPolicy) -> Result<CsvTable, ParseError> {
    let text = normalize_header(text, header);
    if text.is_empty() {
        return Ok(CsvTable::default());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|source| ParseError::Csv { line: 1, source })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|source| ParseError::Csv {
            line: source.position().map(|p| p.line()).unwrap_or_default(),
            source,
        })?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(CsvTable {
        columns: headers,
        rows,
    })
}

/// Fetches one feed and validates it against `schema`.
pub async fn fetch_feed(
    source: &dyn CsvSource,
    feed_id: &str,
    url: &str,
    schema: &Schema,
) -> Result<ValidatedBatch, AdapterError> {
    let span = info_span!("feed", feed_id, schema = schema.name());
    async move {
        let text = source
            .fetch_csv(feed_id, url)
            .await
            .map_err(|source| AdapterError::Fetch {
                feed_id: feed_id.to_string(),
                source,
            })?;
        validate_text(feed_id, &text, schema)
    }
    .instrument(span)
    .await
}

/// Parses and validates already-fetched feed text, logging one summary line.
pub fn validate_text(feed_id: &str, text: &str, schema: &Schema) -> Result<ValidatedBatch, AdapterError> {
    let started = Instant::now();
    let table = parse_table(text, schema.header()).map_err(|source| AdapterError::Parse {
        feed_id: feed_id.to_string(),
        source,
    })?;
    let batch = schema.validate_table(&table.columns, table.rows);
    info!(
        feed_id,
        rows = batch.rows,
        valid = batch.dataset.len(),
        invalid = batch.invalid,
        duplicates = batch.duplicates,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "feed validated"
    );
    Ok(batch)
}
