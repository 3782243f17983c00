//! Turning a merged dataset into sink payloads: a CSV blob, or column-wise
//! range updates aligned to the rows already in the spreadsheet.

use maskfeed_core::a1::{ColumnRef, SheetRange};
use maskfeed_core::{Dataset, ID_FIELD};
use maskfeed_storage::{BatchUpdateValuesRequest, BlobObject, SinkError, ValueRange};
use serde::Serialize;

/// CSV with the dataset's declared fields as header, CRLF line endings and
/// empty cells for fields a record lacks.
pub fn render_csv(dataset: &Dataset) -> Result<Vec<u8>, SinkError> {
    let csv_err = |source: csv::Error| SinkError::Io {
        context: "rendering csv".to_string(),
        source: source.into(),
    };

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    writer.write_record(dataset.fields()).map_err(csv_err)?;
    for record in dataset.iter() {
        writer
            .write_record(
                dataset
                    .fields()
                    .iter()
                    .map(|field| record.get(field).unwrap_or_default()),
            )
            .map_err(csv_err)?;
    }
    writer.into_inner().map_err(|e| SinkError::Io {
        context: "flushing csv".to_string(),
        source: e.into_error(),
    })
}

pub fn blob_object(
    dataset: &Dataset,
    object_key: &str,
    max_age_secs: u32,
    content_language: Option<&str>,
) -> Result<BlobObject, SinkError> {
    let object = BlobObject::csv(object_key, render_csv(dataset)?).with_cache_max_age(max_age_secs);
    Ok(match content_language {
        Some(language) => object.with_content_language(language),
        None => object,
    })
}

/// Where the id column and each published field sit in the sheet's header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    pub id_column: u64,
    pub columns: Vec<(String, u64)>,
}

impl SheetLayout {
    /// Locates `id` and every field in `header`. All missing names are
    /// reported together.
    pub fn locate(header: &[String], fields: &[String]) -> Result<Self, SinkError> {
        let position = |name: &str| {
            header
                .iter()
                .position(|cell| cell.trim() == name)
                .map(|i| i as u64)
        };

        let mut missing = Vec::new();
        let id_column = position(ID_FIELD);
        if id_column.is_none() {
            missing.push(ID_FIELD.to_string());
        }
        let mut columns = Vec::with_capacity(fields.len());
        for field in fields {
            match position(field) {
                Some(col) => columns.push((field.clone(), col)),
                None => missing.push(field.clone()),
            }
        }

        match id_column {
            Some(id_column) if missing.is_empty() => Ok(Self { id_column, columns }),
            _ => Err(SinkError::Layout(format!(
                "sheet header lacks column(s): {}",
                missing.join(", ")
            ))),
        }
    }
}

/// One `COLUMNS` range per field starting at row 2, with one cell per id in
/// the sheet's own row order. Ids the dataset lacks get an empty cell, which
/// clears stale values.
pub fn plan_sheet_update(
    sheet: &str,
    layout: &SheetLayout,
    sheet_ids: &[String],
    dataset: &Dataset,
) -> BatchUpdateValuesRequest {
    let data = layout
        .columns
        .iter()
        .map(|(field, column)| {
            let cells = sheet_ids
                .iter()
                .map(|id| {
                    dataset
                        .get(id.trim())
                        .and_then(|record| record.get(field))
                        .unwrap_or_default()
                        .to_string()
                })
                .collect();
            let range = SheetRange::column_from(sheet, ColumnRef::Index(*column), 2);
            ValueRange::column(range.to_string(), cells)
        })
        .collect();
    BatchUpdateValuesRequest::raw(data)
}

/// What a job left behind at its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "sink", rename_all = "snake_case")]
pub enum SinkOutcome {
    Blob {
        object_key: String,
        location: String,
        content_sha256: String,
        stored_bytes: usize,
    },
    Sheet {
        ranges: usize,
        /// Sheet rows whose id was found in the dataset.
        matched_rows: usize,
        updated_cells: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use maskfeed_core::Record;

    fn dataset() -> Dataset {
        let mut ds = Dataset::new(["id", "name", "adult"]);
        ds.insert(Record::from_pairs([("id", "A1"), ("name", "North, Store"), ("adult", "5")]))
            .unwrap();
        ds.insert(Record::from_pairs([("id", "B2"), ("name", "South")]))
            .unwrap();
        ds
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn csv_uses_declared_header_and_quotes_when_needed() {
        let body = String::from_utf8(render_csv(&dataset()).unwrap()).unwrap();
        assert_eq!(body, "id,name,adult\r\nA1,\"North, Store\",5\r\nB2,South,\r\n");
    }

    #[test]
    fn blob_object_carries_publication_metadata() {
        let object = blob_object(&dataset(), "ncov-mask-map/maskdata.csv", 30, Some("zh")).unwrap();
        assert_eq!(object.key, "ncov-mask-map/maskdata.csv");
        assert_eq!(object.content_type, "text/csv");
        assert_eq!(object.content_language.as_deref(), Some("zh"));
        assert_eq!(object.cache_control(), "public, max-age=30");
        assert!(object.gzip);
    }

    #[test]
    fn layout_reports_all_missing_columns() {
        let header = strings(&["id", "name", "tel"]);
        let err = SheetLayout::locate(&header, &strings(&["tel", "adult", "child"])).unwrap_err();
        assert!(err.to_string().contains("adult, child"), "{err}");

        let err = SheetLayout::locate(&strings(&["name"]), &strings(&["name"])).unwrap_err();
        assert!(err.to_string().contains("id"), "{err}");
    }

    #[test]
    fn update_is_aligned_to_sheet_rows() {
        let header = strings(&["id", "name", "tel", "adult"]);
        let layout = SheetLayout::locate(&header, &strings(&["adult", "name"])).unwrap();
        assert_eq!(layout.id_column, 0);

        let sheet_ids = strings(&["B2", "Z9", "A1 "]);
        let request = plan_sheet_update("database", &layout, &sheet_ids, &dataset());
        assert_eq!(request.data.len(), 2);
        assert_eq!(request.data[0].range, "database!D2:D");
        assert_eq!(request.data[0].first_vector(), vec!["", "", "5"]);
        assert_eq!(request.data[1].range, "database!B2:B");
        assert_eq!(request.data[1].first_vector(), vec!["South", "", "North, Store"]);
        assert!(!request.include_values_in_response);
    }
}
