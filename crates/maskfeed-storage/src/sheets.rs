//! Google Sheets v4 `values` endpoints: ranged reads and batched writes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;
use url::Url;

use crate::auth::TokenProvider;
use crate::SinkError;

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MajorDimension {
    Rows,
    Columns,
}

impl MajorDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            MajorDimension::Rows => "ROWS",
            MajorDimension::Columns => "COLUMNS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueInputOption {
    /// Stored exactly as sent: no formula evaluation, no type coercion.
    #[default]
    Raw,
    UserEntered,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    pub range: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_dimension: Option<MajorDimension>,
    #[serde(default)]
    pub values: Vec<Vec<JsonValue>>,
}

impl ValueRange {
    /// One column of text cells written top to bottom.
    pub fn column(range: impl Into<String>, cells: Vec<String>) -> Self {
        Self {
            range: range.into(),
            major_dimension: Some(MajorDimension::Columns),
            values: vec![cells.into_iter().map(JsonValue::String).collect()],
        }
    }

    /// First row (or column, for column-major reads) rendered as text.
    pub fn first_vector(&self) -> Vec<String> {
        self.values
            .first()
            .map(|cells| cells.iter().map(cell_text).collect())
            .unwrap_or_default()
    }
}

/// Renders an unformatted cell the way it reads in the sheet.
pub fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateValuesRequest {
    pub value_input_option: ValueInputOption,
    pub include_values_in_response: bool,
    pub data: Vec<ValueRange>,
}

impl BatchUpdateValuesRequest {
    pub fn raw(data: Vec<ValueRange>) -> Self {
        Self {
            value_input_option: ValueInputOption::Raw,
            include_values_in_response: false,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchUpdateValuesResponse {
    pub spreadsheet_id: String,
    pub total_updated_rows: u64,
    pub total_updated_columns: u64,
    pub total_updated_cells: u64,
    pub total_updated_sheets: u64,
}

#[async_trait]
pub trait SheetsApi: Send + Sync {
    async fn get_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        major_dimension: MajorDimension,
    ) -> Result<ValueRange, SinkError>;

    async fn batch_update_values(
        &self,
        spreadsheet_id: &str,
        request: &BatchUpdateValuesRequest,
    ) -> Result<BatchUpdateValuesResponse, SinkError>;
}

pub struct SheetsClient {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
}

impl SheetsClient {
    pub fn new(client: reqwest::Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client,
            tokens,
            base_url: SHEETS_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `{base}/v4/spreadsheets/{id}/{tail...}` with every segment percent-encoded.
    fn endpoint(&self, spreadsheet_id: &str, tail: &[&str]) -> Result<Url, SinkError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SinkError::Layout(format!("bad sheets base url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| SinkError::Layout(format!("sheets base url {} cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", spreadsheet_id])
            .extend(tail);
        Ok(url)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(SinkError::HttpStatus {
            service: "sheets",
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, SinkError> {
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| SinkError::Decode {
            service: "sheets",
            source,
        })
    }
}

#[async_trait]
impl SheetsApi for SheetsClient {
    async fn get_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        major_dimension: MajorDimension,
    ) -> Result<ValueRange, SinkError> {
        let url = self.endpoint(spreadsheet_id, &["values", range])?;
        let token = self.tokens.access_token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(&[
                ("majorDimension", major_dimension.as_str()),
                ("valueRenderOption", "UNFORMATTED_VALUE"),
                ("dateTimeRenderOption", "FORMATTED_STRING"),
            ])
            .send()
            .await?;
        Self::decode(Self::check(resp).await?).await
    }

    async fn batch_update_values(
        &self,
        spreadsheet_id: &str,
        request: &BatchUpdateValuesRequest,
    ) -> Result<BatchUpdateValuesResponse, SinkError> {
        let url = self.endpoint(spreadsheet_id, &["values:batchUpdate"])?;
        let token = self.tokens.access_token().await?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;
        let summary: BatchUpdateValuesResponse = Self::decode(Self::check(resp).await?).await?;
        info!(
            spreadsheet_id,
            ranges = request.data.len(),
            cells = summary.total_updated_cells,
            "sheet values updated"
        );
        Ok(summary)
    }
}
