//! Job orchestration: configuration, fetch-validate-merge-publish runs and the
//! cron scheduler that repeats them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use maskfeed_adapters::{fetch_feed, schema_by_name, ValidatedBatch};
use maskfeed_core::a1::{ColumnRef, SheetRange};
use maskfeed_core::{merge, Dataset};
use maskfeed_storage::{
    BlobStore, CsvSource, GcsBlobStore, HttpClientConfig, HttpFetcher, LocalBlobStore,
    MajorDimension, MetadataServerToken, SheetsApi, SheetsClient, StaticToken, TokenProvider,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod registry;
pub mod sink;

pub use registry::{FeedConfig, FeedRegistry, JobConfig, SinkConfig, SpreadsheetConfig};
pub use sink::{SheetLayout, SinkOutcome};

pub const CRATE_NAME: &str = "maskfeed-sync";

pub const DEFAULT_USER_AGENT: &str = "maskfeed/0.1";
pub const DEFAULT_SCHEDULER_CRON: &str = "0 */10 * * * *";
/// Switches the CLI's log output to JSON lines.
pub const LOG_JSON_VAR: &str = "MASKFEED_LOG_JSON";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("configuration incomplete: {}", .0.join("; "))]
    Incomplete(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub gcs_bucket: Option<String>,
    /// Blob objects go to this directory instead of GCS when set.
    pub blob_dir: Option<PathBuf>,
    pub access_token: Option<String>,
    pub metadata_auth: bool,
    pub user_agent: String,
    pub http_timeout: Option<Duration>,
    pub scheduler_cron: String,
}

/// Boolean environment switch: `1` or `true` (any common casing) enables it.
pub fn env_flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from any variable source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let http_timeout = match var("MASKFEED_HTTP_TIMEOUT_SECS") {
            None => None,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "MASKFEED_HTTP_TIMEOUT_SECS",
                        value: raw,
                    })
                }
            },
        };

        Ok(Self {
            workspace_root: var("MASKFEED_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            gcs_bucket: var("GCS_BUCKET"),
            blob_dir: var("MASKFEED_BLOB_DIR").map(PathBuf::from),
            access_token: var("GOOGLE_OAUTH_ACCESS_TOKEN"),
            metadata_auth: env_flag(var("MASKFEED_METADATA_AUTH")),
            user_agent: var("MASKFEED_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout,
            scheduler_cron: var("MASKFEED_SCHEDULER_CRON")
                .unwrap_or_else(|| DEFAULT_SCHEDULER_CRON.to_string()),
        })
    }

    fn has_credentials(&self) -> bool {
        self.access_token.is_some() || self.metadata_auth
    }

    /// Checks every enabled job of `registry` can run with this config.
    pub fn validate_for(&self, registry: &FeedRegistry) -> Result<(), ConfigError> {
        self.validate_jobs(registry, &registry.enabled_jobs())
    }

    /// Reports every missing setting and broken registry reference for `jobs`
    /// in one error, before anything touches the network.
    pub fn validate_jobs(&self, registry: &FeedRegistry, jobs: &[&JobConfig]) -> Result<(), ConfigError> {
        let mut missing = registry.problems(jobs);

        let gcs_blob = self.blob_dir.is_none() && jobs.iter().any(|j| j.is_blob());
        if gcs_blob && self.gcs_bucket.is_none() {
            missing.push("GCS_BUCKET (or MASKFEED_BLOB_DIR) for blob jobs".to_string());
        }
        let remote = gcs_blob || jobs.iter().any(|j| j.is_sheet());
        if remote && !self.has_credentials() {
            missing.push(
                "GOOGLE_OAUTH_ACCESS_TOKEN or MASKFEED_METADATA_AUTH=1 for remote sinks".to_string(),
            );
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Incomplete(missing))
        }
    }
}

/// Outcome of one job run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: usize,
    pub rows: usize,
    pub valid: usize,
    pub invalid: usize,
    pub duplicates: usize,
    pub merged: usize,
    pub outcome: SinkOutcome,
}

/// Counters accumulated while loading a job's feeds.
#[derive(Debug, Default)]
struct FeedTotals {
    rows: usize,
    valid: usize,
    invalid: usize,
    duplicates: usize,
}

impl FeedTotals {
    fn add(&mut self, batch: &ValidatedBatch) {
        self.rows += batch.rows;
        self.valid += batch.dataset.len();
        self.invalid += batch.invalid;
        self.duplicates += batch.duplicates;
    }
}

pub struct Pipeline {
    registry: FeedRegistry,
    source: Arc<dyn CsvSource>,
    blobs: Option<Arc<dyn BlobStore>>,
    sheets: Option<Arc<dyn SheetsApi>>,
    running: Mutex<()>,
}

impl Pipeline {
    pub fn new(registry: FeedRegistry, source: Arc<dyn CsvSource>) -> Self {
        Self {
            registry,
            source,
            blobs: None,
            sheets: None,
            running: Mutex::new(()),
        }
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_sheets(mut self, sheets: Arc<dyn SheetsApi>) -> Self {
        self.sheets = Some(sheets);
        self
    }

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    /// Runs one job end to end. Nothing is published unless every feed of the
    /// job was fetched and parsed.
    pub async fn run_job(&self, job_id: &str) -> Result<RunSummary> {
        let job = self
            .registry
            .job(job_id)
            .with_context(|| format!("unknown job `{job_id}`"))?;
        let _guard = self.running.lock().await;
        self.run(job).await
    }

    /// Runs every enabled job in registry order. A failing job does not stop
    /// the others; the error lists every job that failed.
    pub async fn run_enabled(&self) -> Result<Vec<RunSummary>> {
        let _guard = self.running.lock().await;
        self.run_all().await
    }

    /// Like [`Pipeline::run_enabled`], but returns `None` right away when a
    /// previous run still owns the destinations.
    pub async fn try_run_enabled(&self) -> Option<Result<Vec<RunSummary>>> {
        let _guard = self.running.try_lock().ok()?;
        Some(self.run_all().await)
    }

    async fn run_all(&self) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        let mut failed = Vec::new();
        for job in self.registry.enabled_jobs() {
            match self.run(job).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %format!("{err:#}"), "job failed");
                    failed.push(job.job_id.clone());
                }
            }
        }
        if failed.is_empty() {
            Ok(summaries)
        } else {
            Err(anyhow!("{} job(s) failed: {}", failed.len(), failed.join(", ")))
        }
    }

    async fn run(&self, job: &JobConfig) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("job", job_id = %job.job_id, %run_id);
        async move {
            let started_at = Utc::now();
            let started = Instant::now();

            let feed_ids = job.feed_ids();
            let batches = self.fetch_all(&feed_ids).await?;
            let batch = |feed_id: &str| {
                feed_ids
                    .iter()
                    .position(|id| *id == feed_id)
                    .map(|i| &batches[i])
                    .with_context(|| format!("feed `{feed_id}` was not loaded"))
            };

            let mut totals = FeedTotals::default();
            for b in &batches {
                totals.add(b);
            }

            let mut primary = Dataset::default();
            for feed_id in &job.primary {
                totals.duplicates += primary.extend(batch(feed_id.as_str())?.dataset.clone());
            }
            let secondaries = job
                .secondaries
                .iter()
                .map(|feed_id| batch(feed_id.as_str()).map(|b| &b.dataset))
                .collect::<Result<Vec<_>>>()?;
            let merged = merge(&primary, &secondaries);
            info!(
                records = merged.len(),
                secondaries = secondaries.len(),
                "datasets merged"
            );

            let outcome = self.publish(job, &merged).await?;
            let summary = RunSummary {
                run_id,
                job_id: job.job_id.clone(),
                started_at,
                finished_at: Utc::now(),
                feeds: feed_ids.len(),
                rows: totals.rows,
                valid: totals.valid,
                invalid: totals.invalid,
                duplicates: totals.duplicates,
                merged: merged.len(),
                outcome,
            };
            info!(
                rows = summary.rows,
                invalid = summary.invalid,
                duplicates = summary.duplicates,
                merged = summary.merged,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Fetches and validates `feed_ids` concurrently; the first failure
    /// cancels the rest.
    async fn fetch_all(&self, feed_ids: &[&str]) -> Result<Vec<ValidatedBatch>> {
        let tasks = feed_ids.iter().map(|feed_id| async move {
            let feed = self
                .registry
                .feed(feed_id)
                .with_context(|| format!("unknown feed `{feed_id}`"))?;
            let schema = schema_by_name(&feed.schema)?;
            let batch = fetch_feed(self.source.as_ref(), &feed.feed_id, &feed.url, &schema).await?;
            Ok::<_, anyhow::Error>(batch)
        });
        try_join_all(tasks).await
    }

    async fn publish(&self, job: &JobConfig, dataset: &Dataset) -> Result<SinkOutcome> {
        match &job.sink {
            SinkConfig::Blob {
                object_key,
                max_age_secs,
                content_language,
            } => {
                let store = self
                    .blobs
                    .as_ref()
                    .context("no blob store configured for blob job")?;
                let object =
                    sink::blob_object(dataset, object_key, *max_age_secs, content_language.as_deref())?;
                let stored = store
                    .put(&object)
                    .await
                    .with_context(|| format!("uploading {object_key}"))?;
                info!(
                    object_key = %object_key,
                    location = %stored.location,
                    stored_bytes = stored.stored_bytes,
                    "blob published"
                );
                Ok(SinkOutcome::Blob {
                    object_key: object_key.clone(),
                    location: stored.location,
                    content_sha256: stored.content_sha256,
                    stored_bytes: stored.stored_bytes,
                })
            }
            SinkConfig::Sheet { fields } => {
                let sheets = self
                    .sheets
                    .as_ref()
                    .context("no spreadsheet client configured for sheet job")?;
                let target = self
                    .registry
                    .spreadsheet
                    .as_ref()
                    .context("registry has no spreadsheet section")?;
                publish_to_sheet(sheets.as_ref(), target, fields, dataset).await
            }
        }
    }
}

/// Reads the header row and the id column, then writes every field column in
/// one batched update.
pub async fn publish_to_sheet(
    sheets: &dyn SheetsApi,
    target: &SpreadsheetConfig,
    fields: &[String],
    dataset: &Dataset,
) -> Result<SinkOutcome> {
    let spreadsheet_id = target.spreadsheet_id.as_str();
    let header = sheets
        .get_values(
            spreadsheet_id,
            &SheetRange::row(&target.sheet, 1).to_string(),
            MajorDimension::Rows,
        )
        .await
        .context("reading sheet header")?
        .first_vector();
    let layout = SheetLayout::locate(&header, fields)?;

    let ids = sheets
        .get_values(
            spreadsheet_id,
            &SheetRange::column_from(&target.sheet, ColumnRef::Index(layout.id_column), 2).to_string(),
            MajorDimension::Columns,
        )
        .await
        .context("reading sheet id column")?
        .first_vector();

    let request = sink::plan_sheet_update(&target.sheet, &layout, &ids, dataset);
    let matched_rows = ids.iter().filter(|id| dataset.contains(id.trim())).count();
    let response = sheets
        .batch_update_values(spreadsheet_id, &request)
        .await
        .context("writing sheet columns")?;
    info!(
        ranges = request.data.len(),
        matched_rows,
        sheet_rows = ids.len(),
        "sheet published"
    );
    Ok(SinkOutcome::Sheet {
        ranges: request.data.len(),
        matched_rows,
        updated_cells: response.total_updated_cells,
    })
}

/// Wires the production clients for `config`. Remote clients are only built
/// when the config allows them.
pub fn build_pipeline(config: &SyncConfig, registry: FeedRegistry) -> Result<Pipeline> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
    })?;
    let client = fetcher.client().clone();

    let tokens: Option<Arc<dyn TokenProvider>> = match (&config.access_token, config.metadata_auth) {
        (Some(token), _) => Some(Arc::new(StaticToken::new(token.clone()))),
        (None, true) => Some(Arc::new(MetadataServerToken::new(client.clone()))),
        (None, false) => None,
    };

    let mut pipeline = Pipeline::new(registry, Arc::new(fetcher));
    if let Some(dir) = &config.blob_dir {
        pipeline = pipeline.with_blob_store(Arc::new(LocalBlobStore::new(dir.clone())));
    } else if let (Some(bucket), Some(tokens)) = (&config.gcs_bucket, &tokens) {
        pipeline = pipeline.with_blob_store(Arc::new(GcsBlobStore::new(
            client.clone(),
            bucket.clone(),
            Arc::clone(tokens),
        )));
    }
    if let Some(tokens) = tokens {
        pipeline = pipeline.with_sheets(Arc::new(SheetsClient::new(client, tokens)));
    }
    Ok(pipeline)
}

fn load_from_env() -> Result<(SyncConfig, FeedRegistry)> {
    let config = SyncConfig::from_env()?;
    let registry = FeedRegistry::load(&config.workspace_root)?;
    Ok((config, registry))
}

/// One-shot run of a single job, or of every enabled job when `job_id` is `None`.
pub async fn run_once_from_env(job_id: Option<&str>) -> Result<Vec<RunSummary>> {
    let (config, registry) = load_from_env()?;
    match job_id {
        Some(job_id) => {
            let job = registry
                .job(job_id)
                .with_context(|| format!("unknown job `{job_id}`"))?;
            config.validate_jobs(&registry, &[job])?;
            let pipeline = build_pipeline(&config, registry.clone())?;
            Ok(vec![pipeline.run_job(job_id).await?])
        }
        None => {
            config.validate_for(&registry)?;
            build_pipeline(&config, registry)?.run_enabled().await
        }
    }
}

/// Registers one cron job that runs every enabled job. A tick that fires while
/// the previous run is still publishing is skipped.
pub async fn build_scheduler(pipeline: Arc<Pipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.try_run_enabled().await {
                None => warn!("previous run still in progress; skipping tick"),
                Some(Ok(summaries)) => info!(jobs = summaries.len(), "scheduled run finished"),
                Some(Err(err)) => warn!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs the scheduler until ctrl-c.
pub async fn schedule_from_env() -> Result<()> {
    let (config, registry) = load_from_env()?;
    config.validate_for(&registry)?;
    let pipeline = Arc::new(build_pipeline(&config, registry)?);

    let mut sched = build_scheduler(pipeline, &config.scheduler_cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.scheduler_cron, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|name| vars.get(name).cloned())
    }

    fn registry() -> FeedRegistry {
        FeedRegistry::from_yaml_str(
            r#"
feeds:
  - { feed_id: mask, url: "https://example.test/mask.csv", schema: mask }
spreadsheet: { spreadsheet_id: abc, sheet: database }
jobs:
  - { job_id: blob, sink: blob, primary: [mask], object_key: out.csv }
  - { job_id: sheet, sink: sheet, primary: [mask], fields: [adult] }
"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply_when_unset_or_blank() {
        let config = config(&[("MASKFEED_USER_AGENT", "  ")]).unwrap();
        assert_eq!(config.workspace_root, PathBuf::from("."));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.scheduler_cron, DEFAULT_SCHEDULER_CRON);
        assert_eq!(config.http_timeout, None);
        assert!(!config.metadata_auth);
    }

    #[test]
    fn flags_accept_only_explicit_truthy_values() {
        for on in ["1", "true", "TRUE", "True"] {
            assert!(env_flag(Some(on.to_string())), "{on}");
        }
        for off in ["0", "false", "yes", ""] {
            assert!(!env_flag(Some(off.to_string())), "{off}");
        }
        assert!(!env_flag(None));
        assert!(config(&[("MASKFEED_METADATA_AUTH", "true")]).unwrap().metadata_auth);
    }

    #[test]
    fn timeout_must_be_a_positive_number() {
        let config = config(&[("MASKFEED_HTTP_TIMEOUT_SECS", "45")]).unwrap();
        assert_eq!(config.http_timeout, Some(Duration::from_secs(45)));

        for bad in ["0", "soon"] {
            assert_eq!(
                config_err(&[("MASKFEED_HTTP_TIMEOUT_SECS", bad)]),
                ConfigError::InvalidValue {
                    var: "MASKFEED_HTTP_TIMEOUT_SECS",
                    value: bad.to_string(),
                }
            );
        }
    }

    fn config_err(vars: &[(&str, &str)]) -> ConfigError {
        config(vars).unwrap_err()
    }

    #[test]
    fn validation_lists_every_missing_setting() {
        let registry = registry();
        let err = config(&[]).unwrap().validate_for(&registry).unwrap_err();
        let ConfigError::Incomplete(missing) = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(missing.len(), 2);
        assert!(missing[0].starts_with("GCS_BUCKET"));
        assert!(missing[1].starts_with("GOOGLE_OAUTH_ACCESS_TOKEN"));
    }

    #[test]
    fn local_blob_dir_needs_no_credentials() {
        let registry = registry();
        let config = config(&[("MASKFEED_BLOB_DIR", "/tmp/out")]).unwrap();
        let blob_only = [registry.job("blob").unwrap()];
        assert!(config.validate_jobs(&registry, &blob_only).is_ok());
        assert!(config.validate_for(&registry).is_err());

        let config = SyncConfig {
            metadata_auth: true,
            ..config
        };
        assert!(config.validate_for(&registry).is_ok());
    }
}
