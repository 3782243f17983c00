//! `feeds.yaml`: which feeds exist, where the spreadsheet lives and which jobs
//! publish what.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use maskfeed_adapters::schema_by_name;
use serde::Deserialize;

pub const REGISTRY_FILE: &str = "feeds.yaml";

fn enabled_by_default() -> bool {
    true
}

fn default_max_age_secs() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub spreadsheet: Option<SpreadsheetConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub feed_id: String,
    pub url: String,
    /// Name of a built-in schema.
    pub schema: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpreadsheetConfig {
    pub spreadsheet_id: String,
    pub sheet: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub job_id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Feeds unioned into the primary dataset; later feeds win on repeated ids.
    pub primary: Vec<String>,
    /// Feeds left-joined onto the primary dataset, in overlay order.
    #[serde(default)]
    pub secondaries: Vec<String>,
    #[serde(flatten)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "sink", rename_all = "snake_case")]
pub enum SinkConfig {
    Blob {
        object_key: String,
        #[serde(default = "default_max_age_secs")]
        max_age_secs: u32,
        #[serde(default)]
        content_language: Option<String>,
    },
    Sheet {
        fields: Vec<String>,
    },
}

impl JobConfig {
    /// Every feed the job reads, primaries first, without repeats.
    pub fn feed_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.primary
            .iter()
            .chain(&self.secondaries)
            .map(String::as_str)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn is_blob(&self) -> bool {
        matches!(self.sink, SinkConfig::Blob { .. })
    }

    pub fn is_sheet(&self) -> bool {
        matches!(self.sink, SinkConfig::Sheet { .. })
    }
}

impl FeedRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing feed registry")
    }

    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(REGISTRY_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn feed(&self, feed_id: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.feed_id == feed_id)
    }

    pub fn job(&self, job_id: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn enabled_jobs(&self) -> Vec<&JobConfig> {
        self.jobs.iter().filter(|j| j.enabled).collect()
    }

    /// Structural problems with `jobs`: unknown or disabled feeds, unknown
    /// schemas, sheet jobs without a spreadsheet. Empty means runnable.
    pub fn problems(&self, jobs: &[&JobConfig]) -> Vec<String> {
        let mut problems = Vec::new();
        for job in jobs {
            if job.primary.is_empty() {
                problems.push(format!("job `{}` has no primary feed", job.job_id));
            }
            for feed_id in job.feed_ids() {
                match self.feed(feed_id) {
                    None => problems.push(format!(
                        "job `{}` references unknown feed `{feed_id}`",
                        job.job_id
                    )),
                    Some(feed) if !feed.enabled => problems.push(format!(
                        "job `{}` references disabled feed `{feed_id}`",
                        job.job_id
                    )),
                    Some(feed) => {
                        if schema_by_name(&feed.schema).is_err() {
                            problems.push(format!(
                                "feed `{feed_id}` uses unknown schema `{}`",
                                feed.schema
                            ));
                        }
                    }
                }
            }
            if let SinkConfig::Sheet { fields } = &job.sink {
                if self.spreadsheet.is_none() {
                    problems.push(format!(
                        "sheet job `{}` needs a `spreadsheet` section",
                        job.job_id
                    ));
                }
                if fields.is_empty() {
                    problems.push(format!("sheet job `{}` publishes no fields", job.job_id));
                }
            }
        }
        problems.dedup();
        problems
    }
}
