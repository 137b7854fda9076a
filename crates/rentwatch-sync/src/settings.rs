use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use rentwatch_adapters::{ApiConfig, ApiCredentials, QueryError, SearchQuery, MAX_PAGE_SIZE};
use rentwatch_core::Furnishing;
use rentwatch_mirror::{AwsCredentials, MirrorConfig, MAX_BATCH_ITEMS};
use rentwatch_storage::HistoryConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::PipelineError;

pub const API_KEY_VAR: &str = "IDEALISTA_API_KEY";
pub const API_SECRET_VAR: &str = "IDEALISTA_SECRET";

/// What a failed facet does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacetFailurePolicy {
    /// The first failed page aborts the whole run.
    #[default]
    Abort,
    /// A failed facet contributes no records; remaining facets still run.
    Isolate,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Six-field cron expressions (seconds first).
    pub crons: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            crons: vec!["0 0 7 * * *".to_string()],
        }
    }
}

/// Non-secret run configuration, as read from `rentwatch.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunConfig {
    pub facets: Vec<Furnishing>,
    pub page_size: u32,
    #[serde(default)]
    pub query: SearchQuery,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub facet_failure: FacetFailurePolicy,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("required environment variables are not set: {}", .0.join(", "))]
    MissingSecrets(Vec<String>),
}

impl RunConfig {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Read and parse `path`; does not validate.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.facets.is_empty() {
            return Err(ConfigError::Invalid(
                "facets must name at least one facet".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = self.facets.iter().find(|f| !seen.insert(**f)) {
            return Err(ConfigError::Invalid(format!("facet {dup} is listed twice")));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.history.file_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "history.file_name must not be empty".to_string(),
            ));
        }
        if self.mirror.enabled {
            if self.mirror.batch_size == 0 || self.mirror.batch_size > MAX_BATCH_ITEMS {
                return Err(ConfigError::Invalid(format!(
                    "mirror.batch_size must be between 1 and {MAX_BATCH_ITEMS}, got {}",
                    self.mirror.batch_size
                )));
            }
            if self.mirror.table_name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "mirror.table_name must not be empty".to_string(),
                ));
            }
        }
        if self.scheduler.enabled && self.scheduler.crons.is_empty() {
            return Err(ConfigError::Invalid(
                "scheduler is enabled but lists no cron expressions".to_string(),
            ));
        }
        self.query.validate()?;
        Ok(())
    }
}

/// Validated run configuration plus the secrets it needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub run: RunConfig,
    pub api_credentials: ApiCredentials,
    /// Present whenever the mirror is enabled.
    pub aws_credentials: Option<AwsCredentials>,
}

impl Settings {
    /// Validate `run` and resolve secrets through `lookup`.
    pub fn from_parts(
        run: RunConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PipelineError> {
        run.validate()?;

        let secret = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let (api_key, api_secret) = (secret(API_KEY_VAR), secret(API_SECRET_VAR));
        let api_credentials = match (api_key, api_secret) {
            (Some(api_key), Some(secret)) => ApiCredentials { api_key, secret },
            (key, secret) => {
                let missing = [(API_KEY_VAR, key.is_none()), (API_SECRET_VAR, secret.is_none())]
                    .into_iter()
                    .filter(|(_, missing)| *missing)
                    .map(|(name, _)| name.to_string())
                    .collect();
                return Err(ConfigError::MissingSecrets(missing).into());
            }
        };

        let aws_credentials = if run.mirror.enabled {
            Some(AwsCredentials::from_lookup(&lookup).map_err(PipelineError::StorePrecondition)?)
        } else {
            AwsCredentials::from_lookup(&lookup).ok()
        };

        Ok(Self {
            run,
            api_credentials,
            aws_credentials,
        })
    }

    /// Read `path` and the process environment.
    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let run = RunConfig::load(path).await?;
        Self::from_parts(run, |name| std::env::var(name).ok())
    }
}
