use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rentwatch_adapters::{CatalogPageFetcher, OAuthTokenProvider, TokenProvider};
use rentwatch_core::{FacetCount, Furnishing, ListingRecord};
use rentwatch_mirror::{DynamoBackend, MirrorWriter};
use rentwatch_storage::{HistoryStore, HttpClientConfig, HttpFetcher, ReconcileOutcome};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::harvest::HarvestDriver;
use crate::settings::Settings;
use crate::PipelineError;

/// A facet that failed under the isolate policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetFailure {
    pub facet: Furnishing,
    pub page: u32,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MirrorStatus {
    Disabled,
    Written {
        table_created: bool,
        succeeded: usize,
        failed: usize,
    },
    /// The table could not be provisioned; nothing was written.
    Unavailable { reason: String },
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub facets: Vec<FacetCount>,
    pub facet_failures: Vec<FacetFailure>,
    pub harvested_rows: usize,
    pub reconcile: ReconcileOutcome,
    pub mirror: MirrorStatus,
}

/// Token, harvest, reconcile, mirror; one run at a time.
pub struct Pipeline {
    facets: Vec<Furnishing>,
    tokens: Box<dyn TokenProvider>,
    driver: HarvestDriver,
    history: HistoryStore,
    mirror: Option<MirrorWriter>,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        facets: Vec<Furnishing>,
        tokens: Box<dyn TokenProvider>,
        driver: HarvestDriver,
        history: HistoryStore,
    ) -> Self {
        Self {
            facets,
            tokens,
            driver,
            history,
            mirror: None,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_mirror(mut self, mirror: MirrorWriter) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Wire the HTTP-backed collaborators described by `settings`.
    pub async fn from_settings(settings: &Settings) -> Result<Self, PipelineError> {
        let run = &settings.run;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(run.api.timeout_secs),
            user_agent: run.user_agent.clone(),
        })?;

        let tokens = OAuthTokenProvider::new(
            http.clone(),
            run.api.clone(),
            settings.api_credentials.clone(),
        );
        let fetcher =
            CatalogPageFetcher::new(http, run.api.clone(), run.query.clone(), run.page_size);
        let driver = HarvestDriver::new(Box::new(fetcher), run.facet_failure);
        let pipeline = Self::new(
            run.facets.clone(),
            Box::new(tokens),
            driver,
            HistoryStore::new(run.history.clone()),
        );

        if !run.mirror.enabled {
            return Ok(pipeline);
        }
        let backend = DynamoBackend::connect(&run.mirror, settings.aws_credentials.as_ref())
            .await
            .map_err(PipelineError::StorePrecondition)?;
        Ok(pipeline.with_mirror(MirrorWriter::new(Box::new(backend), &run.mirror)))
    }

    /// Run once for `run_date`; fails with [`PipelineError::RunInProgress`]
    /// instead of waiting when another run holds the lock.
    pub async fn run_once(&self, run_date: NaiveDate) -> Result<RunSummary, PipelineError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| PipelineError::RunInProgress)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, %run_date);
        self.run_locked(run_id, run_date).instrument(span).await
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        run_date: NaiveDate,
    ) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        info!(facets = ?self.facets, "pipeline run started");

        let token = self.tokens.acquire_token().await?;
        let harvest = self.driver.harvest(&self.facets, &token, run_date).await?;
        let facet_failures = harvest
            .failures
            .iter()
            .map(|err| FacetFailure {
                facet: err.facet(),
                page: err.page(),
                status: err.status(),
                message: err.to_string(),
            })
            .collect();
        let batch = harvest.batch;

        let reconcile = self.history.reconcile(batch.records(), run_date).await?;
        let mirror = match &self.mirror {
            Some(writer) => write_mirror(writer, batch.records()).await,
            None => MirrorStatus::Disabled,
        };

        let finished_at = Utc::now();
        info!(
            rows = batch.len(),
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "pipeline run finished"
        );
        Ok(RunSummary {
            run_id,
            run_date,
            started_at,
            finished_at,
            facets: batch.facet_counts().to_vec(),
            facet_failures,
            harvested_rows: batch.len(),
            reconcile,
            mirror,
        })
    }
}

/// The mirror is best effort: provisioning failures are reported, not raised.
async fn write_mirror(writer: &MirrorWriter, records: &[ListingRecord]) -> MirrorStatus {
    let table_created = match writer.ensure_schema().await {
        Ok(created) => created,
        Err(err) => {
            error!(
                table = writer.table_name(),
                error = %err,
                "mirror unavailable; rows not mirrored"
            );
            return MirrorStatus::Unavailable {
                reason: err.to_string(),
            };
        }
    };
    let report = writer.write_batch(records).await;
    MirrorStatus::Written {
        table_created,
        succeeded: report.succeeded,
        failed: report.failed,
    }
}
