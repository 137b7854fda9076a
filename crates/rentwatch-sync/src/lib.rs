//! Harvest pipeline orchestration: settings, the pagination driver, the
//! end-to-end run and its optional cron schedule.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use rentwatch_adapters::{AuthError, FetchError};
use rentwatch_mirror::MirrorError;
use rentwatch_storage::{HistoryError, TransportError};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

mod harvest;
mod pipeline;
mod settings;
#[cfg(test)]
mod testing;

pub use harvest::{HarvestDriver, HarvestReport};
pub use pipeline::{FacetFailure, MirrorStatus, Pipeline, RunSummary};
pub use settings::{
    ConfigError, FacetFailurePolicy, RunConfig, SchedulerConfig, Settings, API_KEY_VAR,
    API_SECRET_VAR,
};

pub const CRATE_NAME: &str = "rentwatch-sync";

/// Everything that aborts a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    StorePrecondition(MirrorError),
    #[error(transparent)]
    Http(#[from] TransportError),
    #[error("acquiring bearer token failed")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("another pipeline run is still in progress")]
    RunInProgress,
}

/// One job per cron expression, each running [`Pipeline::run_once`] for the
/// local date. `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Pipeline>,
    config: &SchedulerConfig,
) -> Result<Option<JobScheduler>> {
    if !config.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in &config.crons {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let run_date = Local::now().date_naive();
                match pipeline.run_once(run_date).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        rows = summary.harvested_rows,
                        "scheduled run complete"
                    ),
                    Err(PipelineError::RunInProgress) => {
                        warn!("previous run still in progress; trigger skipped")
                    }
                    Err(err) => error!(
                        error = %format!("{:#}", anyhow::Error::from(err)),
                        "scheduled run failed"
                    ),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "scheduled harvest registered");
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    use rentwatch_core::Furnishing;
    use rentwatch_storage::{HistoryConfig, HistoryStore};

    use crate::testing::{ScriptedFetcher, StaticTokens};

    fn idle_pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            vec![Furnishing::Furnished],
            Box::<StaticTokens>::default(),
            HarvestDriver::new(Box::<ScriptedFetcher>::default(), FacetFailurePolicy::Abort),
            HistoryStore::new(HistoryConfig::default()),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let sched = maybe_build_scheduler(idle_pipeline(), &SchedulerConfig::default())
            .await
            .unwrap();
        assert!(sched.is_none());
    }

    #[tokio::test]
    async fn malformed_cron_is_reported() {
        let config = SchedulerConfig {
            enabled: true,
            crons: vec!["every morning".to_string()],
        };
        let err = maybe_build_scheduler(idle_pipeline(), &config)
            .await
            .err()
            .expect("malformed cron must be rejected");
        assert!(format!("{err:#}").contains("every morning"));
    }

    #[tokio::test]
    async fn transport_failure_is_described_once_in_the_chain() {
        let http = rentwatch_storage::HttpFetcher::new(Default::default()).unwrap();
        let err = http
            .post("not a url", Default::default(), None, None)
            .await
            .unwrap_err();
        let cause = std::error::Error::source(&err).unwrap().to_string();

        let chain = format!("{:#}", anyhow::Error::from(PipelineError::from(err)));
        assert!(chain.starts_with("request to not a url failed: "));
        assert_eq!(chain.matches("request to not a url").count(), 1);
        assert_eq!(chain.matches(cause.as_str()).count(), 1);
    }

    #[test]
    fn fatal_errors_keep_their_cause() {
        let err = PipelineError::from(AuthError::EmptyToken);
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(
            chain,
            "acquiring bearer token failed: token response carried an empty access token"
        );
    }
}
