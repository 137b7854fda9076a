//! Best-effort key/attribute mirror of harvested listings.
//!
//! Rows are keyed by `insert_date` (partition) and `run` (range, the row's
//! position in its write batch). The historical CSV stays the source of truth;
//! a crash mid-batch leaves a written prefix here and nothing else.

use std::fmt;

use async_trait::async_trait;
use rentwatch_core::{ListingRecord, MirrorRow};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

mod dynamo;

pub use dynamo::DynamoBackend;

pub const CRATE_NAME: &str = "rentwatch-mirror";

/// Per-request item ceiling of the store's batch write.
pub const MAX_BATCH_ITEMS: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub table_name: String,
    /// Rows per batch request, at most [`MAX_BATCH_ITEMS`].
    pub batch_size: usize,
    /// Alternative endpoint, e.g. a local emulator.
    pub endpoint_url: Option<String>,
    pub read_capacity_units: i64,
    pub write_capacity_units: i64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table_name: "IdealistaDataMadrid".to_string(),
            batch_size: MAX_BATCH_ITEMS,
            endpoint_url: None,
            read_capacity_units: 5,
            write_capacity_units: 5,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

impl AwsCredentials {
    pub const ENV_VARS: [&'static str; 3] = [
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_DEFAULT_REGION",
    ];

    /// Resolve all three variables through `lookup`; blank values count as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MirrorError> {
        let values: Vec<Option<String>> = Self::ENV_VARS
            .iter()
            .map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
            .collect();
        let missing: Vec<String> = Self::ENV_VARS
            .iter()
            .zip(&values)
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(MirrorError::Precondition { missing });
        }

        let mut values = values.into_iter().flatten();
        match (values.next(), values.next(), values.next()) {
            (Some(access_key_id), Some(secret_access_key), Some(region)) => Ok(Self {
                access_key_id,
                secret_access_key,
                region,
            }),
            _ => Err(MirrorError::Precondition {
                missing: Self::ENV_VARS.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("secondary store credentials are not set: {}", .missing.join(", "))]
    Precondition { missing: Vec<String> },
    #[error("provisioning table {table} failed: {message}")]
    Provision { table: String, message: String },
}

/// A single row the store did not accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("writing row {run} failed: {message}")]
pub struct StoreItemError {
    pub run: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableCreation {
    Created,
    AlreadyExists,
}

/// Store operations the writer needs.
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, BackendError>;

    async fn create_table(&self, table: &str) -> Result<TableCreation, BackendError>;

    /// Write one request's worth of rows; one outcome per row, in row order.
    async fn put_rows(&self, table: &str, rows: &[MirrorRow]) -> Vec<Result<(), StoreItemError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Written { run: u64 },
    Failed(StoreItemError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWriteReport {
    pub outcomes: Vec<ItemOutcome>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchWriteReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match &outcome {
            ItemOutcome::Written { .. } => self.succeeded += 1,
            ItemOutcome::Failed(err) => {
                warn!(run = err.run, error = %err.message, "mirror row not written");
                self.failed += 1;
            }
        }
        self.outcomes.push(outcome);
    }

    /// `(succeeded, failed)`.
    pub fn counts(&self) -> (usize, usize) {
        (self.succeeded, self.failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StoreItemError> {
        self.outcomes.iter().filter_map(|o| match o {
            ItemOutcome::Failed(err) => Some(err),
            ItemOutcome::Written { .. } => None,
        })
    }
}

pub struct MirrorWriter {
    backend: Box<dyn MirrorBackend>,
    table_name: String,
    batch_size: usize,
}

impl MirrorWriter {
    pub fn new(backend: Box<dyn MirrorBackend>, config: &MirrorConfig) -> Self {
        Self {
            backend,
            table_name: config.table_name.clone(),
            batch_size: config.batch_size.clamp(1, MAX_BATCH_ITEMS),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Create the table if absent. Returns whether this call created it.
    ///
    /// Safe to call on every run: an existing table, or one created concurrently,
    /// is the normal path.
    pub async fn ensure_schema(&self) -> Result<bool, MirrorError> {
        let table = self.table_name.as_str();
        match self.backend.table_exists(table).await {
            Ok(true) => {
                info!(table, "table already exists");
                return Ok(false);
            }
            Ok(false) => info!(table, "table does not exist"),
            Err(err) => warn!(table, error = %err, "probing table failed; attempting creation"),
        }

        match self.backend.create_table(table).await {
            Ok(TableCreation::Created) => {
                info!(table, "table created");
                Ok(true)
            }
            Ok(TableCreation::AlreadyExists) => {
                info!(table, "table already exists");
                Ok(false)
            }
            Err(err) => Err(MirrorError::Provision {
                table: table.to_string(),
                message: err.0,
            }),
        }
    }

    /// Project `records` to all-text rows and write them in bounded requests.
    ///
    /// Item failures are counted, never propagated; every row gets an outcome.
    pub async fn write_batch(&self, records: &[ListingRecord]) -> BatchWriteReport {
        let rows = MirrorRow::project(records);
        let mut report = BatchWriteReport::default();

        for chunk in rows.chunks(self.batch_size) {
            let mut results = self
                .backend
                .put_rows(&self.table_name, chunk)
                .await
                .into_iter();
            for row in chunk {
                let outcome = match results.next() {
                    Some(Ok(())) => ItemOutcome::Written { run: row.run },
                    Some(Err(err)) => ItemOutcome::Failed(err),
                    None => ItemOutcome::Failed(StoreItemError {
                        run: row.run,
                        message: "store reported no outcome".to_string(),
                    }),
                };
                report.record(outcome);
            }
        }

        info!(
            table = %self.table_name,
            succeeded = report.succeeded,
            failed = report.failed,
            "mirror batch written"
        );
        report
    }
}
