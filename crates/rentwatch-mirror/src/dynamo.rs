use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::config::Credentials;
use aws_sdk_dynamodb::error::{BuildError, DisplayErrorContext};
use aws_sdk_dynamodb::operation::create_table::CreateTableError;
use aws_sdk_dynamodb::operation::describe_table::DescribeTableError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, KeySchemaElement, KeyType, ProvisionedThroughput,
    PutRequest, ScalarAttributeType, TableStatus, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use rentwatch_core::{MirrorRow, INSERT_DATE_FIELD, RUN_FIELD};
use tracing::{debug, info};

use crate::{
    AwsCredentials, BackendError, MirrorBackend, MirrorConfig, MirrorError, StoreItemError,
    TableCreation,
};

const CREDENTIALS_PROVIDER: &str = "rentwatch-env";
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ACTIVE_POLL_ATTEMPTS: u32 = 30;

/// DynamoDB-backed mirror store.
#[derive(Debug, Clone)]
pub struct DynamoBackend {
    client: Client,
    read_capacity_units: i64,
    write_capacity_units: i64,
}

impl DynamoBackend {
    /// Build a client from explicit credentials; fails before any network call
    /// when they are absent.
    pub async fn connect(
        config: &MirrorConfig,
        credentials: Option<&AwsCredentials>,
    ) -> Result<Self, MirrorError> {
        let credentials = credentials.ok_or_else(|| MirrorError::Precondition {
            missing: AwsCredentials::ENV_VARS.iter().map(|s| s.to_string()).collect(),
        })?;

        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(credentials.region.clone()))
            .credentials_provider(provider)
            .load()
            .await;

        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        info!(
            region = %credentials.region,
            endpoint = ?config.endpoint_url,
            "dynamodb client configured"
        );

        Ok(Self::from_client(Client::from_conf(builder.build()), config))
    }

    pub fn from_client(client: Client, config: &MirrorConfig) -> Self {
        Self {
            client,
            read_capacity_units: config.read_capacity_units,
            write_capacity_units: config.write_capacity_units,
        }
    }

    async fn wait_until_active(&self, table: &str) -> Result<(), BackendError> {
        for attempt in 1..=ACTIVE_POLL_ATTEMPTS {
            let output = self
                .client
                .describe_table()
                .table_name(table)
                .send()
                .await
                .map_err(|err| BackendError(DisplayErrorContext(&err).to_string()))?;
            let status = output.table().and_then(|t| t.table_status());
            if status == Some(&TableStatus::Active) {
                return Ok(());
            }
            debug!(table, attempt, ?status, "waiting for table to become active");
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }
        Err(BackendError(format!(
            "table {table} not active after {ACTIVE_POLL_ATTEMPTS} polls"
        )))
    }
}

fn build_error(err: BuildError) -> BackendError {
    BackendError(err.to_string())
}

/// `run` as a number, every other attribute as a string.
pub(crate) fn to_item(row: &MirrorRow) -> HashMap<String, AttributeValue> {
    let mut item: HashMap<String, AttributeValue> = row
        .attributes
        .iter()
        .map(|(name, value)| (name.clone(), AttributeValue::S(value.clone())))
        .collect();
    item.insert(RUN_FIELD.to_string(), AttributeValue::N(run_number(row.run)));
    item
}

fn run_number(run: u64) -> String {
    run.to_string()
}

fn item_error(row: &MirrorRow, message: impl Into<String>) -> Result<(), StoreItemError> {
    Err(StoreItemError {
        run: row.run,
        message: message.into(),
    })
}

#[async_trait]
impl MirrorBackend for DynamoBackend {
    async fn table_exists(&self, table: &str) -> Result<bool, BackendError> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(DescribeTableError::is_resource_not_found_exception) =>
            {
                Ok(false)
            }
            Err(err) => Err(BackendError(DisplayErrorContext(&err).to_string())),
        }
    }

    async fn create_table(&self, table: &str) -> Result<TableCreation, BackendError> {
        let partition = KeySchemaElement::builder()
            .attribute_name(INSERT_DATE_FIELD)
            .key_type(KeyType::Hash)
            .build()
            .map_err(build_error)?;
        let range = KeySchemaElement::builder()
            .attribute_name(RUN_FIELD)
            .key_type(KeyType::Range)
            .build()
            .map_err(build_error)?;
        let partition_type = AttributeDefinition::builder()
            .attribute_name(INSERT_DATE_FIELD)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(build_error)?;
        let range_type = AttributeDefinition::builder()
            .attribute_name(RUN_FIELD)
            .attribute_type(ScalarAttributeType::N)
            .build()
            .map_err(build_error)?;
        let throughput = ProvisionedThroughput::builder()
            .read_capacity_units(self.read_capacity_units)
            .write_capacity_units(self.write_capacity_units)
            .build()
            .map_err(build_error)?;

        let result = self
            .client
            .create_table()
            .table_name(table)
            .key_schema(partition)
            .key_schema(range)
            .attribute_definitions(partition_type)
            .attribute_definitions(range_type)
            .provisioned_throughput(throughput)
            .send()
            .await;

        match result {
            Ok(_) => {
                self.wait_until_active(table).await?;
                Ok(TableCreation::Created)
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(CreateTableError::is_resource_in_use_exception) =>
            {
                Ok(TableCreation::AlreadyExists)
            }
            Err(err) => Err(BackendError(DisplayErrorContext(&err).to_string())),
        }
    }

    async fn put_rows(&self, table: &str, rows: &[MirrorRow]) -> Vec<Result<(), StoreItemError>> {
        let mut chunk = ChunkWrite::prepare(rows);
        if chunk.requests.is_empty() {
            return chunk.outcomes;
        }

        let requests = std::mem::take(&mut chunk.requests);
        match self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
        {
            Ok(output) => {
                let unprocessed = output
                    .unprocessed_items()
                    .and_then(|items| items.get(table))
                    .map(Vec::as_slice);
                chunk.apply_unprocessed(rows, unprocessed);
            }
            Err(err) => chunk.fail_sent(rows, &DisplayErrorContext(&err).to_string()),
        }
        chunk.outcomes
    }
}

/// Per-row outcomes for one chunk, indexed like the input rows.
///
/// Rows that reach `requests` start out as successes; the store's answer can
/// still turn them into failures.
#[derive(Debug)]
struct ChunkWrite {
    outcomes: Vec<Result<(), StoreItemError>>,
    requests: Vec<WriteRequest>,
    sent: Vec<usize>,
}

impl ChunkWrite {
    fn prepare(rows: &[MirrorRow]) -> Self {
        let mut chunk = Self {
            outcomes: Vec::with_capacity(rows.len()),
            requests: Vec::new(),
            sent: Vec::new(),
        };
        for (idx, row) in rows.iter().enumerate() {
            if row.insert_date().map_or(true, |d| d.trim().is_empty()) {
                chunk
                    .outcomes
                    .push(item_error(row, "row has no insert_date partition key"));
                continue;
            }
            match PutRequest::builder().set_item(Some(to_item(row))).build() {
                Ok(put) => {
                    chunk
                        .requests
                        .push(WriteRequest::builder().put_request(put).build());
                    chunk.sent.push(idx);
                    chunk.outcomes.push(Ok(()));
                }
                Err(err) => chunk.outcomes.push(item_error(row, err.to_string())),
            }
        }
        chunk
    }

    /// Fail every sent row whose `run` key the store handed back unprocessed.
    fn apply_unprocessed(&mut self, rows: &[MirrorRow], unprocessed: Option<&[WriteRequest]>) {
        let left: HashSet<&str> = unprocessed
            .unwrap_or_default()
            .iter()
            .filter_map(WriteRequest::put_request)
            .filter_map(|put| put.item().get(RUN_FIELD))
            .filter_map(|value| value.as_n().ok())
            .map(String::as_str)
            .collect();
        if left.is_empty() {
            return;
        }
        for &idx in &self.sent {
            let row = &rows[idx];
            if left.contains(run_number(row.run).as_str()) {
                self.outcomes[idx] = item_error(row, "left unprocessed by the store");
            }
        }
    }

    /// The whole request failed: every sent row carries the same error.
    fn fail_sent(&mut self, rows: &[MirrorRow], message: &str) {
        for &idx in &self.sent {
            self.outcomes[idx] = item_error(&rows[idx], message);
        }
    }
}
