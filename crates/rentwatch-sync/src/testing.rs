//! In-memory collaborators for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use rentwatch_adapters::{AuthError, BearerToken, FetchError, PageFetcher, TokenProvider};
use rentwatch_core::{Furnishing, ListingRecord, MirrorRow, PageResult};
use rentwatch_mirror::{BackendError, MirrorBackend, StoreItemError, TableCreation};
use serde_json::json;

pub(crate) fn token() -> BearerToken {
    BearerToken::new("test-token", Utc::now() + TimeDelta::hours(1)).unwrap()
}

/// `count` listings coded `{prefix}-{i}`, on a result set of `total_pages` pages.
pub(crate) fn page(prefix: &str, count: usize, total_pages: u32) -> PageResult {
    let records = (0..count)
        .map(|i| {
            let mut record = ListingRecord::new();
            record.insert("propertyCode", format!("{prefix}-{i}"));
            record.insert("price", json!(1000 + i));
            record.insert("size", json!(50.0));
            record.insert("address", format!("Calle {prefix} {i}"));
            record
        })
        .collect();
    PageResult {
        records,
        total_pages,
        actual_page: 0,
        total: count as u64,
    }
}

enum Step {
    Page(PageResult),
    Fail { status: u16, body: String },
}

#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    steps: HashMap<(Furnishing, u32), Step>,
    calls: Arc<Mutex<Vec<(Furnishing, u32)>>>,
}

impl ScriptedFetcher {
    pub(crate) fn page(mut self, facet: Furnishing, page: u32, result: PageResult) -> Self {
        self.steps.insert((facet, page), Step::Page(result));
        self
    }

    pub(crate) fn failure(mut self, facet: Furnishing, page: u32, status: u16, body: &str) -> Self {
        self.steps.insert(
            (facet, page),
            Step::Fail {
                status,
                body: body.to_string(),
            },
        );
        self
    }

    pub(crate) fn calls(&self) -> Arc<Mutex<Vec<(Furnishing, u32)>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch_page(
        &self,
        facet: Furnishing,
        page: u32,
        _token: &BearerToken,
    ) -> Result<PageResult, FetchError> {
        self.calls.lock().unwrap().push((facet, page));
        match self.steps.get(&(facet, page)) {
            Some(Step::Page(result)) => Ok(result.clone()),
            Some(Step::Fail { status, body }) => Err(FetchError::Status {
                facet,
                page,
                status: *status,
                body: body.clone(),
            }),
            None => Err(FetchError::Status {
                facet,
                page,
                status: 404,
                body: "unscripted page".to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub(crate) struct StaticTokens {
    pub(crate) reject: bool,
    pub(crate) calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn acquire_token(&self) -> Result<BearerToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(AuthError::Rejected {
                status: 401,
                body: "invalid_client".to_string(),
            });
        }
        Ok(token())
    }
}

#[derive(Default)]
pub(crate) struct MemoryState {
    pub(crate) tables: HashSet<String>,
    pub(crate) create_fails: bool,
    pub(crate) failing_runs: HashSet<u64>,
    pub(crate) rows: Vec<MirrorRow>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryMirror(pub(crate) Arc<Mutex<MemoryState>>);

#[async_trait]
impl MirrorBackend for MemoryMirror {
    async fn table_exists(&self, table: &str) -> Result<bool, BackendError> {
        Ok(self.0.lock().unwrap().tables.contains(table))
    }

    async fn create_table(&self, table: &str) -> Result<TableCreation, BackendError> {
        let mut state = self.0.lock().unwrap();
        if state.create_fails {
            return Err(BackendError("AccessDeniedException".to_string()));
        }
        if state.tables.insert(table.to_string()) {
            Ok(TableCreation::Created)
        } else {
            Ok(TableCreation::AlreadyExists)
        }
    }

    async fn put_rows(&self, _table: &str, rows: &[MirrorRow]) -> Vec<Result<(), StoreItemError>> {
        let mut state = self.0.lock().unwrap();
        rows.iter()
            .map(|row| {
                if state.failing_runs.contains(&row.run) {
                    return Err(StoreItemError {
                        run: row.run,
                        message: "ConditionalCheckFailed".to_string(),
                    });
                }
                state.rows.push(row.clone());
                Ok(())
            })
            .collect()
    }
}
