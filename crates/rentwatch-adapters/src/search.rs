use async_trait::async_trait;
use rentwatch_core::{Furnishing, ListingRecord, PageResult};
use rentwatch_storage::header::{self, HeaderMap};
use rentwatch_storage::{HttpFetcher, TransportError};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::auth::BearerToken;
use crate::query::SearchQuery;
use crate::ApiConfig;

/// Field every record receives with the serialized query summary of its page.
const FILTERS_FIELD: &str = "filters";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("search for {facet} page {page} failed with status {status}: {body}")]
    Status {
        facet: Furnishing,
        page: u32,
        status: u16,
        body: String,
    },
    #[error("search for {facet} page {page} could not be sent")]
    Transport {
        facet: Furnishing,
        page: u32,
        #[source]
        source: TransportError,
    },
    #[error("search response for {facet} page {page} could not be decoded")]
    Decode {
        facet: Furnishing,
        page: u32,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn facet(&self) -> Furnishing {
        match self {
            FetchError::Status { facet, .. }
            | FetchError::Transport { facet, .. }
            | FetchError::Decode { facet, .. } => *facet,
        }
    }

    pub fn page(&self) -> u32 {
        match self {
            FetchError::Status { page, .. }
            | FetchError::Transport { page, .. }
            | FetchError::Decode { page, .. } => *page,
        }
    }

    /// HTTP status of a rejected request.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One authenticated search request per call.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        facet: Furnishing,
        page: u32,
        token: &BearerToken,
    ) -> Result<PageResult, FetchError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    element_list: Vec<JsonMap<String, JsonValue>>,
    #[serde(default)]
    summary: Option<JsonValue>,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    actual_page: u32,
}

/// Decode a search response body into a page of flattened records.
///
/// A missing `elementList` is an empty page and a missing `totalPages` is 0.
pub fn parse_search_response(body: &str) -> Result<PageResult, serde_json::Error> {
    let parsed: SearchResponse = serde_json::from_str(body)?;
    let filters = parsed.summary.as_ref().map(JsonValue::to_string);

    let records = parsed
        .element_list
        .into_iter()
        .map(|element| {
            let mut record = ListingRecord::from_api_object(element);
            if let Some(filters) = &filters {
                record.insert(FILTERS_FIELD, filters.as_str());
            }
            record
        })
        .collect();

    Ok(PageResult {
        records,
        total_pages: parsed.total_pages,
        actual_page: parsed.actual_page,
        total: parsed.total,
    })
}

/// Page fetcher speaking the catalog's HTTP search endpoint.
#[derive(Debug, Clone)]
pub struct CatalogPageFetcher {
    http: HttpFetcher,
    api: ApiConfig,
    query: SearchQuery,
    page_size: u32,
}

impl CatalogPageFetcher {
    pub fn new(http: HttpFetcher, api: ApiConfig, query: SearchQuery, page_size: u32) -> Self {
        Self {
            http,
            api,
            query,
            page_size,
        }
    }

    pub fn request_url(&self, facet: Furnishing, page: u32) -> String {
        format!(
            "{}?{}",
            self.api.search_url(),
            self.query.encode(self.page_size, Some(facet), Some(page))
        )
    }
}

#[async_trait]
impl PageFetcher for CatalogPageFetcher {
    async fn fetch_page(
        &self,
        facet: Furnishing,
        page: u32,
        token: &BearerToken,
    ) -> Result<PageResult, FetchError> {
        let span = info_span!("fetch_page", %facet, page);
        async {
            let mut headers = HeaderMap::new();
            headers.insert(header::AUTHORIZATION, token.authorization());

            let resp = self
                .http
                .post(&self.request_url(facet, page), headers, None, None)
                .await
                .map_err(|source| FetchError::Transport {
                    facet,
                    page,
                    source,
                })?;

            if !resp.is_success() {
                return Err(FetchError::Status {
                    facet,
                    page,
                    status: resp.status.as_u16(),
                    body: resp.text(),
                });
            }

            let result = parse_search_response(&resp.text()).map_err(|source| {
                FetchError::Decode {
                    facet,
                    page,
                    source,
                }
            })?;

            if result.actual_page != 0 && result.actual_page != page {
                warn!(
                    actual_page = result.actual_page,
                    "catalog answered with a different page"
                );
            }
            info!(
                total = result.total,
                actual_page = result.actual_page,
                total_pages = result.total_pages,
                records = result.records.len(),
                "{} listings match the query (page {} of {})",
                result.total,
                result.actual_page,
                result.total_pages
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }
}
