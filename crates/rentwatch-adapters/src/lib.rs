//! Catalog API adapter: credential exchange, typed search queries and page fetching.

use serde::Deserialize;

mod auth;
mod query;
mod search;

pub use auth::{
    encode_api_credentials, parse_token_response, ApiCredentials, AuthError, BearerToken,
    OAuthTokenProvider, TokenProvider,
};
pub use query::{
    Location, OrderField, Operation, Preservation, PropertyType, QueryError, SearchQuery,
    SinceDate, SortDirection, MAX_PAGE_SIZE,
};
pub use search::{parse_search_response, CatalogPageFetcher, FetchError, PageFetcher};

pub const CRATE_NAME: &str = "rentwatch-adapters";

/// Where and how to reach the catalog API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub version: String,
    pub country: String,
    /// Deadline for search requests.
    pub timeout_secs: u64,
    /// Deadline for the token exchange.
    pub token_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.idealista.com".to_string(),
            version: "3.5".to_string(),
            country: "es".to_string(),
            timeout_secs: 30,
            token_timeout_secs: 5,
        }
    }
}

impl ApiConfig {
    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.base_url.trim_end_matches('/'))
    }

    pub fn search_url(&self) -> String {
        format!(
            "{}/{}/{}/search",
            self.base_url.trim_end_matches('/'),
            self.version,
            self.country
        )
    }
}
