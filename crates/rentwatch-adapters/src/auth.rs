use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use rentwatch_storage::header::{self, HeaderMap, HeaderValue, InvalidHeaderValue};
use rentwatch_storage::{HttpFetcher, TransportError};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::ApiConfig;

#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// `Basic base64(api_key:secret)`, the client-credentials authorization value.
pub fn encode_api_credentials(api_key: &str, secret: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{api_key}:{secret}")))
}

/// Short-lived bearer credential for search requests.
#[derive(Clone)]
pub struct BearerToken {
    access_token: String,
    expires_at: DateTime<Utc>,
    header: HeaderValue,
}

impl BearerToken {
    pub fn new(
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, AuthError> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(AuthError::EmptyToken);
        }
        let mut header = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(AuthError::InvalidHeader)?;
        header.set_sensitive(true);
        Ok(Self {
            access_token,
            expires_at,
            header,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn authorization(&self) -> HeaderValue {
        self.header.clone()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("token response could not be decoded")]
    Decode(#[source] serde_json::Error),
    #[error("token response carried an empty access token")]
    EmptyToken,
    #[error("credential is not a valid header value")]
    InvalidHeader(#[source] InvalidHeaderValue),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

pub fn parse_token_response(body: &str, now: DateTime<Utc>) -> Result<BearerToken, AuthError> {
    let parsed: TokenResponse = serde_json::from_str(body).map_err(AuthError::Decode)?;
    let lifetime = TimeDelta::try_seconds(parsed.expires_in.max(0)).unwrap_or(TimeDelta::zero());
    BearerToken::new(parsed.access_token, now + lifetime)
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire_token(&self) -> Result<BearerToken, AuthError>;
}

/// Client-credentials exchange against the catalog's OAuth endpoint.
#[derive(Debug, Clone)]
pub struct OAuthTokenProvider {
    http: HttpFetcher,
    api: ApiConfig,
    credentials: ApiCredentials,
}

impl OAuthTokenProvider {
    pub fn new(http: HttpFetcher, api: ApiConfig, credentials: ApiCredentials) -> Self {
        Self {
            http,
            api,
            credentials,
        }
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn acquire_token(&self) -> Result<BearerToken, AuthError> {
        let basic = encode_api_credentials(&self.credentials.api_key, &self.credentials.secret);
        let mut authorization = HeaderValue::from_str(&basic).map_err(AuthError::InvalidHeader)?;
        authorization.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, authorization);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let resp = self
            .http
            .post(
                &self.api.token_url(),
                headers,
                Some("grant_type=client_credentials".to_string()),
                Some(Duration::from_secs(self.api.token_timeout_secs)),
            )
            .await?;

        if !resp.is_success() {
            return Err(AuthError::Rejected {
                status: resp.status.as_u16(),
                body: resp.text(),
            });
        }

        let now = Utc::now();
        let token = parse_token_response(&resp.text(), now)?;
        info!(
            expires_in_secs = (token.expires_at() - now).num_seconds(),
            "bearer token acquired"
        );
        Ok(token)
    }
}
