//! CRM access: OAuth refresh-token exchange and bounded COQL queries.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use crmsync_core::{AccessToken, RawRecord};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "crmsync-crm";

/// Hard page-size ceiling of the CRM query API.
pub const COQL_PAGE_CEILING: u32 = 200;

pub const DEFAULT_TOKEN_URL: &str = "https://accounts.zoho.com/oauth/v2/token";
pub const DEFAULT_API_BASE_URL: &str = "https://www.zohoapis.com/crm/v2";

const AUTH_SCHEME: &str = "Zoho-oauthtoken";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Build the one reqwest client shared by the credential provider and the fetcher.
pub fn build_http_client(config: &HttpClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build()
}

/// Long-lived OAuth client material.
#[derive(Clone)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl OAuthClientConfig {
    fn first_missing(&self) -> Option<&'static str> {
        [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("refresh_token", &self.refresh_token),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

impl fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("CRM OAuth client is not configured: {0} is empty")]
    NotConfigured(&'static str),
    #[error("token request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("token endpoint returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("token endpoint returned no access_token: {body}")]
    MissingToken { body: String },
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Exchange the refresh credential for a fresh access token. No retries.
    async fn acquire(&self) -> Result<AccessToken, CredentialError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ZohoCredentialProvider {
    client: reqwest::Client,
    config: OAuthClientConfig,
}

impl ZohoCredentialProvider {
    pub fn new(client: reqwest::Client, config: OAuthClientConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl CredentialProvider for ZohoCredentialProvider {
    async fn acquire(&self) -> Result<AccessToken, CredentialError> {
        if let Some(missing) = self.config.first_missing() {
            return Err(CredentialError::NotConfigured(missing));
        }

        let resp = self
            .client
            .post(&self.config.token_url)
            .query(&[
                ("refresh_token", self.config.refresh_token.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(CredentialError::Transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(CredentialError::Transport)?;
        if !status.is_success() {
            return Err(CredentialError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let token = serde_json::from_str::<TokenResponse>(&body)
            .ok()
            .and_then(|parsed| parsed.access_token)
            .filter(|token| !token.is_empty());

        match token {
            Some(token) => {
                debug!("access token acquired");
                Ok(AccessToken::new(token))
            }
            None => Err(CredentialError::MissingToken { body }),
        }
    }
}

/// Bounded read-only select against one CRM module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub module: &'static str,
    pub fields: Vec<&'static str>,
    pub filter: Option<&'static str>,
    pub offset: u32,
    pub limit: u32,
}

impl QueryDescriptor {
    pub fn select(module: &'static str, fields: &[&'static str]) -> Self {
        Self {
            module,
            fields: fields.to_vec(),
            filter: None,
            offset: 0,
            limit: COQL_PAGE_CEILING,
        }
    }

    pub fn filter(mut self, filter: &'static str) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Page size, clamped to `1..=COQL_PAGE_CEILING`.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(1, COQL_PAGE_CEILING);
        self
    }

    pub fn to_coql(&self) -> String {
        let mut query = format!("SELECT {} FROM {}", self.fields.join(", "), self.module);
        if let Some(filter) = self.filter {
            query.push_str(" WHERE ");
            query.push_str(filter);
        }
        query.push_str(&format!(" LIMIT {},{}", self.offset, self.limit.min(COQL_PAGE_CEILING)));
        query
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("CRM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("CRM returned http {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("CRM response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait RecordFetcher: Send + Sync {
    /// Run one bounded query. Zero matching rows is an empty vector, not an error.
    async fn fetch(
        &self,
        token: &AccessToken,
        query: &QueryDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError>;

    /// Records of `module` whose `Parent_Id` lookup points at `parent_id`.
    async fn fetch_related(
        &self,
        token: &AccessToken,
        module: &str,
        parent_id: &str,
    ) -> Result<Vec<RawRecord>, FetchError>;
}

#[derive(Debug, Default, Deserialize)]
struct DataResponse {
    #[serde(default)]
    data: Option<Vec<RawRecord>>,
    #[serde(default)]
    info: Option<ResponseInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseInfo {
    #[serde(default)]
    more_records: bool,
    #[serde(default)]
    count: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CoqlFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl CoqlFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn auth_header(token: &AccessToken) -> String {
        format!("{AUTH_SCHEME} {}", token.secret())
    }

    async fn read_data(resp: reqwest::Response) -> Result<Option<DataResponse>, FetchError> {
        let status = resp.status();
        let url = resp.url().to_string();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = resp.text().await?;
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| FetchError::Decode { url, source })
    }
}

#[async_trait]
impl RecordFetcher for CoqlFetcher {
    async fn fetch(
        &self,
        token: &AccessToken,
        query: &QueryDescriptor,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let url = format!("{}/coql", self.base_url);
        let select_query = query.to_coql();
        let span = info_span!("coql_fetch", module = query.module);

        async move {
            debug!(%select_query, "running CRM query");
            let resp = self
                .client
                .post(&url)
                .header(AUTHORIZATION, Self::auth_header(token))
                .json(&json!({ "select_query": select_query }))
                .send()
                .await?;

            let Some(parsed) = Self::read_data(resp).await? else {
                info!(count = 0, "CRM query returned no rows");
                return Ok(Vec::new());
            };

            let records = parsed.data.unwrap_or_default();
            let info = parsed.info.unwrap_or_default();
            if info.more_records {
                warn!(
                    fetched = records.len(),
                    reported = ?info.count,
                    "CRM reports more rows than one page; only the first page is synced"
                );
            }
            info!(count = records.len(), "CRM records fetched");
            Ok(records)
        }
        .instrument(span)
        .await
    }

    async fn fetch_related(
        &self,
        token: &AccessToken,
        module: &str,
        parent_id: &str,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let url = format!("{}/{}/search", self.base_url, module);
        let criteria = format!("(Parent_Id.id:equals:{parent_id})");

        let resp = self
            .client
            .get(&url)
            .header(AUTHORIZATION, Self::auth_header(token))
            .query(&[("criteria", criteria.as_str())])
            .send()
            .await?;

        let records = Self::read_data(resp)
            .await?
            .and_then(|parsed| parsed.data)
            .unwrap_or_default();
        debug!(module, parent_id, count = records.len(), "related CRM records fetched");
        Ok(records)
    }
}
