use super::{FeedSource, PageRequest};
use crate::model::{Cursor, FeedPage, Identity};
use async_trait::async_trait;
use connector_core::backoff::{retry_with_backoff, RetryPolicy};
use connector_core::config::FeedConfig;
use connector_core::{Error, Result};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const API_KEY_HEADER: &str = "X-OTX-API-KEY";
const USER_ME_PATH: &str = "/api/v1/users/me";
const PULSES_SUBSCRIBED_PATH: &str = "/api/v1/pulses/subscribed";

#[derive(Debug, Deserialize)]
struct PulsePage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    next: Option<String>,
}

/// AlienVault OTX subscribed-pulses feed.
pub struct OtxSource {
    client: Client,
    base_url: Url,
    api_key: String,
    source_tag: String,
    retry: RetryPolicy,
}

impl OtxSource {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid feed.base_url {:?}: {e}", config.base_url)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("otx-connector/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            source_tag: config.source_tag.clone(),
            retry: RetryPolicy::from_secs_f64(config.max_retries, config.backoff_secs),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("cannot build URL for {path}: {e}")))
    }

    fn page_url(&self, request: &PageRequest) -> Result<Url> {
        match request {
            PageRequest::First {
                limit,
                modified_since,
            } => {
                let mut url = self.endpoint(PULSES_SUBSCRIBED_PATH)?;
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("limit", &limit.to_string());
                    if let Some(since) = modified_since {
                        query.append_pair("modified_since", since.as_str());
                    }
                }
                Ok(url)
            }
            // `next` is absolute in practice; joining also copes with a relative one
            PageRequest::Follow(cursor) => self.base_url.join(cursor.as_str()).map_err(|e| {
                Error::Validation(format!("feed returned an unusable next link {:?}: {e}", cursor.as_str()))
            }),
        }
    }

    /// GET with the transport retry budget. Non-200 answers come back as
    /// `UnexpectedStatus` for the caller to classify.
    async fn get_json(&self, url: Url, operation: &str) -> Result<Value> {
        let body = retry_with_backoff(|| self.get_once(url.clone()), &self.retry, operation).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_once(&self, url: Url) -> Result<String> {
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            return Err(Error::unexpected_status(status.as_u16(), &body));
        }

        Ok(body)
    }
}

#[async_trait]
impl FeedSource for OtxSource {
    #[instrument(skip(self))]
    async fn authenticate(&self) -> Result<Identity> {
        let url = self.endpoint(USER_ME_PATH)?;
        let body = self
            .get_json(url, "validate_api_key")
            .await
            .map_err(|e| match e {
                Error::UnexpectedStatus { status, body } => Error::Authentication { status, body },
                other => other,
            })?;

        Ok(serde_json::from_value(body)?)
    }

    #[instrument(skip(self))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage> {
        let url = self.page_url(request)?;
        let body = self
            .get_json(url, "fetch_pulses")
            .await
            .map_err(|e| match e {
                Error::UnexpectedStatus { status, body } => Error::Extraction { status, body },
                other => other,
            })?;

        let page: PulsePage = serde_json::from_value(body)?;

        Ok(FeedPage {
            records: page.results,
            next: page
                .next
                .filter(|next| !next.trim().is_empty())
                .map(Cursor::new),
        })
    }

    fn source_id(&self) -> &str {
        &self.source_tag
    }
}
