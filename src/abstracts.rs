//! Abstract lookup against a remote summary service
//!
//! The enrichment stage resolves each article title to its page id and
//! abstract through this interface. Redirects resolve to their target page,
//! which the enricher detects through the id mismatch.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Errors that can occur while resolving an abstract.
#[derive(Debug, Error)]
pub enum AbstractError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("summary endpoint returned status {0} for {1:?}")]
    Status(u16, String),
    #[error("page not found: {0:?}")]
    NotFound(String),
    #[error("failed to parse URL: {0}")]
    InvalidUrl(String),
}

/// Abstract of a resolved page.
#[derive(Debug, Clone, Deserialize)]
pub struct PageAbstract {
    /// Id of the page the title resolved to. A redirect yields the target's
    /// id, not the id of the page carrying the title.
    #[serde(rename = "pageid")]
    pub page_id: u32,
    #[serde(rename = "extract", default)]
    pub abstract_text: String,
}

/// Resolves a title to its page id and abstract.
#[async_trait]
pub trait AbstractLookup: Send + Sync {
    async fn lookup(&self, title: &str) -> Result<PageAbstract, AbstractError>;
}

/// Configuration for the REST summary client.
#[derive(Debug, Clone)]
pub struct RestLookupConfig {
    /// User agent sent with every request.
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
}

impl Default for RestLookupConfig {
    fn default() -> Self {
        Self {
            user_agent: "revstream/0.1 (+https://github.com/revstream)".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 5,
        }
    }
}

/// Summary client for a MediaWiki REST `page/summary` endpoint.
///
/// No request timeout is set on the client itself; the enricher wraps every
/// call in its own configurable deadline.
pub struct RestAbstractLookup {
    client: reqwest::Client,
    base_url: Url,
}

impl RestAbstractLookup {
    /// Client for the given language edition, e.g. `"en"`.
    pub fn new(lang: &str, config: RestLookupConfig) -> Result<Self, AbstractError> {
        Self::with_base_url(
            format!("https://{lang}.wikipedia.org/api/rest_v1/page/summary/"),
            config,
        )
    }

    /// Client against an explicit endpoint, e.g. a local fixture server. The
    /// URL must end with a slash for titles to join onto it.
    pub fn with_base_url(
        base_url: impl AsRef<str>,
        config: RestLookupConfig,
    ) -> Result<Self, AbstractError> {
        let base_url = Url::parse(base_url.as_ref())
            .map_err(|e| AbstractError::InvalidUrl(e.to_string()))?;
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Titles use spaces in the dump but underscores in summary URLs.
    fn summary_url(&self, title: &str) -> Result<Url, AbstractError> {
        self.base_url
            .join(&title.replace(' ', "_"))
            .map_err(|e| AbstractError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl AbstractLookup for RestAbstractLookup {
    async fn lookup(&self, title: &str) -> Result<PageAbstract, AbstractError> {
        let url = self.summary_url(title)?;
        let response = self.client.get(url.as_str()).send().await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(AbstractError::NotFound(title.to_string()));
        }
        if !status.is_success() {
            return Err(AbstractError::Status(status.as_u16(), title.to_string()));
        }

        Ok(response.json::<PageAbstract>().await?)
    }
}
