use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{ACCEPT, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use url::Url;

use crate::model::Validators;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("GET {url} timed out")]
    Timeout { url: String },
    #[error("GET {url}: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// `None` for any non-2xx status, including `304 Not Modified`.
    pub body: Option<String>,
    /// Response headers keyed by lower-cased name.
    pub headers: BTreeMap<String, String>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag").filter(|v| !v.is_empty())
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header("last-modified").filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Conditional GET of a monitored page.
    pub async fn fetch(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<FetchResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_owned(),
            source,
        })?;

        let mut request = self
            .client
            .get(parsed)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8");
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request
            .send()
            .await
            .map_err(|err| transport_error(url, err))?;

        let status = response.status();
        let headers = collect_headers(response.headers());
        if !status.is_success() {
            tracing::debug!(url, status = status.as_u16(), "no content returned");
            return Ok(FetchResponse {
                status: status.as_u16(),
                body: None,
                headers,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| transport_error(url, err))?;
        Ok(FetchResponse {
            status: status.as_u16(),
            body: Some(body),
            headers,
        })
    }
}

pub fn build_client(user_agent: &str, timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|err| anyhow::anyhow!("build http client: {err}"))
}

fn transport_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_owned(),
        }
    } else {
        FetchError::Transport {
            url: url.to_owned(),
            source: err,
        }
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_owned(), value.to_owned()))
        })
        .collect()
}
