//! A thin HTTP layer shared by every cloud-facing client.
//!
//! [`RestClient`] wraps one [`reqwest::Client`] with the defaults every
//! call needs (user agent, request timeout), plus a [`UrlRewriter`]
//! applied to every outgoing request to fix the one host the upstream is
//! known to emit invalidly. Nothing here retries on its own; callers that
//! want bounded retries pace themselves with [`backoff::iter`].

use std::time::Duration;

use http::StatusCode;
use reqwest::Url;

use crate::error::Error;

/// Every remote call is bounded by this; nothing blocks indefinitely.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounded exponential spacing for retries.
pub mod backoff {
    use std::{cmp::min, time::Duration};

    const INITIAL_WAIT_MS: u64 = 500;
    const MAXIMUM_WAIT_MS: u64 = 15_000;
    const EXP_BASE: u64 = 2;

    /// 500ms, 1s, 2s, 4s, ... capped at 15s.
    pub fn iter() -> impl Iterator<Item = Duration> {
        (0u32..).map(|index| {
            let factor = EXP_BASE.saturating_pow(index);
            let wait_ms = INITIAL_WAIT_MS.saturating_mul(factor);
            Duration::from_millis(min(wait_ms, MAXIMUM_WAIT_MS))
        })
    }

}

/// Rewrites request URLs whose host matches a single known-bad host.
///
/// The listing API still emits blob URLs pointing at the storage host from
/// before the vendor's infra migration; requests to it fail DNS. The fixup
/// is applied to every request leaving [`RestClient`].
#[derive(Clone, Debug)]
pub struct UrlRewriter {
    from_host: String,
    to_host: String,
}

impl UrlRewriter {
    pub fn new(
        from_host: impl Into<String>,
        to_host: impl Into<String>,
    ) -> Result<Self, Error> {
        let from_host = from_host.into();
        let to_host = to_host.into();
        // Validate now so `apply` can't fail mid-request.
        for host in [&from_host, &to_host] {
            Url::parse(&format!("https://{host}/")).map_err(|e| {
                Error::InvalidInput(format!("bad rewrite host {host:?}: {e}"))
            })?;
        }
        Ok(Self { from_host, to_host })
    }

    /// Rewrite `url` in place if its host matches.
    pub fn apply(&self, url: &mut Url) {
        if url.host_str() == Some(self.from_host.as_str()) {
            url.set_host(Some(&self.to_host))
                .expect("to_host was validated in the constructor");
        }
    }
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    rewriter: Option<UrlRewriter>,
}

impl RestClient {
    /// Build a [`RestClient`] with safe defaults.
    pub fn new(user_agent: &str, rewriter: Option<UrlRewriter>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(API_REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build reqwest Client");
        Self { client, rewriter }
    }

    /// The underlying client, for building requests.
    #[inline]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a built request; map transport failures and non-2xx statuses
    /// into our error taxonomy.
    pub async fn send(
        &self,
        request_builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error> {
        let request = request_builder
            .build()
            .map_err(|e| Error::transport("building request", e))?;
        self.send_request(request).await
    }

    async fn send_request(
        &self,
        mut request: reqwest::Request,
    ) -> Result<reqwest::Response, Error> {
        if let Some(rewriter) = &self.rewriter {
            rewriter.apply(request.url_mut());
        }

        let method = request.method().clone();
        let url_path = request.url().path().to_owned();

        let resp = self.client.execute(request).await.map_err(|e| {
            Error::transport(format!("{method} {url_path}"), e)
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        // Non-2xx: pull the body for the error message, then map by status.
        let body = resp.text().await.unwrap_or_default();
        let msg = if body.trim().is_empty() {
            format!("{method} {url_path} returned {status}")
        } else {
            format!("{method} {url_path} returned {status}: {}", body.trim())
        };
        Err(error_for_status(status, msg))
    }
}

fn error_for_status(status: StatusCode, msg: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(msg),
        StatusCode::NOT_FOUND => Error::NotFound(msg),
        s if s.is_server_error() => Error::Transport {
            ctx: msg,
            source: None,
        },
        _ => Error::Rejected(msg),
    }
}
