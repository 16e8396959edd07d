use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;

use crate::tools::web_backends::{clip, is_http_or_https, WebError};
use crate::tools::webfetch::ssrf::check_ssrf_blocked;
use crate::tools::webfetch::url_utils::normalize_fetch_url;
use crate::tools::webfetch::WebFetchRaw;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; Ferrite/1.0; +https://github.com/ferrite-dev/ferrite)";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;
const MAX_ATTEMPTS: u32 = 3;

fn status_retryable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn error_for_status(status: u16) -> Option<&'static str> {
    match status {
        403 => Some("http_403"),
        429 => Some("http_429"),
        500..=599 => Some("connect_failed"),
        _ => None,
    }
}

/// GET with SSRF protection, URL normalization, bounded retries
/// (2^attempt backoff on 429/5xx/timeout only) and a streaming byte cap.
pub struct WebfetchClient {
    client: Client,
    max_bytes: usize,
    timeout_connect: Duration,
    timeout_read: Duration,
    user_agent: String,
}

impl WebfetchClient {
    pub fn new(
        timeout_connect: Duration,
        timeout_read: Duration,
        max_bytes: usize,
        proxy: Option<&str>,
        user_agent: Option<&str>,
    ) -> Self {
        let mut builder = Client::builder().connect_timeout(timeout_connect);
        if let Some(proxy_url) = proxy {
            if let Ok(proxy) = reqwest::Proxy::all(proxy_url) {
                builder = builder.proxy(proxy);
            }
        }
        Self {
            client: builder.build().unwrap_or_default(),
            max_bytes: max_bytes.max(1024),
            timeout_connect,
            timeout_read,
            user_agent: user_agent.unwrap_or(DEFAULT_USER_AGENT).to_string(),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Fetch one URL, returning raw bytes plus read metadata. HTTP error
    /// statuses come back as a raw with `error` set; transport failures
    /// after the final retry raise.
    pub async fn fetch(&self, url: &str) -> Result<WebFetchRaw, WebError> {
        if !is_http_or_https(url) {
            return Err(WebError::InvalidInput(
                "url must be http:// or https://".to_string(),
            ));
        }
        let url = normalize_fetch_url(url.trim());
        check_ssrf_blocked(&url).await?;

        let mut last_err: Option<WebError> = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }
            match self.do_request(&url).await {
                Ok(raw) => {
                    if status_retryable(raw.status_code) && attempt < MAX_ATTEMPTS - 1 {
                        last_err = None;
                        continue;
                    }
                    return Ok(raw);
                }
                Err(err) => {
                    let retryable = matches!(err, WebError::Timeout(_) | WebError::Network(_));
                    if retryable && attempt < MAX_ATTEMPTS - 1 {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| WebError::Network("fetch failed".to_string())))
    }

    async fn do_request(&self, url: &str) -> Result<WebFetchRaw, WebError> {
        let request = self
            .client
            .get(url)
            .header("User-Agent", &self.user_agent)
            .header("Accept-Language", ACCEPT_LANGUAGE)
            .timeout(self.timeout_connect + self.timeout_read);
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                WebError::Timeout(clip(&err))
            } else {
                WebError::Network(clip(&err))
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut response = response;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    if err.is_timeout() {
                        return Err(WebError::Timeout(clip(&err)));
                    }
                    return Err(WebError::Network(clip(&err)));
                }
            };
            if body.len() >= self.max_bytes {
                if !chunk.is_empty() {
                    truncated = true;
                }
                break;
            }
            let remaining = self.max_bytes - body.len();
            if chunk.len() > remaining {
                body.extend_from_slice(&chunk[..remaining]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        let bytes_read = body.len();
        Ok(WebFetchRaw {
            url: url.to_string(),
            final_url,
            status_code: status,
            headers,
            body,
            error: error_for_status(status),
            bytes_read,
            truncated,
        })
    }
}

impl Default for WebfetchClient {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5),
            Duration::from_secs(20),
            DEFAULT_MAX_BYTES,
            None,
            None,
        )
    }
}
