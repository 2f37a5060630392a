//! HTTP transport: OSM Notes API, Planet dump, and Overpass.
//!
//! One `reqwest` client per process, with the mandatory `User-Agent` and
//! per-request timeouts. Anything that can fail transiently goes through
//! the fixed-interval retry in `error`.

use std::path::Path;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::config::{Config, FETCH_TIMEOUT, PROBE_TIMEOUT};
use crate::error::{IngestError, RetrySpec, retry_fixed};

/// HTTP client wrapper with the endpoints baked in.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    api_url: String,
    planet_url: String,
    overpass_url: String,
    retry: RetrySpec,
}

impl HttpClient {
    pub fn new(config: &Config) -> Result<Self, IngestError> {
        let inner = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .connect_timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Internal(format!("http client build: {e}")))?;
        Ok(Self {
            inner,
            api_url: config.api_url.clone(),
            planet_url: config.planet_url.clone(),
            overpass_url: config.overpass_url.clone(),
            retry: config.retry,
        })
    }

    /// Liveness probe: a bounded `limit=1` search filtered by the watermark.
    ///
    /// Returns whether any update candidate exists. Both timeouts are 10 s;
    /// an unreachable API is [`IngestError::NetworkUnreachable`].
    pub async fn probe_updates(
        &self,
        since: DateTime<Utc>,
    ) -> Result<bool, IngestError> {
        let url = format!(
            "{}/notes/search?limit=1&closed=-1&sort=updated_at&from={}",
            self.api_url,
            since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        let resp = self
            .inner
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| IngestError::HttpStatus {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                url: url.clone(),
            })?;
        let body = resp.text().await?;
        Ok(body.contains("<note "))
    }

    /// Whether the API host answers at all. Used by the marker self-heal gate.
    pub async fn network_ok(&self) -> bool {
        self.inner
            .get(&self.api_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }

    /// Download the incremental delta XML since `since` into `dest`.
    pub async fn fetch_deltas(
        &self,
        since: DateTime<Utc>,
        limit: u64,
        dest: &Path,
    ) -> Result<u64, IngestError> {
        let url = format!(
            "{}/notes/search?limit={limit}&closed=-1&sort=updated_at&from={}",
            self.api_url,
            since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        retry_fixed("api delta fetch", self.retry, || {
            let url = url.clone();
            async move { self.download_once(&url, dest, FETCH_TIMEOUT).await }
        })
        .await
    }

    /// Download the Planet dump to `dest`, resuming a partial file via HTTP
    /// Range when the server cooperates.
    pub async fn download_planet(&self, dest: &Path) -> Result<u64, IngestError> {
        let url = self.planet_url.clone();
        retry_fixed("planet download", self.retry, || {
            let url = url.clone();
            async move { self.download_resumable(&url, dest).await }
        })
        .await
    }

    /// Issue an Overpass query, returning the response body.
    pub async fn overpass(&self, query: &str) -> Result<String, IngestError> {
        retry_fixed("overpass query", self.retry, || async move {
            let resp = self
                .inner
                .post(&self.overpass_url)
                .form(&[("data", query)])
                .timeout(FETCH_TIMEOUT)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(IngestError::HttpStatus {
                    status: status.as_u16(),
                    url: self.overpass_url.clone(),
                });
            }
            Ok(resp.text().await?)
        })
        .await
    }

    /// One-shot download of `url` into `dest` (truncating), returning bytes
    /// written.
    async fn download_once(
        &self,
        url: &str,
        dest: &Path,
        timeout: std::time::Duration,
    ) -> Result<u64, IngestError> {
        let resp = self.inner.get(url).timeout(timeout).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Download with resume: a pre-existing partial `dest` turns into a
    /// `Range` request. A server answering 200 to a ranged request restarts
    /// the file from scratch.
    async fn download_resumable(&self, url: &str, dest: &Path) -> Result<u64, IngestError> {
        let offset = tokio::fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);

        let mut req = self.inner.get(url).timeout(FETCH_TIMEOUT * 12);
        if offset > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let resp = req.send().await?;
        let status = resp.status();

        let (mut file, mut written) = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            tracing::info!("resuming planet download at byte {offset}");
            let f = tokio::fs::OpenOptions::new().append(true).open(dest).await?;
            (f, offset)
        } else if status.is_success() {
            (tokio::fs::File::create(dest).await?, 0)
        } else {
            return Err(IngestError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        };

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }
}
