use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use camino::Utf8Path;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use tracing::warn;

use crate::cancel::CancelScope;

pub mod broker;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Shared HTTP client with the project user agent.
pub fn default_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("gantry/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[derive(Debug)]
pub enum DownloadEvent {
    Started { total_bytes: u64 },
    Progress { bytes_delta: u64 },
    Completed { success: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation cancelled")]
    Cancelled,
}

/// Byte-transfer collaborator. Packages and raw resources come through here;
/// everything above this trait only sees local paths and text.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Stream `url` into `dest`, atomically (tmp file + rename). Progress is
    /// reported as byte deltas; cancellation aborts the transfer.
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Utf8Path,
        progress: Option<Sender<DownloadEvent>>,
        scope: &CancelScope,
    ) -> Result<(), DownloadError>;

    /// Fetch a small resource straight into memory as text.
    async fn fetch_text(&self, url: &str, scope: &CancelScope) -> Result<String, DownloadError>;
}

pub struct HttpDownloader {
    client: Client,
    retries: u32,
    rate_limit_bytes: Option<u64>,
}

impl HttpDownloader {
    pub fn new(client: Client, retries: u32, rate_limit_bytes: Option<u64>) -> Self {
        Self {
            client,
            retries,
            rate_limit_bytes,
        }
    }

    fn limiter(&self) -> Option<Arc<DirectLimiter>> {
        self.rate_limit_bytes.and_then(|bps| {
            NonZeroU32::new(bps as u32)
                .map(|nz| Arc::new(RateLimiter::direct(Quota::per_second(nz))))
        })
    }

    async fn stream_once(
        &self,
        url: &str,
        tmp_path: &Utf8Path,
        progress: &Option<Sender<DownloadEvent>>,
        limiter: &Option<Arc<DirectLimiter>>,
        scope: &CancelScope,
    ) -> Result<(), DownloadError> {
        let resp = tokio::select! {
            _ = scope.cancelled() => return Err(DownloadError::Cancelled),
            res = self.client.get(url).send() => res.map_err(|e| DownloadError::Http(e.to_string()))?,
        };
        if !resp.status().is_success() {
            return Err(DownloadError::Status(resp.status().as_u16()));
        }

        let total = resp.content_length().unwrap_or(0);
        if let Some(tx) = progress {
            let _ = tx.send(DownloadEvent::Started { total_bytes: total }).await;
        }

        let mut file = File::create(tmp_path.as_std_path()).await?;
        let mut stream = resp.bytes_stream();
        let mut accumulated = 0u64;
        let mut last_emit = Instant::now();

        loop {
            let chunk = tokio::select! {
                _ = scope.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => match next {
                    Some(res) => res.map_err(|e| DownloadError::Http(e.to_string()))?,
                    None => break,
                },
            };

            if let Some(l) = limiter {
                if let Some(nz) = NonZeroU32::new(chunk.len() as u32) {
                    l.until_n_ready(nz).await.ok();
                }
            }

            file.write_all(&chunk).await?;
            accumulated += chunk.len() as u64;

            if accumulated > 1_000_000 || last_emit.elapsed().as_millis() > 100 {
                if let Some(tx) = progress {
                    let _ = tx
                        .send(DownloadEvent::Progress {
                            bytes_delta: accumulated,
                        })
                        .await;
                }
                accumulated = 0;
                last_emit = Instant::now();
            }
        }

        if accumulated > 0 {
            if let Some(tx) = progress {
                let _ = tx
                    .send(DownloadEvent::Progress {
                        bytes_delta: accumulated,
                    })
                    .await;
            }
        }

        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Utf8Path,
        progress: Option<Sender<DownloadEvent>>,
        scope: &CancelScope,
    ) -> Result<(), DownloadError> {
        let tmp_path = dest.with_extension("part");
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent.as_std_path()).await?;
        }

        let limiter = self.limiter();
        let mut last_err = DownloadError::Http("no attempt made".into());

        for attempt in 0..self.retries.max(1) {
            match self
                .stream_once(url, &tmp_path, &progress, &limiter, scope)
                .await
            {
                Ok(()) => {
                    tokio::fs::rename(tmp_path.as_std_path(), dest.as_std_path()).await?;
                    if let Some(tx) = &progress {
                        let _ = tx.send(DownloadEvent::Completed { success: true }).await;
                    }
                    return Ok(());
                }
                Err(DownloadError::Cancelled) => {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(DownloadError::Cancelled);
                }
                Err(e) => {
                    warn!("download attempt {attempt} for {url} failed: {e}");
                    last_err = e;
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }

        let _ = tokio::fs::remove_file(&tmp_path).await;
        if let Some(tx) = &progress {
            let _ = tx.send(DownloadEvent::Completed { success: false }).await;
        }
        Err(last_err)
    }

    async fn fetch_text(&self, url: &str, scope: &CancelScope) -> Result<String, DownloadError> {
        let resp = tokio::select! {
            _ = scope.cancelled() => return Err(DownloadError::Cancelled),
            res = self.client.get(url).send() => res.map_err(|e| DownloadError::Http(e.to_string()))?,
        };
        if !resp.status().is_success() {
            return Err(DownloadError::Status(resp.status().as_u16()));
        }
        tokio::select! {
            _ = scope.cancelled() => Err(DownloadError::Cancelled),
            body = resp.text() => body.map_err(|e| DownloadError::Http(e.to_string())),
        }
    }
}
