//! Package downloader.
//!
//! Streams an archive into memory under a size cap, then scans it. One fetch
//! may run per downloader; a second concurrent call is rejected immediately.

use std::io;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::descriptor::PackageDescriptor;
use super::error::PackageError;
use super::gate::{GatePass, OperationGate};
use crate::config::DownloadConfig;
use crate::metadata::Inspector;

/// Downloads and analyzes plugin packages.
pub struct PackageDownloader {
    config: DownloadConfig,
    inspector: Inspector,
    /// Created on first use and reused.
    client: OnceLock<reqwest::Client>,
    gate: OperationGate,
    /// Token of the fetch in flight, if any.
    cancel_slot: Mutex<Option<CancellationToken>>,
}

impl PackageDownloader {
    /// Creates a downloader; no network activity happens until a fetch.
    #[must_use]
    pub fn new(config: DownloadConfig, inspector: Inspector) -> Self {
        Self {
            config,
            inspector,
            client: OnceLock::new(),
            gate: OperationGate::new(),
            cancel_slot: Mutex::new(None),
        }
    }

    /// Returns true while a fetch is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Cancels the fetch in flight, if any. Safe to call at any time.
    pub fn cancel(&self) {
        if let Some(token) = self.lock_slot().as_ref() {
            info!("[PKG-FETCH] Cancel requested");
            token.cancel();
        }
    }

    /// Fetches `url`, reporting a failure through `on_error`.
    ///
    /// Returns `None` on failure; `on_error` is then called exactly once.
    pub async fn fetch<F>(&self, url: &str, on_error: F) -> Option<PackageDescriptor>
    where
        F: FnOnce(String),
    {
        match self.try_fetch(url).await {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                on_error(e.to_string());
                None
            }
        }
    }

    /// Fetches and scans `url`.
    pub async fn try_fetch(&self, url: &str) -> Result<PackageDescriptor, PackageError> {
        let Some(pass) = self.gate.try_enter() else {
            warn!("[PKG-FETCH] Rejected {}: already busy", url);
            return Err(PackageError::Busy);
        };

        let token = CancellationToken::new();
        let _scope = FetchScope::enter(&self.cancel_slot, token.clone(), pass);

        info!("[PKG-FETCH] Fetching {}", url);
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(PackageError::Canceled),
            result = self.download_and_analyze(url) => result,
        };

        match &result {
            Ok(descriptor) => info!(
                "[PKG-FETCH] Fetched {} ({} other files, manifest: {})",
                descriptor.main_member_name(),
                descriptor.other_files().len(),
                descriptor.manifest().is_some()
            ),
            Err(e) => warn!("[PKG-FETCH] Fetch of {} failed: {}", url, e),
        }
        result
    }

    async fn download_and_analyze(&self, url: &str) -> Result<PackageDescriptor, PackageError> {
        let bytes = self.download(url).await?;
        debug!("[PKG-FETCH] Downloaded {} bytes", bytes.len());
        Ok(PackageDescriptor::from_archive(bytes, &self.inspector)?.with_source_url(url))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, PackageError> {
        let response = self.client()?.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PackageError::HttpStatus(status));
        }

        let limit = self.config.max_archive_bytes;
        if let Some(length) = response.content_length() {
            if length > limit {
                return Err(PackageError::TooLarge { limit });
            }
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other));
        let reader = StreamReader::new(stream);
        tokio::pin!(reader);

        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        let mut data = Vec::new();
        loop {
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(PackageError::Transfer)?;
            if read == 0 {
                break;
            }
            if (data.len() + read) as u64 > limit {
                return Err(PackageError::TooLarge { limit });
            }
            data.extend_from_slice(&buffer[..read]);
        }

        Ok(data)
    }

    fn client(&self) -> Result<&reqwest::Client, PackageError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }

        let client = reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.cancel_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PackageDownloader {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Publishes the cancellation token for the duration of one fetch.
///
/// Dropping it clears the slot, then releases the gate, on every exit path
/// including a dropped future.
struct FetchScope<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
    _pass: GatePass<'a>,
}

impl<'a> FetchScope<'a> {
    fn enter(slot: &'a Mutex<Option<CancellationToken>>, token: CancellationToken, pass: GatePass<'a>) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Self { slot, _pass: pass }
    }
}

impl Drop for FetchScope<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
