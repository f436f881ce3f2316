//! Fetch installation media into the cache and verify it.
//!
//! The digest is computed over exactly the bytes written to the partial
//! file. Nothing is committed to the cache unless the digest matches, so a
//! bad or interrupted download can never be reused.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::cache::{cache_key, Cache, EntryMeta};
use crate::cancel::CancelToken;
use crate::checksum::{digest_file, ChecksumType};
use crate::ui::Ui;

const CHUNK_SIZE: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// How often the writer looks at the cancel token while waiting for data.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Chunks buffered between the transfer thread and the writer.
const TRANSFER_QUEUE: usize = 8;
/// Progress granularity when the server does not send a length.
const UNKNOWN_LENGTH_REPORT_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("checksum mismatch for {url}: expected {kind} {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        kind: ChecksumType,
        expected: String,
        actual: String,
    },
}

/// What a fetch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// Verified media in the cache.
    Ready(PathBuf),
    Cancelled,
}

/// Media to fetch.
#[derive(Debug, Clone, Copy)]
pub struct IsoRequest<'a> {
    pub url: &'a str,
    pub checksum_type: ChecksumType,
    /// Lower-case hex digest.
    pub checksum: &'a str,
}

impl IsoRequest<'_> {
    pub fn cache_key(&self) -> String {
        cache_key(self.url, self.checksum_type, self.checksum)
    }
}

/// Resolve `request` to a verified file in `cache`, downloading it if needed.
pub fn fetch_iso(
    request: IsoRequest<'_>,
    cache: &dyn Cache,
    ui: &dyn Ui,
    cancel: &CancelToken,
) -> Result<Fetched> {
    let key = request.cache_key();
    log::debug!("ISO cache key for {}: {}", request.url, key);

    let Some(mut entry) = cache.lock(&key, cancel)? else {
        return Ok(Fetched::Cancelled);
    };

    if let Some(path) = entry.completed_path() {
        ui.message(&format!("Verifying cached ISO: {}", path.display()));
        match digest_file(&path, request.checksum_type, cancel)? {
            None => return Ok(Fetched::Cancelled),
            Some(actual) if actual == request.checksum => {
                log::info!("Cache hit for {}", request.url);
                return Ok(Fetched::Ready(path));
            }
            Some(actual) => {
                ui.error(&format!(
                    "Cached ISO is corrupt (expected {}, got {}); downloading again",
                    request.checksum, actual
                ));
                entry.invalidate()?;
            }
        }
    }

    ui.message(&format!("Downloading {}", request.url));
    let partial = entry.partial_path();
    let Some((actual, size_bytes)) = download_to(&request, &partial, ui, cancel)? else {
        return Ok(Fetched::Cancelled);
    };

    if actual != request.checksum {
        return Err(DownloadError::ChecksumMismatch {
            url: request.url.to_string(),
            kind: request.checksum_type,
            expected: request.checksum.to_string(),
            actual,
        }
        .into());
    }

    let path = entry.commit(EntryMeta {
        url: request.url.to_string(),
        checksum_type: request.checksum_type.to_string(),
        checksum: request.checksum.to_string(),
        size_bytes,
    })?;
    Ok(Fetched::Ready(path))
}

/// Events the transfer thread hands to the writer.
enum Transfer {
    Started { total: Option<u64> },
    Chunk(Vec<u8>),
    Done,
}

/// Stream `request.url` into `dest`, hashing every byte written.
///
/// The HTTP exchange runs on its own thread so that a stalled server cannot
/// block cancellation. Returns `Ok(None)` when cancelled; the abandoned
/// thread exits once its read returns or it finds the channel closed.
fn download_to(
    request: &IsoRequest<'_>,
    dest: &Path,
    ui: &dyn Ui,
    cancel: &CancelToken,
) -> Result<Option<(String, u64)>> {
    let (tx, rx) = mpsc::sync_channel(TRANSFER_QUEUE);
    let url = request.url.to_string();
    thread::Builder::new()
        .name("iso-download".to_string())
        .spawn(move || {
            if let Err(err) = transfer(&url, &tx) {
                let _ = tx.send(Err(err));
            }
        })
        .context("Failed to start download thread")?;

    let file =
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut out = BufWriter::new(file);
    let mut hasher = request.checksum_type.hasher();
    let mut total = None;
    let mut received = 0u64;
    let mut progress = Progress::new(None);

    loop {
        if cancel.is_cancelled() {
            log::info!("Download of {} cancelled after {} bytes", request.url, received);
            return Ok(None);
        }
        let event = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                bail!("Download of {} stopped without finishing", request.url)
            }
        };
        match event {
            Transfer::Started { total: length } => {
                total = length;
                progress = Progress::new(length);
            }
            Transfer::Chunk(chunk) => {
                out.write_all(&chunk)
                    .with_context(|| format!("Failed to write {}", dest.display()))?;
                hasher.update(&chunk);
                received += chunk.len() as u64;
                if let Some(line) = progress.advance(received) {
                    ui.message(&line);
                }
            }
            Transfer::Done => break,
        }
    }

    let file = out
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush {}", dest.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", dest.display()))?;

    if let Some(total) = total {
        if received != total {
            bail!(
                "Download of {} ended early: received {} of {} bytes",
                request.url,
                received,
                total
            );
        }
    }

    Ok(Some((hasher.finalize_hex(), received)))
}

/// Body of the transfer thread. Stops quietly once the receiver is gone.
fn transfer(url: &str, tx: &SyncSender<Result<Transfer>>) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None::<Duration>)
        .build()
        .context("Failed to create HTTP client")?;

    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("HTTP request for {url} failed"))?
        .error_for_status()
        .with_context(|| format!("HTTP error fetching {url}"))?;

    let started = Transfer::Started {
        total: response.content_length(),
    };
    if tx.send(Ok(started)).is_err() {
        return Ok(());
    }

    loop {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = response
            .read(&mut buf)
            .with_context(|| format!("Failed reading response body from {url}"))?;
        if n == 0 {
            let _ = tx.send(Ok(Transfer::Done));
            return Ok(());
        }
        buf.truncate(n);
        if tx.send(Ok(Transfer::Chunk(buf))).is_err() {
            log::debug!("Transfer of {url} abandoned");
            return Ok(());
        }
    }
}

/// Throttles progress lines to every 10% (or every 64 MiB without a length).
struct Progress {
    total: Option<u64>,
    next: u64,
}

impl Progress {
    fn new(total: Option<u64>) -> Self {
        let mut p = Self { total, next: 0 };
        p.next = p.step();
        p
    }

    fn step(&self) -> u64 {
        match self.total {
            Some(total) => (total / 10).max(1),
            None => UNKNOWN_LENGTH_REPORT_BYTES,
        }
    }

    fn advance(&mut self, received: u64) -> Option<String> {
        if received < self.next {
            return None;
        }
        while self.next <= received {
            self.next += self.step();
        }
        Some(match self.total {
            Some(total) => format!(
                "Download progress: {}%",
                (received.min(total) * 100) / total.max(1)
            ),
            None => format!("Downloaded {} MiB", received / (1024 * 1024)),
        })
    }
}
