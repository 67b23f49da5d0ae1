// src/fetch.rs

//! Streaming HTTP fetches
//!
//! One trait for "GET this URL and hand me the body in arrival order",
//! implemented on a blocking reqwest client. Components receive a fetcher
//! handle instead of reaching for a shared client; the HTTP implementation
//! builds a fresh client per request so redirect policy and timeout are
//! request-scoped and nothing is shared across threads.

use crate::error::{Error, Result};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Total wall-clock budget for a single fetch.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Read buffer for body streaming (64 KiB).
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Cooperative cancellation flag, shared between a requester and the thread
/// doing the work. Cancellation is best-effort: it is observed at chunk
/// boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How many redirects a fetch may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirects {
    /// Redirects are an error.
    None,
    /// Follow at most this many.
    Limited(usize),
    /// Client default.
    Default,
}

/// One GET request.
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub headers: &'a [(&'a str, String)],
    pub redirects: Redirects,
}

impl<'a> FetchRequest<'a> {
    pub fn new(url: &'a str) -> Self {
        Self {
            url,
            headers: &[],
            redirects: Redirects::Default,
        }
    }
}

/// Streaming GET with chunk and progress callbacks.
///
/// `on_chunk` receives every body byte exactly once, in arrival order; an
/// error from it aborts the transfer. `on_progress` receives
/// `(received, total)` where `total` is unknown when the server sends no
/// content length. A fetch succeeds only if the status is 2xx and the whole
/// body arrived.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        cancel: &CancelToken,
        on_chunk: &mut dyn FnMut(&[u8]) -> Result<()>,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<()>;
}

/// Production fetcher on reqwest's blocking client.
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            timeout: HTTP_TIMEOUT,
        }
    }

    /// Override the fetch timeout. Tests use this to avoid minute-long
    /// stalls; production code sticks with [`HTTP_TIMEOUT`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_client(&self, redirects: Redirects) -> Result<reqwest::blocking::Client> {
        let policy = match redirects {
            Redirects::None => reqwest::redirect::Policy::none(),
            Redirects::Limited(n) => reqwest::redirect::Policy::limited(n),
            Redirects::Default => reqwest::redirect::Policy::default(),
        };

        reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .redirect(policy)
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {e}")))
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        cancel: &CancelToken,
        on_chunk: &mut dyn FnMut(&[u8]) -> Result<()>,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<()> {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        let client = self.build_client(request.redirects)?;

        let mut builder = client.get(request.url);
        for (name, value) in request.headers {
            builder = builder.header(*name, value);
        }

        debug!("GET {}", request.url);

        let mut response = builder.send().map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(request.url.to_string())
            } else {
                Error::DownloadError(format!("Failed to fetch {}: {e}", request.url))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {status} from {}",
                request.url
            )));
        }

        let total = response.content_length();
        let mut received: u64 = 0;
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];

        loop {
            if cancel.is_canceled() {
                info!("Aborting download of {}", request.url);
                return Err(Error::Canceled);
            }

            let n = response.read(&mut buffer).map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut {
                    Error::Timeout(request.url.to_string())
                } else {
                    Error::DownloadError(format!("Failed to read response body: {e}"))
                }
            })?;

            if n == 0 {
                break;
            }

            on_chunk(&buffer[..n])?;
            received += n as u64;
            on_progress(received, total);
        }

        Ok(())
    }
}

/// Fetch a URL into memory. Used for the manifest and signature, which are
/// small and get persisted by the caller.
pub fn fetch_to_vec(
    fetcher: &dyn Fetcher,
    request: &FetchRequest<'_>,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    fetcher.fetch(
        request,
        cancel,
        &mut |chunk| {
            body.extend_from_slice(chunk);
            Ok(())
        },
        &mut |_, _| {},
    )?;
    Ok(body)
}
