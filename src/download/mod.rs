//! Downloader strategies and the pieces they share.
//!
//! A [`Downloader`] turns one attachment URL into a file on disk through the
//! page session. Three strategies implement the same contract:
//!
//! - [`DirectDownloader`]: GET through the session (`Page::request`)
//! - [`ClickDownloader`]: locate a download element and activate it
//! - [`AutoDownloader`]: one, then the other, falling back only on failure
//!
//! Strategies never return errors. Everything is logged and mapped into a
//! [`DownloadOutcome`].

mod auto;
mod click;
pub mod constants;
mod direct;
mod error;
pub mod filename;
mod outcome;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{FallbackOrder, StrategyKind, Timeouts};
use crate::filter::HostAllowList;
use crate::page::Page;

pub use auto::AutoDownloader;
pub use click::ClickDownloader;
pub use direct::DirectDownloader;
pub use error::DownloadError;
pub use filename::{Allocation, FilenameArbiter, safe_filename};
pub use outcome::{DownloadOutcome, FailureKind, SavedFile, SkipReason};

// Note: no module-local Result alias. Use `Result<T, DownloadError>`.

/// One attachment to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Attachment URL.
    pub url: Url,
    /// Directory the file lands in. Created on demand.
    pub target_dir: PathBuf,
    /// Name to prefer over server-provided names (link text on Moodle).
    pub preferred_title: Option<String>,
}

impl DownloadRequest {
    /// Creates a request without a preferred title.
    #[must_use]
    pub fn new(url: Url, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            url,
            target_dir: target_dir.into(),
            preferred_title: None,
        }
    }

    /// Sets the preferred title. Blank titles are ignored.
    #[must_use]
    pub fn with_preferred_title(mut self, title: Option<String>) -> Self {
        self.preferred_title = title.filter(|t| !t.trim().is_empty());
        self
    }
}

/// State shared by every strategy of one run.
#[derive(Debug, Clone)]
pub struct DownloadContext {
    /// Hosts a strategy may contact.
    pub hosts: HostAllowList,
    /// The run's single filename owner.
    pub arbiter: Arc<FilenameArbiter>,
    /// Bounds on navigation, requests and clicks.
    pub timeouts: Timeouts,
}

impl DownloadContext {
    /// Creates a context.
    #[must_use]
    pub fn new(hosts: HostAllowList, arbiter: Arc<FilenameArbiter>, timeouts: Timeouts) -> Self {
        Self {
            hosts,
            arbiter,
            timeouts,
        }
    }

    /// Host check every strategy runs before touching the network.
    pub(crate) fn untrusted(&self, url: &Url) -> Option<DownloadOutcome> {
        if self.hosts.is_allowed(url) {
            return None;
        }
        debug!(url = %url, "host not on allow-list, skipping");
        Some(DownloadOutcome::Skipped(SkipReason::UntrustedHost))
    }

    /// Host check on the URL a body was actually served from.
    pub(crate) fn served_untrusted(&self, requested: &Url, served: &Url) -> Option<DownloadOutcome> {
        if self.hosts.is_allowed(served) {
            return None;
        }
        warn!(url = %requested, served = %served, "served from a host not on allow-list, discarding");
        Some(DownloadOutcome::Skipped(SkipReason::UntrustedHost))
    }
}

/// Contract shared by all download strategies.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetches `request.url` into `request.target_dir`.
    async fn download(&self, page: &mut dyn Page, request: &DownloadRequest) -> DownloadOutcome;

    /// Short name for log fields.
    fn name(&self) -> &'static str;
}

/// Builds the downloader for a strategy selection.
#[must_use]
pub fn create_downloader(
    kind: StrategyKind,
    order: FallbackOrder,
    ctx: DownloadContext,
) -> Box<dyn Downloader> {
    match kind {
        StrategyKind::RequestOnly => Box::new(DirectDownloader::new(ctx)),
        StrategyKind::ClickOnly => Box::new(ClickDownloader::new(ctx)),
        StrategyKind::Auto => Box::new(AutoDownloader::new(ctx, order)),
    }
}

/// How fetched bytes are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// UTF-8 text; invalid sequences are replaced.
    Text,
    /// Bytes as received.
    Binary,
}

/// Allocates a name through the arbiter and writes `body` there.
pub(crate) async fn save(
    ctx: &DownloadContext,
    request: &DownloadRequest,
    filename: &str,
    body: &[u8],
    mode: WriteMode,
) -> Result<DownloadOutcome, DownloadError> {
    let dir = &request.target_dir;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::io(dir.clone(), e))?;

    let allocation = ctx.arbiter.allocate(dir, filename, request.url.as_str());
    let (path, replaced) = match allocation {
        Allocation::Fresh(path) => (path, false),
        Allocation::Overwrite(path) => (path, true),
        Allocation::Skip(reason) => {
            info!(url = %request.url, filename, reason = %reason, "skipped");
            return Ok(DownloadOutcome::Skipped(reason));
        }
    };

    if let Err(e) = write_body(&path, body, mode).await {
        // Nothing landed under the name, so another mechanism may claim it.
        if !replaced {
            ctx.arbiter.release(&path, request.url.as_str());
        }
        return Err(e);
    }

    let filename = path
        .file_name()
        .map_or_else(|| filename.to_string(), |n| n.to_string_lossy().into_owned());
    info!(
        url = %request.url,
        path = %path.display(),
        bytes = body.len(),
        replaced,
        "saved"
    );
    Ok(DownloadOutcome::Saved(SavedFile {
        filename,
        path,
        replaced,
    }))
}

async fn write_body(path: &Path, body: &[u8], mode: WriteMode) -> Result<(), DownloadError> {
    let result = match mode {
        WriteMode::Text => tokio::fs::write(path, String::from_utf8_lossy(body).as_bytes()).await,
        WriteMode::Binary => tokio::fs::write(path, body).await,
    };
    result.map_err(|e| DownloadError::io(path, e))
}

/// Name under a preferred title, taking the extension from the first source
/// that has one.
pub(crate) fn preferred_name(title: &str, sources: &[Option<String>]) -> String {
    let ext = sources.iter().flatten().next().map(String::as_str);
    filename::titled_filename(title, ext)
}
