//! The page traversal driver.
//!
//! `Start -> LoggedIn -> [per item page: navigate, collect, filter, download] -> Done`.
//!
//! Only login and the start page can abort a run. Item pages that fail to
//! load are skipped and counted, and attachment failures never abort a page.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::{AuthError, LoginCapability};
use crate::config::{ConfigError, HarvestConfig, Layout};
use crate::download::{
    DownloadContext, DownloadOutcome, DownloadRequest, Downloader, FilenameArbiter,
    create_downloader, safe_filename,
};
use crate::filter::ResourceFilter;
use crate::page::{Page, PageError, WaitUntil};
use crate::platform::{PlatformCollector, ResourceLink, UNSORTED_SECTION};

/// Name of the per-page URL marker file.
pub const URL_MARKER_FILE: &str = "url.txt";

/// Per-page subdirectory holding attachments.
pub const ATTACHMENTS_DIR: &str = "attachments";

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Still on the login page after every allowed attempt.
    #[error("authentication failed after {attempts} attempt(s)")]
    Authentication {
        /// Login attempts made.
        attempts: u32,
        /// Error of the last attempt, if it raised one.
        #[source]
        last_error: Option<AuthError>,
    },

    /// The start page could not be loaded or read.
    #[error("start page {url} unavailable: {source}")]
    StartPage {
        /// Start page URL.
        url: String,
        /// Underlying page error.
        #[source]
        source: PageError,
    },

    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The output root could not be created.
    #[error("cannot prepare output directory {path}: {source}")]
    Io {
        /// Directory path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl HarvestError {
    fn start_page(url: &Url, source: PageError) -> Self {
        Self::StartPage {
            url: url.to_string(),
            source,
        }
    }
}

/// Shared cancellation switch, checked between item pages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Totals of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Item pages that loaded.
    pub pages_visited: usize,
    /// Item pages that failed to load.
    pub pages_failed: usize,
    /// Files written.
    pub files_saved: usize,
    /// Attachments deliberately not written.
    pub files_skipped: usize,
    /// Attachments that failed.
    pub files_failed: usize,
    /// The run stopped early on request.
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Saved(_) => self.files_saved += 1,
            DownloadOutcome::Skipped(_) => self.files_skipped += 1,
            DownloadOutcome::Failed(_) => self.files_failed += 1,
        }
    }

    /// Whether anything failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.pages_failed > 0 || self.files_failed > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} page(s) visited, {} failed; {} file(s) saved, {} skipped, {} failed",
            self.pages_visited,
            self.pages_failed,
            self.files_saved,
            self.files_skipped,
            self.files_failed
        )?;
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

/// Drives one harvesting run over a page session.
pub struct Harvester {
    start_url: Url,
    output_dir: PathBuf,
    layout: Layout,
    write_url_marker: bool,
    max_login_attempts: u32,
    navigation_timeout: Duration,
    collector: Box<dyn PlatformCollector>,
    filter: ResourceFilter,
    downloader: Box<dyn Downloader>,
    login: Option<Box<dyn LoginCapability>>,
    cancel: CancelFlag,
}

impl fmt::Debug for Harvester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harvester")
            .field("start_url", &self.start_url.as_str())
            .field("output_dir", &self.output_dir)
            .field("layout", &self.layout)
            .field("downloader", &self.downloader.name())
            .field("login", &self.login.is_some())
            .finish_non_exhaustive()
    }
}

impl Harvester {
    /// Builds the driver from a validated configuration.
    ///
    /// The layout comes from the configuration; the filter profile from the
    /// collector.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] if the start URL is invalid.
    pub fn new(
        config: &HarvestConfig,
        collector: Box<dyn PlatformCollector>,
    ) -> Result<Self, HarvestError> {
        let policy = config.policy.clone();
        let hosts = config.host_allow_list();
        let arbiter = Arc::new(FilenameArbiter::new(policy.replace_existing));
        let ctx = DownloadContext::new(hosts.clone(), arbiter, config.timeouts.clone());
        let downloader = create_downloader(policy.strategy, policy.fallback_order, ctx);
        let filter = ResourceFilter::new(policy.clone(), hosts, collector.filter_profile());
        if config.layout != collector.layout() {
            debug!(layout = ?config.layout, "configured layout overrides platform default");
        }

        Ok(Self {
            start_url: config.start_url()?,
            output_dir: config.output_dir.clone(),
            layout: config.layout,
            write_url_marker: policy.write_url_marker,
            max_login_attempts: config.login.max_attempts.max(1),
            navigation_timeout: config.timeouts.navigation(),
            collector,
            filter,
            downloader,
            login: None,
            cancel: CancelFlag::new(),
        })
    }

    /// Sets how the driver logs in when the start page asks for it.
    #[must_use]
    pub fn with_login(mut self, login: Box<dyn LoginCapability>) -> Self {
        self.login = Some(login);
        self
    }

    /// Replaces the download strategy.
    #[must_use]
    pub fn with_downloader(mut self, downloader: Box<dyn Downloader>) -> Self {
        self.downloader = downloader;
        self
    }

    /// Shares a cancellation flag with the caller.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs to completion. The page is closed exactly once, on every path.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] if login fails, the start page is unavailable
    /// or the output root cannot be created.
    #[instrument(skip(self, page), fields(start = %self.start_url))]
    pub async fn run(&self, page: &mut dyn Page) -> Result<RunSummary, HarvestError> {
        let result = self.run_inner(page).await;
        if let Err(e) = page.close().await {
            warn!(error = %e, "closing the page failed");
        }
        match &result {
            Ok(summary) => info!(%summary, "run finished"),
            Err(e) => warn!(error = %e, "run aborted"),
        }
        result
    }

    async fn run_inner(&self, page: &mut dyn Page) -> Result<RunSummary, HarvestError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| HarvestError::Io {
                path: self.output_dir.clone(),
                source,
            })?;

        self.ensure_logged_in(page).await?;

        let items = self
            .collector
            .collect_item_pages(page)
            .await
            .map_err(|e| HarvestError::start_page(&self.start_url, e))?;
        info!(count = items.len(), "item pages found");

        let mut summary = RunSummary::default();
        let total = items.len();
        for (idx, item) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = total - idx, "cancelled, stopping before next page");
                summary.cancelled = true;
                break;
            }
            info!(page = idx + 1, total, url = %item.url, title = ?item.title, "visiting");
            self.visit(page, idx + 1, item, &mut summary).await;
        }
        Ok(summary)
    }

    async fn open_start(&self, page: &mut dyn Page) -> Result<(), HarvestError> {
        page.goto(&self.start_url, WaitUntil::NetworkIdle, self.navigation_timeout)
            .await
            .map(|_| ())
            .map_err(|e| HarvestError::start_page(&self.start_url, e))
    }

    async fn ensure_logged_in(&self, page: &mut dyn Page) -> Result<(), HarvestError> {
        let mut attempts = 0;
        let mut last_error = None;
        loop {
            self.open_start(page).await?;
            if !self.collector.is_login_page(page).await {
                if attempts > 0 {
                    info!(attempts, "logged in");
                }
                return Ok(());
            }

            let Some(login) = &self.login else {
                warn!("start page requires login but no credentials are configured");
                return Err(HarvestError::Authentication {
                    attempts,
                    last_error,
                });
            };
            if attempts >= self.max_login_attempts {
                return Err(HarvestError::Authentication {
                    attempts,
                    last_error,
                });
            }

            attempts += 1;
            info!(attempt = attempts, max = self.max_login_attempts, "login required");
            match login.login(page).await {
                Ok(()) => last_error = None,
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "login attempt failed");
                    last_error = Some(e);
                }
            }
        }
    }

    async fn visit(
        &self,
        page: &mut dyn Page,
        position: usize,
        item: &ResourceLink,
        summary: &mut RunSummary,
    ) {
        if let Err(e) = page
            .goto(&item.url, WaitUntil::NetworkIdle, self.navigation_timeout)
            .await
        {
            warn!(url = %item.url, error = %e, "item page failed to load, skipping");
            summary.pages_failed += 1;
            return;
        }
        summary.pages_visited += 1;

        let target_dir = match self.target_dir(page, position, item).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(url = %item.url, error = %e, "cannot prepare page directory, skipping");
                summary.pages_failed += 1;
                return;
            }
        };

        let candidates = match self.collector.collect_attachments(page).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(url = %item.url, error = %e, "attachment collection failed");
                Vec::new()
            }
        };
        let urls = self.filter.filter(&candidates);
        debug!(candidates = candidates.len(), selected = urls.len(), "filtered attachments");

        // A single attachment takes the link text as its name.
        let preferred_title = match (self.layout, urls.len()) {
            (Layout::PerSection, 1) => item.title.clone(),
            _ => None,
        };

        let mut saved = 0;
        for url in urls {
            let request = DownloadRequest::new(url, target_dir.clone())
                .with_preferred_title(preferred_title.clone());
            let outcome = self.downloader.download(page, &request).await;
            saved += usize::from(outcome.is_saved());
            summary.record(&outcome);
        }
        if saved > 0 {
            info!(saved, dir = %target_dir.display(), "attachments saved");
        }
    }

    async fn target_dir(
        &self,
        page: &dyn Page,
        position: usize,
        item: &ResourceLink,
    ) -> std::io::Result<PathBuf> {
        match self.layout {
            Layout::PerSection => Ok(self.output_dir.join(section_dir(item))),
            Layout::PerPage => {
                let title = page.title().await.unwrap_or_default();
                let folder = self
                    .output_dir
                    .join(page_dir_name(position, &title, &item.url));
                tokio::fs::create_dir_all(&folder).await?;
                if self.write_url_marker {
                    write_url_marker(&folder, &item.url).await?;
                }
                Ok(folder.join(ATTACHMENTS_DIR))
            }
        }
    }
}

fn section_dir(item: &ResourceLink) -> String {
    item.section
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map_or_else(|| UNSORTED_SECTION.to_string(), safe_filename)
}

/// `NNN_<safe title>`, falling back to the URL when the page has no title.
fn page_dir_name(position: usize, title: &str, url: &Url) -> String {
    let label = if title.trim().is_empty() {
        url.as_str()
    } else {
        title
    };
    format!("{position:03}_{}", safe_filename(label))
}

async fn write_url_marker(folder: &Path, url: &Url) -> std::io::Result<()> {
    tokio::fs::write(folder.join(URL_MARKER_FILE), format!("{url}\n")).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::{FailureKind, SavedFile, SkipReason};

    #[test]
    fn test_page_dir_name_uses_title_or_url() {
        let url = Url::parse("https://se.cs.ovgu.de/assignment/view/7").unwrap();
        assert_eq!(page_dir_name(7, "Blatt 2: Graphs", &url), "007_Blatt_2_Graphs");
        assert_eq!(
            page_dir_name(12, "  ", &url),
            "012_https_se.cs.ovgu.de_assignment_view_7"
        );
    }

    #[test]
    fn test_section_dir_defaults_to_unsorted() {
        let url = Url::parse("https://elearning.ovgu.de/mod/resource/view.php?id=1").unwrap();
        let mut item = ResourceLink::new(url);
        assert_eq!(section_dir(&item), "Unsorted");
        item.section = Some("Week 1".to_string());
        assert_eq!(section_dir(&item), "Week_1");
    }

    #[test]
    fn test_summary_records_outcomes() {
        let mut summary = RunSummary::default();
        summary.record(&DownloadOutcome::Saved(SavedFile {
            filename: "a.pdf".into(),
            path: PathBuf::from("a.pdf"),
            replaced: false,
        }));
        summary.record(&DownloadOutcome::Skipped(SkipReason::AlreadyExists));
        summary.record(&DownloadOutcome::Failed(FailureKind::Timeout));
        assert_eq!(
            (summary.files_saved, summary.files_skipped, summary.files_failed),
            (1, 1, 1)
        );
        assert!(summary.has_failures());
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            pages_visited: 2,
            files_saved: 3,
            cancelled: true,
            ..RunSummary::default()
        };
        assert_eq!(
            summary.to_string(),
            "2 page(s) visited, 0 failed; 3 file(s) saved, 0 skipped, 0 failed (cancelled)"
        );
    }
}
