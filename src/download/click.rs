//! Simulated-click strategy: find a download element and activate it.

use async_trait::async_trait;
use tracing::{debug, instrument, warn};
use url::Url;

use super::filename::{extension_from_name, extension_from_url, filename_from_url, safe_filename};
use super::{
    DownloadContext, DownloadError, DownloadOutcome, DownloadRequest, Downloader, WriteMode,
    preferred_name, save,
};
use crate::filter::HostAllowList;
use crate::page::{Element, FileTransfer, Page, WaitUntil, resolve_href};

/// Elements that trigger a file transfer on a resource page.
pub(crate) const DOWNLOAD_MARKERS: &str =
    r#"a[href*="pluginfile"], a[href*="forcedownload"], a[download]"#;

/// Clicks a link to the resource, or a download marker on the resource page.
#[derive(Debug, Clone)]
pub struct ClickDownloader {
    ctx: DownloadContext,
}

impl ClickDownloader {
    /// Creates the strategy.
    #[must_use]
    pub fn new(ctx: DownloadContext) -> Self {
        Self { ctx }
    }

    async fn locate(
        &self,
        page: &mut dyn Page,
        request: &DownloadRequest,
    ) -> Result<Element, DownloadError> {
        let url = &request.url;
        let timeouts = &self.ctx.timeouts;

        if let Err(e) = page.wait_for_load(WaitUntil::NetworkIdle, timeouts.settle()).await {
            debug!(error = %e, "page did not settle, continuing");
        }

        let on_page = link_selector(url.path());
        match page.query_all(&on_page).await {
            Ok(links) => {
                let base = page.current_url();
                let picked = pick_trusted(&self.ctx.hosts, base.as_ref(), links, Some(url));
                if let Some(element) = picked {
                    return Ok(element);
                }
                debug!(selector = %on_page, "no trusted matching link on current page");
            }
            Err(e) => debug!(selector = %on_page, error = %e, "link lookup failed"),
        }

        page.goto(url, WaitUntil::NetworkIdle, timeouts.navigation())
            .await
            .map_err(|e| DownloadError::from_page(url.as_str(), e))?;

        let markers = page
            .query_all(DOWNLOAD_MARKERS)
            .await
            .map_err(|e| DownloadError::from_page(url.as_str(), e))?;
        let base = page.current_url();
        pick_trusted(&self.ctx.hosts, base.as_ref(), markers, None)
            .ok_or_else(|| DownloadError::no_download_mechanism(url.as_str()))
    }

    async fn fetch(
        &self,
        page: &mut dyn Page,
        request: &DownloadRequest,
    ) -> Result<DownloadOutcome, DownloadError> {
        let url = &request.url;
        let element = self.locate(page, request).await?;
        debug!(selector = %element.selector, "activating download element");

        let transfer = page
            .click_for_download(&element, self.ctx.timeouts.click())
            .await
            .map_err(|e| DownloadError::from_page(url.as_str(), e))?;
        if let Some(skipped) = self.ctx.served_untrusted(url, &transfer.url) {
            return Ok(skipped);
        }

        let filename = transfer_filename(&transfer, request.preferred_title.as_deref());
        save(&self.ctx, request, &filename, &transfer.body, WriteMode::Binary).await
    }
}

#[async_trait]
impl Downloader for ClickDownloader {
    #[instrument(skip(self, page, request), fields(url = %request.url, strategy = "click"))]
    async fn download(&self, page: &mut dyn Page, request: &DownloadRequest) -> DownloadOutcome {
        if let Some(skipped) = self.ctx.untrusted(&request.url) {
            return skipped;
        }
        match self.fetch(page, request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "click download failed");
                e.into()
            }
        }
    }

    fn name(&self) -> &'static str {
        "click"
    }
}

fn link_selector(path: &str) -> String {
    let escaped = path.replace('\\', "\\\\").replace('"', "\\\"");
    format!(r#"a[href*="{escaped}"]"#)
}

/// First element whose link resolves to a trusted host, an exact match on
/// `target` winning over document order.
fn pick_trusted(
    hosts: &HostAllowList,
    base: Option<&Url>,
    elements: Vec<Element>,
    target: Option<&Url>,
) -> Option<Element> {
    let base = base?;
    let mut trusted: Vec<(Url, Element)> = elements
        .into_iter()
        .filter_map(|element| {
            let resolved = element.href().and_then(|href| resolve_href(base, href))?;
            if hosts.is_allowed(&resolved) {
                Some((resolved, element))
            } else {
                debug!(href = %resolved, "ignoring link to untrusted host");
                None
            }
        })
        .collect();
    let index = target
        .and_then(|target| trusted.iter().position(|(resolved, _)| resolved == target))
        .unwrap_or(0);
    if index < trusted.len() {
        Some(trusted.swap_remove(index).1)
    } else {
        None
    }
}

fn transfer_filename(transfer: &FileTransfer, title: Option<&str>) -> String {
    if let Some(title) = title {
        return preferred_name(
            title,
            &[
                transfer
                    .suggested_filename
                    .as_deref()
                    .and_then(extension_from_name),
                extension_from_url(&transfer.url),
            ],
        );
    }
    match transfer.suggested_filename.as_deref() {
        Some(name) if !name.trim().is_empty() => safe_filename(name),
        _ => filename_from_url(&transfer.url),
    }
}
