//! Direct-fetch strategy: one GET through the page's session.

use async_trait::async_trait;
use tracing::{debug, instrument, warn};
use url::Url;

use super::filename::{
    extension_from_content_type, extension_from_name, extension_from_url, filename_from_url,
    parse_content_disposition, safe_filename,
};
use super::{
    DownloadContext, DownloadError, DownloadOutcome, DownloadRequest, Downloader, WriteMode,
    preferred_name, save,
};
use crate::page::{Page, PageResponse};

/// Fetches the URL with `Page::request`, reusing the session's cookies.
#[derive(Debug, Clone)]
pub struct DirectDownloader {
    ctx: DownloadContext,
}

impl DirectDownloader {
    /// Creates the strategy.
    #[must_use]
    pub fn new(ctx: DownloadContext) -> Self {
        Self { ctx }
    }

    async fn fetch(
        &self,
        page: &dyn Page,
        request: &DownloadRequest,
    ) -> Result<DownloadOutcome, DownloadError> {
        let url = &request.url;
        let response = page
            .request(url, self.ctx.timeouts.request())
            .await
            .map_err(|e| DownloadError::from_page(url.as_str(), e))?;

        if !response.is_success() {
            return Err(DownloadError::http_status(url.as_str(), response.status));
        }
        if let Some(skipped) = self.ctx.served_untrusted(url, &response.url) {
            return Ok(skipped);
        }
        // Expired sessions answer file URLs with a login page.
        if response.is_html_page() {
            return Err(DownloadError::not_a_file(url.as_str()));
        }

        let filename = response_filename(url, &response, request.preferred_title.as_deref());
        debug!(filename = %filename, status = response.status, "resolved filename");
        save(
            &self.ctx,
            request,
            &filename,
            &response.body,
            write_mode(url, response.content_type()),
        )
        .await
    }
}

#[async_trait]
impl Downloader for DirectDownloader {
    #[instrument(skip(self, page, request), fields(url = %request.url, strategy = "direct"))]
    async fn download(&self, page: &mut dyn Page, request: &DownloadRequest) -> DownloadOutcome {
        if let Some(skipped) = self.ctx.untrusted(&request.url) {
            return skipped;
        }
        match self.fetch(page, request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "direct download failed");
                e.into()
            }
        }
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Picks the output name: preferred title, then Content-Disposition, then URL.
fn response_filename(url: &Url, response: &PageResponse, title: Option<&str>) -> String {
    let disposition = response
        .header("content-disposition")
        .and_then(parse_content_disposition);

    if let Some(title) = title {
        return preferred_name(
            title,
            &[
                disposition.as_deref().and_then(extension_from_name),
                extension_from_url(url),
                response
                    .content_type()
                    .map(|ct| extension_from_content_type(ct).to_string()),
            ],
        );
    }

    match disposition {
        Some(name) => safe_filename(&name),
        None => filename_from_url(url),
    }
}

/// Text for textual content types, `.md`/`.txt` paths and `mode=raw` links.
fn write_mode(url: &Url, content_type: Option<&str>) -> WriteMode {
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    let path = url.path().to_ascii_lowercase();
    let raw = url
        .query_pairs()
        .any(|(k, v)| k == "mode" && v.eq_ignore_ascii_case("raw"));

    if content_type.contains("text")
        || content_type.contains("json")
        || path.ends_with(".md")
        || path.ends_with(".txt")
        || raw
    {
        WriteMode::Text
    } else {
        WriteMode::Binary
    }
}
