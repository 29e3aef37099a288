//! Auto strategy: direct and click in a configurable order.

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{
    ClickDownloader, DirectDownloader, DownloadContext, DownloadOutcome, DownloadRequest,
    Downloader,
};
use crate::config::FallbackOrder;
use crate::page::Page;

/// Runs one strategy and falls back to the other when it fails.
///
/// Only `Failed` triggers the fallback. A `Skipped` outcome (untrusted host,
/// existing file) is final.
#[derive(Debug, Clone)]
pub struct AutoDownloader {
    direct: DirectDownloader,
    click: ClickDownloader,
    order: FallbackOrder,
}

impl AutoDownloader {
    /// Creates the composite.
    #[must_use]
    pub fn new(ctx: DownloadContext, order: FallbackOrder) -> Self {
        Self {
            direct: DirectDownloader::new(ctx.clone()),
            click: ClickDownloader::new(ctx),
            order,
        }
    }

    fn ordered(&self) -> [&dyn Downloader; 2] {
        match self.order {
            FallbackOrder::RequestFirst => [&self.direct, &self.click],
            FallbackOrder::ClickFirst => [&self.click, &self.direct],
        }
    }
}

#[async_trait]
impl Downloader for AutoDownloader {
    #[instrument(skip(self, page, request), fields(url = %request.url, strategy = "auto"))]
    async fn download(&self, page: &mut dyn Page, request: &DownloadRequest) -> DownloadOutcome {
        let [first, second] = self.ordered();
        match first.download(page, request).await {
            DownloadOutcome::Failed(kind) => {
                info!(failed = %kind, from = first.name(), to = second.name(), "falling back");
                second.download(page, request).await
            }
            outcome => outcome,
        }
    }

    fn name(&self) -> &'static str {
        "auto"
    }
}
