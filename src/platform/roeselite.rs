//! Roeselite: an assignment list linking to one page per assignment.

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument};
use url::Url;

use super::{PlatformCollector, ResourceLink, on_login_path, page_base, resolve_unique};
use crate::config::{ConfigError, HarvestConfig, Layout};
use crate::filter::FilterProfile;
use crate::page::{Page, PageError};

/// Collector for Roeselite assignment pages.
#[derive(Debug, Clone)]
pub struct RoeseliteCollector {
    base: Url,
    login_path: String,
    item_paths: Regex,
}

impl RoeseliteCollector {
    /// Creates the collector from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the base URL or item pattern is invalid.
    pub fn from_config(config: &HarvestConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            base: config.base()?,
            login_path: config.login.path.clone(),
            item_paths: config.item_path_regex()?,
        })
    }

    fn is_item(&self, url: &Url) -> bool {
        url.host_str() == self.base.host_str() && self.item_paths.is_match(url.path())
    }

    async fn hrefs(&self, page: &dyn Page) -> Result<Vec<String>, PageError> {
        Ok(page
            .query_all("a[href]")
            .await?
            .into_iter()
            .filter_map(|el| el.href().map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl PlatformCollector for RoeseliteCollector {
    #[instrument(level = "debug", skip(self, page))]
    async fn collect_item_pages(&self, page: &dyn Page) -> Result<Vec<ResourceLink>, PageError> {
        let base = page_base(page, &self.base);
        let links: Vec<ResourceLink> = resolve_unique(&base, self.hrefs(page).await?)
            .into_iter()
            .filter(|url| self.is_item(url))
            .map(ResourceLink::new)
            .collect();
        debug!(count = links.len(), "item pages");
        Ok(links)
    }

    #[instrument(level = "debug", skip(self, page))]
    async fn collect_attachments(&self, page: &dyn Page) -> Result<Vec<String>, PageError> {
        let base = page_base(page, &self.base);
        Ok(resolve_unique(&base, self.hrefs(page).await?)
            .into_iter()
            .map(String::from)
            .collect())
    }

    async fn is_login_page(&self, page: &dyn Page) -> bool {
        page.current_url()
            .is_some_and(|url| on_login_path(&url, &self.login_path))
    }

    fn filter_profile(&self) -> FilterProfile {
        FilterProfile::roeselite()
    }

    fn layout(&self) -> Layout {
        Layout::PerPage
    }
}
