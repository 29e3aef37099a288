//! Platform collectors: the site-specific DOM heuristics.
//!
//! A [`PlatformCollector`] knows where a platform lists its item pages, which
//! links on an item page are attachment candidates, and how its login page
//! looks. Candidates are returned unfiltered; the resource filter decides.

mod dom;
mod moodle;
mod roeselite;

use std::collections::HashSet;

use async_trait::async_trait;
use url::Url;

use crate::config::{ConfigError, HarvestConfig, Layout, Platform};
use crate::filter::FilterProfile;
use crate::page::{Page, PageError, resolve_href};

pub use moodle::MoodleCollector;
pub use roeselite::RoeseliteCollector;

/// Section label used when no section can be determined.
pub const UNSORTED_SECTION: &str = "Unsorted";

/// A link to an item page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLink {
    /// Item page URL.
    pub url: Url,
    /// Filesystem-safe section label, when the platform groups by section.
    pub section: Option<String>,
    /// Link text.
    pub title: Option<String>,
}

impl ResourceLink {
    /// Creates a link without section or title.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            section: None,
            title: None,
        }
    }
}

/// Site-specific discovery used by the traversal driver.
#[async_trait]
pub trait PlatformCollector: Send + Sync {
    /// Item pages linked from the start page, in document order, deduplicated.
    async fn collect_item_pages(&self, page: &dyn Page) -> Result<Vec<ResourceLink>, PageError>;

    /// Attachment candidates on the current item page.
    async fn collect_attachments(&self, page: &dyn Page) -> Result<Vec<String>, PageError>;

    /// Whether the page currently shows a login form or an SSO provider.
    async fn is_login_page(&self, page: &dyn Page) -> bool;

    /// Filter rules specific to this platform.
    fn filter_profile(&self) -> FilterProfile;

    /// Output layout for this platform.
    fn layout(&self) -> Layout;
}

/// Builds the collector for `config.platform`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the base URL or item pattern is invalid.
pub fn collector_for(config: &HarvestConfig) -> Result<Box<dyn PlatformCollector>, ConfigError> {
    Ok(match config.platform {
        Platform::Moodle => Box::new(MoodleCollector::from_config(config)?),
        Platform::Roeselite => Box::new(RoeseliteCollector::from_config(config)?),
    })
}

/// Resolves `hrefs` against `base`, dropping fragments and duplicates.
fn resolve_unique<I, S>(base: &Url, hrefs: I) -> Vec<Url>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    hrefs
        .into_iter()
        .filter_map(|href| resolve_href(base, href.as_ref()))
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .filter(|url| seen.insert(url.as_str().to_string()))
        .collect()
}

/// URL the page is on, or `fallback` before the first navigation.
fn page_base(page: &dyn Page, fallback: &Url) -> Url {
    page.current_url().unwrap_or_else(|| fallback.clone())
}

/// Whether `url` points at the configured login path.
fn on_login_path(url: &Url, login_path: &str) -> bool {
    !login_path.is_empty() && url.path().starts_with(login_path)
}
