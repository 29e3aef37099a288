//! Moodle: course pages list resource modules grouped into sections.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    PlatformCollector, ResourceLink, UNSORTED_SECTION, dom, on_login_path, page_base,
    resolve_unique,
};
use crate::config::{ConfigError, HarvestConfig, Layout};
use crate::download::safe_filename;
use crate::filter::FilterProfile;
use crate::page::{Element, Page, PageError};

/// Marker of Moodle's file-serving endpoint.
const PLUGINFILE: &str = "pluginfile.php";
const FORCE_DOWNLOAD: &str = "forcedownload=1";

/// Elements Moodle themes use for "download this file" links.
const DOWNLOAD_SELECTORS: [&str; 5] = [
    "a.resourceworkaround",
    "a.download",
    r#"a[class*="download"]"#,
    r#"a[title*="Download"]"#,
    r#"a[title*="download"]"#,
];

/// URL fragments of identity providers met during SSO login.
const SSO_INDICATORS: [&str; 6] = ["saml2", "sso", "idp", "shibboleth", "oauth", "saml"];

/// Finds the link's section container and returns its heading text.
const SECTION_SCRIPT: &str = r#"(link) => {
    const container = link.closest('li[id^="section-"]') || link.closest('section') ||
        link.closest('[data-sectionid]') || link.closest('.section') ||
        link.closest('[class*="section"]');
    if (!container) return null;
    const heading = container.querySelector('.sectionname') ||
        container.querySelector('h3.sectionname') ||
        container.querySelector('[data-for="section_title"]') ||
        container.querySelector('h3') || container.querySelector('.section-title') ||
        container.querySelector('[class*="sectionname"]');
    const text = heading ? (heading.innerText || heading.textContent) : container.innerText;
    if (!text) return null;
    const line = text.split('\n').map(l => l.trim()).find(l => l);
    return line || null;
}"#;

#[allow(clippy::expect_used)]
static META_REFRESH_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\s*=\s*['"]?([^\s;'"]+)"#).expect("meta refresh regex is valid")
});

/// Collector for Moodle course pages.
#[derive(Debug, Clone)]
pub struct MoodleCollector {
    base: Url,
    login_path: String,
    item_paths: Regex,
}

impl MoodleCollector {
    /// Creates the collector from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the base URL is invalid or no module
    /// pattern is configured.
    pub fn from_config(config: &HarvestConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            base: config.base()?,
            login_path: config.login.path.clone(),
            item_paths: config.item_path_regex()?,
        })
    }

    fn is_resource(&self, url: &Url) -> bool {
        self.item_paths.is_match(url.path())
    }

    /// Section label per link, with `links[i].index` indexing `a[href]`.
    async fn sections(&self, page: &dyn Page, links: &[Element]) -> Vec<Option<String>> {
        let mut labels = Vec::with_capacity(links.len());
        for link in links {
            match page.evaluate(SECTION_SCRIPT, Some(link)).await {
                Ok(value) => labels.push(
                    value
                        .as_str()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(safe_filename),
                ),
                Err(PageError::Unsupported { .. }) => {
                    return self.sections_from_markup(page, links).await;
                }
                Err(e) => {
                    warn!(href = ?link.href(), error = %e, "could not determine section");
                    labels.push(None);
                }
            }
        }
        labels
    }

    async fn sections_from_markup(&self, page: &dyn Page, links: &[Element]) -> Vec<Option<String>> {
        let by_index = match page.content().await {
            Ok(html) => dom::link_sections(&html),
            Err(e) => {
                warn!(error = %e, "could not read page markup for sections");
                Vec::new()
            }
        };
        links
            .iter()
            .map(|link| by_index.get(link.index).cloned().flatten())
            .collect()
    }

    async fn hrefs(&self, page: &dyn Page, selector: &str, attr: &str) -> Vec<String> {
        match page.query_all(selector).await {
            Ok(elements) => elements
                .iter()
                .filter_map(|el| el.attr(attr).map(str::to_string))
                .collect(),
            Err(e) => {
                debug!(selector, error = %e, "selector lookup failed");
                Vec::new()
            }
        }
    }
}

fn is_native(candidate: &str) -> bool {
    candidate.contains(PLUGINFILE) || candidate.contains(FORCE_DOWNLOAD)
}

fn meta_refresh_target(content: &str) -> Option<String> {
    META_REFRESH_URL
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[async_trait]
impl PlatformCollector for MoodleCollector {
    #[instrument(level = "debug", skip(self, page))]
    async fn collect_item_pages(&self, page: &dyn Page) -> Result<Vec<ResourceLink>, PageError> {
        let base = page_base(page, &self.base);
        let anchors = page.query_all("a[href]").await?;

        let mut seen = std::collections::HashSet::new();
        let mut picked: Vec<(Url, Element)> = Vec::new();
        for anchor in anchors {
            let Some(href) = anchor.href() else { continue };
            let Some(url) = resolve_unique(&base, [href]).into_iter().next() else {
                continue;
            };
            if self.is_resource(&url) && seen.insert(url.to_string()) {
                picked.push((url, anchor));
            }
        }

        let elements: Vec<Element> = picked.iter().map(|(_, el)| el.clone()).collect();
        let sections = self.sections(page, &elements).await;

        Ok(picked
            .into_iter()
            .zip(sections)
            .map(|((url, anchor), section)| ResourceLink {
                url,
                section: Some(section.unwrap_or_else(|| UNSORTED_SECTION.to_string())),
                title: Some(anchor.text.trim().to_string()).filter(|t| !t.is_empty()),
            })
            .collect())
    }

    #[instrument(level = "debug", skip(self, page))]
    async fn collect_attachments(&self, page: &dyn Page) -> Result<Vec<String>, PageError> {
        let current = page.current_url().ok_or(PageError::NotLoaded)?;
        let mut raw: Vec<String> = Vec::new();

        raw.extend(self.hrefs(page, r#"a[href*="pluginfile.php"]"#, "href").await);
        raw.extend(self.hrefs(page, r#"a[href*="forcedownload=1"]"#, "href").await);

        // "Force download" resources redirect navigation onto the file itself.
        if current.as_str().contains(PLUGINFILE) {
            raw.push(current.to_string());
        }

        for selector in DOWNLOAD_SELECTORS {
            raw.extend(
                self.hrefs(page, selector, "href")
                    .await
                    .into_iter()
                    .filter(|href| is_native(href)),
            );
        }
        raw.extend(
            self.hrefs(page, "iframe[src]", "src")
                .await
                .into_iter()
                .filter(|src| is_native(src)),
        );

        if let Ok(Some(meta)) = page.query(r#"meta[http-equiv="refresh"]"#).await
            && let Some(target) = meta.attr("content").and_then(meta_refresh_target)
            && target.contains(PLUGINFILE)
        {
            raw.push(target);
        }

        let found: Vec<String> = resolve_unique(&current, raw)
            .into_iter()
            .map(String::from)
            .collect();
        debug!(count = found.len(), "attachment candidates");
        Ok(found)
    }

    async fn is_login_page(&self, page: &dyn Page) -> bool {
        let Some(url) = page.current_url() else {
            return false;
        };
        if on_login_path(&url, &self.login_path) {
            return true;
        }
        let foreign = url.host_str() != self.base.host_str();
        let lowered = url.as_str().to_ascii_lowercase();
        foreign && SSO_INDICATORS.iter().any(|i| lowered.contains(i))
    }

    fn filter_profile(&self) -> FilterProfile {
        FilterProfile::moodle()
    }

    fn layout(&self) -> Layout {
        Layout::PerSection
    }
}
