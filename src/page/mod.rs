//! The page capability: one browsing session positioned on one document.
//!
//! Everything above this module (platform collectors, login, download
//! strategies, the traversal driver) talks to a site only through [`Page`].
//! [`http::HttpPage`] is the reqwest + scraper implementation used by the
//! binary; tests drive the same code with scripted pages.

pub mod http;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub use http::HttpPage;

/// Load state to wait for after navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitUntil {
    /// The full document and its subresources.
    #[default]
    Load,
    /// The DOM is parsed.
    DomContentLoaded,
    /// No network traffic for a short while.
    NetworkIdle,
}

/// Snapshot of an element matched by a selector.
///
/// `selector` and `index` locate the element again on the same document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Selector the element was found with.
    pub selector: String,
    /// Position among the selector's matches.
    pub index: usize,
    /// Lower-case tag name.
    pub tag: String,
    /// Whitespace-normalized text content.
    pub text: String,
    /// Attributes by name.
    pub attributes: BTreeMap<String, String>,
}

impl Element {
    /// Value of attribute `name`.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// The `href` attribute.
    #[must_use]
    pub fn href(&self) -> Option<&str> {
        self.attr("href")
    }
}

/// Response to a navigation or a session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResponse {
    /// Final URL after redirects.
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lower-cased.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl PageResponse {
    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The `content-type` header.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Whether the body is an HTML document rather than an attachment: an
    /// HTML content type without `content-disposition`.
    #[must_use]
    pub fn is_html_page(&self) -> bool {
        self.header("content-disposition").is_none()
            && self.content_type().is_some_and(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.contains("text/html") || ct.contains("application/xhtml")
            })
    }
}

/// A file delivered by activating a download element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// URL the file was served from.
    pub url: Url,
    /// Filename proposed by the server, if any.
    pub suggested_filename: Option<String>,
    /// The `content-type` of the transfer.
    pub content_type: Option<String>,
    /// File contents.
    pub body: Vec<u8>,
}

/// Errors reported by a [`Page`].
#[derive(Debug, Error)]
pub enum PageError {
    /// Connection-level failure.
    #[error("network error loading {url}: {source}")]
    Network {
        /// URL being loaded.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// A bounded wait expired.
    #[error("{operation} timed out for {url}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// URL involved.
        url: String,
    },

    /// Non-success status on navigation.
    #[error("HTTP {status} loading {url}")]
    HttpStatus {
        /// URL being loaded.
        url: String,
        /// Status code.
        status: u16,
    },

    /// A URL or href could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending value.
        url: String,
    },

    /// A selector did not parse.
    #[error("invalid selector: {selector}")]
    InvalidSelector {
        /// The offending selector.
        selector: String,
    },

    /// No element matched.
    #[error("no element matches {selector}")]
    ElementNotFound {
        /// The selector used.
        selector: String,
    },

    /// Activating an element did not produce a file.
    #[error("no file transfer: {reason}")]
    NoTransfer {
        /// Why no transfer happened.
        reason: String,
    },

    /// A form could not be filled or submitted.
    #[error("form error: {reason}")]
    Form {
        /// What went wrong.
        reason: String,
    },

    /// The implementation does not support the operation.
    #[error("{operation} is not supported by this page")]
    Unsupported {
        /// The operation name.
        operation: &'static str,
    },

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {source}")]
    Client {
        /// Builder error.
        #[source]
        source: reqwest::Error,
    },

    /// No document has been loaded yet.
    #[error("no document loaded")]
    NotLoaded,

    /// The page was closed.
    #[error("page is closed")]
    Closed,
}

impl PageError {
    /// Creates a network error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: &'static str, url: impl Into<String>) -> Self {
        Self::Timeout {
            operation,
            url: url.into(),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an invalid selector error.
    pub fn invalid_selector(selector: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.into(),
        }
    }

    /// Creates an element-not-found error.
    pub fn element_not_found(selector: impl Into<String>) -> Self {
        Self::ElementNotFound {
            selector: selector.into(),
        }
    }

    /// Creates a no-transfer error.
    pub fn no_transfer(reason: impl Into<String>) -> Self {
        Self::NoTransfer {
            reason: reason.into(),
        }
    }

    /// Creates a form error.
    pub fn form(reason: impl Into<String>) -> Self {
        Self::Form {
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }
}

/// One browsing session positioned on one document.
///
/// Read operations take `&self`; anything that navigates or changes form
/// state takes `&mut self`. Implementations bound every network wait by the
/// timeout passed in.
#[async_trait]
pub trait Page: Send + Sync {
    /// URL of the current document.
    fn current_url(&self) -> Option<Url>;

    /// Document title, empty when there is none.
    async fn title(&self) -> Result<String, PageError>;

    /// Serialized HTML of the current document.
    async fn content(&self) -> Result<String, PageError>;

    /// First element matching `selector`.
    async fn query(&self, selector: &str) -> Result<Option<Element>, PageError>;

    /// All elements matching `selector`, in document order.
    async fn query_all(&self, selector: &str) -> Result<Vec<Element>, PageError>;

    /// Runs a script against the document, optionally with an element bound.
    async fn evaluate(
        &self,
        script: &str,
        element: Option<&Element>,
    ) -> Result<serde_json::Value, PageError>;

    /// Navigates to `url`.
    async fn goto(
        &mut self,
        url: &Url,
        wait: WaitUntil,
        timeout: Duration,
    ) -> Result<PageResponse, PageError>;

    /// Waits until the current document reaches `wait`.
    async fn wait_for_load(&mut self, wait: WaitUntil, timeout: Duration)
    -> Result<(), PageError>;

    /// Sets the value of the form field matched by `selector`.
    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), PageError>;

    /// Clicks the element matched by `selector`.
    async fn click(&mut self, selector: &str) -> Result<(), PageError>;

    /// Activates `element` and waits for the file it delivers.
    async fn click_for_download(
        &mut self,
        element: &Element,
        timeout: Duration,
    ) -> Result<FileTransfer, PageError>;

    /// GETs `url` through the session without leaving the current document.
    ///
    /// Non-success statuses are returned, not raised.
    async fn request(&self, url: &Url, timeout: Duration) -> Result<PageResponse, PageError>;

    /// Ends the session.
    async fn close(&mut self) -> Result<(), PageError>;
}

/// Resolves `href` against `base`, ignoring fragments-only and script links.
#[must_use]
pub fn resolve_href(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    base.join(href).ok()
}
