//! Error types for the download module.
//!
//! These errors stay inside the strategies: every strategy converts them into
//! a [`DownloadOutcome`](super::DownloadOutcome) before returning.

use std::path::PathBuf;

use thiserror::Error;

use crate::page::PageError;

/// Errors that can occur while fetching and saving one resource.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The page capability reported an error it could not classify further.
    #[error("page error downloading {url}: {source}")]
    Page {
        /// The URL that failed to download.
        url: String,
        /// The underlying page error.
        #[source]
        source: PageError,
    },

    /// A bounded wait expired before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// No link or download marker could be activated for the resource.
    #[error("no download link found for {url}")]
    NoDownloadMechanism {
        /// The URL that could not be triggered.
        url: String,
    },

    /// An HTML page came back where a file was expected, usually a login page
    /// served after the session expired.
    #[error("expected a file at {url} but received a web page")]
    NotAFile {
        /// The URL that answered with a page.
        url: String,
    },

    /// File system error while saving (create dir, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a missing-mechanism error.
    pub fn no_download_mechanism(url: impl Into<String>) -> Self {
        Self::NoDownloadMechanism { url: url.into() }
    }

    /// Creates an error for an HTML page served in place of a file.
    pub fn not_a_file(url: impl Into<String>) -> Self {
        Self::NotAFile { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Maps a page capability error onto the download taxonomy.
    pub fn from_page(url: impl Into<String>, source: PageError) -> Self {
        let url = url.into();
        match source {
            PageError::Timeout { .. } => Self::Timeout { url },
            PageError::HttpStatus { status, .. } => Self::HttpStatus { url, status },
            PageError::Network { source, .. } => Self::Network { url, source },
            PageError::InvalidUrl { .. } => Self::InvalidUrl { url },
            PageError::NoTransfer { .. } | PageError::ElementNotFound { .. } => {
                Self::NoDownloadMechanism { url }
            }
            other => Self::Page { url, source: other },
        }
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs the
// url or path, which the source errors do not carry.
