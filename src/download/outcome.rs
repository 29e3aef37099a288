//! Outcome of a single download attempt.

use std::fmt;
use std::path::PathBuf;

use super::error::DownloadError;

/// Why a resource was deliberately not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The download policy does not select this resource.
    PolicyExcluded,
    /// The URL's host is not on the allow-list.
    UntrustedHost,
    /// A file with the resolved name exists and replacement is disabled.
    AlreadyExists,
    /// The same resource was already written under this name during this run.
    DuplicateInRun,
}

impl SkipReason {
    /// Stable label used in log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PolicyExcluded => "policy-excluded",
            Self::UntrustedHost => "host-not-trusted",
            Self::AlreadyExists => "already-exists",
            Self::DuplicateInRun => "duplicate-in-run",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection-level error.
    Network,
    /// A bounded wait expired.
    Timeout,
    /// The server answered with a non-success status.
    HttpStatus(u16),
    /// Neither a matching link nor a download marker was found.
    NoDownloadMechanism,
    /// Writing the file failed.
    Io,
    /// The URL could not be parsed.
    InvalidUrl,
}

impl FailureKind {
    /// Classifies a [`DownloadError`].
    #[must_use]
    pub fn classify(error: &DownloadError) -> Self {
        match error {
            DownloadError::Network { .. } | DownloadError::Page { .. } => Self::Network,
            DownloadError::Timeout { .. } => Self::Timeout,
            DownloadError::HttpStatus { status, .. } => Self::HttpStatus(*status),
            DownloadError::NoDownloadMechanism { .. } | DownloadError::NotAFile { .. } => {
                Self::NoDownloadMechanism
            }
            DownloadError::Io { .. } => Self::Io,
            DownloadError::InvalidUrl { .. } => Self::InvalidUrl,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::Timeout => f.write_str("timeout"),
            Self::HttpStatus(status) => write!(f, "http-{status}"),
            Self::NoDownloadMechanism => f.write_str("no-download-mechanism"),
            Self::Io => f.write_str("io"),
            Self::InvalidUrl => f.write_str("invalid-url"),
        }
    }
}

/// A file that was written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Final filename inside the target directory.
    pub filename: String,
    /// Full output path.
    pub path: PathBuf,
    /// Whether an existing file was overwritten.
    pub replaced: bool,
}

/// Result of one download attempt. Strategies never return errors past
/// their boundary; everything ends up here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The resource was written.
    Saved(SavedFile),
    /// The resource was deliberately not written.
    Skipped(SkipReason),
    /// The attempt failed.
    Failed(FailureKind),
}

impl DownloadOutcome {
    /// Filename of the saved file, if any.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::Saved(saved) => Some(&saved.filename),
            _ => None,
        }
    }

    /// Whether a file was written.
    #[must_use]
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved(_))
    }

    /// Whether the attempt failed (as opposed to being skipped).
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<DownloadError> for DownloadOutcome {
    fn from(error: DownloadError) -> Self {
        Self::Failed(FailureKind::classify(&error))
    }
}
