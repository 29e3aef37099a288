//! Filename extraction, sanitization, and per-run path allocation for downloads.
//!
//! This module derives safe filenames from titles, URLs and
//! Content-Disposition headers, and owns the [`FilenameArbiter`] that hands out
//! output paths so that repeated runs stay idempotent and distinct resources
//! never share a name within one run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::debug;
use url::Url;

use super::outcome::SkipReason;

/// Maximum length of a name produced by [`safe_filename`].
pub const MAX_FILENAME_LEN: usize = 90;

/// Name used when nothing usable survives sanitization.
const EMPTY_NAME_FALLBACK: &str = "page";

/// Longest extension (including the dot) kept intact when truncating.
const MAX_EXTENSION_LEN: usize = 12;

/// Upper bound on numeric suffixes tried before falling back to a timestamp.
const MAX_SUFFIX: usize = 10_000;

/// Normalizes arbitrary text into a filesystem-safe name.
///
/// Runs of characters outside `[A-Za-z0-9._-]` collapse into a single `_`,
/// leading and trailing underscores are removed, and the result is capped at
/// [`MAX_FILENAME_LEN`] characters while keeping a short extension. Empty or
/// dot-only results become `page`.
///
/// Applying the function to its own output returns the output unchanged.
#[must_use]
pub fn safe_filename(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }

    let mut name = out.trim_matches('_').to_string();
    if name.len() > MAX_FILENAME_LEN {
        name = truncate_keeping_extension(&name, MAX_FILENAME_LEN);
        name = name.trim_matches('_').to_string();
    }

    if name.is_empty() || name.chars().all(|c| c == '.') {
        return EMPTY_NAME_FALLBACK.to_string();
    }
    name
}

// Input is ASCII-only at this point, so byte offsets are char offsets.
fn truncate_keeping_extension(name: &str, max_len: usize) -> String {
    if let Some((stem, ext)) = split_extension(name)
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.len() < max_len
    {
        let stem_len = max_len - ext.len();
        let stem = stem[..stem.len().min(stem_len)].trim_end_matches('_');
        return format!("{stem}{ext}");
    }
    name[..max_len].to_string()
}

/// Splits `name` into stem and extension (extension includes the dot).
///
/// Names without a dot, or whose only dot is the first character, have no
/// extension.
pub(crate) fn split_extension(name: &str) -> Option<(&str, &str)> {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => Some((&name[..pos], &name[pos..])),
        _ => None,
    }
}

/// Returns the lower-cased extension of a bare filename, if it looks like one.
pub(crate) fn extension_from_name(name: &str) -> Option<String> {
    let (_, ext) = split_extension(name)?;
    if ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    Some(ext.to_lowercase())
}

pub(crate) fn extension_from_url(url: &Url) -> Option<String> {
    let last_segment = url.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index..];
    if ext.len() <= 1 || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Guess file extension from Content-Type header.
pub(crate) fn extension_from_content_type(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match mime.as_str() {
        "text/html" => ".html",
        "text/plain" => ".txt",
        "text/markdown" => ".md",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/pdf" => ".pdf",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "application/zip" | "application/x-zip-compressed" => ".zip",
        "application/gzip" | "application/x-gzip" => ".gz",
        "application/msword" => ".doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
        "application/vnd.ms-powerpoint" => ".ppt",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => ".pptx",
        "application/vnd.ms-excel" => ".xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => ".xlsx",
        _ => ".bin",
    }
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles both:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename=example.pdf`
/// - `attachment; filename*=UTF-8''example.pdf` (RFC 5987)
///
/// Parameter names match case-insensitively.
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets valid for `header`.
    let lowered = header.to_ascii_lowercase();

    if let Some(pos) = lowered.find("filename*=") {
        let value = header[pos + 10..].trim();
        // charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim().trim_matches('"');
            if let Ok(decoded) = urlencoding::decode(encoded_name) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = lowered.find("filename=") {
        let value = header[pos + 9..].trim();

        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string()).filter(|name| !name.is_empty());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim().trim_matches('\'');
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Filename derived from the last URL path segment (percent-decoded), or `file`.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).unwrap_or_else(|e| {
            debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
            last.into()
        });
        return safe_filename(&decoded);
    }
    "file".to_string()
}

/// Builds `<title><ext>` from a preferred title and an inferred extension.
///
/// The extension is appended only when the title does not already end with it.
#[must_use]
pub fn titled_filename(title: &str, extension: Option<&str>) -> String {
    let base = safe_filename(title);
    match extension {
        Some(ext) if !base.to_lowercase().ends_with(ext) => safe_filename(&format!("{base}{ext}")),
        _ => base,
    }
}

/// Result of asking the [`FilenameArbiter`] for an output path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// Nothing exists at this path; write a new file.
    Fresh(PathBuf),
    /// A file exists and replacement is enabled; overwrite it.
    Overwrite(PathBuf),
    /// The resource must not be written.
    Skip(SkipReason),
}

impl Allocation {
    /// Path to write to, if the allocation permits writing.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Fresh(path) | Self::Overwrite(path) => Some(path),
            Self::Skip(_) => None,
        }
    }
}

/// Single owner of output filename allocation for one run.
///
/// Distinguishes "same resource again" (skip or overwrite according to the
/// replace policy) from "different resource, same name" (always suffixed with
/// `_2`, `_3`, ...). Names are claimed under a mutex so concurrent callers can
/// never be handed the same path.
#[derive(Debug)]
pub struct FilenameArbiter {
    replace_existing: bool,
    claims: Mutex<HashMap<PathBuf, String>>,
}

impl FilenameArbiter {
    /// Creates an arbiter with the given replacement policy.
    #[must_use]
    pub fn new(replace_existing: bool) -> Self {
        Self {
            replace_existing,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Whether existing files are overwritten.
    #[must_use]
    pub fn replace_existing(&self) -> bool {
        self.replace_existing
    }

    /// Allocates an output path in `dir` for `filename` on behalf of `resource`.
    ///
    /// `resource` identifies the logical resource (its URL); the same key
    /// asking twice for the same name is treated as a re-download.
    pub fn allocate(&self, dir: &Path, filename: &str, resource: &str) -> Allocation {
        let filename = safe_filename(filename);
        let mut claims = self
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for candidate in candidate_names(&filename) {
            let path = dir.join(&candidate);
            match claims.get(&path) {
                Some(owner) if owner == resource => {
                    return if self.replace_existing {
                        Allocation::Overwrite(path)
                    } else {
                        Allocation::Skip(SkipReason::DuplicateInRun)
                    };
                }
                Some(_) => continue,
                None => {}
            }

            let exists = path.exists();
            claims.insert(path.clone(), resource.to_string());
            if !exists {
                debug!(path = %path.display(), "allocated fresh path");
                return Allocation::Fresh(path);
            }
            return if self.replace_existing {
                debug!(path = %path.display(), "existing file will be replaced");
                Allocation::Overwrite(path)
            } else {
                debug!(path = %path.display(), "existing file kept");
                Allocation::Skip(SkipReason::AlreadyExists)
            };
        }

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let (stem, ext) = split_extension(&filename).unwrap_or((filename.as_str(), ""));
        let path = dir.join(format!("{stem}_{timestamp}{ext}"));
        claims.insert(path.clone(), resource.to_string());
        Allocation::Fresh(path)
    }

    /// Drops `resource`'s claim on `path` so the name can be allocated again.
    ///
    /// Claims held by other resources are left alone.
    pub fn release(&self, path: &Path, resource: &str) {
        let mut claims = self
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if claims.get(path).is_some_and(|owner| owner == resource) {
            claims.remove(path);
            debug!(path = %path.display(), "released claim");
        }
    }
}

fn candidate_names(filename: &str) -> impl Iterator<Item = String> + '_ {
    let (stem, ext) = split_extension(filename).unwrap_or((filename, ""));
    std::iter::once(filename.to_string())
        .chain((2..MAX_SUFFIX).map(move |i| format!("{stem}_{i}{ext}")))
}
