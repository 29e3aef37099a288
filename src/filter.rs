//! Resource filter: decides which discovered URLs are downloaded.
//!
//! The host allow-list is checked first and dominates every other rule.
//! After that a URL is included if any enabled rule matches; rules are a
//! union, so the first match is only reported for logging.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, trace, warn};
use url::Url;

use crate::config::DownloadPolicy;
use crate::download::SkipReason;

const ARCHIVE_ZIP: &[&str] = &[".zip"];
const ARCHIVE_TARBALL: &[&str] = &[".tgz", ".tar.gz", ".gz"];
const PDF: &[&str] = &[".pdf"];
const OFFICE_DOCUMENTS: &[&str] = &[".doc", ".docx", ".ppt", ".pptx", ".xls", ".xlsx"];
const BASE_IMAGES: &[&str] = &[".png", ".jpg", ".jpeg"];
const MOODLE_IMAGES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif"];
const MOODLE_NATIVE_MARKERS: &[&str] = &["pluginfile.php", "forcedownload=1"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    HostPort(String, u16),
    Subdomain(String, Option<u16>),
}

/// Explicit set of trusted hosts.
///
/// Entries are `host`, `host:port` or `*.domain[:port]`. A wildcard matches
/// strict subdomains only, never the bare domain. An entry without a port
/// matches only URLs without an explicit port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAllowList {
    patterns: Vec<HostPattern>,
}

impl HostAllowList {
    /// Builds the list from pattern strings; blank or malformed entries are ignored.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|raw| {
                let parsed = parse_host_pattern(raw.as_ref());
                if parsed.is_none() && !raw.as_ref().trim().is_empty() {
                    warn!(pattern = raw.as_ref(), "ignoring malformed allowed host");
                }
                parsed
            })
            .collect();
        Self { patterns }
    }

    /// Whether no host is trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `url`'s host (and port) is trusted.
    #[must_use]
    pub fn is_allowed(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let port = url.port();

        self.patterns.iter().any(|pattern| match pattern {
            HostPattern::Exact(expected) => port.is_none() && host == *expected,
            HostPattern::HostPort(expected, expected_port) => {
                port == Some(*expected_port) && host == *expected
            }
            HostPattern::Subdomain(domain, expected_port) => {
                port == *expected_port
                    && host.len() > domain.len() + 1
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
            }
        })
    }
}

fn parse_host_pattern(raw: &str) -> Option<HostPattern> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw.is_empty() {
        return None;
    }
    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), Some(port.parse::<u16>().ok()?)),
        None => (raw, None),
    };
    if let Some(domain) = host.strip_prefix("*.") {
        if domain.is_empty() || domain.contains('*') {
            return None;
        }
        return Some(HostPattern::Subdomain(domain.to_string(), port));
    }
    if host.is_empty() || host.contains('*') || host.contains('/') {
        return None;
    }
    Some(match port {
        Some(port) => HostPattern::HostPort(host, port),
        None => HostPattern::Exact(host),
    })
}

/// Platform-dependent parts of the filter rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterProfile {
    /// Extensions counted as images.
    pub image_extensions: &'static [&'static str],
    /// Substrings marking the platform's own file-serving endpoint.
    pub native_markers: &'static [&'static str],
}

impl FilterProfile {
    /// Moodle: GIFs are images, `pluginfile.php` and `forcedownload=1` are native markers.
    #[must_use]
    pub fn moodle() -> Self {
        Self {
            image_extensions: MOODLE_IMAGES,
            native_markers: MOODLE_NATIVE_MARKERS,
        }
    }

    /// Roeselite: no native markers.
    #[must_use]
    pub fn roeselite() -> Self {
        Self {
            image_extensions: BASE_IMAGES,
            native_markers: &[],
        }
    }
}

impl Default for FilterProfile {
    fn default() -> Self {
        Self::roeselite()
    }
}

/// The rule that admitted a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InclusionRule {
    /// `mode=raw` in the query.
    RawMode,
    /// `mode=dl` in the query.
    DownloadMode,
    /// `.zip` path.
    Zip,
    /// `.tgz`, `.tar.gz` or `.gz` path.
    Tarball,
    /// Image extension from the profile.
    Image,
    /// `.pdf` path.
    Pdf,
    /// Office document extension.
    Document,
    /// Platform-native marker with no disabling extension.
    NativeFallback,
}

impl fmt::Display for InclusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::RawMode => "mode-raw",
            Self::DownloadMode => "mode-dl",
            Self::Zip => "zip",
            Self::Tarball => "tarball",
            Self::Image => "image",
            Self::Pdf => "pdf",
            Self::Document => "document",
            Self::NativeFallback => "native-fallback",
        };
        f.write_str(label)
    }
}

/// Verdict for one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Download it.
    Include(InclusionRule),
    /// Leave it; the reason is `UntrustedHost` or `PolicyExcluded`.
    Exclude(SkipReason),
}

/// Applies a [`DownloadPolicy`] and a [`HostAllowList`] to candidate URLs.
#[derive(Debug, Clone)]
pub struct ResourceFilter {
    policy: DownloadPolicy,
    hosts: HostAllowList,
    profile: FilterProfile,
}

impl ResourceFilter {
    /// Creates a filter.
    #[must_use]
    pub fn new(policy: DownloadPolicy, hosts: HostAllowList, profile: FilterProfile) -> Self {
        Self {
            policy,
            hosts,
            profile,
        }
    }

    /// The host allow-list.
    #[must_use]
    pub fn hosts(&self) -> &HostAllowList {
        &self.hosts
    }

    /// Decides a single URL.
    #[must_use]
    pub fn decide(&self, url: &Url) -> FilterDecision {
        if !self.hosts.is_allowed(url) {
            return FilterDecision::Exclude(SkipReason::UntrustedHost);
        }

        let policy = &self.policy;
        let path = url.path().to_ascii_lowercase();
        let query_mode = |mode: &str| {
            url.query_pairs()
                .any(|(k, v)| k.eq_ignore_ascii_case("mode") && v.eq_ignore_ascii_case(mode))
        };
        let has_ext = |exts: &[&str]| exts.iter().any(|ext| path.ends_with(ext));

        let structural = [
            (policy.allow_raw && query_mode("raw"), InclusionRule::RawMode),
            (policy.allow_dl && query_mode("dl"), InclusionRule::DownloadMode),
            (policy.allow_zip && has_ext(ARCHIVE_ZIP), InclusionRule::Zip),
            (policy.allow_tgz && has_ext(ARCHIVE_TARBALL), InclusionRule::Tarball),
            (
                policy.allow_images && has_ext(self.profile.image_extensions),
                InclusionRule::Image,
            ),
            (policy.allow_pdf && has_ext(PDF), InclusionRule::Pdf),
            (
                policy.allow_documents && has_ext(OFFICE_DOCUMENTS),
                InclusionRule::Document,
            ),
        ];
        if let Some((_, rule)) = structural.iter().find(|(matched, _)| *matched) {
            return FilterDecision::Include(*rule);
        }

        if policy.native_fallback && self.carries_native_marker(url) {
            let disabled = [
                (!policy.allow_zip, ARCHIVE_ZIP),
                (!policy.allow_tgz, ARCHIVE_TARBALL),
                (!policy.allow_images, self.profile.image_extensions),
                (!policy.allow_pdf, PDF),
                (!policy.allow_documents, OFFICE_DOCUMENTS),
            ];
            let disqualified = disabled
                .iter()
                .any(|(is_disabled, exts)| *is_disabled && has_ext(*exts));
            if !disqualified {
                warn!(url = %url, "no policy rule matched; including platform file link as fallback");
                return FilterDecision::Include(InclusionRule::NativeFallback);
            }
        }

        FilterDecision::Exclude(SkipReason::PolicyExcluded)
    }

    fn carries_native_marker(&self, url: &Url) -> bool {
        let lowered = url.as_str().to_ascii_lowercase();
        self.profile
            .native_markers
            .iter()
            .any(|marker| lowered.contains(marker))
    }

    /// Filters `candidates`, keeping discovery order and dropping duplicates.
    ///
    /// Candidates that do not parse as absolute URLs are dropped.
    pub fn filter<I, S>(&self, candidates: I) -> Vec<Url>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for candidate in candidates {
            let raw = candidate.as_ref();
            let url = match Url::parse(raw) {
                Ok(url) => url,
                Err(e) => {
                    debug!(candidate = raw, error = %e, "dropping unparseable candidate");
                    continue;
                }
            };
            if seen.contains(url.as_str()) {
                continue;
            }
            match self.decide(&url) {
                FilterDecision::Include(rule) => {
                    trace!(url = %url, %rule, "candidate included");
                    seen.insert(url.as_str().to_string());
                    out.push(url);
                }
                FilterDecision::Exclude(reason) => {
                    debug!(url = %url, %reason, "candidate excluded");
                }
            }
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn policy() -> DownloadPolicy {
        DownloadPolicy {
            allow_raw: false,
            allow_dl: false,
            allow_zip: false,
            allow_tgz: false,
            allow_images: false,
            allow_pdf: false,
            allow_documents: false,
            native_fallback: false,
            ..DownloadPolicy::default()
        }
    }

    #[test]
    fn test_host_exact_match() {
        let hosts = HostAllowList::new(["elearning.ovgu.de"]);
        assert!(hosts.is_allowed(&url("https://elearning.ovgu.de/a.pdf")));
        assert!(hosts.is_allowed(&url("https://ELEARNING.ovgu.de/a.pdf")));
        assert!(!hosts.is_allowed(&url("https://evil.elearning.ovgu.de/a.pdf")));
        assert!(!hosts.is_allowed(&url("https://elearning.ovgu.de:8443/a.pdf")));
    }

    #[test]
    fn test_host_port_match() {
        let hosts = HostAllowList::new(["127.0.0.1:8080"]);
        assert!(hosts.is_allowed(&url("http://127.0.0.1:8080/x")));
        assert!(!hosts.is_allowed(&url("http://127.0.0.1:9090/x")));
        assert!(!hosts.is_allowed(&url("http://127.0.0.1/x")));
    }

    #[test]
    fn test_wildcard_matches_strict_subdomains_only() {
        let hosts = HostAllowList::new(["*.cs.ovgu.de"]);
        assert!(hosts.is_allowed(&url("https://roeselite.cs.ovgu.de/a.zip")));
        assert!(hosts.is_allowed(&url("https://a.b.cs.ovgu.de/a.zip")));
        assert!(!hosts.is_allowed(&url("https://cs.ovgu.de/a.zip")));
        assert!(!hosts.is_allowed(&url("https://evilcs.ovgu.de/a.zip")));
        assert!(!hosts.is_allowed(&url("https://cs.ovgu.de.evil.org/a.zip")));
    }

    #[test]
    fn test_malformed_patterns_are_ignored() {
        let hosts = HostAllowList::new(["", "  ", "*.", "host:notaport", "a*b.org"]);
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_empty_allow_list_trusts_nothing() {
        let filter = ResourceFilter::new(
            DownloadPolicy::default(),
            HostAllowList::default(),
            FilterProfile::moodle(),
        );
        assert_eq!(
            filter.decide(&url("https://elearning.ovgu.de/pluginfile.php/1/a.pdf")),
            FilterDecision::Exclude(SkipReason::UntrustedHost)
        );
    }

    #[test]
    fn test_query_modes() {
        let hosts = HostAllowList::new(["trusted.org"]);
        let filter = ResourceFilter::new(
            DownloadPolicy {
                allow_raw: true,
                ..policy()
            },
            hosts,
            FilterProfile::roeselite(),
        );
        assert_eq!(
            filter.decide(&url("https://trusted.org/file?mode=raw")),
            FilterDecision::Include(InclusionRule::RawMode)
        );
        assert_eq!(
            filter.decide(&url("https://trusted.org/file?mode=dl")),
            FilterDecision::Exclude(SkipReason::PolicyExcluded)
        );
    }

    #[test]
    fn test_extension_checks_ignore_query() {
        let filter = ResourceFilter::new(
            DownloadPolicy {
                allow_pdf: true,
                ..policy()
            },
            HostAllowList::new(["trusted.org"]),
            FilterProfile::roeselite(),
        );
        assert!(matches!(
            filter.decide(&url("https://trusted.org/view?file=a.pdf")),
            FilterDecision::Exclude(_)
        ));
        assert!(matches!(
            filter.decide(&url("https://trusted.org/Docs/A.PDF?x=1")),
            FilterDecision::Include(InclusionRule::Pdf)
        ));
    }

    #[test]
    fn test_tarball_and_images_per_profile() {
        let policy = DownloadPolicy {
            allow_tgz: true,
            allow_images: true,
            ..policy()
        };
        let hosts = HostAllowList::new(["trusted.org"]);
        let moodle = ResourceFilter::new(policy.clone(), hosts.clone(), FilterProfile::moodle());
        let roeselite = ResourceFilter::new(policy, hosts, FilterProfile::roeselite());

        assert_eq!(
            roeselite.decide(&url("https://trusted.org/src.tar.gz")),
            FilterDecision::Include(InclusionRule::Tarball)
        );
        assert_eq!(
            moodle.decide(&url("https://trusted.org/fig.gif")),
            FilterDecision::Include(InclusionRule::Image)
        );
        assert_eq!(
            roeselite.decide(&url("https://trusted.org/fig.gif")),
            FilterDecision::Exclude(SkipReason::PolicyExcluded)
        );
    }

    #[test]
    fn test_native_fallback_respects_disabled_extensions() {
        let filter = ResourceFilter::new(
            DownloadPolicy {
                native_fallback: true,
                ..policy()
            },
            HostAllowList::new(["elearning.ovgu.de"]),
            FilterProfile::moodle(),
        );
        assert_eq!(
            filter.decide(&url(
                "https://elearning.ovgu.de/pluginfile.php/5/mod_resource/content/1/notes.txt"
            )),
            FilterDecision::Include(InclusionRule::NativeFallback)
        );
        assert_eq!(
            filter.decide(&url(
                "https://elearning.ovgu.de/pluginfile.php/5/mod_resource/content/1/notes.pdf"
            )),
            FilterDecision::Exclude(SkipReason::PolicyExcluded)
        );
    }

    #[test]
    fn test_native_fallback_off_excludes() {
        let filter = ResourceFilter::new(
            policy(),
            HostAllowList::new(["elearning.ovgu.de"]),
            FilterProfile::moodle(),
        );
        assert_eq!(
            filter.decide(&url("https://elearning.ovgu.de/mod/x/view.php?forcedownload=1")),
            FilterDecision::Exclude(SkipReason::PolicyExcluded)
        );
    }

    #[test]
    fn test_filter_keeps_order_and_deduplicates() {
        let filter = ResourceFilter::new(
            DownloadPolicy {
                allow_zip: true,
                allow_pdf: true,
                ..policy()
            },
            HostAllowList::new(["trusted.org"]),
            FilterProfile::roeselite(),
        );
        let out = filter.filter([
            "https://trusted.org/b.pdf",
            "not a url",
            "https://trusted.org/a.zip",
            "https://trusted.org/b.pdf",
        ]);
        let out: Vec<&str> = out.iter().map(Url::as_str).collect();
        assert_eq!(out, vec!["https://trusted.org/b.pdf", "https://trusted.org/a.zip"]);
    }

    #[test]
    fn test_untrusted_host_dominates_every_rule() {
        let everything = DownloadPolicy {
            allow_raw: true,
            allow_dl: true,
            allow_zip: true,
            allow_tgz: true,
            allow_images: true,
            allow_pdf: true,
            allow_documents: true,
            native_fallback: true,
            ..DownloadPolicy::default()
        };
        let filter = ResourceFilter::new(
            everything,
            HostAllowList::new(["trusted.org", "*.trusted.org"]),
            FilterProfile::moodle(),
        );
        for candidate in [
            "https://untrusted.org/a.zip",
            "https://untrusted.org/pluginfile.php/1/a.pdf?forcedownload=1",
            "https://untrusted.org/x?mode=raw",
            "https://trusted.org.evil.net/a.pdf",
        ] {
            assert_eq!(
                filter.decide(&url(candidate)),
                FilterDecision::Exclude(SkipReason::UntrustedHost),
                "{candidate}"
            );
        }
    }
}
