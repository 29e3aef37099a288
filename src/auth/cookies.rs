//! Netscape cookie file import.
//!
//! Lets a run start from a browser session exported with a cookie-export
//! extension (or `curl -c`), which is the only way through SSO flows that
//! need interaction. Lines have 7 TAB-separated fields:
//! `domain`, `tailmatch`, `path`, `secure`, `expires`, `name`, `value`.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::cookie::Jar;
use tracing::{debug, instrument, warn};

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// One cookie from a cookie file. The value is redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCookie {
    /// Domain, possibly with a leading dot.
    pub domain: String,
    /// Whether subdomains match.
    pub include_subdomains: bool,
    /// Path scope.
    pub path: String,
    /// HTTPS only.
    pub secure: bool,
    /// Unix expiry, 0 for a session cookie.
    pub expires: u64,
    /// Cookie name.
    pub name: String,
    value: String,
}

impl SessionCookie {
    /// The cookie value. Never log it.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires != 0 && self.expires <= now
    }
}

impl fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookie")
            .field("domain", &self.domain)
            .field("include_subdomains", &self.include_subdomains)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("expires", &self.expires)
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Errors while reading a cookie file.
#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    /// The file could not be opened or read.
    #[error("failed to read cookie file '{path}': {source}")]
    Io {
        /// Cookie file path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A line is malformed.
    #[error("line {line_number}: {reason}")]
    InvalidLine {
        /// 1-based line number.
        line_number: usize,
        /// What is wrong.
        reason: String,
    },

    /// The file had data lines but none parsed.
    #[error("no valid cookies found ({malformed_count} lines failed to parse)")]
    NoCookiesFound {
        /// Number of malformed lines.
        malformed_count: usize,
    },
}

/// Parses cookie lines. Malformed lines are logged and skipped.
///
/// # Errors
///
/// Returns [`CookieError::Io`] on read failure and
/// [`CookieError::NoCookiesFound`] when data lines exist but none parse.
pub fn parse_cookie_lines(reader: impl BufRead) -> Result<Vec<SessionCookie>, CookieError> {
    let mut cookies = Vec::new();
    let mut malformed = 0usize;
    let mut data_lines = 0usize;

    for (idx, line) in reader.lines().enumerate() {
        let line_number = idx + 1;
        let line = line.map_err(|source| CookieError::Io {
            path: "<reader>".to_string(),
            source,
        })?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (line, http_only) = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => (rest, true),
            None if line.starts_with('#') => continue,
            None => (line, false),
        };

        data_lines += 1;
        match parse_cookie_line(line, line_number) {
            Ok(cookie) => {
                debug!(line = line_number, domain = %cookie.domain, name = %cookie.name, http_only, "parsed cookie");
                cookies.push(cookie);
            }
            Err(e) => {
                warn!(line = line_number, reason = %e, "skipping malformed cookie line");
                malformed += 1;
            }
        }
    }

    if cookies.is_empty() && data_lines > 0 {
        return Err(CookieError::NoCookiesFound {
            malformed_count: malformed,
        });
    }
    Ok(cookies)
}

fn parse_cookie_line(line: &str, line_number: usize) -> Result<SessionCookie, CookieError> {
    let invalid = |reason: String| CookieError::InvalidLine {
        line_number,
        reason,
    };

    let fields: Vec<&str> = line.split('\t').collect();
    let [domain, tailmatch, path, secure, expires, name, value] = fields.as_slice() else {
        return Err(invalid(format!(
            "expected 7 TAB-separated fields, found {}",
            fields.len()
        )));
    };

    let flag = |raw: &str, field: &str| match raw.to_ascii_uppercase().as_str() {
        "TRUE" => Ok(true),
        "FALSE" => Ok(false),
        _ => Err(invalid(format!("{field} must be TRUE or FALSE, got '{raw}'"))),
    };

    if domain.is_empty() {
        return Err(invalid("domain field is empty".to_string()));
    }
    if name.is_empty() {
        return Err(invalid("cookie name field is empty".to_string()));
    }

    Ok(SessionCookie {
        domain: (*domain).to_string(),
        include_subdomains: flag(*tailmatch, "tailmatch")?,
        path: if path.is_empty() { "/" } else { *path }.to_string(),
        secure: flag(*secure, "secure")?,
        expires: expires
            .parse()
            .map_err(|_| invalid(format!("expires must be a non-negative integer, got '{expires}'")))?,
        name: (*name).to_string(),
        value: (*value).to_string(),
    })
}

/// Adds `cookies` to a fresh jar, dropping expired ones.
#[instrument(level = "debug", skip(cookies), fields(count = cookies.len()))]
pub fn cookie_jar_from(cookies: &[SessionCookie]) -> Arc<Jar> {
    let jar = Arc::new(Jar::default());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    for cookie in cookies {
        if cookie.is_expired(now) {
            debug!(domain = %cookie.domain, name = %cookie.name, "skipping expired cookie");
            continue;
        }
        let origin = origin_url(cookie);
        match origin.parse::<url::Url>() {
            Ok(url) => jar.add_cookie_str(&set_cookie_header(cookie, now), &url),
            Err(_) => {
                warn!(domain = %cookie.domain, name = %cookie.name, "skipping cookie with unparseable domain");
            }
        }
    }
    jar
}

/// Reads `path` and builds a jar from it.
///
/// # Errors
///
/// Returns [`CookieError`] if the file cannot be read or holds no valid cookie.
pub fn load_cookie_file(path: &Path) -> Result<Arc<Jar>, CookieError> {
    let file = File::open(path).map_err(|source| CookieError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let cookies = parse_cookie_lines(BufReader::new(file))?;
    debug!(path = %path.display(), count = cookies.len(), "loaded cookie file");
    Ok(cookie_jar_from(&cookies))
}

fn set_cookie_header(cookie: &SessionCookie, now: u64) -> String {
    let mut header = format!("{}={}; Path={}", cookie.name, cookie.value(), cookie.path);
    if cookie.include_subdomains {
        header.push_str("; Domain=");
        header.push_str(cookie.domain.trim_start_matches('.'));
    }
    if cookie.secure {
        header.push_str("; Secure");
    }
    if cookie.expires > now {
        header.push_str(&format!("; Max-Age={}", cookie.expires - now));
    }
    header
}

fn origin_url(cookie: &SessionCookie) -> String {
    let scheme = if cookie.secure { "https" } else { "http" };
    let domain = cookie.domain.trim_start_matches('.');
    format!("{scheme}://{domain}{}", cookie.path)
}
