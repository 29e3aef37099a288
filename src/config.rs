//! Run configuration: platform presets overlaid with a TOML file.
//!
//! Loading starts from the preset of the selected platform and deep-merges
//! the file's tables over it, so a file only needs to name what differs.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::download::constants::{
    CLICK_TRANSFER_TIMEOUT, CONNECT_TIMEOUT_SECS, NAVIGATION_TIMEOUT, REQUEST_TIMEOUT,
    SETTLE_TIMEOUT,
};
use crate::filter::HostAllowList;

const CONFIG_DIR_NAME: &str = "course-harvester";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unexpected keys or values.
    #[error("failed to parse config{}: {source}", .path.as_ref().map(|p| format!(" file '{}'", p.display())).unwrap_or_default())]
    Parse {
        /// Config path, when parsed from a file.
        path: Option<PathBuf>,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A preset could not be turned into a TOML table.
    #[error("failed to prepare platform preset: {source}")]
    Preset {
        /// Underlying TOML error.
        #[source]
        source: toml::ser::Error,
    },

    /// A value is out of range or malformed.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Supported platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Moodle learning-management system.
    #[default]
    Moodle,
    /// Roeselite assignment site.
    Roeselite,
}

impl Platform {
    /// Stable label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Moodle => "moodle",
            Self::Roeselite => "roeselite",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "moodle" => Ok(Self::Moodle),
            "roeselite" => Ok(Self::Roeselite),
            other => Err(ConfigError::invalid(
                "platform",
                format!("unknown platform '{other}', expected moodle or roeselite"),
            )),
        }
    }
}

/// Which downloader strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StrategyKind {
    /// Direct request through the session only.
    RequestOnly,
    /// Simulated click only.
    ClickOnly,
    /// Request and click combined.
    #[default]
    Auto,
}

impl StrategyKind {
    /// Canonical label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestOnly => "request-only",
            Self::ClickOnly => "click-only",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "request-only" | "request" => Ok(Self::RequestOnly),
            "click-only" | "click" => Ok(Self::ClickOnly),
            "auto" => Ok(Self::Auto),
            other => Err(ConfigError::invalid(
                "strategy",
                format!("unknown strategy '{other}', expected request-only, click-only or auto"),
            )),
        }
    }
}

impl TryFrom<String> for StrategyKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StrategyKind> for String {
    fn from(value: StrategyKind) -> Self {
        value.as_str().to_string()
    }
}

/// Order in which the auto strategy tries its two mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackOrder {
    /// Direct request, then click.
    #[default]
    RequestFirst,
    /// Click, then direct request.
    ClickFirst,
}

/// Output directory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// `NNN_<page title>/attachments/` per item page.
    PerPage,
    /// `<section>/` per course section.
    PerSection,
}

/// Which resources are downloaded and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadPolicy {
    /// Links whose query carries `mode=raw`.
    pub allow_raw: bool,
    /// Links whose query carries `mode=dl`.
    pub allow_dl: bool,
    /// `.zip` archives.
    pub allow_zip: bool,
    /// `.tgz`, `.tar.gz` and `.gz` archives.
    pub allow_tgz: bool,
    /// Images (extensions per platform).
    pub allow_images: bool,
    /// PDF files.
    pub allow_pdf: bool,
    /// Office documents.
    pub allow_documents: bool,
    /// Include platform file links no rule matched, unless a disabled type.
    pub native_fallback: bool,
    /// Write `url.txt` into each page folder.
    pub write_url_marker: bool,
    /// Overwrite files that already exist.
    pub replace_existing: bool,
    /// Downloader strategy.
    pub strategy: StrategyKind,
    /// Order for the auto strategy.
    pub fallback_order: FallbackOrder,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            allow_raw: false,
            allow_dl: true,
            allow_zip: true,
            allow_tgz: false,
            allow_images: false,
            allow_pdf: false,
            allow_documents: false,
            native_fallback: false,
            write_url_marker: false,
            replace_existing: false,
            strategy: StrategyKind::Auto,
            fallback_order: FallbackOrder::RequestFirst,
        }
    }
}

/// Login form settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoginConfig {
    /// Login page path relative to the base URL.
    pub path: String,
    /// Username field selectors, tried in order.
    pub username_selectors: Vec<String>,
    /// Password field selectors, tried in order.
    pub password_selectors: Vec<String>,
    /// Submit control selectors, tried in order.
    pub submit_selectors: Vec<String>,
    /// Consent ("information release") buttons accepted after SSO, tried in order.
    pub consent_selectors: Vec<String>,
    /// Attempts before the run fails with an authentication error.
    pub max_attempts: u32,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            path: "/login".to_string(),
            username_selectors: strings(&[
                r#"input[name="username"]"#,
                "#username",
                r#"input[type="text"]"#,
            ]),
            password_selectors: strings(&[
                r#"input[name="password"]"#,
                "#password",
                r#"input[type="password"]"#,
            ]),
            submit_selectors: strings(&[
                r#"button[type="submit"]"#,
                r#"input[type="submit"]"#,
            ]),
            consent_selectors: Vec::new(),
            max_attempts: 3,
        }
    }
}

/// Timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Page navigation.
    pub navigation_secs: u64,
    /// Direct request.
    pub request_secs: u64,
    /// Click-triggered transfer.
    pub click_secs: u64,
    /// Settle wait before clicking.
    pub settle_secs: u64,
    /// HTTP connect.
    pub connect_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation_secs: NAVIGATION_TIMEOUT.as_secs(),
            request_secs: REQUEST_TIMEOUT.as_secs(),
            click_secs: CLICK_TRANSFER_TIMEOUT.as_secs(),
            settle_secs: SETTLE_TIMEOUT.as_secs(),
            connect_secs: CONNECT_TIMEOUT_SECS,
        }
    }
}

impl Timeouts {
    /// Navigation bound.
    #[must_use]
    pub fn navigation(&self) -> Duration {
        Duration::from_secs(self.navigation_secs)
    }

    /// Direct request bound.
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    /// Click transfer bound.
    #[must_use]
    pub fn click(&self) -> Duration {
        Duration::from_secs(self.click_secs)
    }

    /// Settle wait bound.
    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    /// Connect bound.
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

/// Complete configuration for one harvest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarvestConfig {
    /// Target platform; selects the preset.
    pub platform: Platform,
    /// Site root, e.g. `https://elearning.ovgu.de`.
    pub base_url: String,
    /// Start page listing the item pages, relative to `base_url`.
    pub start_path: String,
    /// Root of the output tree.
    pub output_dir: PathBuf,
    /// Trusted download hosts.
    pub allowed_hosts: Vec<String>,
    /// Output layout.
    pub layout: Layout,
    /// Roeselite: also visit submission pages.
    #[serde(default)]
    pub include_submissions: bool,
    /// Regex over URL paths selecting item pages; platform default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_path_pattern: Option<String>,
    /// Moodle: module paths treated as resources.
    #[serde(default)]
    pub resource_module_patterns: Vec<String>,
    /// Resource policy.
    #[serde(default)]
    pub policy: DownloadPolicy,
    /// Login settings.
    #[serde(default)]
    pub login: LoginConfig,
    /// Timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::preset(Platform::default())
    }
}

impl HarvestConfig {
    /// Defaults for `platform`.
    #[must_use]
    pub fn preset(platform: Platform) -> Self {
        match platform {
            Platform::Moodle => Self {
                platform,
                base_url: "https://elearning.ovgu.de".to_string(),
                start_path: "/my/".to_string(),
                output_dir: PathBuf::from("data/moodle"),
                allowed_hosts: strings(&["elearning.ovgu.de"]),
                layout: Layout::PerSection,
                include_submissions: false,
                item_path_pattern: None,
                resource_module_patterns: strings(&[
                    "/mod/resource/view.php",
                    "/mod/folder/view.php",
                ]),
                policy: DownloadPolicy {
                    allow_pdf: true,
                    allow_documents: true,
                    native_fallback: true,
                    ..DownloadPolicy::default()
                },
                login: LoginConfig {
                    path: "/login/index.php".to_string(),
                    submit_selectors: strings(&[
                        "#loginbtn",
                        r#"button[type="submit"]"#,
                        r#"input[type="submit"]"#,
                    ]),
                    consent_selectors: strings(&[r#"button[name="_eventId_proceed"]"#]),
                    ..LoginConfig::default()
                },
                timeouts: Timeouts::default(),
            },
            Platform::Roeselite => Self {
                platform,
                base_url: "https://se.cs.ovgu.de".to_string(),
                start_path: "/assignments".to_string(),
                output_dir: PathBuf::from("data/roeselite"),
                allowed_hosts: strings(&["*.cs.ovgu.de"]),
                layout: Layout::PerPage,
                include_submissions: false,
                item_path_pattern: None,
                resource_module_patterns: Vec::new(),
                policy: DownloadPolicy::default(),
                login: LoginConfig {
                    path: "/users/login".to_string(),
                    submit_selectors: strings(&[
                        r#"input[type="submit"]"#,
                        r#"button[type="submit"]"#,
                    ]),
                    ..LoginConfig::default()
                },
                timeouts: Timeouts::default(),
            },
        }
    }

    /// Parses TOML text over the preset of the platform it names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML, unknown keys or bad values.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        parse_config_str(raw, None)
    }

    /// Parsed base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `base_url` is not an absolute http(s) URL.
    pub fn base(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid("base_url", format!("'{}': {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ConfigError::invalid(
                "base_url",
                format!("'{}' is not an http(s) URL", self.base_url),
            ));
        }
        Ok(url)
    }

    /// Start page URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the base URL or the path is malformed.
    pub fn start_url(&self) -> Result<Url, ConfigError> {
        self.base()?
            .join(&self.start_path)
            .map_err(|e| ConfigError::invalid("start_path", format!("'{}': {e}", self.start_path)))
    }

    /// Login page URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the base URL or the path is malformed.
    pub fn login_url(&self) -> Result<Url, ConfigError> {
        self.base()?
            .join(&self.login.path)
            .map_err(|e| ConfigError::invalid("login.path", format!("'{}': {e}", self.login.path)))
    }

    /// Trusted hosts as a matcher.
    #[must_use]
    pub fn host_allow_list(&self) -> HostAllowList {
        HostAllowList::new(&self.allowed_hosts)
    }

    /// Regex selecting item page paths.
    ///
    /// Moodle module paths may appear anywhere in the path, so installs served
    /// under a sub-path still match.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `item_path_pattern` does not compile
    /// or no Moodle module path is configured.
    pub fn item_path_regex(&self) -> Result<Regex, ConfigError> {
        let pattern = match (&self.item_path_pattern, self.platform) {
            (Some(pattern), _) => pattern.clone(),
            (None, Platform::Roeselite) if self.include_submissions => {
                r"^/(assignment|submission)/view/".to_string()
            }
            (None, Platform::Roeselite) => r"^/assignment/view/".to_string(),
            (None, Platform::Moodle) => {
                let alternatives: Vec<String> = self
                    .resource_module_patterns
                    .iter()
                    .map(|p| p.as_str().trim())
                    .filter(|p| !p.is_empty())
                    .map(regex::escape)
                    .collect();
                if alternatives.is_empty() {
                    return Err(ConfigError::invalid(
                        "resource_module_patterns",
                        "at least one module path is required",
                    ));
                }
                format!("({})", alternatives.join("|"))
            }
        };
        Regex::new(&pattern).map_err(|e| ConfigError::invalid("item_path_pattern", e.to_string()))
    }

    /// Validates values against runtime constraints.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.start_url()?;
        self.login_url()?;

        if self.allowed_hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "allowed_hosts",
                "at least one trusted host is required",
            ));
        }
        if self.host_allow_list().is_empty() {
            return Err(ConfigError::invalid(
                "allowed_hosts",
                "no entry is a valid host, host:port or *.domain pattern",
            ));
        }

        if !(1..=10).contains(&self.login.max_attempts) {
            return Err(ConfigError::invalid(
                "login.max_attempts",
                format!("{}. Expected range: 1..=10", self.login.max_attempts),
            ));
        }
        for (field, chain) in [
            ("login.username_selectors", &self.login.username_selectors),
            ("login.password_selectors", &self.login.password_selectors),
            ("login.submit_selectors", &self.login.submit_selectors),
        ] {
            if chain.is_empty() {
                return Err(ConfigError::invalid(field, "at least one selector is required"));
            }
        }

        validate_timeout_secs("timeouts.navigation_secs", self.timeouts.navigation_secs)?;
        validate_timeout_secs("timeouts.request_secs", self.timeouts.request_secs)?;
        validate_timeout_secs("timeouts.click_secs", self.timeouts.click_secs)?;
        validate_timeout_secs("timeouts.settle_secs", self.timeouts.settle_secs)?;
        validate_timeout_secs("timeouts.connect_secs", self.timeouts.connect_secs)?;

        self.item_path_regex()?;
        Ok(())
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(ConfigError::invalid(
            field,
            format!("{value}. Expected range: 1..=3600"),
        ));
    }
    Ok(())
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_config_str(raw: &str, path: Option<&Path>) -> Result<HarvestConfig, ConfigError> {
    let parse_error = |source| ConfigError::Parse {
        path: path.map(Path::to_path_buf),
        source,
    };

    let overlay: toml::Table = toml::from_str(raw).map_err(parse_error)?;
    let platform = match overlay.get("platform") {
        Some(toml::Value::String(name)) => name.parse()?,
        Some(other) => {
            return Err(ConfigError::invalid(
                "platform",
                format!("expected a string, found {}", other.type_str()),
            ));
        }
        None => Platform::default(),
    };

    let mut merged = toml::Table::try_from(HarvestConfig::preset(platform))
        .map_err(|source| ConfigError::Preset { source })?;
    merge_tables(&mut merged, overlay);
    toml::Value::Table(merged)
        .try_into()
        .map_err(parse_error)
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/course-harvester/config.toml`
/// 2. `$HOME/.config/course-harvester/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    default_config_path_from(
        env_var_non_empty_os("XDG_CONFIG_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn default_config_path_from(
    xdg_config_home: Option<std::ffi::OsString>,
    home: Option<std::ffi::OsString>,
) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home {
        return Some(PathBuf::from(xdg).join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME));
    }
    let home = home?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// File the values were read from, if any.
    pub path: Option<PathBuf>,
    /// The configuration.
    pub config: HarvestConfig,
}

/// Loads configuration.
///
/// An explicit `path` must exist. Without one, the default path is used when
/// present, else the preset of `fallback_platform`.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] for unreadable or
/// malformed files.
pub fn load_config(
    path: Option<&Path>,
    fallback_platform: Platform,
) -> Result<LoadedConfig, ConfigError> {
    let candidate = match path {
        Some(explicit) => Some(explicit.to_path_buf()),
        None => resolve_default_config_path().filter(|p| p.exists()),
    };

    let Some(path) = candidate else {
        debug!(platform = %fallback_platform, "no config file, using platform preset");
        return Ok(LoadedConfig {
            path: None,
            config: HarvestConfig::preset(fallback_platform),
        });
    };

    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config = parse_config_str(&raw, Some(&path))?;
    debug!(path = %path.display(), platform = %config.platform, "loaded config file");
    Ok(LoadedConfig {
        path: Some(path),
        config,
    })
}
