//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use harvester_core::config::{HarvestConfig, Platform, StrategyKind};

/// Log in to a course platform and download the attachments of its pages.
///
/// Values come from the platform preset, then the config file, then these
/// flags. Credentials are read from HARVESTER_USERNAME and HARVESTER_PASSWORD.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/course-harvester/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Platform preset used when no config file is found (moodle, roeselite)
    #[arg(short, long, default_value_t = Platform::Moodle)]
    pub platform: Platform,

    /// Root of the output tree
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Start page path, relative to the base URL
    #[arg(long, value_name = "PATH")]
    pub start_path: Option<String>,

    /// Download strategy (request-only, click-only, auto)
    #[arg(short, long)]
    pub strategy: Option<StrategyKind>,

    /// Trusted download host; repeat to add more (replaces configured hosts)
    #[arg(long = "allow-host", value_name = "HOST")]
    pub allow_hosts: Vec<String>,

    /// Netscape cookie file to seed the session with
    #[arg(long, value_name = "PATH")]
    pub cookies: Option<PathBuf>,

    /// Never submit the login form; rely on --cookies
    #[arg(long)]
    pub no_login: bool,

    /// Overwrite files that already exist
    #[arg(long)]
    pub replace_existing: bool,

    /// Write url.txt into every page folder
    #[arg(long)]
    pub url_marker: bool,

    /// Also download PDFs
    #[arg(long)]
    pub pdf: bool,

    /// Also download images
    #[arg(long)]
    pub images: bool,

    /// Roeselite: also visit submission pages
    #[arg(long)]
    pub include_submissions: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    /// Log level implied by -q / -v when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Applies flag overrides on top of file and preset values.
    pub fn apply_overrides(&self, config: &mut HarvestConfig) {
        if let Some(dir) = &self.output_dir {
            config.output_dir.clone_from(dir);
        }
        if let Some(path) = &self.start_path {
            config.start_path.clone_from(path);
        }
        if let Some(strategy) = self.strategy {
            config.policy.strategy = strategy;
        }
        if !self.allow_hosts.is_empty() {
            config.allowed_hosts.clone_from(&self.allow_hosts);
        }
        config.policy.replace_existing |= self.replace_existing;
        config.policy.write_url_marker |= self.url_marker;
        config.policy.allow_pdf |= self.pdf;
        config.policy.allow_images |= self.images;
        config.include_submissions |= self.include_submissions;
    }
}
