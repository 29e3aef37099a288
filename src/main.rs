//! CLI entry point for the harvester.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::auth::{Credentials, FormLogin, SelectorChain, load_cookie_file};
use harvester_core::config::{HarvestConfig, load_config};
use harvester_core::page::HttpPage;
use harvester_core::platform::collector_for;
use harvester_core::traversal::{CancelFlag, Harvester, RunSummary};
use reqwest::cookie::Jar;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

/// Process outcome, mapped to the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    /// Nothing failed.
    Success,
    /// Some files were saved, some failed.
    Partial,
    /// Nothing was saved and something failed, or the run aborted.
    Failure,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Partial => ExitCode::from(1),
            ProcessExit::Failure => ExitCode::from(2),
        }
    }
}

fn determine_exit_outcome(summary: &RunSummary) -> ProcessExit {
    if summary.cancelled {
        ProcessExit::Failure
    } else if !summary.has_failures() {
        ProcessExit::Success
    } else if summary.files_saved > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.default_log_level()));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();

    match run(args).await {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("error: {e:#}");
            ProcessExit::Failure.into()
        }
    }
}

async fn run(args: Args) -> Result<ProcessExit> {
    debug!(?args, "CLI arguments parsed");

    let loaded = load_config(args.config.as_deref(), args.platform)
        .context("failed to load configuration")?;
    let mut config = loaded.config;
    args.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    if args.print_config {
        let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
        print!("{rendered}");
        return Ok(ProcessExit::Success);
    }

    info!(
        platform = %config.platform,
        config = ?loaded.path,
        output = %config.output_dir.display(),
        strategy = %config.policy.strategy,
        "harvester starting"
    );

    let jar = match &args.cookies {
        Some(path) => load_cookie_file(path)
            .with_context(|| format!("failed to load cookies from {}", path.display()))?,
        None => Arc::new(Jar::default()),
    };
    let mut page = HttpPage::with_cookie_jar(jar, config.timeouts.connect())
        .and_then(|page| page.with_trusted_hosts(config.host_allow_list()))
        .context("failed to create HTTP session")?
        .with_action_timeout(config.timeouts.navigation());

    let collector = collector_for(&config).context("invalid platform settings")?;
    let mut harvester = Harvester::new(&config, collector)?;
    if let Some(login) = form_login(&config, args.no_login)? {
        harvester = harvester.with_login(Box::new(login));
    }

    let cancel = CancelFlag::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current page");
            signal.cancel();
        }
    });
    let harvester = harvester.with_cancel_flag(cancel);

    let summary = harvester.run(&mut page).await?;
    println!("{summary}");
    if summary.cancelled {
        warn!("Interrupted. Run again to continue; existing files are kept.");
    }
    Ok(determine_exit_outcome(&summary))
}

/// Form login from the environment, unless disabled.
///
/// Missing credentials are not an error here: a cookie-seeded session may
/// not need them, and the driver reports an authentication failure if it does.
fn form_login(config: &HarvestConfig, disabled: bool) -> Result<Option<FormLogin>> {
    if disabled {
        debug!("form login disabled");
        return Ok(None);
    }
    let credentials = match Credentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            debug!(error = %e, "no credentials, form login unavailable");
            return Ok(None);
        }
    };
    let login = &config.login;
    let url = config.login_url().context("invalid login path")?;
    Ok(Some(
        FormLogin::new(url, credentials, config.timeouts.navigation())
            .with_fields(
                SelectorChain::new(&login.username_selectors),
                SelectorChain::new(&login.password_selectors),
                SelectorChain::new(&login.submit_selectors),
            )
            .with_consent(SelectorChain::new(&login.consent_selectors)),
    ))
}
