//! Course Harvester Core Library
//!
//! Logs in to a course platform (Moodle or Roeselite), walks its item pages
//! and saves the attachments it is allowed to download.
//!
//! # Architecture
//!
//! - [`config`] - run configuration, TOML loading and platform presets
//! - [`filter`] - host allow-list and download policy rules
//! - [`page`] - the page capability and its HTTP implementation
//! - [`platform`] - Moodle and Roeselite DOM heuristics
//! - [`auth`] - form login and cookie import
//! - [`download`] - download strategies and filename allocation
//! - [`traversal`] - the driver tying everything together

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod download;
pub mod filter;
pub mod page;
pub mod platform;
pub mod traversal;
mod user_agent;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use config::{HarvestConfig, Platform};
pub use download::{DownloadOutcome, DownloadRequest, Downloader, FilenameArbiter};
pub use filter::{HostAllowList, ResourceFilter};
pub use page::{HttpPage, Page, PageError};
pub use traversal::{CancelFlag, HarvestError, Harvester, RunSummary};
