//! Timeouts shared by the page session and the download strategies.

use std::time::Duration;

/// HTTP connect timeout for the page session (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Bound on a single page navigation (30 seconds).
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a direct request through the page session (30 seconds).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on waiting for a click-triggered file transfer (30 seconds).
pub const CLICK_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on waiting for the page to settle before clicking (5 seconds).
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
