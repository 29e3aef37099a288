//! User-Agent string for the page session.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/course-harvester";

/// Default User-Agent for page and download requests (identifies the tool).
#[must_use]
pub(crate) fn default_session_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("course-harvester/{version} (coursework-archiver; +{PROJECT_UA_URL})")
}
