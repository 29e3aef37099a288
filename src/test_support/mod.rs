//! Helpers shared by unit tests.

use std::net::TcpListener;

use wiremock::MockServer;

/// Starts a mock server, or returns `None` where localhost sockets are
/// unavailable. `HARVESTER_REQUIRE_SOCKET_TESTS=1` turns the skip into a panic.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return Some(MockServer::start().await);
    }
    let required = std::env::var("HARVESTER_REQUIRE_SOCKET_TESTS")
        .is_ok_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
    assert!(!required, "cannot bind a localhost socket for the mock server");
    eprintln!("cannot bind a localhost socket; skipping mock-server test");
    None
}
