//! Integration tests for the download strategies.
//!
//! These tests drive a real `HttpPage` session against mock HTTP servers.

mod support;

use std::path::Path;
use std::sync::Arc;

use harvester_core::config::{FallbackOrder, StrategyKind, Timeouts};
use harvester_core::download::{
    DownloadContext, DownloadOutcome, DownloadRequest, FailureKind, FilenameArbiter, SkipReason,
    create_downloader,
};
use harvester_core::filter::HostAllowList;
use harvester_core::page::{HttpPage, Page, WaitUntil};
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn trusted(server: &MockServer) -> HostAllowList {
    let address = server.address();
    HostAllowList::new([format!("{}:{}", address.ip(), address.port())])
}

fn context(server: &MockServer, replace_existing: bool) -> DownloadContext {
    DownloadContext::new(
        trusted(server),
        Arc::new(FilenameArbiter::new(replace_existing)),
        Timeouts::default(),
    )
}

/// Session set up the way the binary does it.
fn session(server: &MockServer) -> HttpPage {
    HttpPage::new()
        .unwrap()
        .with_trusted_hosts(trusted(server))
        .unwrap()
}

const LOGIN_PAGE: &[u8] = br#"<html><head><title>Log in</title></head><body>
    <form method="post" action="/login/index.php"><input name="username"></form>
</body></html>"#;

fn url(server: &MockServer, route: &str) -> Url {
    Url::parse(&format!("{}{route}", server.uri())).unwrap()
}

async fn mount_file(server: &MockServer, route: &str, content_type: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", content_type)
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

async fn mount_status(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn test_direct_download_preserves_content() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let content = b"%PDF-1.7\nslides for week one\n";
    mount_file(&server, "/files/week1.pdf", "application/pdf", content).await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::RequestOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = HttpPage::new().unwrap();
    let request = DownloadRequest::new(url(&server, "/files/week1.pdf"), dir.path());

    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(outcome.filename(), Some("week1.pdf"));
    assert_eq!(read(&dir.path().join("week1.pdf")), content);
}

#[tokio::test]
async fn test_direct_download_uses_content_disposition_and_title() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/pluginfile.php/7/content"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .insert_header("content-disposition", r#"attachment; filename="Blatt 3.pdf""#)
                .set_body_bytes(b"%PDF-blatt".to_vec()),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::RequestOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = HttpPage::new().unwrap();

    let plain = DownloadRequest::new(url(&server, "/pluginfile.php/7/content"), dir.path());
    let outcome = downloader.download(&mut page, &plain).await;
    assert_eq!(outcome.filename(), Some("Blatt_3.pdf"));

    let titled_dir = dir.path().join("titled");
    let titled = DownloadRequest::new(url(&server, "/pluginfile.php/7/content"), &titled_dir)
        .with_preferred_title(Some("Exercise Sheet 3".to_string()));
    let outcome = downloader.download(&mut page, &titled).await;
    assert_eq!(outcome.filename(), Some("Exercise_Sheet_3.pdf"));
    assert_eq!(read(&titled_dir.join("Exercise_Sheet_3.pdf")), b"%PDF-blatt");
}

#[tokio::test]
async fn test_raw_mode_is_written_as_text() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(
        &server,
        "/ex/blob/README.md",
        "text/plain; charset=utf-8",
        b"# Exercise 1\n\nSolve it.\n",
    )
    .await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::RequestOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = HttpPage::new().unwrap();
    let request = DownloadRequest::new(url(&server, "/ex/blob/README.md?mode=raw"), dir.path());

    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(outcome.filename(), Some("README.md"));
    let text = std::fs::read_to_string(dir.path().join("README.md")).unwrap();
    assert_eq!(text, "# Exercise 1\n\nSolve it.\n");
}

#[tokio::test]
async fn test_click_download_follows_link_on_current_page() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(
        &server,
        "/course/view.php",
        "text/html; charset=utf-8",
        br#"<html><body><a href="/files/lab.zip">Lab archive</a></body></html>"#,
    )
    .await;
    mount_file(&server, "/files/lab.zip", "application/zip", b"PK\x03\x04lab").await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::ClickOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = HttpPage::new().unwrap();
    page.goto(
        &url(&server, "/course/view.php"),
        WaitUntil::Load,
        Timeouts::default().navigation(),
    )
    .await
    .unwrap();

    let request = DownloadRequest::new(url(&server, "/files/lab.zip"), dir.path());
    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(outcome.filename(), Some("lab.zip"));
    assert_eq!(read(&dir.path().join("lab.zip")), b"PK\x03\x04lab");
}

#[tokio::test]
async fn test_click_download_without_marker_fails() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(
        &server,
        "/mod/resource/view.php",
        "text/html",
        b"<html><body><p>Nothing to see here</p></body></html>",
    )
    .await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::ClickOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = HttpPage::new().unwrap();
    let request = DownloadRequest::new(url(&server, "/mod/resource/view.php"), dir.path());

    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(
        outcome,
        DownloadOutcome::Failed(FailureKind::NoDownloadMechanism)
    );
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_auto_falls_back_to_click_after_request_failure() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(
        &server,
        "/course/view.php",
        "text/html",
        br#"<a href="/files/notes.pdf">Notes</a>"#,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/files/notes.pdf"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_file(&server, "/files/notes.pdf", "application/pdf", b"%PDF-notes").await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::Auto,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = HttpPage::new().unwrap();
    page.goto(
        &url(&server, "/course/view.php"),
        WaitUntil::Load,
        Timeouts::default().navigation(),
    )
    .await
    .unwrap();

    let request = DownloadRequest::new(url(&server, "/files/notes.pdf"), dir.path());
    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(outcome.filename(), Some("notes.pdf"));
    assert_eq!(read(&dir.path().join("notes.pdf")), b"%PDF-notes");
}

#[tokio::test]
async fn test_auto_failure_does_not_block_next_attachment() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_status(&server, "/files/missing.pdf", 404).await;
    mount_file(&server, "/files/present.pdf", "application/pdf", b"%PDF-ok").await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::Auto,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = HttpPage::new().unwrap();

    let missing = DownloadRequest::new(url(&server, "/files/missing.pdf"), dir.path());
    let outcome = downloader.download(&mut page, &missing).await;
    assert_eq!(outcome, DownloadOutcome::Failed(FailureKind::HttpStatus(404)));

    let present = DownloadRequest::new(url(&server, "/files/present.pdf"), dir.path());
    let outcome = downloader.download(&mut page, &present).await;
    assert_eq!(outcome.filename(), Some("present.pdf"));
    assert!(!dir.path().join("missing.pdf").exists());
}

#[tokio::test]
async fn test_existing_file_is_kept_unless_replacement_enabled() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(&server, "/files/notes.pdf", "application/pdf", b"%PDF-new").await;

    let dir = TempDir::new().unwrap();
    let existing = dir.path().join("notes.pdf");
    std::fs::write(&existing, b"%PDF-old").unwrap();
    let request = DownloadRequest::new(url(&server, "/files/notes.pdf"), dir.path());
    let mut page = HttpPage::new().unwrap();

    let keep = create_downloader(
        StrategyKind::RequestOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let outcome = keep.download(&mut page, &request).await;
    assert_eq!(outcome, DownloadOutcome::Skipped(SkipReason::AlreadyExists));
    assert_eq!(read(&existing), b"%PDF-old");

    let replace = create_downloader(
        StrategyKind::RequestOnly,
        FallbackOrder::RequestFirst,
        context(&server, true),
    );
    let outcome = replace.download(&mut page, &request).await;
    match outcome {
        DownloadOutcome::Saved(saved) => {
            assert_eq!(saved.path, existing);
            assert!(saved.replaced);
        }
        other => panic!("expected overwrite, got {other:?}"),
    }
    assert_eq!(read(&existing), b"%PDF-new");
}

#[tokio::test]
async fn test_same_name_from_different_resources_is_suffixed() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(&server, "/week1/slides.pdf", "application/pdf", b"%PDF-1").await;
    mount_file(&server, "/week2/slides.pdf", "application/pdf", b"%PDF-2").await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::RequestOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = HttpPage::new().unwrap();

    for route in ["/week1/slides.pdf", "/week2/slides.pdf", "/week1/slides.pdf"] {
        let request = DownloadRequest::new(url(&server, route), dir.path());
        downloader.download(&mut page, &request).await;
    }

    assert_eq!(read(&dir.path().join("slides.pdf")), b"%PDF-1");
    assert_eq!(read(&dir.path().join("slides_2.pdf")), b"%PDF-2");
    assert!(!dir.path().join("slides_3.pdf").exists());
}

#[tokio::test]
async fn test_untrusted_host_is_never_contacted() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"nope".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let ctx = DownloadContext::new(
        HostAllowList::new(["files.example.org"]),
        Arc::new(FilenameArbiter::new(false)),
        Timeouts::default(),
    );
    let downloader = create_downloader(StrategyKind::Auto, FallbackOrder::ClickFirst, ctx);
    let mut page = HttpPage::new().unwrap();
    let request = DownloadRequest::new(url(&server, "/files/a.zip"), dir.path());

    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(outcome, DownloadOutcome::Skipped(SkipReason::UntrustedHost));
}

#[tokio::test]
async fn test_click_skips_same_path_link_on_untrusted_host() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(mirror) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"EVIL".to_vec()))
        .expect(0)
        .mount(&mirror)
        .await;
    let course = format!(
        r#"<html><body>
            <a href="{}/files/lab.zip">Mirror</a>
            <a href="/files/lab.zip">Lab archive</a>
        </body></html>"#,
        mirror.uri()
    );
    mount_file(&server, "/course/view.php", "text/html", course.as_bytes()).await;
    mount_file(&server, "/files/lab.zip", "application/zip", b"PK-trusted").await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::ClickOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = session(&server);
    page.goto(
        &url(&server, "/course/view.php"),
        WaitUntil::Load,
        Timeouts::default().navigation(),
    )
    .await
    .unwrap();

    let request = DownloadRequest::new(url(&server, "/files/lab.zip"), dir.path());
    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(outcome.filename(), Some("lab.zip"));
    assert_eq!(read(&dir.path().join("lab.zip")), b"PK-trusted");
}

#[tokio::test]
async fn test_click_with_only_untrusted_markers_fails() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(mirror) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"EVIL".to_vec()))
        .expect(0)
        .mount(&mirror)
        .await;
    let resource = format!(
        r#"<a class="resourceworkaround" href="{}/pluginfile.php/1/a.pdf">a.pdf</a>"#,
        mirror.uri()
    );
    mount_file(&server, "/mod/resource/view.php", "text/html", resource.as_bytes()).await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::ClickOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = session(&server);
    let request = DownloadRequest::new(url(&server, "/mod/resource/view.php"), dir.path());

    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(
        outcome,
        DownloadOutcome::Failed(FailureKind::NoDownloadMechanism)
    );
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_direct_download_does_not_follow_redirect_to_untrusted_host() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(mirror) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"EVIL".to_vec()))
        .expect(0)
        .mount(&mirror)
        .await;
    let location = format!("{}/payload.zip", mirror.uri());
    Mock::given(method("GET"))
        .and(path("/files/r.zip"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", location.as_str()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::RequestOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let request = DownloadRequest::new(url(&server, "/files/r.zip"), dir.path());

    // with and without an explicit host list on the session
    for mut page in [session(&server), HttpPage::new().unwrap()] {
        let outcome = downloader.download(&mut page, &request).await;
        assert_eq!(outcome, DownloadOutcome::Failed(FailureKind::HttpStatus(302)));
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_direct_download_rejects_login_page_served_for_file() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(&server, "/files/notes.pdf", "text/html; charset=utf-8", LOGIN_PAGE).await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::RequestOnly,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = session(&server);
    let request = DownloadRequest::new(url(&server, "/files/notes.pdf"), dir.path());

    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(
        outcome,
        DownloadOutcome::Failed(FailureKind::NoDownloadMechanism)
    );
    assert!(!dir.path().join("notes.pdf").exists());
}

#[tokio::test]
async fn test_auto_falls_back_to_click_after_login_page() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_file(
        &server,
        "/course/view.php",
        "text/html",
        br#"<a href="/files/notes.pdf">Notes</a>"#,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/files/notes.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_bytes(LOGIN_PAGE.to_vec()),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_file(&server, "/files/notes.pdf", "application/pdf", b"%PDF-notes").await;

    let dir = TempDir::new().unwrap();
    let downloader = create_downloader(
        StrategyKind::Auto,
        FallbackOrder::RequestFirst,
        context(&server, false),
    );
    let mut page = session(&server);
    page.goto(
        &url(&server, "/course/view.php"),
        WaitUntil::Load,
        Timeouts::default().navigation(),
    )
    .await
    .unwrap();

    let request = DownloadRequest::new(url(&server, "/files/notes.pdf"), dir.path());
    let outcome = downloader.download(&mut page, &request).await;

    assert_eq!(outcome.filename(), Some("notes.pdf"));
    assert_eq!(read(&dir.path().join("notes.pdf")), b"%PDF-notes");
}
