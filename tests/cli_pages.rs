use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use predicates::prelude::*;

fn pagewatch(data_dir: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("pagewatch");
    cmd.env("PAGEWATCH_DATA_DIR", data_dir.path())
        .env("PAGEWATCH_DOWNLOAD_DIR", data_dir.path().join("files"))
        .env_remove("PAGEWATCH_WEBHOOK_URL");
    cmd
}

fn spawn_page_server(body: &'static str) -> (String, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
    let base_url = format!("http://{}", server.server_addr());
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let handle = thread::spawn(move || {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(20)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };
            let response = tiny_http::Response::from_string(body).with_header(
                tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/html"[..])
                    .expect("content-type header"),
            );
            let _ = request.respond(response);
        }
    });

    (base_url, shutdown_tx, handle)
}

#[test]
fn page_add_then_list_prints_json_lines() {
    let data_dir = tempfile::TempDir::new().unwrap();

    pagewatch(&data_dir)
        .args([
            "page",
            "add",
            "--url",
            "https://example.com/minutes",
            "--name",
            "Minutes",
            "--frequency",
            "daily",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""id":1"#))
        .stdout(predicate::str::contains(r#""frequency":"daily""#));

    pagewatch(&data_dir)
        .args(["page", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""url":"https://example.com/minutes""#))
        .stdout(predicate::str::contains(r#""is_active":true"#));

    assert!(data_dir.path().join("pagewatch.json").exists());
}

#[test]
fn duplicate_url_is_rejected() {
    let data_dir = tempfile::TempDir::new().unwrap();
    let add = ["page", "add", "--url", "https://example.com/minutes"];

    pagewatch(&data_dir).args(add).assert().success();
    pagewatch(&data_dir)
        .args(add)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn unknown_frequency_is_rejected() {
    let data_dir = tempfile::TempDir::new().unwrap();

    pagewatch(&data_dir)
        .args([
            "page",
            "add",
            "--url",
            "https://example.com/minutes",
            "--frequency",
            "fortnightly",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid frequency"));
}

#[test]
fn check_of_unknown_page_fails() {
    let data_dir = tempfile::TempDir::new().unwrap();

    pagewatch(&data_dir)
        .args(["check", "--id", "42"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("page not found: 42"));
}

#[test]
fn update_and_remove_page() {
    let data_dir = tempfile::TempDir::new().unwrap();

    pagewatch(&data_dir)
        .args([
            "page",
            "add",
            "--url",
            "https://example.com/minutes",
            "--selector",
            "#content",
        ])
        .assert()
        .success();

    pagewatch(&data_dir)
        .args([
            "page",
            "update",
            "--id",
            "1",
            "--clear-selector",
            "--active",
            "false",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""css_selector":null"#))
        .stdout(predicate::str::contains(r#""is_active":false"#));

    pagewatch(&data_dir)
        .args(["page", "remove", "--id", "1"])
        .assert()
        .success();

    pagewatch(&data_dir)
        .args(["page", "list"])
        .assert()
        .success()
        .stdout("");

    pagewatch(&data_dir)
        .args(["changes", "--page-id", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("page not found: 1"));
}

#[test]
fn check_prints_outcome_and_records_change() {
    let data_dir = tempfile::TempDir::new().unwrap();
    let (base_url, shutdown_tx, handle) =
        spawn_page_server("<html><body><p>Agenda posted.</p></body></html>");
    let url = format!("{base_url}/agenda");

    pagewatch(&data_dir)
        .args(["page", "add", "--url", &url])
        .assert()
        .success();

    pagewatch(&data_dir)
        .args(["check", "--id", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"changed""#))
        .stdout(predicate::str::contains(r#""change_id":1"#));

    pagewatch(&data_dir)
        .args(["check", "--id", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"unchanged""#));

    pagewatch(&data_dir)
        .args(["changes", "--page-id", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""change_type":"content_changed""#));

    let _ = shutdown_tx.send(());
    let _ = handle.join();
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() {
    let data_dir = tempfile::TempDir::new().unwrap();

    pagewatch(&data_dir)
        .env("RUST_LOG", "debug")
        .args(["page", "list"])
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}
