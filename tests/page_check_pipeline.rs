use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pagewatch::app::dispatcher::{InProcessJobDispatcher, JobDispatcher};
use pagewatch::app::queue::InProcessQueue;
use pagewatch::app::runner::{CheckError, CheckRunner, CheckStatus};
use pagewatch::app::scheduler::Scheduler;
use pagewatch::detect::ChangeDetector;
use pagewatch::download::Downloader;
use pagewatch::fetch::{Fetcher, build_client};
use pagewatch::fingerprint::{fingerprint, sha256_hex};
use pagewatch::model::{ChangeDetails, ChangeId, Frequency, MonitoredPage, NewPage, PageId};
use pagewatch::notify::{ChangeEvent, Notifier, NotifierSet};
use pagewatch::store::{JsonStore, Store, StoreError};

const B1: &str = r#"<!doctype html>
<html>
  <body>
    <h1>Council minutes</h1>
    <p>No documents yet.</p>
  </body>
</html>
"#;

const B2: &str = r#"<!doctype html>
<html>
  <body>
    <h1>Council minutes</h1>
    <p>The quarterly report is out.</p>
    <a href="/files/report.pdf">Quarterly report</a>
  </body>
</html>
"#;

static REPORT_PDF: &[u8] = b"%PDF-1.4\n1 0 obj << /Type /Catalog >> endobj\ntrailer << /Root 1 0 R >>\n%%EOF\n";

#[derive(Clone)]
struct Route {
    status: u16,
    body: Vec<u8>,
    content_type: &'static str,
    etag: Option<&'static str>,
}

impl Route {
    fn html(body: &str) -> Self {
        Self {
            status: 200,
            body: body.as_bytes().to_vec(),
            content_type: "text/html; charset=utf-8",
            etag: None,
        }
    }

    fn pdf(body: &[u8]) -> Self {
        Self {
            status: 200,
            body: body.to_vec(),
            content_type: "application/pdf",
            etag: None,
        }
    }

    fn with_etag(mut self, etag: &'static str) -> Self {
        self.etag = Some(etag);
        self
    }
}

/// tiny_http server whose routes can be swapped between checks.
struct TestServer {
    base_url: String,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    if_none_match: Arc<Mutex<Vec<(String, String)>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}", server.server_addr());

        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::default();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let if_none_match: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = {
            let routes = Arc::clone(&routes);
            let hits = Arc::clone(&hits);
            let if_none_match = Arc::clone(&if_none_match);
            thread::spawn(move || {
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                    let request = match server.recv_timeout(Duration::from_millis(20)) {
                        Ok(Some(req)) => req,
                        Ok(None) => continue,
                        Err(_) => break,
                    };

                    let path = request
                        .url()
                        .split('?')
                        .next()
                        .unwrap_or_default()
                        .to_owned();
                    *hits.lock().unwrap().entry(path.clone()).or_default() += 1;

                    let validator = request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("If-None-Match"))
                        .map(|h| h.value.as_str().to_owned());
                    if let Some(value) = &validator {
                        if_none_match
                            .lock()
                            .unwrap()
                            .push((path.clone(), value.clone()));
                    }

                    let route = routes.lock().unwrap().get(&path).cloned();
                    let response = match route {
                        None => tiny_http::Response::from_data(b"not found".to_vec())
                            .with_status_code(404),
                        Some(route) if route.etag.is_some() && validator.as_deref() == route.etag => {
                            tiny_http::Response::from_data(Vec::new()).with_status_code(304)
                        }
                        Some(route) => {
                            let mut response = tiny_http::Response::from_data(route.body)
                                .with_status_code(route.status)
                                .with_header(
                                    tiny_http::Header::from_bytes(
                                        &b"Content-Type"[..],
                                        route.content_type.as_bytes(),
                                    )
                                    .expect("content-type header"),
                                );
                            if let Some(etag) = route.etag {
                                response = response.with_header(
                                    tiny_http::Header::from_bytes(&b"ETag"[..], etag.as_bytes())
                                        .expect("etag header"),
                                );
                            }
                            response
                        }
                    };
                    let _ = request.respond(response);
                }
            })
        };

        Self {
            base_url,
            routes,
            hits,
            if_none_match,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn set(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(path.to_owned(), route);
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn validators_seen(&self) -> Vec<(String, String)> {
        self.if_none_match.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<(PageId, ChangeId, usize)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> &str {
        "recording"
    }

    async fn notify(&self, event: &ChangeEvent<'_>) -> anyhow::Result<bool> {
        self.events
            .lock()
            .unwrap()
            .push((event.page.id, event.change.id, event.files.len()));
        Ok(true)
    }
}

struct Harness {
    store: Arc<dyn Store>,
    runner: Arc<CheckRunner>,
    notifier: Arc<RecordingNotifier>,
    downloads: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let store: Arc<dyn Store> = Arc::new(JsonStore::in_memory());
        let downloads = tempfile::TempDir::new().expect("create download dir");
        let client = build_client("pagewatch-test", Duration::from_secs(5)).expect("http client");
        let notifier = Arc::new(RecordingNotifier::default());
        let channel: Arc<dyn Notifier> = notifier.clone();
        let runner = CheckRunner::new(
            Arc::clone(&store),
            ChangeDetector::new(Fetcher::with_client(client.clone())),
            Downloader::new(client, downloads.path(), 4),
            NotifierSet::new(vec![channel]),
        );
        Self {
            store,
            runner: Arc::new(runner),
            notifier,
            downloads,
        }
    }

    async fn add_page(&self, name: Option<&str>, url: String) -> MonitoredPage {
        self.store
            .create_page(NewPage {
                name: name.map(str::to_owned),
                url,
                css_selector: None,
                frequency: Frequency::Hourly,
                is_active: true,
            })
            .await
            .expect("create page")
    }

    async fn page(&self, page_id: PageId) -> MonitoredPage {
        self.store
            .get_page(page_id)
            .await
            .expect("load page")
            .expect("page exists")
    }
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() { count_files(&path) } else { 1 }
        })
        .sum()
}

#[tokio::test]
async fn change_then_idempotent_check_then_file_download() {
    let server = TestServer::start();
    server.set("/minutes", Route::html(B1));
    let h = Harness::new();
    let page = h
        .add_page(Some("Council Minutes"), server.url("/minutes"))
        .await;

    let first = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(first.status, CheckStatus::Changed);
    assert!(first.changed);
    assert_eq!(first.files_found, 0);
    assert_eq!(first.files_downloaded, 0);
    assert_eq!(h.store.list_changes(page.id).await.unwrap().len(), 1);
    let after_first = h.page(page.id).await;
    assert_eq!(
        after_first.last_content_hash.as_deref(),
        Some(fingerprint(B1, None).as_str())
    );
    assert!(after_first.last_checked_at.is_some());
    assert!(after_first.last_changed_at.is_some());

    let second = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(second.status, CheckStatus::Unchanged);
    assert!(!second.changed);
    assert_eq!(second.change_id, None);
    assert_eq!(h.store.list_changes(page.id).await.unwrap().len(), 1);
    assert_eq!(h.page(page.id).await.last_changed_at, after_first.last_changed_at);

    server.set("/minutes", Route::html(B2));
    server.set("/files/report.pdf", Route::pdf(REPORT_PDF));
    let third = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(third.status, CheckStatus::Changed);
    assert_eq!(third.files_found, 1);
    assert_eq!(third.files_downloaded, 1);
    assert_eq!(third.notifications.get("recording"), Some(&true));

    let changes = h.store.list_changes(page.id).await.unwrap();
    assert_eq!(changes.len(), 2);
    let latest = changes
        .iter()
        .find(|c| Some(c.id) == third.change_id)
        .expect("latest change recorded");
    let details: ChangeDetails =
        serde_json::from_str(latest.details.as_deref().expect("details")).unwrap();
    assert_eq!(details.previous_hash, Some(fingerprint(B1, None)));
    assert_eq!(details.new_hash, fingerprint(B2, None));

    let files = h.store.list_files(page.id).await.unwrap();
    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert_eq!(file.original_url, server.url("/files/report.pdf"));
    assert_eq!(file.original_filename, "report.pdf");
    assert_eq!(file.content_hash.as_deref(), Some(sha256_hex(REPORT_PDF).as_str()));
    assert_eq!(file.file_size, REPORT_PDF.len() as u64);
    assert_eq!(file.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(file.change_id, third.change_id);

    let stored = Path::new(&file.stored_path);
    assert!(stored.starts_with(h.downloads.path().join("Council_Minutes")));
    assert!(stored.extension().is_some_and(|ext| ext == "pdf"));
    assert_eq!(std::fs::read(stored).unwrap(), REPORT_PDF);

    let events = h.notifier.events.lock().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], (page.id, latest.id, 1));
}

#[tokio::test]
async fn recorded_file_urls_are_not_fetched_again() {
    let server = TestServer::start();
    server.set("/minutes", Route::html(B2));
    server.set("/files/report.pdf", Route::pdf(REPORT_PDF));
    server.set("/files/agenda.docx", Route::pdf(b"agenda bytes"));
    let h = Harness::new();
    let page = h.add_page(None, server.url("/minutes")).await;

    let first = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(first.files_downloaded, 1);
    assert_eq!(server.hits("/files/report.pdf"), 1);

    server.set(
        "/minutes",
        Route::html(
            r#"<html><body>
              <a href="/files/report.pdf">Quarterly report</a>
              <a href="/files/agenda.docx">Agenda</a>
            </body></html>"#,
        ),
    );
    let second = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(second.status, CheckStatus::Changed);
    assert_eq!(second.files_found, 2);
    assert_eq!(second.files_downloaded, 1);
    assert_eq!(server.hits("/files/report.pdf"), 1);
    assert_eq!(server.hits("/files/agenda.docx"), 1);

    let files = h.store.list_files(page.id).await.unwrap();
    assert_eq!(files.len(), 2);
    let host_dir = h
        .downloads
        .path()
        .join(pagewatch::download::page_dir_name(&page));
    assert_eq!(count_files(&host_dir), 2);
}

#[tokio::test]
async fn identical_bytes_under_two_urls_record_one_file() {
    let server = TestServer::start();
    server.set(
        "/minutes",
        Route::html(
            r#"<html><body>
              <a href="/a/report.pdf">Report</a>
              <a href="/b/report-copy.pdf">Report (mirror)</a>
            </body></html>"#,
        ),
    );
    server.set("/a/report.pdf", Route::pdf(REPORT_PDF));
    server.set("/b/report-copy.pdf", Route::pdf(REPORT_PDF));
    let h = Harness::new();
    let page = h.add_page(Some("mirrors"), server.url("/minutes")).await;

    let outcome = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(outcome.files_found, 2);
    assert_eq!(outcome.files_downloaded, 1);

    let files = h.store.list_files(page.id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].content_hash.as_deref(), Some(sha256_hex(REPORT_PDF).as_str()));
    assert_eq!(count_files(h.downloads.path()), 1);
}

#[tokio::test]
async fn failed_download_leaves_change_detected() {
    let server = TestServer::start();
    server.set(
        "/minutes",
        Route::html(
            r#"<html><body>
              <a href="/files/missing.pdf">Gone</a>
              <a href="/files/report.pdf">Report</a>
            </body></html>"#,
        ),
    );
    server.set("/files/report.pdf", Route::pdf(REPORT_PDF));
    let h = Harness::new();
    let page = h.add_page(None, server.url("/minutes")).await;

    let outcome = h.runner.check_page(page.id).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.files_found, 2);
    assert_eq!(outcome.files_downloaded, 1);
    assert_eq!(server.hits("/files/missing.pdf"), 1);
    assert_eq!(h.store.list_files(page.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn validators_are_sent_and_not_modified_is_no_content() {
    let server = TestServer::start();
    server.set("/minutes", Route::html(B1).with_etag("\"v1\""));
    let h = Harness::new();
    let page = h.add_page(None, server.url("/minutes")).await;

    let first = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(first.status, CheckStatus::Changed);
    let after_first = h.page(page.id).await;
    assert_eq!(after_first.last_etag.as_deref(), Some("\"v1\""));
    assert!(server.validators_seen().is_empty());

    let second = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(second.status, CheckStatus::NoContent);
    assert!(!second.changed);
    assert_eq!(
        server.validators_seen(),
        vec![("/minutes".to_owned(), "\"v1\"".to_owned())]
    );

    let after_second = h.page(page.id).await;
    assert_eq!(after_second.last_etag.as_deref(), Some("\"v1\""));
    assert_eq!(after_second.last_content_hash, after_first.last_content_hash);
    assert!(after_second.last_checked_at >= after_first.last_checked_at);
    assert_eq!(h.store.list_changes(page.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unreachable_page_counts_as_no_content() {
    let server = TestServer::start();
    let h = Harness::new();
    let page = h.add_page(None, server.url("/gone")).await;

    let outcome = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(outcome.status, CheckStatus::NoContent);
    let page = h.page(page.id).await;
    assert!(page.last_checked_at.is_some());
    assert!(page.last_content_hash.is_none());
    assert!(h.store.list_changes(page.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn inactive_page_is_skipped_without_fetching() {
    let server = TestServer::start();
    server.set("/minutes", Route::html(B1));
    let h = Harness::new();
    let page = h
        .store
        .create_page(NewPage {
            name: None,
            url: server.url("/minutes"),
            css_selector: None,
            frequency: Frequency::Daily,
            is_active: false,
        })
        .await
        .unwrap();

    let outcome = h.runner.check_page(page.id).await.unwrap();
    assert_eq!(outcome.status, CheckStatus::Skipped);
    assert_eq!(server.hits("/minutes"), 0);
    assert!(h.page(page.id).await.last_checked_at.is_none());
}

#[tokio::test]
async fn deleting_a_page_removes_its_history() {
    let server = TestServer::start();
    server.set("/minutes", Route::html(B2));
    server.set("/files/report.pdf", Route::pdf(REPORT_PDF));
    let h = Harness::new();
    let page = h.add_page(None, server.url("/minutes")).await;

    h.runner.check_page(page.id).await.unwrap();
    let file_id = h.store.list_files(page.id).await.unwrap()[0].id;

    h.store.delete_page(page.id).await.unwrap();
    assert!(matches!(
        h.store.list_changes(page.id).await,
        Err(StoreError::PageNotFound(id)) if id == page.id
    ));
    assert!(matches!(
        h.store.list_files(page.id).await,
        Err(StoreError::PageNotFound(_))
    ));
    assert!(h.store.get_file(file_id).await.unwrap().is_none());
    assert!(matches!(
        h.runner.check_page(page.id).await,
        Err(CheckError::PageNotFound(id)) if id == page.id
    ));

    let again = h.add_page(None, server.url("/minutes")).await;
    assert_ne!(again.id, page.id);
    assert!(h.store.list_files(again.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn scheduler_tick_runs_due_pages_through_the_dispatcher() {
    let server = TestServer::start();
    server.set("/due", Route::html(B1));
    server.set("/fresh", Route::html(B1));
    let h = Harness::new();
    let due = h.add_page(None, server.url("/due")).await;
    let fresh = h.add_page(None, server.url("/fresh")).await;
    h.runner.check_page(fresh.id).await.unwrap();
    assert_eq!(server.hits("/fresh"), 1);

    let dispatcher: Arc<dyn JobDispatcher> = Arc::new(InProcessJobDispatcher::new(
        InProcessQueue::new(2),
        Arc::clone(&h.runner),
    ));
    let scheduler = Scheduler::new(Arc::clone(&h.store), dispatcher, Duration::from_secs(60));

    let summary = scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.scheduled, 1);
    assert_eq!(summary.skipped, 1);

    let mut checked = false;
    for _ in 0..200 {
        if h.page(due.id).await.last_checked_at.is_some() {
            checked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(checked, "due page was never checked");
    assert_eq!(server.hits("/due"), 1);
    assert_eq!(server.hits("/fresh"), 1);
}
