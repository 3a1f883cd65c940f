//! End-to-end tests for the orchestrator: discovery, queue draining,
//! fault isolation, run history, and notifications.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use cwsf::config::watcher::ConfigEvent;
use cwsf::domain::config::SiteConfig;
use cwsf::domain::models::RunStatus;
use cwsf::repository::run_history::RunHistoryStore;
use cwsf::service::orchestrator::Orchestrator;

const BOOKS_PAGE: &str = r#"
    <html><body>
        <article class="book"><h2>  Dune  </h2><span class="price">$9.99</span></article>
        <article class="book"><h2>  Neuromancer  </h2><span class="price">$12.50</span></article>
    </body></html>
"#;

fn write_config(dir: &Path, name: &str, content: &str) {
    let mut file = std::fs::File::create(dir.join(name)).unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

fn good_site_yaml(site: &str, base_url: &str, destination: &str) -> String {
    format!(
        r#"
version: "1.0"
site_name: {site}
base_url: "{base_url}"
rate_limit:
  delay_seconds: 0.001
  max_concurrent: 4
retry:
  max_retries: 0
  backoff_factor: 0.01
output:
  format: sqlite
  destination: "{destination}"
  mode: append
selectors:
  container: "article.book"
  fields:
    title:
      selector: "h2::text"
      kind: css
      transform: strip
    price:
      selector: "span.price::text"
      kind: css
      transform: regex
      transform_pattern: "([0-9.]+)"
"#
    )
}

#[tokio::test]
async fn per_site_fault_isolation_and_history() {
    let mut server = mockito::Server::new_async().await;
    let _ok_page = server
        .mock("GET", "/good")
        .with_status(200)
        .with_body(BOOKS_PAGE)
        .create_async()
        .await;
    let _bad_page = server
        .mock("GET", "/bad")
        .with_status(200)
        .with_body(BOOKS_PAGE)
        .create_async()
        .await;

    let config_dir = tempfile::TempDir::new().unwrap();
    let output_dir = tempfile::TempDir::new().unwrap();
    let destination = output_dir.path().to_str().unwrap();

    write_config(
        config_dir.path(),
        "good.yaml",
        &good_site_yaml("good_site", &format!("{}/good", server.url()), destination),
    );
    // An invalid container selector makes every page a parse error.
    write_config(
        config_dir.path(),
        "bad.yaml",
        &format!(
            r#"
version: "1.0"
site_name: bad_site
base_url: "{}/bad"
rate_limit:
  delay_seconds: 0.001
  max_concurrent: 4
retry:
  max_retries: 0
  backoff_factor: 0.01
output:
  format: sqlite
  destination: "{destination}"
  mode: append
selectors:
  container: "li[unclosed"
  fields:
    title:
      selector: "h2::text"
      kind: css
"#,
            server.url()
        ),
    );

    let meta_db = output_dir.path().join("meta.db");
    let mut orchestrator = Orchestrator::new(config_dir.path(), BTreeMap::new(), &meta_db)
        .await
        .unwrap();
    let summary = orchestrator.run_once(None).await.unwrap();

    // The bad site fails; the good one is unaffected.
    assert_eq!(summary.total_sites, 2);
    assert_eq!(summary.sites_succeeded, 1);
    assert_eq!(summary.sites_failed, 1);
    assert_eq!(summary.total_records, 2);
    assert!(summary.failed_sites.contains_key("bad_site"));

    assert!(output_dir.path().join("good_site.db").exists());

    // Both runs are persisted.
    let store = RunHistoryStore::open(&meta_db).await.unwrap();
    let latest = store.latest_runs().await.unwrap();
    assert_eq!(latest.len(), 2);
    let bad = latest.iter().find(|r| r.site_name == "bad_site").unwrap();
    assert_eq!(bad.status, RunStatus::Failed);
    assert_eq!(bad.records_count, 0);
    assert!(bad.last_error.is_some());
    let good = latest.iter().find(|r| r.site_name == "good_site").unwrap();
    assert_eq!(good.status, RunStatus::Success);
    assert_eq!(good.records_count, 2);
}

#[tokio::test]
async fn single_site_filter_rejects_unknown_site() {
    let mut server = mockito::Server::new_async().await;
    let _page = server
        .mock("GET", "/good")
        .with_status(200)
        .with_body(BOOKS_PAGE)
        .create_async()
        .await;

    let config_dir = tempfile::TempDir::new().unwrap();
    let output_dir = tempfile::TempDir::new().unwrap();
    write_config(
        config_dir.path(),
        "good.yaml",
        &good_site_yaml(
            "known_site",
            &format!("{}/good", server.url()),
            output_dir.path().to_str().unwrap(),
        ),
    );

    let meta_db = output_dir.path().join("meta.db");
    let mut orchestrator = Orchestrator::new(config_dir.path(), BTreeMap::new(), &meta_db)
        .await
        .unwrap();

    let err = orchestrator.run_once(Some("missing")).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("missing"));
    assert!(message.contains("known_site"));
}

#[tokio::test]
async fn retry_exhaustion_notifies_and_fails_the_run() {
    let mut server = mockito::Server::new_async().await;
    let page_mock = server
        .mock("GET", "/flaky")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;
    // One error notification for the failure context plus one run summary.
    let gotify_mock = server
        .mock("POST", "/message")
        .match_header("x-gotify-key", "tok")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let config_dir = tempfile::TempDir::new().unwrap();
    let output_dir = tempfile::TempDir::new().unwrap();
    write_config(
        config_dir.path(),
        "flaky.yaml",
        &format!(
            r#"
version: "1.0"
site_name: flaky_site
base_url: "{url}/flaky"
rate_limit:
  delay_seconds: 0.001
  max_concurrent: 4
retry:
  max_retries: 2
  backoff_factor: 0.05
gotify:
  server_url: "{url}"
  app_token: "tok"
  priority: 5
output:
  format: sqlite
  destination: "{destination}"
  mode: append
selectors:
  container: "article.book"
  fields:
    title:
      selector: "h2::text"
      kind: css
"#,
            url = server.url(),
            destination = output_dir.path().to_str().unwrap()
        ),
    );

    let meta_db = output_dir.path().join("meta.db");
    let mut orchestrator = Orchestrator::new(config_dir.path(), BTreeMap::new(), &meta_db)
        .await
        .unwrap();
    let summary = orchestrator.run_once(None).await.unwrap();

    page_mock.assert_async().await;
    gotify_mock.assert_async().await;
    assert_eq!(summary.sites_failed, 1);
    assert_eq!(summary.total_records, 0);

    let store = RunHistoryStore::open(&meta_db).await.unwrap();
    let history = store.site_history("flaky_site", 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn rejected_config_retains_existing_job() {
    let config_dir = tempfile::TempDir::new().unwrap();
    let output_dir = tempfile::TempDir::new().unwrap();
    let meta_db = output_dir.path().join("meta.db");
    let mut orchestrator = Orchestrator::new(config_dir.path(), BTreeMap::new(), &meta_db)
        .await
        .unwrap();

    let config = SiteConfig::from_value(&serde_json::json!({
        "version": "1.0",
        "site_name": "s4",
        "base_url": "http://example.com",
        "selectors": {"container": "div", "fields": {"a": {"selector": "b", "kind": "css"}}}
    }))
    .unwrap();
    let path = config_dir.path().join("s4.yaml");

    orchestrator.handle_config_event(ConfigEvent::Validated {
        path: path.clone(),
        config: config.clone(),
    });
    assert_eq!(orchestrator.queue().size(), 1);

    // A later invalid revision leaves the queued job untouched.
    orchestrator.handle_config_event(ConfigEvent::Rejected {
        path: path.clone(),
        errors: Vec::new(),
    });
    assert_eq!(orchestrator.queue().size(), 1);
    let jobs = orchestrator.queue().list_jobs();
    assert_eq!(jobs[0].site_name, "s4");

    // Restoring a valid config replaces the job in place.
    let mut restored = config.clone();
    restored.base_url = "http://example.com/v2".to_string();
    orchestrator.handle_config_event(ConfigEvent::Validated {
        path: path.clone(),
        config: restored,
    });
    assert_eq!(orchestrator.queue().size(), 1);
    let job = orchestrator.queue().dequeue().unwrap();
    assert_eq!(job.config.base_url, "http://example.com/v2");

    // Removing the file drops the (now running) job via cancellation.
    orchestrator.handle_config_event(ConfigEvent::Removed { path });
    assert!(orchestrator.queue().is_cancelled("s4"));
}
