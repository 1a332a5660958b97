//! Integration tests for the fetch engine
//!
//! These tests use wiremock to create mock HTTP servers and run full rounds
//! end-to-end against a crawl database in a temporary directory.

use std::time::Duration;
use sumi_harvest::config::{
    Config, CrawlerConfig, ExtractConfig, FetchConfig, OutputConfig, UserAgentConfig,
    WatchdogConfig,
};
use sumi_harvest::crawler::{AbortReason, Crawler, HtmlLinkExtractor, HttpTransport};
use sumi_harvest::storage::{CrawlDb, MergeStats, RoundStatus, SegmentReader, SegmentSink, SegmentWriter};
use sumi_harvest::{FetchRecord, FetchStatus};
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration crawling `seeds` into `dir`
fn create_test_config(dir: &TempDir, seeds: Vec<String>) -> Config {
    Config {
        crawler: CrawlerConfig {
            threads: 4,
            depth: 1,
            resumable: false,
            top_n: None,
            max_execute_count: 1,
            queue_target_size: 10,
        },
        fetch: FetchConfig {
            max_retries: 0,
            timeout_ms: 5_000,
            connect_timeout_ms: 1_000,
            ..FetchConfig::default()
        },
        watchdog: WatchdogConfig {
            poll_interval_ms: 20,
            spin_wait_ms: 5,
            hang_threshold_ms: 60_000,
            grace_period_ms: 200,
            stale_lock_ms: 60_000,
        },
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: "https://example.com/contact".to_string(),
            contact_email: "test@example.com".to_string(),
        },
        output: OutputConfig {
            crawl_path: dir.path().display().to_string(),
        },
        extract: ExtractConfig::default(),
        seeds,
        forced_seeds: vec![],
    }
}

fn crawler(config: &Config) -> Crawler<HttpTransport, HtmlLinkExtractor> {
    let transport = HttpTransport::new(&config.user_agent, &config.fetch).unwrap();
    Crawler::new(config, transport, HtmlLinkExtractor::new(&config.extract))
}

fn html_page(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        format!("<html><head><title>Test</title></head><body>{}</body></html>", body),
        "text/html",
    )
}

async fn mount_page(server: &MockServer, at: &str, body: &str, calls: u64) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(html_page(body))
        .expect(calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_two_rounds_follow_links() {
    let server = MockServer::start().await;
    let base = server.uri();

    mount_page(
        &server,
        "/",
        r#"<a href="/b">B</a> <a href="/c">C</a> <a href="/b#again">B again</a>"#,
        1,
    )
    .await;
    mount_page(&server, "/b", "leaf", 1).await;
    mount_page(&server, "/c", "leaf", 1).await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, vec![format!("{}/", base)]);
    let report = crawler(&config).start(2).await.unwrap();

    assert_eq!(report.rounds.len(), 2);
    assert_eq!(report.rounds[0].generated, 1);
    assert_eq!(report.rounds[0].links, 2);
    assert_eq!(report.rounds[1].generated, 2);
    assert_eq!(report.total_fetched(), 3);
    assert!(report.rounds.iter().all(|r| r.abort.is_none()));

    let db = CrawlDb::open(dir.path()).unwrap();
    for page in ["/", "/b", "/c"] {
        let record = db.get(&format!("{}{}", base, page)).unwrap().unwrap();
        assert_eq!(record.status, FetchStatus::Fetched, "{}", page);
        assert_eq!(record.http_code, Some(200));
    }
    assert_eq!(db.count_total().unwrap(), 3);
    assert!(!db.is_locked().unwrap());

    let rounds = db.rounds().unwrap();
    assert_eq!(rounds.len(), 2);
    assert!(rounds.iter().all(|r| r.status == RoundStatus::Completed));
}

#[tokio::test]
async fn test_fetched_status_is_sticky() {
    let server = MockServer::start().await;

    // Each page links to the other; neither may be fetched twice
    mount_page(&server, "/", r#"<a href="/b">B</a>"#, 1).await;
    mount_page(&server, "/b", r#"<a href="/">home</a>"#, 1).await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, vec![format!("{}/", server.uri())]);
    let report = crawler(&config).start(5).await.unwrap();

    assert_eq!(report.rounds.len(), 3);
    assert_eq!(report.rounds[2].generated, 0);

    let db = CrawlDb::open(dir.path()).unwrap();
    assert_eq!(db.count_by_status(FetchStatus::Fetched).unwrap(), 2);
}

#[tokio::test]
async fn test_every_record_fetched_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/p/\d+$"))
        .respond_with(html_page("no links"))
        .expect(60)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let seeds = (0..60).map(|i| format!("{}/p/{}", server.uri(), i)).collect();
    let mut config = create_test_config(&dir, seeds);
    config.crawler.queue_target_size = 3;

    let report = crawler(&config).start(1).await.unwrap();

    assert_eq!(report.rounds[0].generated, 60);
    assert_eq!(report.rounds[0].fetched, 60);
    let db = CrawlDb::open(dir.path()).unwrap();
    assert_eq!(db.count_by_status(FetchStatus::Fetched).unwrap(), 60);
    assert_eq!(db.count_by_status(FetchStatus::Unfetched).unwrap(), 0);
}

#[tokio::test]
async fn test_retry_bound_and_gone_records() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let base = server.uri();
    let mut config = create_test_config(
        &dir,
        vec![format!("{}/flaky", base), format!("{}/missing", base)],
    );
    config.fetch.max_retries = 2;

    let report = crawler(&config).start(1).await.unwrap();
    assert_eq!(report.rounds[0].failed, 2);

    let db = CrawlDb::open(dir.path()).unwrap();

    let flaky = db.get(&format!("{}/flaky", base)).unwrap().unwrap();
    assert_eq!(flaky.status, FetchStatus::Gone);
    assert_eq!(flaky.retry_count, 2);
    assert_eq!(flaky.http_code, None);
    assert_eq!(flaky.execute_count, 1);

    let missing = db.get(&format!("{}/missing", base)).unwrap().unwrap();
    assert_eq!(missing.status, FetchStatus::Gone);
    assert_eq!(missing.http_code, Some(404));
    assert_eq!(missing.retry_count, 0);
}

#[tokio::test]
async fn test_redirect_is_recorded() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
        .mount(&server)
        .await;
    mount_page(&server, "/new", "moved here", 1).await;

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, vec![format!("{}/old", base)]);
    crawler(&config).start(1).await.unwrap();

    let db = CrawlDb::open(dir.path()).unwrap();
    let old = db.get(&format!("{}/old", base)).unwrap().unwrap();
    assert_eq!(old.status, FetchStatus::Redirected);
    assert_eq!(old.http_code, Some(200));
    assert_eq!(old.location.as_deref(), Some(format!("{}/new", base).as_str()));
}

#[tokio::test]
async fn test_hung_fetch_trips_watchdog() {
    let server = MockServer::start().await;
    let base = server.uri();

    mount_page(&server, "/fast", "quick", 1).await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(html_page("late").set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(
        &dir,
        vec![format!("{}/fast", base), format!("{}/slow", base)],
    );
    config.crawler.threads = 2;
    config.fetch.timeout_ms = 60_000;
    config.watchdog.hang_threshold_ms = 300;

    let report = tokio::time::timeout(Duration::from_secs(20), crawler(&config).start(1))
        .await
        .expect("watchdog never fired")
        .unwrap();

    assert!(matches!(report.rounds[0].abort, Some(AbortReason::Hung { .. })));
    assert_eq!(report.rounds[0].fetched, 1);

    let db = CrawlDb::open(dir.path()).unwrap();
    let slow = db.get(&format!("{}/slow", base)).unwrap().unwrap();
    assert_eq!(slow.status, FetchStatus::Unfetched);
    assert!(!db.is_locked().unwrap());
    assert_eq!(
        db.latest_round().unwrap().unwrap().status,
        RoundStatus::Aborted
    );
}

#[tokio::test]
async fn test_resume_after_crash_merges_orphaned_segment() {
    let server = MockServer::start().await;
    let base = server.uri();
    let home = format!("{}/", base);
    let next = format!("{}/next", base);

    // The crashed run already fetched the home page
    mount_page(&server, "/", "", 0).await;
    mount_page(&server, "/next", "", 1).await;

    let dir = TempDir::new().unwrap();
    {
        let db = CrawlDb::open(dir.path()).unwrap();
        db.inject(&[FetchRecord::new(home.as_str())]).unwrap();

        let segment = db.new_segment_path();
        db.lock(&segment).unwrap();
        let writer = SegmentWriter::create(&segment).unwrap();
        let mut fetched = FetchRecord::new(home.as_str());
        fetched.complete(FetchStatus::Fetched, Some(200), 0).unwrap();
        writer.write_fetch(&fetched).unwrap();
        writer
            .write_links(fetched.key(), &[FetchRecord::linked(next.as_str())])
            .unwrap();
        writer.flush().unwrap();
        // Dropped without merging or unlocking
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut config = create_test_config(&dir, vec![home.clone()]);
    config.crawler.resumable = true;
    config.watchdog.stale_lock_ms = 10;

    let report = crawler(&config).start(1).await.unwrap();

    let round = &report.rounds[0];
    assert_eq!(
        round.recovered,
        Some(MergeStats {
            outcomes: 1,
            linked: 1
        })
    );
    assert_eq!(round.generated, 1);

    let db = CrawlDb::open(dir.path()).unwrap();
    assert_eq!(db.get(&home).unwrap().unwrap().status, FetchStatus::Fetched);
    assert_eq!(db.get(&next).unwrap().unwrap().status, FetchStatus::Fetched);
    assert!(db.unmerged_segments().unwrap().is_empty());
    assert!(!db.is_locked().unwrap());
}

#[tokio::test]
async fn test_live_lock_blocks_second_crawl() {
    let server = MockServer::start().await;
    mount_page(&server, "/", "", 0).await;

    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, vec![format!("{}/", server.uri())]);
    config.crawler.resumable = true;

    let db = CrawlDb::open(dir.path()).unwrap();
    db.lock(&db.new_segment_path()).unwrap();

    let err = crawler(&config).start(1).await.unwrap_err();
    assert!(err.to_string().contains("locked"), "{}", err);
    assert!(db.is_locked().unwrap());
}

#[tokio::test]
async fn test_segment_keeps_content_and_merges_once() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_page(&server, "/", r#"<a href="/x">x</a>"#, 1).await;

    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, vec![format!("{}/", base)]);
    config.fetch.store_content = true;

    let report = crawler(&config).start(1).await.unwrap();
    let segment = &report.rounds[0].segment;

    let reader = SegmentReader::open(segment).unwrap();
    assert!(!reader.has_staging().unwrap());
    let content = reader.content(&format!("{}/", base)).unwrap().unwrap();
    assert!(String::from_utf8_lossy(&content.body).contains("/x"));
    let text = reader.text(&format!("{}/", base)).unwrap().unwrap();
    assert_eq!(text.output.unwrap()["title"], "Test");

    // A second merge of the same segment changes nothing
    let db = CrawlDb::open(dir.path()).unwrap();
    let before = db.count_total().unwrap();
    assert_eq!(db.merge(segment).unwrap(), MergeStats::default());
    assert_eq!(db.count_total().unwrap(), before);
}
