//! End-to-end refresh scenarios against a mock HTTP server.
//!
//! Each test wires a real `Worker` to an in-memory database and a wiremock
//! server, then drives it through the public API only.

use std::time::Duration;

use rookery::feed::{discover_feed, parse_opml, Discovery, Fetcher, FetcherConfig};
use rookery::storage::{Database, ItemFilter};
use rookery::util::UrlPolicy;
use rookery::worker::{Worker, WorkerConfig};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rss(ids: std::ops::Range<usize>) -> String {
    let items: String = ids
        .map(|i| {
            format!(
                "<item><guid>post-{i}</guid><title>Post {i}</title>\
                 <link>https://blog.example.com/{i}</link></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Scenario Blog</title>{items}</channel></rss>"#
    )
}

async fn test_worker() -> Worker {
    let db = Database::open(":memory:").await.unwrap();
    let config = WorkerConfig {
        pool_size: 2,
        refresh_interval: Duration::ZERO,
        favicon_timeout: Duration::from_secs(2),
        ..WorkerConfig::default()
    };
    Worker::new(db, config).unwrap()
}

// ============================================================================
// Refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_then_merge_overlapping_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss(0..10))
                .set_delay(Duration::from_millis(100)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(2..12)))
        .mount(&server)
        .await;

    let worker = test_worker().await;
    let feed = worker
        .database()
        .create_feed("", None, None, &format!("{}/feed.xml", server.uri()), None)
        .await
        .unwrap();

    assert_eq!(worker.feeds_pending(), 0);
    assert!(worker.refresh_one(feed.id).await.unwrap());
    assert_eq!(worker.feeds_pending(), 1);
    worker.wait_idle().await;
    assert_eq!(worker.feeds_pending(), 0);

    let stored = worker.database().get_feed(feed.id).await.unwrap().unwrap();
    assert_eq!(stored.size, 10);
    assert_eq!(stored.title, "Scenario Blog");
    assert_eq!(stored.error, None);

    assert!(worker.refresh_one(feed.id).await.unwrap());
    worker.wait_idle().await;

    let stored = worker.database().get_feed(feed.id).await.unwrap().unwrap();
    assert_eq!(stored.size, 12);
    let filter = ItemFilter {
        feed_id: Some(feed.id),
        ..ItemFilter::default()
    };
    let items = worker.database().list_items(&filter, 100, false).await.unwrap();
    let guids: Vec<&str> = items.iter().map(|i| i.guid.as_str()).collect();
    assert_eq!(guids.len(), 12);
    assert_eq!(guids[10], "post-10");
    assert_eq!(guids[11], "post-11");
}

#[tokio::test]
async fn test_not_modified_leaves_feed_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("If-None-Match", "\"rev-1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss(0..3))
                .insert_header("ETag", "\"rev-1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let worker = test_worker().await;
    let db = worker.database();
    let feed = db
        .create_feed("Blog", None, None, &format!("{}/feed.xml", server.uri()), None)
        .await
        .unwrap();

    worker.refresh_one(feed.id).await.unwrap();
    worker.wait_idle().await;
    db.set_feed_error(feed.id, Some("marker")).await.unwrap();

    worker.refresh_one(feed.id).await.unwrap();
    worker.wait_idle().await;

    let stored = db.get_feed(feed.id).await.unwrap().unwrap();
    assert_eq!(stored.error.as_deref(), Some("marker"));
    assert_eq!(stored.size, 3);
    assert_eq!(stored.validators.etag.as_deref(), Some("\"rev-1\""));
    server.verify().await;
}

#[tokio::test]
async fn test_failing_feed_recovers_on_next_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(0..1)))
        .mount(&server)
        .await;

    let worker = test_worker().await;
    let feed = worker
        .database()
        .create_feed("Blog", None, None, &format!("{}/feed.xml", server.uri()), None)
        .await
        .unwrap();

    worker.refresh_all().await.unwrap();
    worker.wait_idle().await;
    let errors = worker.feed_errors().await.unwrap();
    assert_eq!(errors.get(&feed.id).map(String::as_str), Some("HTTP error: status 502"));

    worker.refresh_all().await.unwrap();
    worker.wait_idle().await;
    assert!(worker.feed_errors().await.unwrap().is_empty());
    assert_eq!(worker.database().count_items(feed.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_import_then_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(0..5)))
        .mount(&server)
        .await;

    let opml = format!(
        r#"<opml version="2.0"><body>
  <outline text="Reading">
    <outline text="One" xmlUrl="{uri}/one.xml"/>
    <outline text="Two" xmlUrl="{uri}/two.xml"/>
  </outline>
</body></opml>"#,
        uri = server.uri()
    );
    let entries = parse_opml(&opml, UrlPolicy::default()).unwrap();

    let worker = test_worker().await;
    let summary = worker.import_feeds(&entries).await.unwrap();
    assert_eq!((summary.feeds, summary.folders), (2, 1));

    worker.refresh_all().await.unwrap();
    worker.wait_idle().await;

    for feed in worker.database().list_feeds().await.unwrap() {
        assert!(feed.folder_id.is_some());
        assert_eq!(worker.database().count_items(feed.id).await.unwrap(), 5);
    }
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_discovery_single_link_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(
                    r#"<html><head><link rel="alternate" type="application/rss+xml" href="/feed.xml"></head></html>"#,
                )
                .insert_header("Content-Type", "text/html; charset=utf-8"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(0..4)))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(FetcherConfig::default()).unwrap();
    match discover_feed(&fetcher, &server.uri()).await.unwrap() {
        Discovery::Feed { url, feed } => {
            assert_eq!(url, format!("{}/feed.xml", server.uri()));
            assert_eq!(feed.title, "Scenario Blog");
            assert_eq!(feed.items.len(), 4);
        }
        Discovery::Candidates(c) => panic!("Expected a single feed, got {} candidates", c.len()),
    }
}

#[tokio::test]
async fn test_discovery_two_links_are_not_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(
                    r#"<html><head>
<link rel="alternate" type="application/rss+xml" href="/rss.xml" title="Posts">
<link rel="alternate" type="application/atom+xml" href="/atom.xml" title="Comments">
</head></html>"#,
                )
                .insert_header("Content-Type", "text/html"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rss.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(0..1)))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/atom.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(0..1)))
        .expect(0)
        .mount(&server)
        .await;

    let worker = test_worker().await;
    match worker.discover_feed(&server.uri()).await.unwrap() {
        Discovery::Candidates(candidates) => {
            let urls: Vec<String> = candidates.into_iter().map(|c| c.url).collect();
            assert_eq!(
                urls,
                vec![
                    format!("{}/rss.xml", server.uri()),
                    format!("{}/atom.xml", server.uri()),
                ]
            );
        }
        Discovery::Feed { url, .. } => panic!("Expected candidates, got feed {url}"),
    }
    server.verify().await;
}

#[tokio::test]
async fn test_get_body_decodes_declared_charset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"caf\xe9".to_vec())
                .insert_header("Content-Type", "text/html; charset=iso-8859-1"),
        )
        .mount(&server)
        .await;

    let worker = test_worker().await;
    assert_eq!(worker.get_body(&server.uri()).await.unwrap(), "café");
}
