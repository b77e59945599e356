use std::sync::Arc;
use std::time::Duration;
use telemetry_exporter::{
    Batch, Config, DropReason, EnvelopeKind, ListenerChain, SendResult, StatsListener,
    TelemetryItem, TelemetryItemExporter,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(endpoint: String, spool_dir: &TempDir) -> Config {
    Config {
        endpoint,
        spool_dir: spool_dir.path().to_path_buf(),
        http_timeout: Duration::from_secs(5),
        sweep_interval: None,
        ..Config::default()
    }
}

fn batch(message: &str) -> Batch {
    let item = TelemetryItem::from_json(
        EnvelopeKind::Log,
        "test-key",
        &serde_json::json!({ "message": message }),
    )
    .unwrap();
    Batch::new(vec![item]).unwrap()
}

async fn start_exporter(config: &Config) -> (TelemetryItemExporter, Arc<StatsListener>) {
    let stats = Arc::new(StatsListener::new());
    let exporter =
        TelemetryItemExporter::from_config(config, ListenerChain::new().with(stats.clone()))
            .await
            .unwrap();
    (exporter, stats)
}

async fn answer(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

async fn redirect(server: &MockServer, route: &str, location: &str) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(307).insert_header("Location", location))
        .mount(server)
        .await;
}

async fn received(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| request.url.path().to_string())
        .collect()
}

#[tokio::test]
async fn test_delivers_json_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/track"))
        .and(wiremock::matchers::header(
            "content-type",
            "application/x-json-stream",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (exporter, stats) = start_exporter(&config(format!("{}/track", server.uri()), &dir)).await;

    let sent = batch("hello");
    let payload = sent.payload().to_vec();
    assert_eq!(exporter.send(sent).await, SendResult::Delivered);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].body, payload);
    assert_eq!(stats.snapshot().delivered_items, 1);
}

#[tokio::test]
async fn test_follows_ten_redirects_and_caches_final_url() {
    let server = MockServer::start().await;
    redirect(&server, "/track", "/hop/1").await;
    for hop in 1..10 {
        redirect(&server, &format!("/hop/{}", hop), &format!("/hop/{}", hop + 1)).await;
    }
    answer(&server, "/hop/10", 200).await;

    let dir = TempDir::new().unwrap();
    let (exporter, _) = start_exporter(&config(format!("{}/track", server.uri()), &dir)).await;

    assert_eq!(exporter.send(batch("a")).await, SendResult::Delivered);
    assert_eq!(received(&server).await.len(), 11);

    // The next send goes straight to where the chain ended
    assert_eq!(exporter.send(batch("b")).await, SendResult::Delivered);
    let paths = received(&server).await;
    assert_eq!(paths.len(), 12);
    assert_eq!(paths[11], "/hop/10");
}

#[tokio::test]
async fn test_eleventh_redirect_is_a_permanent_failure() {
    let server = MockServer::start().await;
    redirect(&server, "/track", "/hop/1").await;
    for hop in 1..=10 {
        redirect(&server, &format!("/hop/{}", hop), &format!("/hop/{}", hop + 1)).await;
    }
    answer(&server, "/hop/11", 200).await;

    let dir = TempDir::new().unwrap();
    let (exporter, _) = start_exporter(&config(format!("{}/track", server.uri()), &dir)).await;

    assert_eq!(
        exporter.send(batch("a")).await,
        SendResult::Dropped(DropReason::Permanent)
    );
    let paths = received(&server).await;
    assert_eq!(paths.len(), 11);
    assert!(!paths.contains(&"/hop/11".to_string()));
    assert!(exporter.spool().unwrap().entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_service_unavailable_spools_batch() {
    let server = MockServer::start().await;
    answer(&server, "/track", 503).await;

    let dir = TempDir::new().unwrap();
    let (exporter, stats) = start_exporter(&config(format!("{}/track", server.uri()), &dir)).await;

    let sent = batch("keep me");
    let payload = sent.payload().to_vec();
    assert_eq!(exporter.send(sent).await, SendResult::Spooled);

    let entries = exporter.spool().unwrap().entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(tokio::fs::read(&entries[0].path).await.unwrap(), payload);
    assert_eq!(stats.snapshot().retryable_failures, 1);
}

#[tokio::test]
async fn test_bad_request_drops_batch() {
    let server = MockServer::start().await;
    answer(&server, "/track", 400).await;

    let dir = TempDir::new().unwrap();
    let (exporter, stats) = start_exporter(&config(format!("{}/track", server.uri()), &dir)).await;

    assert_eq!(
        exporter.send(batch("bad")).await,
        SendResult::Dropped(DropReason::Permanent)
    );
    assert!(exporter.spool().unwrap().entries().await.unwrap().is_empty());
    assert_eq!(stats.snapshot().permanent_failures, 1);
}

#[tokio::test]
async fn test_unreachable_endpoint_spools_batch() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let dir = TempDir::new().unwrap();
    let (exporter, _) = start_exporter(&config(format!("http://127.0.0.1:{}/track", port), &dir)).await;

    assert_eq!(exporter.send(batch("offline")).await, SendResult::Spooled);
    assert_eq!(exporter.spool().unwrap().entries().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_spooled_batch_resent_after_recovery() {
    let server = MockServer::start().await;
    answer(&server, "/track", 503).await;

    let dir = TempDir::new().unwrap();
    let (exporter, stats) = start_exporter(&config(format!("{}/track", server.uri()), &dir)).await;

    let old = batch("old");
    let old_payload = old.payload().to_vec();
    assert_eq!(exporter.send(old).await, SendResult::Spooled);

    server.reset().await;
    answer(&server, "/track", 200).await;

    // The first success marks the endpoint healthy, the next send piggy-backs
    assert_eq!(exporter.send(batch("ping")).await, SendResult::Delivered);
    assert_eq!(exporter.send(batch("new")).await, SendResult::Delivered);

    let bodies: Vec<Vec<u8>> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .map(|request| request.body)
        .collect();
    assert!(bodies.contains(&old_payload));
    assert!(exporter.spool().unwrap().entries().await.unwrap().is_empty());
    assert_eq!(exporter.spool().unwrap().stats().resent, 1);
    assert_eq!(stats.snapshot().delivered, 3);
}

#[tokio::test]
async fn test_spool_survives_restart() {
    let dir = TempDir::new().unwrap();

    let down = MockServer::start().await;
    answer(&down, "/track", 500).await;
    {
        let (exporter, _) = start_exporter(&config(format!("{}/track", down.uri()), &dir)).await;
        assert_eq!(exporter.send(batch("persisted")).await, SendResult::Spooled);
        exporter.shutdown(Some(Duration::from_secs(1))).await;
    }

    let up = MockServer::start().await;
    answer(&up, "/track", 204).await;
    let (exporter, _) = start_exporter(&config(format!("{}/track", up.uri()), &dir)).await;

    let report = exporter.resend_spooled(u64::MAX).await;
    assert_eq!(report.resent, 1);
    assert_eq!(received(&up).await.len(), 1);
    assert!(exporter.spool().unwrap().entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_send_after_shutdown_never_reaches_endpoint() {
    let server = MockServer::start().await;
    answer(&server, "/track", 200).await;

    let dir = TempDir::new().unwrap();
    let (exporter, _) = start_exporter(&config(format!("{}/track", server.uri()), &dir)).await;

    exporter.shutdown(None).await;
    assert_eq!(exporter.send(batch("late")).await, SendResult::Stopped);
    assert!(received(&server).await.is_empty());
}

#[tokio::test]
async fn test_configured_sweeper_drains_spool_without_new_sends() {
    let server = MockServer::start().await;
    answer(&server, "/track", 503).await;

    let dir = TempDir::new().unwrap();
    let config = Config {
        sweep_interval: Some(Duration::from_millis(50)),
        ..config(format!("{}/track", server.uri()), &dir)
    };
    let (exporter, _) = start_exporter(&config).await;

    assert_eq!(exporter.send(batch("waiting")).await, SendResult::Spooled);

    server.reset().await;
    answer(&server, "/track", 200).await;

    let spool = exporter.spool().unwrap().clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while spool.stats().resent == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert!(spool.entries().await.unwrap().is_empty());
    assert_eq!(spool.resident_bytes().await.unwrap(), 0);
    exporter.shutdown(None).await;
}
