//! End-to-end runs of the measurement engine against mock HTTP servers
//!
//! These tests drive the full orchestrator over the real HTTP transport:
//! phase sequencing, multistream transfer pools, latency probing, graceful
//! degradation and abort, all against wiremock endpoints.

use speedmeter::{Config, MetricReading, Phase, SpeedTest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mock speed test backend: a payload endpoint, an upload sink and a
/// near-zero-byte probe endpoint
async fn mock_speedtest_server(payload_bytes: usize) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/garbage"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; payload_bytes])
                .set_delay(Duration::from_millis(40)),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(20)))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(10)))
        .mount(&server)
        .await;

    server
}

fn engine_config(server: &MockServer) -> Config {
    Config {
        download_url: Some(format!("{}/garbage", server.uri())),
        upload_url: Some(format!("{}/empty", server.uri())),
        ping_url: Some(format!("{}/empty", server.uri())),
        time_dl_max_secs: 2,
        time_ul_max_secs: 2,
        time_ping_max_secs: 2,
        count_ping: 5,
        streams_dl: 4,
        streams_ul: 2,
        min_stable_secs: 0.5,
        update_interval_ms: 50,
        upload_payload_bytes: 128 * 1024,
        ..Config::default()
    }
}

#[tokio::test]
async fn full_run_measures_every_metric() {
    let server = mock_speedtest_server(256 * 1024).await;
    let updates = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    let updates_clone = Arc::clone(&updates);
    let ends_clone = Arc::clone(&ends);

    let test = SpeedTest::new(engine_config(&server))
        .unwrap()
        .on_update(move |_| {
            updates_clone.fetch_add(1, Ordering::SeqCst);
        })
        .on_end(move |aborted| {
            assert!(!aborted);
            ends_clone.fetch_add(1, Ordering::SeqCst);
        });

    let result = test.start().await;

    assert!(result.is_complete());
    assert!(!result.aborted);
    assert!(result.ping.is_measured());
    assert!(result.jitter.is_measured());
    assert!(result.download.is_measured());
    assert!(result.upload.is_measured());
    assert!(result.download_bytes > 0);
    assert!(result.upload_bytes > 0);
    // Probe endpoint adds 10ms server-side delay
    assert!(result.ping.value().unwrap() >= 10.0);
    assert!(updates.load(Ordering::SeqCst) > 0);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reported_download_matches_reference_calculation() {
    let server = mock_speedtest_server(256 * 1024).await;
    let mut config = engine_config(&server);
    config.test_order = vec![Phase::Download];

    let result = SpeedTest::new(config).unwrap().start().await;

    let reported = result.download.value().expect("download must be measured");
    let elapsed_secs = result.download_elapsed_ms / 1000.0;
    let expected = (result.download_bytes as f64 * 8.0) / (elapsed_secs * 1_000_000.0);
    let deviation = (reported - expected).abs() / expected;
    assert!(
        deviation < 0.02,
        "reported {} Mbps deviates {}% from reference {}",
        reported,
        deviation * 100.0,
        expected
    );
}

#[tokio::test]
async fn download_bias_scales_reported_speed() {
    let server = mock_speedtest_server(128 * 1024).await;
    let mut config = engine_config(&server);
    config.test_order = vec![Phase::Download];
    config.download_bias = 2.0;

    let result = SpeedTest::new(config).unwrap().start().await;

    let reported = result.download.value().expect("download must be measured");
    let elapsed_secs = result.download_elapsed_ms / 1000.0;
    let unbiased = (result.download_bytes as f64 * 8.0) / (elapsed_secs * 1_000_000.0);
    assert!((reported - unbiased * 2.0).abs() / reported < 0.02);
}

#[tokio::test]
async fn failing_download_degrades_to_unmeasured_not_abort() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/garbage"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = engine_config(&server);
    config.test_order = vec![Phase::Download];
    config.time_dl_max_secs = 1;

    let started = std::time::Instant::now();
    let test = SpeedTest::new(config).unwrap();
    let result = test.start().await;
    let elapsed = started.elapsed();

    assert!(!result.aborted, "total phase failure must degrade, not abort");
    assert!(result.is_complete());
    assert_eq!(result.download, MetricReading::Unmeasured);
    assert_eq!(result.download_bytes, 0);
    // Tolerant retries run out the full budget
    assert!(elapsed >= Duration::from_millis(950));
    assert!(elapsed < Duration::from_secs(4));
}

#[tokio::test]
async fn unreachable_probe_endpoint_leaves_ping_unmeasured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = engine_config(&server);
    config.test_order = vec![Phase::Ping];
    config.time_ping_max_secs = 1;

    let result = SpeedTest::new(config).unwrap().start().await;

    assert!(!result.aborted);
    assert_eq!(result.ping, MetricReading::Unmeasured);
    assert_eq!(result.jitter, MetricReading::Unmeasured);
    assert_eq!(result.ping_samples, 0);
}

#[tokio::test]
async fn abort_mid_run_fires_terminal_event_once() {
    let server = mock_speedtest_server(256 * 1024).await;
    let mut config = engine_config(&server);
    // Long budgets so the abort is what ends the run
    config.time_dl_max_secs = 30;
    config.time_ul_max_secs = 30;
    config.test_order = vec![Phase::Download, Phase::Upload];
    config.stable_threshold = 0.001;
    config.min_stable_secs = 60.0;

    let ends = Arc::new(AtomicUsize::new(0));
    let ends_clone = Arc::clone(&ends);
    let test = SpeedTest::new(config).unwrap().on_end(move |aborted| {
        assert!(aborted);
        ends_clone.fetch_add(1, Ordering::SeqCst);
    });

    let runner = test.clone();
    let task = tokio::spawn(async move { runner.start().await });
    tokio::time::sleep(Duration::from_millis(400)).await;
    test.abort();
    let result = task.await.unwrap();

    assert!(result.aborted);
    assert!(result.is_complete());
    assert_eq!(ends.load(Ordering::SeqCst), 1);

    // Aborting a terminated run is a no-op
    test.abort();
    assert_eq!(ends.load(Ordering::SeqCst), 1);
    assert!(test.results().aborted);
}

#[tokio::test]
async fn upload_requests_are_cache_defeating_octet_streams() {
    let server = mock_speedtest_server(64 * 1024).await;
    let mut config = engine_config(&server);
    config.test_order = vec![Phase::Upload];
    config.upload_payload_bytes = 32 * 1024;
    config.streams_ul = 1;

    let result = SpeedTest::new(config).unwrap().start().await;
    assert!(result.upload.is_measured());

    let requests = server.received_requests().await.unwrap();
    let posts: Vec<_> = requests
        .iter()
        .filter(|r| r.method.to_string() == "POST")
        .collect();
    assert!(posts.len() >= 2, "the pool should reissue transfers back to back");

    let mut nonces = std::collections::HashSet::new();
    for request in &posts {
        let content_type = request
            .headers
            .get("content-type")
            .expect("uploads must declare a content type");
        assert_eq!(content_type.to_str().unwrap(), "application/octet-stream");
        assert!(request.headers.get("cache-control").is_some());

        let nonce = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "r")
            .map(|(_, v)| v.to_string())
            .expect("every request carries a cache-defeating nonce");
        assert!(nonces.insert(nonce), "nonces must be distinct per request");
    }
}

#[tokio::test]
async fn phase_order_is_honored() {
    let server = mock_speedtest_server(64 * 1024).await;
    let mut config = engine_config(&server);
    config.test_order = vec![Phase::Upload, Phase::Ping];
    config.time_ul_max_secs = 1;

    let phases = Arc::new(std::sync::Mutex::new(Vec::new()));
    let phases_clone = Arc::clone(&phases);
    let test = SpeedTest::new(config).unwrap().on_update(move |snapshot| {
        let mut seen = phases_clone.lock().unwrap();
        if seen.last() != Some(&snapshot.phase) {
            seen.push(snapshot.phase);
        }
    });

    let result = test.start().await;
    assert!(!result.aborted);
    assert!(result.upload.is_measured());
    assert!(result.ping.is_measured());
    // Download never ran
    assert_eq!(result.download, MetricReading::Unmeasured);
    assert_eq!(result.download_bytes, 0);

    let seen = phases.lock().unwrap();
    let upload_pos = seen.iter().position(|p| *p == Phase::Upload);
    let ping_pos = seen.iter().position(|p| *p == Phase::Ping);
    if let (Some(upload_pos), Some(ping_pos)) = (upload_pos, ping_pos) {
        assert!(upload_pos < ping_pos, "upload must run before ping: {:?}", seen);
    }
}
