//! Tests for the health and metrics endpoints

use super::*;
use std::time::Duration;

/// Poll /healthz until the server accepts connections
async fn wait_for_server(port: u16, max_retries: u32) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=max_retries {
        match client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < max_retries => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {} attempts: {}", max_retries, e),
        }
    }
    client
}

fn spawn_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    tokio::spawn(async move { run_health_server(port, readiness, metrics).await })
}

async fn get(client: &reqwest::Client, port: u16, path: &str) -> reqwest::Response {
    client
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server")
}

#[tokio::test]
async fn test_healthz_returns_200() {
    let port = 18180;
    let handle = spawn_server(port, ReadinessState::new(), create_metrics().unwrap());
    let client = wait_for_server(port, 10).await;

    let response = get(&client, port, "/healthz").await;

    assert_eq!(response.status(), 200, "Liveness check should return 200");
    handle.abort();
}

#[tokio::test]
async fn test_readyz_follows_readiness_state() {
    let port = 18181;
    let readiness = ReadinessState::new();
    let handle = spawn_server(port, readiness.clone(), create_metrics().unwrap());
    let client = wait_for_server(port, 10).await;

    // Not ready until the watches are up
    assert_eq!(get(&client, port, "/readyz").await.status(), 503);

    readiness.set_ready();
    assert_eq!(get(&client, port, "/readyz").await.status(), 200);

    // Shutdown flips it back
    readiness.set_not_ready();
    assert_eq!(get(&client, port, "/readyz").await.status(), 503);

    handle.abort();
}

#[tokio::test]
async fn test_metrics_endpoint_serves_prometheus_text() {
    let port = 18182;
    let metrics = create_metrics().unwrap();
    metrics.record_drain("success", 12.0);
    let handle = spawn_server(port, ReadinessState::new(), metrics);
    let client = wait_for_server(port, 10).await;

    let response = get(&client, port, "/metrics").await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains(r#"autodrain_drains_total{outcome="success"} 1"#));

    handle.abort();
}

#[test]
fn test_readiness_clones_share_state() {
    let state = ReadinessState::new();
    let cloned = state.clone();

    assert!(!state.is_ready());
    state.set_ready();
    assert!(cloned.is_ready());
}
