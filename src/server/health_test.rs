//! Tests for the health, readiness and metrics endpoints

use super::*;
use std::time::Duration;

/// Start a server on `port` and wait until it accepts connections
async fn start_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> (reqwest::Client, tokio::task::JoinHandle<Result<(), std::io::Error>>) {
    let handle = tokio::spawn(async move { run_health_server(port, readiness, metrics).await });

    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);
    for attempt in 1..=10 {
        match client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => break,
            Err(_) if attempt < 10 => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {} attempts: {}", attempt, e),
        }
    }
    (client, handle)
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
    let (client, handle) =
        start_server(port, ReadinessState::new(), create_metrics().unwrap()).await;

    assert_eq!(get(&client, port, "/healthz").await.status(), 200);

    handle.abort();
}

#[tokio::test]
async fn test_readyz_follows_readiness_state() {
    let port = 18181;
    let readiness = ReadinessState::new();
    let (client, handle) = start_server(port, readiness.clone(), create_metrics().unwrap()).await;

    assert_eq!(get(&client, port, "/readyz").await.status(), 503);

    readiness.set(true);
    assert_eq!(get(&client, port, "/readyz").await.status(), 200);

    readiness.set(false);
    assert_eq!(get(&client, port, "/readyz").await.status(), 503);

    handle.abort();
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text_format() {
    let port = 18182;
    let metrics = create_metrics().unwrap();
    metrics.set_candidate_weight("default", "checkout", 40);
    let (client, handle) = start_server(port, ReadinessState::new(), metrics).await;

    let response = get(&client, port, "/metrics").await;
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = response.text().await.unwrap();
    assert!(body.contains("vaaka_experiment_candidate_weight"));

    handle.abort();
}

#[tokio::test]
async fn test_removed_routes_are_not_found() {
    let port = 18183;
    let (client, handle) =
        start_server(port, ReadinessState::new(), create_metrics().unwrap()).await;

    assert_eq!(get(&client, port, "/convert").await.status(), 404);

    handle.abort();
}

#[test]
fn test_readiness_state_clones_share_state() {
    let state = ReadinessState::new();
    assert!(!state.is_ready());

    let cloned = state.clone();
    state.set(true);
    assert!(cloned.is_ready());
}
