use super::health::*;
use super::metrics::create_metrics;
use std::time::Duration;

/// Polls `/healthz` until the server accepts connections
async fn wait_for_server(port: u16) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=10 {
        match client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < 10 => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("health server not up on port {}: {}", port, e),
        }
    }
    client
}

async fn get(client: &reqwest::Client, port: u16, path: &str) -> reqwest::Response {
    client
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("request to health server failed")
}

#[tokio::test]
async fn test_healthz_and_readyz_follow_readiness() {
    let readiness = ReadinessState::new();
    let metrics = create_metrics().unwrap();
    let port = 18180;

    let server_readiness = readiness.clone();
    let handle =
        tokio::spawn(async move { run_health_server(port, server_readiness, metrics).await });
    let client = wait_for_server(port).await;

    assert_eq!(get(&client, port, "/healthz").await.status(), 200);
    assert_eq!(get(&client, port, "/readyz").await.status(), 503);

    readiness.set_ready();
    assert_eq!(get(&client, port, "/readyz").await.status(), 200);

    readiness.set_not_ready();
    assert_eq!(get(&client, port, "/readyz").await.status(), 503);

    handle.abort();
}

#[tokio::test]
async fn test_metrics_endpoint_serves_registry() {
    let metrics = create_metrics().unwrap();
    metrics.set_traffic_weight("bookinfo", "reviews-exp", "reviews-v1", 100);
    let port = 18181;

    let handle = tokio::spawn(async move {
        run_health_server(port, ReadinessState::new(), metrics).await
    });
    let client = wait_for_server(port).await;

    let response = get(&client, port, "/metrics").await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("kanary_traffic_weight"));

    handle.abort();
}

#[test]
fn test_readiness_clones_share_state() {
    let state = ReadinessState::new();
    let cloned = state.clone();
    assert!(!cloned.is_ready());

    state.set_ready();
    assert!(cloned.is_ready());
}
