use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_signal_starts_clear() {
    let (_controller, signal) = shutdown_channel();
    assert!(!signal.is_shutdown());
}

#[tokio::test]
async fn test_shutdown_reaches_every_clone() {
    let (controller, signal) = shutdown_channel();
    let clones = vec![signal.clone(), signal.clone()];

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(clones.iter().all(ShutdownSignal::is_shutdown));
}

#[tokio::test]
async fn test_wait_resolves_on_shutdown() {
    let (controller, signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.shutdown();
    });

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok(), "wait() should resolve after shutdown()");
}

#[tokio::test]
async fn test_wait_resolves_when_controller_dropped() {
    let (controller, signal) = shutdown_channel();
    drop(controller);

    let waited = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(waited.is_ok());
}

#[tokio::test]
async fn test_wait_after_shutdown_returns_immediately() {
    let (controller, signal) = shutdown_channel();
    controller.shutdown();

    let waited = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
    assert!(waited.is_ok());
}
