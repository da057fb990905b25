//! Test helpers and utilities

use anyhow::Result;
use std::future::Future;
use std::sync::Once;
use std::time::Duration;
use tokio::time::{sleep, timeout};

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Initialize the rustls crypto provider (call before any TLS operations)
pub fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Initialize tracing for tests (call once at start of test)
pub fn init_tracing() {
    init_crypto_provider();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("irods_client=debug,irods_integration_tests=debug")
        });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout_duration {
        if condition().await {
            return Ok(());
        }
        sleep(poll_interval).await;
    }

    anyhow::bail!("Condition not met within {:?}", timeout_duration)
}

/// Wait for a condition with default timeout (5s) and poll interval (20ms)
pub async fn wait_for_condition<F, Fut>(condition: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for(condition, Duration::from_secs(5), Duration::from_millis(20)).await
}

/// Assert that a future completes within the given timeout
pub async fn assert_completes_within<F, Fut, T>(future: F, duration: Duration) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    timeout(duration, future())
        .await
        .unwrap_or_else(|_| panic!("Operation did not complete within {:?}", duration))
}

/// Unique absolute data object path for replica token tests
pub fn unique_path(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    format!("/tempZone/home/rods/{}-{}", prefix, &uuid[..8])
}
