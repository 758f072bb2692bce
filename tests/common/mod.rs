use std::sync::Once;
use std::time::Duration;

use kafka_receiver::ReceiverOptions;

static INIT: Once = Once::new();

/// Initialize tracing once for the whole test binary.
pub fn init_logging() {
    INIT.call_once(|| {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
        if installed.is_err() {
            eprintln!("tracing subscriber already installed");
        }
    });
}

/// Receiver options tuned for fast test cycles.
pub fn fast_options() -> ReceiverOptions {
    ReceiverOptions::new("localhost:9092", "integration-test-group")
        .subscribe(["events"])
        .with_poll_timeout(Duration::from_millis(10))
        .with_commit_interval(Duration::from_millis(25))
        .with_prefetch(8)
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
