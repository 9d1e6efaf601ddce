use std::future::Future;
use std::time::Duration;

/// Waits for `action` to complete, but no longer than `timeout`. Returns `true` if it completed;
///  otherwise it is dropped without having completed.
pub async fn wait_action<F: Future>(action: F, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, action).await
        .is_ok()
}
