//! Cancellation helpers around the pipeline's shutdown channel.
//!
//! Shutdown is a `watch` channel carrying `true` once the host wants to
//! stop. A dropped sender means no shutdown will ever be requested.

use tokio::sync::watch;

/// Resolves once shutdown has been requested; never resolves if the sender is gone.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

/// Non-blocking check of the current shutdown state
pub fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}
