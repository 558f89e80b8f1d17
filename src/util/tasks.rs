use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

/// Waits for a background task to finish after it was asked to stop. If it does not finish
///  within `timeout`, this is logged and the task is aborted - the caller is never blocked for
///  longer than that.
pub async fn join_with_timeout(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    let abort_handle = handle.abort_handle();
    match time::timeout(timeout, handle).await {
        Ok(Ok(())) => {
            debug!("{} finished", name);
        }
        Ok(Err(e)) if e.is_cancelled() => {
            debug!("{} was cancelled", name);
        }
        Ok(Err(e)) => {
            error!("{} terminated abnormally: {}", name, e);
        }
        Err(_) => {
            warn!("{} did not stop within {:?} - aborting it", name, timeout);
            abort_handle.abort();
        }
    }
}

/// Joins all tasks in `handles`, each with its own bounded wait
pub async fn join_all_with_timeout(name: &str, handles: Vec<JoinHandle<()>>, timeout: Duration) {
    for handle in handles {
        join_with_timeout(name, handle, timeout).await;
    }
}
