use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use corral_common::Shutdown;
use futures::FutureExt;
use tokio::sync::Notify;

use crate::store::KvStore;

/// Pause after a failed long-poll before polling again.
const RESYNC_DELAY: Duration = Duration::from_secs(1);

/// Long-polls `prefix` until `shutdown` fires, waking `wake` on every mutation.
///
/// After an error the watch position is lost, so the loop wakes the consumer
/// once to force a full re-read and restarts from the store's current index.
pub(crate) async fn run_watch(store: Arc<dyn KvStore>, prefix: String, shutdown: Shutdown, wake: Arc<Notify>) {
    let mut next_index: Option<u64> = None;
    tracing::debug!(prefix = %prefix, "registry watch started");

    loop {
        let polled = tokio::select! {
            _ = shutdown.wait() => break,
            polled = AssertUnwindSafe(store.watch(&prefix, next_index)).catch_unwind() => polled,
        };

        match polled {
            Ok(Ok(event)) => {
                next_index = Some(event.index + 1);
                if event.action.is_mutation() {
                    tracing::trace!(key = %event.key, index = event.index, "registry change");
                    wake.notify_one();
                }
                continue;
            }
            Ok(Err(e)) => {
                tracing::warn!(prefix = %prefix, error = %e, "registry watch failed, resyncing");
            }
            Err(_) => {
                tracing::error!(prefix = %prefix, "registry watch panicked, resyncing");
            }
        }

        next_index = None;
        wake.notify_one();
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(RESYNC_DELAY) => {}
        }
    }

    tracing::debug!(prefix = %prefix, "registry watch stopped");
}
