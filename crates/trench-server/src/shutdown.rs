//! Process-wide shutdown signal.
//!
//! The listener, the hub actor, and the presence bridge all watch clones of
//! one `CancellationToken`. Cancelling it stops new upgrades, and the hub
//! closes every live connection on its way out.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upper bound on [`ShutdownCoordinator::drain`] when no timeout is given.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owner of the shutdown token.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// A coordinator whose token has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the token for a task that must stop on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the token. Repeated calls are harmless.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire the token and wait for `tasks` to finish.
    ///
    /// Returns `false` if the wait hit `timeout` (default
    /// [`DEFAULT_SHUTDOWN_TIMEOUT`]); stragglers are left running.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>, timeout: Option<Duration>) -> bool {
        let limit = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        info!(tasks = tasks.len(), limit_ms = limit.as_millis(), "draining background tasks");

        match tokio::time::timeout(limit, futures::future::join_all(tasks)).await {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    warn!(panicked, "background tasks ended abnormally");
                }
                true
            }
            Err(_) => {
                warn!(?limit, "drain timed out");
                false
            }
        }
    }
}
