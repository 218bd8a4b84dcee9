//! Graceful shutdown coordination.
//!
//! Shutdown runs in four steps: raise the shutting-down flag (every later
//! teardown evaluation deletes its pod unconditionally), stop accepting
//! connections, wait for the live session count to reach zero or the
//! deadline to pass, and finally close the transport. Sessions are never
//! killed here; they unwind when their own connection ends, and
//! [`ShutdownCoordinator::stop`] waits for that unwinding before the
//! process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::registry::SessionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown deadline exceeded after {waited:?} with {remaining} session(s) still active")]
    DeadlineExceeded { remaining: usize, waited: Duration },

    #[error("{remaining} task(s) still running {waited:?} after the transport closed")]
    TasksOutstanding { remaining: usize, waited: Duration },
}

/// Read-only view of the shutting-down flag, handed to sessions.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    flag: Arc<AtomicBool>,
    accept: CancellationToken,
    transport: CancellationToken,
    registry: SessionRegistry,
    tasks: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            accept: CancellationToken::new(),
            transport: CancellationToken::new(),
            registry,
            tasks: TaskTracker::new(),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            flag: Arc::clone(&self.flag),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Tracker for connection and session tasks; [`drain`](Self::drain)
    /// waits on it.
    pub fn tracker(&self) -> TaskTracker {
        self.tasks.clone()
    }

    /// Cancelled when the server must stop accepting connections.
    pub fn accept_token(&self) -> CancellationToken {
        self.accept.clone()
    }

    /// Parent of every connection token; cancelled when the transport closes.
    pub fn transport_token(&self) -> CancellationToken {
        self.transport.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Run the shutdown sequence, waiting at most `deadline` for sessions.
    ///
    /// The transport is closed on both the success and the deadline path.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        let started = Instant::now();
        self.flag.store(true, Ordering::Release);
        self.accept.cancel();
        tracing::info!(
            sessions = self.registry.len(),
            ?deadline,
            "shutting down, waiting for sessions"
        );

        let drained = tokio::time::timeout(deadline, self.registry.wait_empty()).await;
        self.transport.cancel();

        match drained {
            Ok(()) => {
                tracing::info!(elapsed = ?started.elapsed(), "all sessions finished");
                Ok(())
            }
            Err(_) => Err(ShutdownError::DeadlineExceeded {
                remaining: self.registry.len(),
                waited: started.elapsed(),
            }),
        }
    }

    /// Wait at most `limit` for every tracked task to finish.
    ///
    /// Sessions cut off by the transport close still run their teardown;
    /// this is where the process waits for it.
    pub async fn drain(&self, limit: Duration) -> Result<(), ShutdownError> {
        self.tasks.close();
        if tokio::time::timeout(limit, self.tasks.wait()).await.is_ok() {
            return Ok(());
        }
        Err(ShutdownError::TasksOutstanding {
            remaining: self.tasks.len(),
            waited: limit,
        })
    }

    /// The exit sequence: [`shutdown`](Self::shutdown), then
    /// [`drain`](Self::drain) with `teardown_timeout`. The first error wins.
    pub async fn stop(
        &self,
        deadline: Duration,
        teardown_timeout: Duration,
    ) -> Result<(), ShutdownError> {
        let result = self.shutdown(deadline).await;
        let drained = self.drain(teardown_timeout).await;
        if let Err(e) = &drained {
            tracing::error!(error = %e, "sessions did not finish tearing down");
        }
        result.and(drained)
    }
}
