use std::sync::Arc;

use tokio::sync::watch;

/// Live count of in-flight sessions, server-wide.
///
/// Sessions register when their shell request is accepted and hold the
/// returned [`SessionGuard`] until the connection handler returns.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    count: Arc<watch::Sender<usize>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that deregisters its session on drop.
#[derive(Debug)]
pub struct SessionGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    /// Register a session, returning a guard that deregisters it when dropped.
    pub fn register(&self) -> SessionGuard {
        self.count.send_modify(|n| *n += 1);
        SessionGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no sessions remain. Returns immediately if already empty.
    pub async fn wait_empty(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
