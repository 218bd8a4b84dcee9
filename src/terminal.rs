use tokio::sync::watch;

/// Dimensions of the connecting terminal, in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl TerminalSize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Build a size from the `u32` values carried by SSH window messages,
    /// clamping to the `u16` range and to a minimum of one cell.
    pub fn from_ssh(width: u32, height: u32) -> Self {
        let clamp = |v: u32| v.clamp(1, u16::MAX as u32) as u16;
        Self::new(clamp(width), clamp(height))
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Single-producer queue of pending terminal-size updates.
///
/// Pushing never blocks. If the consumer is not polling, only the most
/// recent size is retained, so a burst of resize events collapses into one.
#[derive(Debug)]
pub struct ResizeQueue {
    tx: watch::Sender<TerminalSize>,
}

impl ResizeQueue {
    pub fn new(initial: TerminalSize) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Record a new terminal size.
    pub fn push(&self, size: TerminalSize) {
        self.tx.send_replace(size);
    }

    /// The most recently pushed size.
    pub fn current(&self) -> TerminalSize {
        *self.tx.borrow()
    }

    /// Create a consumer. Its first `next()` yields the current size so the
    /// remote side starts with the right dimensions.
    pub fn subscribe(&self) -> ResizeReceiver {
        let rx = self.tx.subscribe();
        let initial = *rx.borrow();
        ResizeReceiver {
            rx,
            initial: Some(initial),
        }
    }
}

/// Consumer half of a [`ResizeQueue`].
#[derive(Debug)]
pub struct ResizeReceiver {
    rx: watch::Receiver<TerminalSize>,
    initial: Option<TerminalSize>,
}

impl ResizeReceiver {
    /// Wait for the next size. Returns `None` once the queue is dropped.
    pub async fn next(&mut self) -> Option<TerminalSize> {
        if let Some(size) = self.initial.take() {
            self.rx.borrow_and_update();
            return Some(size);
        }
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
