use tokio::sync::watch;

/// Counting completion barrier: `add` work, mark it `done`, `wait` for zero.
///
/// Used for the close sequence (one count for the gateway plus one per
/// tracked listener) and for binder start-up.
#[derive(Debug)]
pub struct WaitGroup {
    pending: watch::Sender<usize>,
}

impl WaitGroup {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self { pending }
    }

    pub fn add(&self, n: usize) {
        self.pending.send_modify(|pending| *pending += n);
    }

    /// Saturates at zero.
    pub fn done(&self) {
        self.pending
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolves once the count reaches zero.
    pub async fn wait(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}
