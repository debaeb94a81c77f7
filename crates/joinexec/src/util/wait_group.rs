use tokio::sync::watch;

/// Counts outstanding units of in-flight work.
///
/// Each unit is represented by a [`WaitToken`] minted from the group; the
/// token travels with the work and dropping it is the completion. Waiting
/// for the count to reach zero is only meaningful once no new tokens can
/// be minted concurrently with the wait — callers enforce that by stopping
/// producers first.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    count: watch::Sender<usize>,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        let (count, _) = watch::channel(0);
        WaitGroup { count }
    }

    /// Mint a token for one unit of in-flight work.
    pub fn token(&self) -> WaitToken {
        self.count.send_modify(|count| *count += 1);
        WaitToken {
            count: self.count.clone(),
        }
    }

    /// Current number of outstanding tokens.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once no tokens are outstanding.
    pub async fn wait_zero(&self) {
        let mut rx = self.count.subscribe();
        // Can't fail: we hold a sender for at least as long as this wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of in-flight work. Dropping it completes the unit.
#[derive(Debug)]
pub struct WaitToken {
    count: watch::Sender<usize>,
}

impl Drop for WaitToken {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}
