use tokio::sync::watch;

/// Broadcast cancellation signal.
///
/// Any number of tasks may await `cancelled`; all of them unblock once the
/// signal fires, including tasks that start waiting after the fact.
/// Firing more than once is a no-op.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    fired: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn new() -> CancelSignal {
        let (fired, _) = watch::channel(false);
        CancelSignal { fired }
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.fired.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.fired.borrow()
    }

    /// Resolve once the signal has fired.
    pub async fn cancelled(&self) {
        let mut rx = self.fired.subscribe();
        // Can't fail: we hold a sender for at least as long as this wait.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel();
        signal.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn wakes_every_waiter() {
        let signal = CancelSignal::new();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let signal = signal.clone();
            waiters.push(tokio::spawn(async move { signal.cancelled().await }));
        }

        signal.cancel();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn late_waiter_sees_fired_signal() {
        let signal = CancelSignal::new();
        signal.cancel();
        signal.cancelled().await;
    }
}
