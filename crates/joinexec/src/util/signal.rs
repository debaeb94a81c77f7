use tokio::sync::watch;

/// A single-fire broadcast signal carrying a value.
///
/// Multiple readers may wait on the signal and each observes the fired
/// value without consuming it. Firing twice is a programming error and is
/// asserted in debug builds; in release the second value wins silently
/// rather than deadlocking.
#[derive(Debug)]
pub struct OnceSignal<T> {
    value: watch::Sender<Option<T>>,
}

impl<T: Clone> OnceSignal<T> {
    pub fn new() -> OnceSignal<T> {
        let (value, _) = watch::channel(None);
        OnceSignal { value }
    }

    /// Publish the value to all current and future waiters.
    pub fn fire(&self, value: T) {
        let prev = self.value.send_replace(Some(value));
        debug_assert!(prev.is_none(), "completion signal fired twice");
    }

    pub fn is_fired(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// Resolve to the fired value.
    pub async fn wait(&self) -> T {
        let mut rx = self.value.subscribe();
        // Can't fail: we hold a sender for at least as long as this wait.
        let fired = rx
            .wait_for(|value| value.is_some())
            .await
            .expect("signal sender alive");
        fired.clone().expect("checked some")
    }
}

impl<T: Clone> Default for OnceSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}
