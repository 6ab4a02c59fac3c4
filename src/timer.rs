use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A cancellable one-shot timer.
///
/// Re-arming cancels the previous instance, so at most one fire is pending at
/// any time. The armed future typically upgrades a `Weak` handle to the owning
/// state and re-enters the engine; a timer whose owner is gone fires into
/// nothing.
#[derive(Default)]
pub(crate) struct OneShot {
    token: Option<CancellationToken>,
}

impl OneShot {
    pub fn new() -> Self {
        Self { token: None }
    }

    /// Cancel the pending fire, if any
    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    /// Arm the timer: run `fire` after `delay` unless cancelled or re-armed
    pub fn schedule<F>(&mut self, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let token = CancellationToken::new();
        self.token = Some(token.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => fire.await,
                _ = token.cancelled() => {}
            }
        });
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timer = OneShot::new();
        let f = fired.clone();
        timer.schedule(Duration::from_millis(100), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timer = OneShot::new();
        let f = fired.clone();
        timer.schedule(Duration::from_millis(100), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_pending_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timer = OneShot::new();
        for _ in 0..3 {
            let f = fired.clone();
            timer.schedule(Duration::from_millis(100), async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
