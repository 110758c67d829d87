use std::future::Future;
use std::time::Duration;

/// Wall-clock source and sleeper for the supervisor loop.
pub trait Clock {
    /// Current time in Unix seconds.
    fn now(&self) -> u64;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        crate::registry::unix_now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
