//! Cancellable pacing
//!
//! Every wait and every driver call of an invocation goes through a
//! [`Pacer`], which races it against the session's stop token. A stop
//! therefore unwinds the invocation at its next suspension point and drops
//! any driver call still in flight.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::stealth::{DelayCategory, TimingModel};

/// Suspension points of one invocation
#[derive(Debug, Clone)]
pub struct Pacer {
    token: CancellationToken,
    timing: TimingModel,
    throttle_factor: f64,
}

impl Pacer {
    pub fn new(token: CancellationToken, timing: TimingModel, throttle_factor: f64) -> Self {
        Self {
            token,
            timing,
            throttle_factor: throttle_factor.max(1.0),
        }
    }

    pub fn timing(&self) -> &TimingModel {
        &self.timing
    }

    pub fn throttle_factor(&self) -> f64 {
        self.throttle_factor
    }

    /// Fail fast if a stop was requested
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Stopped)
        } else {
            Ok(())
        }
    }

    /// Sleep unless stopped first
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Stopped),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Human pause of the category, widened by the throttle factor
    pub async fn pause(&self, category: DelayCategory) -> Result<()> {
        let delay = self.timing.delay_scaled(category, self.throttle_factor);
        self.sleep(delay).await
    }

    /// Uniform micro-pause in `[min_ms, max_ms]`
    pub async fn micro(&self, min_ms: u64, max_ms: u64) -> Result<()> {
        self.sleep(self.timing.micro(min_ms, max_ms)).await
    }

    /// Run a driver call unless stopped; a stop mid-call drops the call
    pub async fn guard<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Stopped),
            result = call => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_when_not_stopped() {
        let pacer = Pacer::new(CancellationToken::new(), TimingModel::default(), 1.0);
        let start = tokio::time::Instant::now();
        pacer.pause(DelayCategory::Simple).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_sleep() {
        let token = CancellationToken::new();
        let pacer = Pacer::new(token.clone(), TimingModel::default(), 1.0);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = pacer.sleep(Duration::from_secs(60)).await;
        assert!(matches!(result, Err(Error::Stopped)));
        assert!(start.elapsed() < Duration::from_secs(1));
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_refuses_after_stop() {
        let token = CancellationToken::new();
        let pacer = Pacer::new(token.clone(), TimingModel::default(), 1.0);
        assert_eq!(pacer.guard(async { Ok(7) }).await.unwrap(), 7);

        token.cancel();
        let result: Result<i32> = pacer.guard(async { Ok(7) }).await;
        assert!(result.unwrap_err().is_stop());
    }

    #[test]
    fn test_throttle_never_below_one() {
        let pacer = Pacer::new(CancellationToken::new(), TimingModel::default(), 0.2);
        assert_eq!(pacer.throttle_factor(), 1.0);
    }
}
