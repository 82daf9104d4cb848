//! Polling loop
//!
//! [`Monitor`] owns an executor and re-runs `check` at the adaptive interval,
//! streaming each result to the notification side over an mpsc channel.
//! Owning the executor keeps at most one invocation in flight.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::driver::PageDriver;
use crate::executor::StealthExecutor;
use crate::protocol::{OperationResult, ProtocolState};
use crate::session::StopHandle;
use crate::CheckConfig;

/// Re-invokes `check` until stopped
pub struct Monitor<D: PageDriver> {
    executor: StealthExecutor<D>,
    check: CheckConfig,
    max_cycles: Option<u64>,
}

impl<D: PageDriver> Monitor<D> {
    pub fn new(executor: StealthExecutor<D>, check: CheckConfig) -> Self {
        Self {
            executor,
            check,
            max_cycles: None,
        }
    }

    /// Stop after this many invocations
    pub fn max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    pub fn executor(&self) -> &StealthExecutor<D> {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut StealthExecutor<D> {
        &mut self.executor
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.executor.stop_handle()
    }

    /// Hand the executor back, e.g. to run `execute_change` on a found slot
    pub fn into_executor(self) -> StealthExecutor<D> {
        self.executor
    }

    /// Run until the stop handle fires, the receiver is dropped or the cycle
    /// limit is reached. Returns the number of invocations made.
    pub async fn run(&mut self, results: mpsc::Sender<OperationResult>) -> u64 {
        let stop = self.executor.stop_handle();
        let mut cycles = 0;

        loop {
            if stop.is_stopped() {
                info!(cycles, "Monitor stopped");
                break;
            }

            let result = self.executor.check(&self.check).await;
            cycles += 1;
            let halted = result.final_state == ProtocolState::EmergencyStopped;

            if results.send(result).await.is_err() {
                debug!("Result receiver dropped, ending monitor");
                break;
            }
            if halted || self.max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }

            let interval = self.executor.next_interval();
            debug!(interval_ms = interval.as_millis() as u64, "Next check scheduled");

            let token = stop.token();
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(cycles, "Monitor stopped while idle");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::BookingStrategy;
    use crate::driver::simulated::BookingSite;
    use crate::StealthConfig;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn monitor() -> Monitor<crate::driver::SimulatedPage> {
        let page = BookingSite::new("1 March 2025", "8:10am")
            .offer("2025-02-10", &["09:00"])
            .build();
        Monitor::new(
            StealthExecutor::new(page, StealthConfig::default()),
            CheckConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_each_cycle() {
        let mut monitor = monitor().max_cycles(3);
        let (tx, mut rx) = mpsc::channel(8);

        let cycles = monitor.run(tx).await;

        assert_eq!(cycles, 3);
        let mut received = 0;
        while let Some(result) = rx.recv().await {
            assert!(result.success, "cycle {received}: {:?}", result.detail);
            let booking = result.current_booking.expect("booking read every cycle");
            assert_eq!(booking.date, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
            assert_eq!(booking.source, BookingStrategy::Selectors);
            assert_eq!(result.slots_found.len(), 1);
            received += 1;
        }
        assert_eq!(received, 3);
        let metrics = monitor.executor().session().metrics();
        assert_eq!(metrics.checks_performed, 3);
        assert_eq!(metrics.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_idle_wait() {
        let mut monitor = monitor();
        let stop = monitor.stop_handle();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(async move { monitor.run(tx).await });

        let first = rx.recv().await.unwrap();
        assert!(first.success);
        stop.emergency_stop();

        let cycles = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_ends_loop() {
        let mut monitor = monitor();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        assert_eq!(monitor.run(tx).await, 1);
    }
}
