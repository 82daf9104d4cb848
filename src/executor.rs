//! Stealth operation executor
//!
//! [`StealthExecutor`] owns one page driver and the session bound to it and
//! runs the interaction protocol for each `check` or `execute_change` call.
//! Step code propagates errors with `?`; [`StealthExecutor::invoke`] is the
//! one place where an error becomes a terminal state and a reason code.

use std::time::Duration;

use chrono::NaiveTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::booking::{self, BookingStrategy, CandidateSlot, CurrentBooking, PageSelectors};
use crate::driver::{ElementHandle, PageDriver, ReadyState};
use crate::error::{Error, FailureReason, Result};
use crate::pacer::Pacer;
use crate::protocol::{OperationResult, ProtocolRun, ProtocolState};
use crate::risk::{Policy, RiskAssessor, RiskLevel};
use crate::session::{Session, StopHandle};
use crate::stealth::timing::{random_bool, random_f64_range, random_range};
use crate::stealth::{DelayCategory, FingerprintMasker, MotionSimulator, TimingModel};
use crate::{CheckConfig, StealthConfig};

#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    Check,
    Change(&'a CandidateSlot),
}

/// What an invocation learned before it ended
#[derive(Debug, Default)]
struct Progress {
    booking: Option<CurrentBooking>,
    slots: Vec<CandidateSlot>,
}

/// Runs stealth operations against one page context
pub struct StealthExecutor<D: PageDriver> {
    driver: D,
    config: StealthConfig,
    timing: TimingModel,
    risk: RiskAssessor,
    masker: FingerprintMasker,
    motion: MotionSimulator,
    session: Session,
}

impl<D: PageDriver> StealthExecutor<D> {
    /// Executor with a fresh session
    pub fn new(driver: D, config: StealthConfig) -> Self {
        Self::with_session(driver, config, Session::new())
    }

    /// Executor continuing an existing session
    pub fn with_session(driver: D, config: StealthConfig, session: Session) -> Self {
        Self {
            timing: TimingModel::new(config.timing.clone()),
            risk: RiskAssessor::new(config.risk.clone()),
            masker: FingerprintMasker::new(config.masking.clone()),
            motion: MotionSimulator::new(),
            driver,
            config,
            session,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &StealthConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Mutable session access, e.g. for an external metrics reset
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Handle for stopping from outside the running invocation
    pub fn stop_handle(&self) -> StopHandle {
        self.session.stop_handle()
    }

    /// Halt the running invocation and refuse new ones until resumed
    pub fn emergency_stop(&self) {
        self.session.emergency_stop();
    }

    pub fn current_risk(&self) -> RiskLevel {
        let metrics = self.session.metrics();
        self.risk.current_risk(metrics, metrics.elapsed())
    }

    /// Policy a new invocation would run under right now
    pub fn policy(&self) -> Policy {
        if self.session.stop_handle().is_stopped() {
            return Policy::blocked();
        }
        self.risk.policy_for(self.current_risk())
    }

    /// Wait before the next polling cycle
    pub fn next_interval(&self) -> Duration {
        self.timing
            .adaptive_interval(self.session.metrics().success_rate(), self.current_risk())
    }

    /// Look for slots earlier than the current booking.
    ///
    /// A run refused up front (risk HIGH or a latched stop) reports
    /// `blocked: true` and changes none of the session counters.
    pub async fn check(&mut self, check: &CheckConfig) -> OperationResult {
        self.invoke(Request::Check, check).await
    }

    /// Search again and move the booking to `slot`
    pub async fn execute_change(
        &mut self,
        slot: &CandidateSlot,
        check: &CheckConfig,
    ) -> OperationResult {
        self.invoke(Request::Change(slot), check).await
    }

    /// Run one invocation and settle the session counters.
    ///
    /// Refused runs count nothing: a `risk_blocked` failure adds neither a
    /// check nor a failure, so a HIGH session can fall back once its window
    /// moves on. Admitted runs count one check, then one success or one
    /// failure; a mid-run stop adds neither.
    async fn invoke(&mut self, request: Request<'_>, check: &CheckConfig) -> OperationResult {
        let mut run = ProtocolRun::begin();
        let risk = self.current_risk();
        let stop = self.session.stop_handle();

        if stop.is_stopped() {
            run.terminate(ProtocolState::EmergencyStopped);
            return self.report(
                run,
                risk,
                Policy::blocked(),
                Progress::default(),
                Some(Error::Stopped),
            );
        }

        let policy = self.risk.policy_for(risk);
        if !policy.allow {
            run.terminate(ProtocolState::Failed);
            return self.report(
                run,
                risk,
                policy,
                Progress::default(),
                Some(Error::step(FailureReason::RiskBlocked)),
            );
        }

        self.session.metrics_mut().record_check();
        debug!(risk = ?risk, throttle = policy.throttle_factor, "Precheck passed");

        let pacer = Pacer::new(stop.token(), self.timing.clone(), policy.throttle_factor);
        let mut progress = Progress::default();
        let outcome = self
            .run_steps(&mut run, &pacer, request, check, &mut progress)
            .await;

        let error = match outcome {
            Ok(()) => {
                self.session.metrics_mut().record_success();
                None
            }
            Err(e) if e.is_stop() => {
                run.terminate(ProtocolState::EmergencyStopped);
                Some(e)
            }
            Err(e) => {
                run.terminate(ProtocolState::Failed);
                self.session.metrics_mut().record_failure();
                Some(e)
            }
        };

        self.report(run, risk, policy, progress, error)
    }

    fn report(
        &self,
        run: ProtocolRun,
        risk: RiskLevel,
        policy: Policy,
        progress: Progress,
        error: Option<Error>,
    ) -> OperationResult {
        let final_state = run.state();
        let blocked = !policy.allow || final_state == ProtocolState::EmergencyStopped;

        let result = OperationResult {
            success: final_state == ProtocolState::Done,
            risk_level: risk,
            slots_found: progress.slots,
            blocked,
            error: error.as_ref().map(Error::reason),
            detail: error.as_ref().map(|e| e.to_string()),
            final_state,
            current_booking: progress.booking,
            throttle_factor: policy.throttle_factor,
            trace: run.trace().to_vec(),
        };

        let metrics = self.session.metrics();
        match (final_state, &result.error) {
            (ProtocolState::Done, _) => info!(
                slots = result.slots_found.len(),
                risk = ?risk,
                checks = metrics.checks_performed,
                "Operation completed"
            ),
            (_, Some(reason)) if blocked => info!(
                reason = %reason,
                risk = ?risk,
                "Operation blocked"
            ),
            (_, reason) => warn!(
                reason = ?reason,
                detail = result.detail.as_deref().unwrap_or_default(),
                failures = metrics.failures,
                "Operation failed"
            ),
        }

        result
    }

    async fn run_steps(
        &mut self,
        run: &mut ProtocolRun,
        pacer: &Pacer,
        request: Request<'_>,
        check: &CheckConfig,
        progress: &mut Progress,
    ) -> Result<()> {
        let selectors = self.config.selectors.clone();

        run.advance(ProtocolState::Warmup)?;
        self.warmup(pacer, check.rapid_mode).await?;

        run.advance(ProtocolState::ReadBooking)?;
        self.return_to_booking(pacer, &selectors).await?;
        let booking = booking::read_booking(
            &self.driver,
            pacer,
            &selectors,
            &BookingStrategy::DEFAULT_ORDER,
        )
        .await?;
        info!(
            date = %booking.date,
            centre = booking.centre_id.as_deref().unwrap_or("-"),
            "Current booking"
        );
        progress.booking = Some(booking.clone());
        pacer.pause(DelayCategory::Reading).await?;

        run.advance(ProtocolState::Navigate)?;
        self.click_selector(
            pacer,
            &selectors.change_booking,
            FailureReason::NavigationTargetNotFound,
        )
        .await?;
        self.wait_for_navigation(pacer).await?;

        run.advance(ProtocolState::Search)?;
        self.search(pacer, &selectors, &booking, check, &mut progress.slots)
            .await?;

        let slot = match request {
            Request::Check => return run.advance(ProtocolState::Done),
            Request::Change(slot) => slot,
        };

        run.begin_execute(&progress.slots)?;
        self.execute(pacer, &selectors, slot, &progress.slots).await?;

        run.advance(ProtocolState::Review)?;
        self.review(pacer).await?;

        run.advance(ProtocolState::Confirm)?;
        self.confirm(pacer, &selectors).await?;

        run.advance(ProtocolState::Done)
    }

    async fn warmup(&mut self, pacer: &Pacer, rapid: bool) -> Result<()> {
        pacer.check()?;
        let state = self
            .masker
            .apply(
                &self.driver,
                pacer,
                self.session.profile(),
                self.session.mask_state(),
            )
            .await?;
        self.session.set_mask_state(state);

        let gestures = if rapid { 1 } else { random_range(2, 5) };
        for _ in 0..gestures {
            if random_bool(0.5) {
                let delta = random_f64_range(80.0, 400.0);
                self.motion.scroll(&self.driver, pacer, delta).await?;
            } else {
                self.motion.idle_jitter(&self.driver, pacer).await?;
            }
            pacer.pause(DelayCategory::Simple).await?;
        }
        Ok(())
    }

    /// Bring the page back to the booking overview left by a previous run
    async fn return_to_booking(&mut self, pacer: &Pacer, selectors: &PageSelectors) -> Result<()> {
        let Some(link) = pacer.guard(self.driver.query(&selectors.booking_view)).await? else {
            return Ok(());
        };
        debug!("Returning to booking overview");
        self.click_element(pacer, link, FailureReason::BookingNotFound)
            .await?;
        self.wait_for_navigation(pacer).await?;
        pacer.pause(DelayCategory::Simple).await
    }

    async fn search(
        &mut self,
        pacer: &Pacer,
        selectors: &PageSelectors,
        booking: &CurrentBooking,
        check: &CheckConfig,
        slots: &mut Vec<CandidateSlot>,
    ) -> Result<()> {
        let markers = pacer
            .guard(self.driver.query_all(&selectors.availability_marker))
            .await?;

        let mut earlier = Vec::new();
        for marker in markers {
            let Some(date) = booking::marker_date(&self.driver, pacer, selectors, marker).await?
            else {
                continue;
            };
            if date >= booking.date || !check.date_range.contains(date) {
                continue;
            }
            let centre = pacer
                .guard(self.driver.attribute(marker, &selectors.marker_centre_attr))
                .await?
                .or_else(|| booking.centre_id.clone());
            if !check.accepts_centre(centre.as_deref()) {
                debug!(%date, centre = ?centre, "Skipping date at another centre");
                continue;
            }
            earlier.push((marker, date, centre));
        }
        debug!(earlier = earlier.len(), "Earlier dates on offer");

        let skim = if check.rapid_mode {
            DelayCategory::Simple
        } else {
            DelayCategory::Reading
        };

        for (marker, date, centre) in earlier {
            if slots.len() >= self.config.max_candidates {
                break;
            }

            let Some(bounds) = pacer.guard(self.driver.bounding_box(marker)).await? else {
                continue;
            };
            self.motion.click(&self.driver, pacer, &bounds).await?;
            let options = self.wait_for_all(pacer, &selectors.time_option).await?;
            pacer.pause(skim).await?;

            let mut times = Vec::new();
            for option in options {
                if let Some(time) = booking::option_time(&self.driver, pacer, selectors, option).await? {
                    if !times.contains(&time) {
                        times.push(time);
                    }
                }
            }
            if times.is_empty() {
                debug!(%date, "No valid times offered");
                continue;
            }

            if let Some(slot) = CandidateSlot::earlier_than(booking, date, times, centre) {
                info!(
                    date = %slot.date(),
                    times = slot.times().len(),
                    months_gained = slot.lead_time_delta(),
                    "Earlier slot found"
                );
                slots.push(slot);
            }
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        pacer: &Pacer,
        selectors: &PageSelectors,
        slot: &CandidateSlot,
        found: &[CandidateSlot],
    ) -> Result<()> {
        let Some(offered) = found.iter().find(|s| s.date() == slot.date()) else {
            return Err(Error::step_with(
                FailureReason::DateNotFound,
                format!("{} was not offered in this search", slot.date()),
            ));
        };

        let markers = pacer
            .guard(self.driver.query_all(&selectors.availability_marker))
            .await?;
        let mut target = None;
        for marker in markers {
            if booking::marker_date(&self.driver, pacer, selectors, marker).await? == Some(slot.date()) {
                target = Some(marker);
                break;
            }
        }
        let marker = target.ok_or_else(|| {
            Error::step_with(
                FailureReason::DateNotFound,
                format!("no marker for {}", slot.date()),
            )
        })?;
        self.click_element(pacer, marker, FailureReason::DateNotFound)
            .await?;
        pacer.pause(DelayCategory::Decision).await?;

        // Requested times in preference order, limited to what is still offered
        let wanted: Vec<NaiveTime> = slot
            .times()
            .iter()
            .filter(|t| offered.times().contains(t))
            .copied()
            .collect();

        let options = self.wait_for_all(pacer, &selectors.time_option).await?;
        let mut choice: Option<(usize, ElementHandle)> = None;
        for option in options {
            let Some(time) = booking::option_time(&self.driver, pacer, selectors, option).await?
            else {
                continue;
            };
            if let Some(rank) = wanted.iter().position(|w| *w == time) {
                if choice.map_or(true, |(best, _)| rank < best) {
                    choice = Some((rank, option));
                }
            }
        }
        let (rank, option) = choice.ok_or_else(|| {
            Error::step_with(
                FailureReason::TimeNotFound,
                format!("none of the requested times is offered on {}", slot.date()),
            )
        })?;
        debug!(date = %slot.date(), time = %wanted[rank], "Selecting slot");
        self.click_element(pacer, option, FailureReason::TimeNotFound)
            .await?;
        pacer.pause(DelayCategory::Simple).await?;

        self.click_selector(
            pacer,
            &selectors.continue_button,
            FailureReason::ContinueNotFound,
        )
        .await?;
        self.wait_for_navigation(pacer).await
    }

    async fn review(&mut self, pacer: &Pacer) -> Result<()> {
        let delta = random_f64_range(200.0, 600.0);
        self.motion.scroll(&self.driver, pacer, delta).await?;
        pacer.pause(DelayCategory::Important).await
    }

    async fn confirm(&mut self, pacer: &Pacer, selectors: &PageSelectors) -> Result<()> {
        self.click_selector(
            pacer,
            &selectors.confirm_button,
            FailureReason::ConfirmNotFound,
        )
        .await?;
        self.wait_for_navigation(pacer).await?;

        let indicator = self
            .wait_for_all(pacer, &selectors.success_indicator)
            .await?;
        if indicator.is_empty() {
            return Err(Error::step_with(
                FailureReason::ConfirmationNotDetected,
                format!(
                    "no success indicator within {}ms",
                    self.config.element_timeout_ms
                ),
            ));
        }
        info!("Booking change confirmed");
        Ok(())
    }

    async fn click_selector(
        &mut self,
        pacer: &Pacer,
        selector: &str,
        missing: FailureReason,
    ) -> Result<()> {
        let element = pacer
            .guard(self.driver.query(selector))
            .await?
            .ok_or_else(|| Error::step_with(missing, format!("no element matches '{selector}'")))?;
        self.click_element(pacer, element, missing).await
    }

    async fn click_element(
        &mut self,
        pacer: &Pacer,
        element: ElementHandle,
        missing: FailureReason,
    ) -> Result<()> {
        let bounds = pacer
            .guard(self.driver.bounding_box(element))
            .await?
            .ok_or_else(|| Error::step_with(missing, "element is not rendered"))?;
        self.motion.click(&self.driver, pacer, &bounds).await
    }

    /// Poll `readyState` until the document is complete
    async fn wait_for_navigation(&self, pacer: &Pacer) -> Result<()> {
        let start = Instant::now();
        let timeout_ms = self.config.navigation_timeout_ms;
        let timeout = Duration::from_millis(timeout_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            match pacer.guard(self.driver.ready_state()).await {
                Ok(ReadyState::Complete) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_stop() => return Err(e),
                // Page might be navigating, readyState unavailable - keep waiting
                Err(_) => {}
            }

            if start.elapsed() > timeout {
                return Err(Error::Timeout(format!(
                    "Navigation did not complete within {}ms",
                    timeout_ms
                )));
            }

            pacer.sleep(poll_interval).await?;
        }
    }

    /// Poll until `selector` matches something or the element timeout passes
    async fn wait_for_all(&self, pacer: &Pacer, selector: &str) -> Result<Vec<ElementHandle>> {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.element_timeout_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let found = pacer.guard(self.driver.query_all(selector)).await?;
            if !found.is_empty() || start.elapsed() > timeout {
                return Ok(found);
            }
            pacer.sleep(poll_interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::BookingSite;
    use crate::driver::SimulatedPage;
    use chrono::NaiveDate;

    fn executor(page: SimulatedPage) -> StealthExecutor<SimulatedPage> {
        StealthExecutor::new(page, StealthConfig::default())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_walks_the_protocol() {
        let page = BookingSite::new("1 March 2025", "8:10am")
            .offer("2025-02-10", &["09:00", "13:30"])
            .build();
        let mut exec = executor(page);

        let result = exec.check(&CheckConfig::default()).await;

        assert!(result.success, "{:?}", result.detail);
        assert_eq!(
            result.trace,
            vec![
                ProtocolState::Idle,
                ProtocolState::Precheck,
                ProtocolState::Warmup,
                ProtocolState::ReadBooking,
                ProtocolState::Navigate,
                ProtocolState::Search,
                ProtocolState::Done,
            ]
        );
        assert_eq!(result.slots_found.len(), 1);
        assert_eq!(result.slots_found[0].date(), date(2025, 2, 10));
        assert_eq!(result.slots_found[0].times().len(), 2);
        assert_eq!(exec.session().metrics().successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_respects_date_range_and_centres() {
        let page = BookingSite::new("1 March 2025", "8:10am")
            .offer_at("2025-01-20", "York", &["09:00"])
            .offer_at("2025-02-03", "Leeds", &["10:00"])
            .offer_at("2025-02-17", "Leeds", &["11:00"])
            .build();
        let mut exec = executor(page);
        let check = CheckConfig {
            centres: vec!["Leeds".into()],
            date_range: crate::DateRange::new(None, Some(date(2025, 2, 10))),
            rapid_mode: true,
        };

        let result = exec.check(&check).await;

        let dates: Vec<_> = result.slots_found.iter().map(|s| s.date()).collect();
        assert_eq!(dates, vec![date(2025, 2, 3)]);
        assert_eq!(result.slots_found[0].centre_id(), Some("Leeds"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_capped() {
        let mut site = BookingSite::new("30 June 2025", "8:10am");
        for day in 1..=8 {
            site = site.offer(format!("2025-05-{day:02}"), &["09:00"]);
        }
        let mut exec = executor(site.build());

        let result = exec.check(&CheckConfig::default()).await;

        assert!(result.success);
        assert_eq!(result.slots_found.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dates_without_times_are_skipped() {
        let page = BookingSite::new("1 March 2025", "8:10am")
            .offer("2025-02-10", &[])
            .offer("2025-02-11", &["not a time"])
            .build();
        let mut exec = executor(page);

        let result = exec.check(&CheckConfig::default()).await;

        assert!(result.success);
        assert!(result.slots_found.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_risk_throttles() {
        let page = BookingSite::new("1 March 2025", "8:10am").build();
        let mut exec = executor(page);
        {
            let metrics = exec.session_mut().metrics_mut();
            metrics.checks_performed = 10;
            metrics.successes = 8;
            metrics.failures = 2;
        }
        assert_eq!(exec.current_risk(), RiskLevel::Medium);

        let result = exec.check(&CheckConfig::default()).await;

        assert_eq!(result.risk_level, RiskLevel::Medium);
        assert!(!result.blocked);
        assert_eq!(result.throttle_factor, 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latched_stop_blocks_without_counting() {
        let page = BookingSite::new("1 March 2025", "8:10am").build();
        let mut exec = executor(page);
        exec.emergency_stop();

        let result = exec.check(&CheckConfig::default()).await;

        assert!(result.blocked);
        assert_eq!(result.error, Some(FailureReason::EmergencyStopped));
        assert_eq!(result.final_state, ProtocolState::EmergencyStopped);
        assert_eq!(exec.session().metrics().checks_performed, 0);
        assert_eq!(exec.driver().call_count(), 0);
        assert_eq!(exec.policy(), Policy::blocked());

        exec.stop_handle().resume();
        let result = exec.check(&CheckConfig::default()).await;
        assert!(result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_interval_grows_with_failures() {
        let page = BookingSite::new("1 March 2025", "8:10am").build();
        let mut exec = executor(page);
        let fresh = exec.next_interval();

        let metrics = exec.session_mut().metrics_mut();
        metrics.checks_performed = 20;
        metrics.successes = 17;
        metrics.failures = 3;

        assert!(exec.next_interval() > fresh);
    }
}
