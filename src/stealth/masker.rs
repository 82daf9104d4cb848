//! Fingerprint masking
//!
//! Installs the evasion script once per page context. Masking is best
//! effort: a driver failure leaves the page unmasked and is logged, and the
//! caller carries on. Only a stop request ends the invocation.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::evasions::{build_evasion_script, MaskingConfig, VERIFY_EXPRESSION};
use super::fingerprint::HardwareProfile;
use crate::driver::PageDriver;
use crate::error::Result;
use crate::pacer::Pacer;

/// Masking state of the session's current page context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MaskState {
    /// Nothing applied yet
    Unmasked,
    /// Evasions installed and verified in this context
    Masked { context_id: String },
    /// Installation or verification failed in this context
    Degraded { context_id: String, reason: String },
    /// Masking switched off by configuration
    Disabled,
}

impl MaskState {
    /// Context this state applies to, if any
    pub fn context_id(&self) -> Option<&str> {
        match self {
            MaskState::Masked { context_id } | MaskState::Degraded { context_id, .. } => {
                Some(context_id.as_str())
            }
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, MaskState::Degraded { .. })
    }
}

/// Rewrites observable automation signals before any interaction
#[derive(Debug, Clone, Default)]
pub struct FingerprintMasker {
    config: MaskingConfig,
}

impl FingerprintMasker {
    pub fn new(config: MaskingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MaskingConfig {
        &self.config
    }

    /// Apply masking to the driver's current page context.
    ///
    /// Returns the new state; when `current` already covers this context it
    /// is returned unchanged and the page is not touched again. Every driver
    /// call goes through `pacer`, so a stop ends masking with
    /// [`Error::Stopped`](crate::Error::Stopped) instead of degrading.
    pub async fn apply<D>(
        &self,
        driver: &D,
        pacer: &Pacer,
        profile: &HardwareProfile,
        current: &MaskState,
    ) -> Result<MaskState>
    where
        D: PageDriver + ?Sized,
    {
        if !self.config.enabled {
            return Ok(MaskState::Disabled);
        }

        let context_id = match pacer.guard(driver.context_id()).await {
            Ok(id) => id,
            Err(e) if e.is_stop() => return Err(e),
            Err(e) => {
                warn!(error = %e, "masking_degraded: page context unavailable");
                return Ok(MaskState::Degraded {
                    context_id: String::new(),
                    reason: e.to_string(),
                });
            }
        };

        if current.context_id() == Some(context_id.as_str()) {
            debug!(context = %context_id, "Masking already applied to context");
            return Ok(current.clone());
        }

        let state = match self.install(driver, pacer, profile).await {
            Ok(true) => {
                debug!(context = %context_id, "Fingerprint masking applied");
                MaskState::Masked { context_id }
            }
            Ok(false) => {
                warn!(context = %context_id, "masking_degraded: webdriver flag still visible");
                MaskState::Degraded {
                    context_id,
                    reason: "verification failed".to_string(),
                }
            }
            Err(e) if e.is_stop() => return Err(e),
            Err(e) => {
                warn!(context = %context_id, error = %e, "masking_degraded: falling back to unmasked page");
                MaskState::Degraded {
                    context_id,
                    reason: e.to_string(),
                }
            }
        };
        Ok(state)
    }

    async fn install<D>(&self, driver: &D, pacer: &Pacer, profile: &HardwareProfile) -> Result<bool>
    where
        D: PageDriver + ?Sized,
    {
        let script = build_evasion_script(profile, &self.config);
        // Future documents get it from the init hook, the current one now
        pacer.guard(driver.add_init_script(&script)).await?;
        pacer.guard(driver.evaluate(&script)).await?;
        let verified = pacer.guard(driver.evaluate(VERIFY_EXPRESSION)).await?;
        Ok(verified.as_bool().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedPage;
    use crate::error::Error;
    use crate::stealth::TimingModel;
    use tokio_util::sync::CancellationToken;

    fn pacer() -> Pacer {
        Pacer::new(CancellationToken::new(), TimingModel::default(), 1.0)
    }

    #[tokio::test]
    async fn test_apply_masks_once_per_context() {
        let page = SimulatedPage::builder().build();
        let masker = FingerprintMasker::default();
        let profile = HardwareProfile::random();
        let pacer = pacer();

        let state = masker
            .apply(&page, &pacer, &profile, &MaskState::Unmasked)
            .await
            .unwrap();
        assert!(matches!(state, MaskState::Masked { .. }));
        assert_eq!(page.init_scripts().len(), 1);
        assert_eq!(page.evaluations().len(), 2);

        let again = masker.apply(&page, &pacer, &profile, &state).await.unwrap();
        assert_eq!(again, state);
        assert_eq!(page.init_scripts().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_degrades_silently() {
        let page = SimulatedPage::builder().fail_masking().build();
        let masker = FingerprintMasker::default();

        let state = masker
            .apply(&page, &pacer(), &HardwareProfile::random(), &MaskState::Unmasked)
            .await
            .unwrap();
        assert!(state.is_degraded());
        assert_eq!(state.context_id(), Some("ctx-1"));
    }

    #[tokio::test]
    async fn test_disabled_leaves_page_untouched() {
        let page = SimulatedPage::builder().build();
        let masker = FingerprintMasker::new(MaskingConfig {
            enabled: false,
            ..Default::default()
        });
        let state = masker
            .apply(&page, &pacer(), &HardwareProfile::random(), &MaskState::Unmasked)
            .await
            .unwrap();
        assert_eq!(state, MaskState::Disabled);
        assert_eq!(page.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_during_install_skips_remaining_calls() {
        let token = CancellationToken::new();
        let pacer = Pacer::new(token.clone(), TimingModel::default(), 1.0);
        let page = SimulatedPage::builder()
            .on_init_script_hook(move || token.cancel())
            .build();

        let result = FingerprintMasker::default()
            .apply(&page, &pacer, &HardwareProfile::random(), &MaskState::Unmasked)
            .await;

        assert!(matches!(result, Err(Error::Stopped)));
        assert!(page.evaluations().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_pacer_leaves_page_untouched() {
        let token = CancellationToken::new();
        token.cancel();
        let pacer = Pacer::new(token, TimingModel::default(), 1.0);
        let page = SimulatedPage::builder().build();

        let result = FingerprintMasker::default()
            .apply(&page, &pacer, &HardwareProfile::random(), &MaskState::Unmasked)
            .await;

        assert!(matches!(result, Err(Error::Stopped)));
        assert_eq!(page.call_count(), 0);
    }
}
