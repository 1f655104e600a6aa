//! Auto-renewal scheduler
//!
//! A control loop that renews the certificate when it gets close to expiry
//! and pushes the result onto the device.
//!
//! ## Timeline
//!
//! ```text
//! start ──initial delay──▶ tick ──────── period ────────▶ tick ── period ──▶ ...
//! ```
//!
//! The initial delay gives a first-boot agent download time to finish.
//!
//! ## Tick
//!
//! 1. Read the configuration; skip unless auto-mode is on, the agent is
//!    present and a primary domain is configured
//! 2. Read the certificate's expiry; skip if it is missing or unreadable
//! 3. Skip while more than the configured threshold of days remain
//! 4. Run `renew` and record it as `auto-renew`
//! 5. On success, install on the device (when credentials are available)
//!    and record it as `auto-install`
//!
//! A tick never fails: every error is logged, recorded where a run or an
//! install was attempted, and the loop waits for the next period.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::certs::{CertificateFiles, days_remaining};
use crate::controller::{Controller, InstallTrigger};
use crate::error::Error;
use crate::orchestrator::AgentCommand;

/// History record name for scheduled renewals
pub const AUTO_RENEW: &str = "auto-renew";

/// Result of the install step that follows a scheduled renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No installer configured
    Skipped,
    /// Installed under this identifier
    Installed(String),
    /// Installation failed; recorded and broadcast
    Failed,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No configuration, or auto-mode is off
    Disabled,
    /// The agent binary is missing
    AgentNotReady,
    /// No primary domain configured
    NoDomain,
    /// No readable certificate for the primary domain yet
    NoCertificate,
    /// Expiry is further away than the threshold
    NotDue { days_remaining: i64, threshold: u32 },
    /// Another run held the slot; nothing was attempted
    Busy,
    /// The renewal run failed
    RenewFailed,
    /// The renewal run was stopped before it finished
    RenewCancelled,
    /// The renewal run succeeded
    Renewed { install: InstallOutcome },
}

/// Periodic renewal driver
#[derive(Debug, Clone)]
pub struct RenewalScheduler {
    controller: Controller,
    initial_delay: Duration,
    period: Duration,
}

impl RenewalScheduler {
    /// Scheduler with the controller's configured timing
    pub fn new(controller: Controller) -> Self {
        let settings = controller.settings();
        let initial_delay = Duration::from_secs(settings.initial_delay_secs);
        let period = Duration::from_secs(settings.check_interval_secs);
        Self {
            controller,
            initial_delay,
            period,
        }
    }

    /// Run ticks until `shutdown` is cancelled
    ///
    /// A tick in progress is allowed to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            initial_delay_secs = self.initial_delay.as_secs(),
            period_secs = self.period.as_secs(),
            "Renewal scheduler started"
        );
        let start = Instant::now();

        tokio::select! {
            _ = tokio::time::sleep(self.initial_delay) => {
                self.tick().await;
            }
            _ = shutdown.cancelled() => {
                info!("Renewal scheduler stopped");
                return;
            }
        }

        let mut interval = tokio::time::interval_at(start + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.cancelled() => {
                    info!("Renewal scheduler stopped");
                    break;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) as a background task
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Perform one renewal check
    pub async fn tick(&self) -> TickOutcome {
        let outcome = self.check_and_renew().await;
        debug!(outcome = ?outcome, "Renewal check finished");
        outcome
    }

    async fn check_and_renew(&self) -> TickOutcome {
        let config = match self.controller.config().await {
            Ok(config) => config,
            Err(Error::Config(_)) => return TickOutcome::Disabled,
            Err(e) => {
                warn!("Failed to load configuration: {}", e);
                return TickOutcome::Disabled;
            }
        };
        if !config.auto_mode {
            return TickOutcome::Disabled;
        }
        if !self.controller.agent().is_ready() {
            return TickOutcome::AgentNotReady;
        }
        let Some(domain) = config.primary_domain() else {
            return TickOutcome::NoDomain;
        };

        let files = CertificateFiles::for_domain(&self.controller.settings().certs_dir(), &domain);
        let days = match days_remaining(&files.certificate, Utc::now()) {
            Ok(days) => days,
            Err(e) => {
                debug!(domain = %domain, "No usable certificate yet: {}", e);
                return TickOutcome::NoCertificate;
            }
        };

        info!(
            "Certificate expires in {} days (threshold: {})",
            days, config.auto_days
        );
        if days > i64::from(config.auto_days) {
            return TickOutcome::NotDue {
                days_remaining: days,
                threshold: config.auto_days,
            };
        }

        info!("Auto-renewing certificate (expires in {} days)", days);
        match self
            .controller
            .run_recorded(AUTO_RENEW, AgentCommand::Renew, &config)
            .await
        {
            Ok(run) if run.cancelled => {
                info!("Auto-renew stopped by user; skipping install");
                return TickOutcome::RenewCancelled;
            }
            Ok(_) => {}
            Err(Error::AlreadyRunning) => {
                info!("Skipping auto-renew: an agent run is already active");
                return TickOutcome::Busy;
            }
            Err(e) => {
                error!("Auto-renew failed: {}", e);
                return TickOutcome::RenewFailed;
            }
        }

        if !self.controller.has_installer() {
            info!("Skipping auto-install: device credentials not available");
            return TickOutcome::Renewed {
                install: InstallOutcome::Skipped,
            };
        }

        info!(domain = %domain, "Auto-installing certificate");
        let install = match self
            .controller
            .install_recorded(&domain, InstallTrigger::Scheduled)
            .await
        {
            Ok(report) => InstallOutcome::Installed(report.certificate_id),
            Err(_) => InstallOutcome::Failed,
        };
        TickOutcome::Renewed { install }
    }
}
