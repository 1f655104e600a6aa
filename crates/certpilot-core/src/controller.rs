//! Task submission facade
//!
//! [`Controller`] owns every engine component and is the one entry point for
//! front ends (HTTP routes, the daemon, tests). Long operations are submitted
//! as tokio tasks: the returned `JoinHandle` may be awaited or dropped, and
//! results always reach observers through the [`Hub`] as well.
//!
//! Completed runs and installs are appended to the run history:
//!
//! | Record         | Written by                  |
//! |----------------|-----------------------------|
//! | `obtain`       | [`Controller::submit_run`]  |
//! | `renew`        | [`Controller::submit_run`]  |
//! | `install`      | [`Controller::install_now`] |
//! | `auto-renew`   | the renewal scheduler       |
//! | `auto-install` | the renewal scheduler       |

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::{AgentManager, detect_arch};
use crate::certs::{CertificateFileKind, CertificateFiles, CertificateStatus};
use crate::config::{DesiredConfig, EngineSettings};
use crate::error::{Error, Result};
use crate::hub::{Hub, HubEvent};
use crate::orchestrator::{AgentCommand, Orchestrator, RunOutput, TracingSink};
use crate::scheduler::RenewalScheduler;
use crate::traits::{ConfigStore, DeviceInstaller, InstallReport, RunHistoryStore, RunRecord};

/// Snapshot of the engine for status endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    /// The agent binary is present
    pub lego_ready: bool,
    /// An agent run is live
    pub lego_running: bool,
    /// Release architecture of this platform
    pub arch: String,
    /// Command of the live run
    pub active_command: Option<String>,
    /// Device installation is possible
    pub installer_available: bool,
}

/// Who triggered an installation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallTrigger {
    Manual,
    Scheduled,
}

impl InstallTrigger {
    fn record_command(self) -> &'static str {
        match self {
            Self::Manual => "install",
            Self::Scheduled => "auto-install",
        }
    }

    fn success_message(self) -> &'static str {
        match self {
            Self::Manual => "Certificate installed to camera",
            Self::Scheduled => "Certificate auto-installed to camera",
        }
    }

    fn failure_prefix(self) -> &'static str {
        match self {
            Self::Manual => "Install failed",
            Self::Scheduled => "Auto-install failed",
        }
    }
}

struct Inner {
    settings: EngineSettings,
    hub: Arc<Hub>,
    agent: AgentManager,
    orchestrator: Orchestrator,
    config_store: Arc<dyn ConfigStore>,
    history: Arc<dyn RunHistoryStore>,
    installer: Option<Arc<dyn DeviceInstaller>>,
}

/// Shared handle to the engine; clones are cheap
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Wire the engine components
    ///
    /// `installer` is `None` when device credentials are unavailable; the
    /// engine then runs without installation support.
    pub fn new(
        settings: EngineSettings,
        config_store: Arc<dyn ConfigStore>,
        history: Arc<dyn RunHistoryStore>,
        installer: Option<Arc<dyn DeviceInstaller>>,
    ) -> Result<Self> {
        settings.validate()?;
        let agent = AgentManager::new(settings.clone())?;
        let orchestrator = Orchestrator::new(settings.binary_path(), settings.certs_dir());

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                hub: Arc::new(Hub::new()),
                agent,
                orchestrator,
                config_store,
                history,
                installer,
            }),
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.inner.hub
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn agent(&self) -> &AgentManager {
        &self.inner.agent
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn has_installer(&self) -> bool {
        self.inner.installer.is_some()
    }

    /// Renewal scheduler driving this controller
    pub fn scheduler(&self) -> RenewalScheduler {
        RenewalScheduler::new(self.clone())
    }

    /// Store the default configuration if none exists yet
    pub async fn seed_default_config(&self) -> Result<()> {
        if self.inner.config_store.load().await?.is_none() {
            info!("Seeding default configuration");
            self.inner
                .config_store
                .save(&DesiredConfig::default().with_defaults())
                .await?;
        }
        Ok(())
    }

    /// Current configuration with defaults applied
    ///
    /// Fails with `Config` when no configuration has been stored.
    pub async fn config(&self) -> Result<DesiredConfig> {
        self.inner
            .config_store
            .load()
            .await?
            .map(DesiredConfig::with_defaults)
            .ok_or_else(|| Error::config("no configuration found"))
    }

    /// Upsert the configuration
    pub async fn save_config(&self, config: &DesiredConfig) -> Result<()> {
        self.inner.config_store.save(config).await
    }

    /// Most recent run record
    pub async fn last_run(&self) -> Result<Option<RunRecord>> {
        self.inner.history.last().await
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            lego_ready: self.inner.agent.is_ready(),
            lego_running: self.inner.orchestrator.is_running(),
            arch: detect_arch().to_string(),
            active_command: self
                .inner
                .orchestrator
                .active_command()
                .map(|c| c.to_string()),
            installer_available: self.has_installer(),
        }
    }

    /// Download the latest agent in the background
    pub fn submit_download(&self) -> JoinHandle<Result<String>> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.inner.agent.download(&this.inner.hub).await;
            match &result {
                Ok(version) => info!(version = %version, "Agent downloaded"),
                Err(e) => error!("Agent download failed: {}", e),
            }
            result
        })
    }

    /// Start an `obtain` or `renew` run in the background
    ///
    /// The command and the stored configuration are checked before the
    /// task is spawned.
    pub async fn submit_run(&self, command: &str) -> Result<JoinHandle<Result<RunOutput>>> {
        let command: AgentCommand = command.parse()?;
        let config = self.config().await?;

        let this = self.clone();
        Ok(tokio::spawn(async move {
            let result = this.run_recorded(command.as_str(), command, &config).await;
            if let Err(e) = &result {
                error!("Agent {} failed: {}", command, e);
            }
            result
        }))
    }

    /// Cancel the live run
    pub fn stop(&self) -> Result<()> {
        self.inner.orchestrator.stop(&self.inner.hub)
    }

    /// Install the current certificate on the device in the background
    pub fn install_now(&self) -> JoinHandle<Result<InstallReport>> {
        let this = self.clone();
        tokio::spawn(async move {
            let domain = this
                .config()
                .await?
                .primary_domain()
                .ok_or_else(|| Error::config("no domain configured"))?;
            this.install_recorded(&domain, InstallTrigger::Manual).await
        })
    }

    /// Supported DNS providers; empty when they cannot be determined
    pub async fn providers(&self) -> Vec<String> {
        let agent = &self.inner.agent;
        let providers = match agent.capabilities().await {
            Ok(list) if list.is_empty() && agent.is_ready() => agent.probe().await,
            other => other,
        };
        providers.unwrap_or_else(|e| {
            warn!("Failed to determine DNS providers: {}", e);
            Vec::new()
        })
    }

    /// Certificate summary for the configured primary domain
    pub async fn certificate_status(&self) -> Result<CertificateStatus> {
        let domain = self.primary_domain().await?;
        Ok(CertificateStatus::for_domain(
            &self.inner.settings.certs_dir(),
            &domain,
        ))
    }

    /// Path of one certificate file for the primary domain
    ///
    /// Fails with `NotFound` when the file does not exist.
    pub async fn certificate_file(&self, kind: CertificateFileKind) -> Result<PathBuf> {
        let domain = self.primary_domain().await?;
        let files = CertificateFiles::for_domain(&self.inner.settings.certs_dir(), &domain);
        let path = files.path(kind).to_path_buf();
        if !path.exists() {
            return Err(Error::not_found(format!("{} does not exist", path.display())));
        }
        Ok(path)
    }

    async fn primary_domain(&self) -> Result<String> {
        let config = self.config().await?;
        Ok(config
            .primary_domain()
            .unwrap_or_else(|| config.domains.trim().to_string()))
    }

    /// Run the agent and append a history record named `record_command`
    ///
    /// Nothing is recorded when the run was never attempted because another
    /// run holds the slot.
    pub(crate) async fn run_recorded(
        &self,
        record_command: &str,
        command: AgentCommand,
        config: &DesiredConfig,
    ) -> Result<RunOutput> {
        let result = self
            .inner
            .orchestrator
            .run(config, &self.inner.hub, command.as_str(), &TracingSink)
            .await;

        let record = match &result {
            Err(Error::AlreadyRunning) => return result,
            Ok(run) => RunRecord::new(record_command, true, run.output.clone()),
            Err(e) => RunRecord::new(
                record_command,
                false,
                e.process_output()
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string()),
            ),
        };
        self.append_record(record).await;
        result
    }

    /// Install on the device, record the outcome and broadcast it
    pub(crate) async fn install_recorded(
        &self,
        domain: &str,
        trigger: InstallTrigger,
    ) -> Result<InstallReport> {
        let installer = self
            .inner
            .installer
            .as_ref()
            .ok_or_else(|| Error::config("device credentials not available"))?;

        info!(domain = %domain, installer = installer.installer_name(), "Installing certificate");
        match installer.install(domain).await {
            Ok(report) => {
                info!(
                    domain = %domain,
                    certificate_id = %report.certificate_id,
                    removed = report.removed,
                    "Certificate installed"
                );
                self.append_record(RunRecord::new(
                    trigger.record_command(),
                    true,
                    "Certificate installed successfully",
                ))
                .await;
                self.inner.hub.broadcast(HubEvent::AgentComplete {
                    message: trigger.success_message().to_string(),
                });
                Ok(report)
            }
            Err(e) => {
                error!(domain = %domain, "{}: {}", trigger.failure_prefix(), e);
                self.append_record(RunRecord::new(trigger.record_command(), false, e.to_string()))
                    .await;
                self.inner.hub.broadcast(HubEvent::AgentError {
                    error: format!("{}: {}", trigger.failure_prefix(), e),
                });
                Err(e)
            }
        }
    }

    async fn append_record(&self, record: RunRecord) {
        let command = record.command.clone();
        if let Err(e) = self.inner.history.append(record).await {
            error!(command = %command, "Failed to persist run record: {}", e);
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("data_dir", &self.inner.settings.data_dir)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn controller(store: MemoryStore, dir: &std::path::Path) -> Controller {
        Controller::new(
            EngineSettings::new(dir),
            Arc::new(store.clone()),
            Arc::new(store),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn seeds_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let controller = controller(store.clone(), dir.path());

        controller.seed_default_config().await.unwrap();
        let mut config = controller.config().await.unwrap();
        assert_eq!(config.key_type, "ec256");

        config.email = "ops@example.com".to_string();
        controller.save_config(&config).await.unwrap();
        controller.seed_default_config().await.unwrap();
        assert_eq!(controller.config().await.unwrap().email, "ops@example.com");
    }

    #[tokio::test]
    async fn submit_run_validates_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(MemoryStore::new(), dir.path());

        assert!(matches!(
            controller.submit_run("revoke").await,
            Err(Error::InvalidCommand(_))
        ));
        assert!(matches!(
            controller.submit_run("obtain").await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn install_without_installer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_config(DesiredConfig {
            domains: "cam.example.com".to_string(),
            ..Default::default()
        });
        let controller = controller(store.clone(), dir.path());

        let err = controller.install_now().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!controller.status().installer_available);
        assert_eq!(store.run_count().await, 0);
    }

    #[tokio::test]
    async fn providers_fall_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(MemoryStore::new(), dir.path());
        assert!(controller.providers().await.is_empty());
    }

    #[tokio::test]
    async fn missing_certificate_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_config(DesiredConfig {
            domains: "cam.example.com".to_string(),
            ..Default::default()
        });
        let controller = controller(store, dir.path());

        let status = controller.certificate_status().await.unwrap();
        assert_eq!(status.domain, "cam.example.com");
        assert!(!status.has_cert);
        assert!(matches!(
            controller.certificate_file(CertificateFileKind::Certificate).await,
            Err(Error::NotFound(_))
        ));
    }
}
