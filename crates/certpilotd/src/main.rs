// # certpilotd - Certificate Lifecycle Daemon
//
// Thin integration layer: reads configuration from the environment, wires
// the engine from `certpilot-core` with the VAPIX installer, and runs the
// renewal scheduler until SIGTERM/SIGINT. No certificate logic lives here.
//
// The daemon is responsible for:
// 1. Reading and validating environment configuration
// 2. Initializing logging and the runtime
// 3. Opening the state file and seeding the default configuration
// 4. Fetching the lego binary on first boot
// 5. Running the renewal scheduler
//
// ## Configuration
//
// - `CERTPILOT_DATA_DIR`: Data directory (default `./localdata`)
// - `CERTPILOT_LOG_LEVEL`: trace, debug, info, warn, error (default `info`)
// - `CERTPILOT_DEVICE_URL`: Device base URL (default `http://127.0.0.12`)
// - `CERTPILOT_DEVICE_USER`: Device account name
// - `CERTPILOT_DEVICE_PASSWORD`: Device account password
// - `CERTPILOT_CHECK_INTERVAL_SECS`: Renewal check period (default 86400)
// - `CERTPILOT_INITIAL_DELAY_SECS`: Delay before the first check (default 30)
//
// Without device credentials the daemon still obtains and renews
// certificates but never installs them.
//
// ## Example
//
// ```bash
// export CERTPILOT_DATA_DIR=/var/lib/certpilot
// export CERTPILOT_DEVICE_USER=root
// export CERTPILOT_DEVICE_PASSWORD=secret
//
// certpilotd
// ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use certpilot_core::hub::{DeliveryError, Frame};
use certpilot_core::{
    Controller, CredentialSource, Credentials, DeviceInstaller, EngineSettings, FileStore,
    Subscriber,
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long a running scheduler tick may take to finish after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum CertpilotExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<CertpilotExitCode> for ExitCode {
    fn from(code: CertpilotExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
struct Config {
    data_dir: PathBuf,
    log_level: String,
    device_url: String,
    device_user: Option<String>,
    device_password: Option<String>,
    check_interval_secs: Option<u64>,
    initial_delay_secs: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            data_dir: env::var("CERTPILOT_DATA_DIR")
                .unwrap_or_else(|_| "./localdata".to_string())
                .into(),
            log_level: env::var("CERTPILOT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            device_url: env::var("CERTPILOT_DEVICE_URL")
                .unwrap_or_else(|_| "http://127.0.0.12".to_string()),
            device_user: non_empty_var("CERTPILOT_DEVICE_USER"),
            device_password: non_empty_var("CERTPILOT_DEVICE_PASSWORD"),
            check_interval_secs: parse_var("CERTPILOT_CHECK_INTERVAL_SECS")?,
            initial_delay_secs: parse_var("CERTPILOT_INITIAL_DELAY_SECS")?,
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "CERTPILOT_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        if !self.device_url.starts_with("http://") && !self.device_url.starts_with("https://") {
            anyhow::bail!(
                "CERTPILOT_DEVICE_URL must use HTTP or HTTPS scheme. Got: {}",
                self.device_url
            );
        }

        if self.device_user.is_some() != self.device_password.is_some() {
            anyhow::bail!(
                "CERTPILOT_DEVICE_USER and CERTPILOT_DEVICE_PASSWORD must be set together"
            );
        }

        if let Some(interval) = self.check_interval_secs
            && !(60..=7 * 86_400).contains(&interval)
        {
            anyhow::bail!(
                "CERTPILOT_CHECK_INTERVAL_SECS must be between 60 and 604800 seconds. Got: {}",
                interval
            );
        }

        if let Some(delay) = self.initial_delay_secs
            && delay > 3600
        {
            anyhow::bail!(
                "CERTPILOT_INITIAL_DELAY_SECS must be at most 3600 seconds. Got: {}",
                delay
            );
        }

        self.settings().validate()?;
        Ok(())
    }

    /// Engine settings with the environment overrides applied
    fn settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::new(&self.data_dir);
        if let Some(interval) = self.check_interval_secs {
            settings.check_interval_secs = interval;
        }
        if let Some(delay) = self.initial_delay_secs {
            settings.initial_delay_secs = delay;
        }
        settings
    }

    fn log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var(name: &str) -> Result<Option<u64>> {
    non_empty_var(name)
        .map(|v| {
            v.parse()
                .with_context(|| format!("{name} must be a whole number of seconds. Got: {v}"))
        })
        .transpose()
}

/// Device credentials taken from the environment
struct EnvCredentials {
    username: Option<String>,
    password: Option<String>,
}

#[async_trait]
impl CredentialSource for EnvCredentials {
    async fn credentials(&self) -> certpilot_core::Result<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Ok(Credentials::new(user, password)),
            _ => Err(certpilot_core::Error::config(
                "CERTPILOT_DEVICE_USER/CERTPILOT_DEVICE_PASSWORD not set",
            )),
        }
    }
}

/// Hub observer that mirrors every event into the log
struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn deliver(&self, frame: &Frame) -> std::result::Result<(), DeliveryError> {
        debug!(event = %frame, "hub");
        Ok(())
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return CertpilotExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return CertpilotExitCode::ConfigError.into();
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CertpilotExitCode::ConfigError.into();
    }

    info!("Starting certpilotd {}", env!("CARGO_PKG_VERSION"));

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CertpilotExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            CertpilotExitCode::RuntimeError
        } else {
            CertpilotExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon until a shutdown signal arrives
async fn run_daemon(config: Config) -> Result<()> {
    let settings = config.settings();
    tokio::fs::create_dir_all(&settings.data_dir)
        .await
        .with_context(|| format!("failed to create {}", settings.data_dir.display()))?;

    let store = Arc::new(FileStore::new(settings.state_path()).await?);
    let installer = build_installer(&config, &settings).await;

    let controller = Controller::new(settings, store.clone(), store, installer)?;
    controller.hub().register(Arc::new(LogSubscriber));
    controller.seed_default_config().await?;

    let status = controller.status();
    info!(
        arch = %status.arch,
        lego_ready = status.lego_ready,
        installer = status.installer_available,
        "Engine initialized"
    );

    if !status.lego_ready {
        info!("lego binary not found, downloading");
        // Failures are broadcast and logged; the daemon keeps running
        drop(controller.submit_download());
    }

    let shutdown = CancellationToken::new();
    let scheduler = controller.scheduler().spawn(shutdown.clone());

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);

    shutdown.cancel();
    if controller.stop().is_ok() {
        info!("Stopped running lego process");
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, scheduler).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => anyhow::bail!("renewal scheduler panicked: {}", e),
        Err(_) => warn!("Renewal scheduler did not stop within {:?}", SHUTDOWN_GRACE),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Build the device installer when credentials are available
#[cfg(feature = "vapix")]
async fn build_installer(
    config: &Config,
    settings: &EngineSettings,
) -> Option<Arc<dyn DeviceInstaller>> {
    let source = EnvCredentials {
        username: config.device_user.clone(),
        password: config.device_password.clone(),
    };

    let credentials = match source.credentials().await {
        Ok(credentials) => credentials,
        Err(e) => {
            warn!("Device installation disabled: {}", e);
            return None;
        }
    };

    match certpilot_vapix::VapixInstaller::new(&config.device_url, credentials, settings.certs_dir())
    {
        Ok(installer) => {
            info!(device = %config.device_url, "Device installer enabled");
            Some(Arc::new(installer))
        }
        Err(e) => {
            warn!("Device installation disabled: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "vapix"))]
async fn build_installer(
    _config: &Config,
    _settings: &EngineSettings,
) -> Option<Arc<dyn DeviceInstaller>> {
    warn!("Device installation disabled: built without the vapix feature");
    None
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
