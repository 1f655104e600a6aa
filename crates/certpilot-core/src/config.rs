//! Configuration types for the certificate lifecycle engine
//!
//! [`DesiredConfig`] is the single user-editable record describing which
//! certificate to obtain and how. It is owned by a [`ConfigStore`]; the
//! engine only reads and upserts it.
//!
//! [`EngineSettings`] holds deployment paths and timing knobs that the
//! daemon derives from its environment.
//!
//! [`ConfigStore`]: crate::traits::ConfigStore

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default DNS resolver used for propagation checks
pub const DEFAULT_DNS_RESOLVERS: &str = "8.8.8.8:53";

/// Default ACME directory
pub const DEFAULT_CA_SERVER: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Default key algorithm passed to the agent
pub const DEFAULT_KEY_TYPE: &str = "ec256";

/// Default renewal threshold in days
pub const DEFAULT_AUTO_DAYS: u32 = 30;

/// Desired certificate configuration
///
/// At most one record exists. Field names match the JSON shape exposed to
/// the web frontend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredConfig {
    /// ACME account email
    pub email: String,

    /// Comma-separated domain list; the first entry is the primary domain
    pub domains: String,

    /// DNS provider identifier understood by the agent (e.g. "cloudflare")
    pub dns_provider: String,

    /// JSON object of provider environment variables
    pub env_vars: String,

    /// ACME directory URL
    pub ca_server: String,

    /// Key algorithm (ec256, ec384, rsa2048, ...)
    pub key_type: String,

    /// DNS resolvers used by the agent
    pub dns_resolvers: String,

    /// Whether External Account Binding flags are passed
    pub eab_enabled: bool,

    /// EAB key identifier
    pub eab_kid: String,

    /// EAB HMAC secret
    pub eab_hmac: String,

    /// Whether the scheduler renews automatically
    pub auto_mode: bool,

    /// Renew when fewer than this many days remain
    pub auto_days: u32,
}

impl DesiredConfig {
    /// Fill unset fields with their defaults
    pub fn with_defaults(mut self) -> Self {
        if self.dns_resolvers.trim().is_empty() {
            self.dns_resolvers = DEFAULT_DNS_RESOLVERS.to_string();
        }
        if self.ca_server.trim().is_empty() {
            self.ca_server = DEFAULT_CA_SERVER.to_string();
        }
        if self.key_type.trim().is_empty() {
            self.key_type = DEFAULT_KEY_TYPE.to_string();
        }
        if self.auto_days == 0 {
            self.auto_days = DEFAULT_AUTO_DAYS;
        }
        if self.env_vars.trim().is_empty() {
            self.env_vars = "{}".to_string();
        }
        self
    }

    /// Trimmed, non-empty domains in their configured order
    pub fn domains(&self) -> Vec<String> {
        split_domains(&self.domains)
    }

    /// First configured domain, used for file naming and installation
    pub fn primary_domain(&self) -> Option<String> {
        self.domains().into_iter().next()
    }

    /// Parse the provider environment variables
    ///
    /// An empty string is treated as an empty mapping; anything else must
    /// be a JSON object whose values are strings.
    pub fn provider_env(&self) -> Result<HashMap<String, String>, crate::Error> {
        if self.env_vars.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&self.env_vars)
            .map_err(|e| crate::Error::config(format!("failed to parse env vars: {e}")))
    }

    /// Whether EAB credentials are complete and enabled
    pub fn eab(&self) -> Option<(&str, &str)> {
        if self.eab_enabled && !self.eab_kid.is_empty() && !self.eab_hmac.is_empty() {
            Some((&self.eab_kid, &self.eab_hmac))
        } else {
            None
        }
    }
}

/// Split a comma-separated domain list
pub fn split_domains(domains: &str) -> Vec<String> {
    domains
        .split(',')
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect()
}

/// Deployment settings for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Root directory for all engine data
    pub data_dir: PathBuf,

    /// Release metadata endpoint returning `{"tag_name": ...}`
    #[serde(default = "default_releases_url")]
    pub releases_url: String,

    /// Base URL for release archives
    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,

    /// Timeout for release, archive and device requests
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Interval between scheduled renewal checks
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Delay before the first renewal check after startup
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
}

impl EngineSettings {
    /// Create settings rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            releases_url: default_releases_url(),
            download_base_url: default_download_base_url(),
            http_timeout_secs: default_http_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
        }
    }

    /// Path of the agent executable
    pub fn binary_path(&self) -> PathBuf {
        self.data_dir.join("lego")
    }

    /// Directory the agent writes certificates into
    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    /// Capability cache file
    pub fn providers_cache_path(&self) -> PathBuf {
        self.data_dir.join("providers.json")
    }

    /// Scratch file the release archive is streamed into
    pub fn archive_spool_path(&self) -> PathBuf {
        self.data_dir.join("lego.tar.gz.part")
    }

    /// Persisted configuration and run history
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// HTTP timeout as a duration
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::config("data directory cannot be empty"));
        }
        if self.check_interval_secs == 0 {
            return Err(crate::Error::config("check interval must be > 0"));
        }
        if self.http_timeout_secs == 0 {
            return Err(crate::Error::config("HTTP timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::new("./localdata")
    }
}

fn default_releases_url() -> String {
    "https://api.github.com/repos/go-acme/lego/releases/latest".to_string()
}

fn default_download_base_url() -> String {
    "https://github.com/go-acme/lego/releases/download".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_check_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_initial_delay_secs() -> u64 {
    30
}
