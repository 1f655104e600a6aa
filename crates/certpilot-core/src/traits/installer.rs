// # Device Installer Trait
//
// Defines the interface for pushing an issued certificate onto the target
// device and activating it for HTTPS.
//
// ## Implementations
//
// - VAPIX/ONVIF SOAP: `certpilot-vapix` crate
//
// ## Usage
//
// ```rust,ignore
// use certpilot_core::DeviceInstaller;
//
// let report = installer.install("camera.example.com").await?;
// println!("active certificate id: {}", report.certificate_id);
// ```

use async_trait::async_trait;

/// Result of a successful installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Identifier the certificate was uploaded and activated under
    pub certificate_id: String,
    /// Number of stale identifiers removed during cleanup
    pub removed: usize,
}

/// Credentials for the device's management interface
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account name
    pub username: String,
    /// Account password
    pub password: String,
}

impl Credentials {
    /// Create a credential pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Custom Debug implementation that hides the password
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .finish()
    }
}

/// Source of device credentials
///
/// Retrieval may fail when the platform does not expose credentials; the
/// engine then runs without installation support.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Retrieve the credential pair
    async fn credentials(&self) -> Result<Credentials, crate::Error>;
}

/// Credentials known up front
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials, crate::Error> {
        Ok(self.0.clone())
    }
}

/// Trait for device certificate installers
///
/// An installer reads the certificate and key for `domain` from disk,
/// uploads them, activates them and removes stale copies it installed
/// earlier. Credentials are bound at construction.
///
/// # Failure Semantics
///
/// Upload, cipher negotiation and activation failures abort the install and
/// are returned. Cleanup of stale certificates is best-effort and never
/// fails an install.
#[async_trait]
pub trait DeviceInstaller: Send + Sync {
    /// Install and activate the certificate for `domain`
    async fn install(&self, domain: &str) -> Result<InstallReport, crate::Error>;

    /// Installer name (for logging/debugging)
    fn installer_name(&self) -> &'static str;
}
