//! Certificate installation over VAPIX/ONVIF

use crate::cert_id;
use crate::client::DeviceClient;
use crate::keys;
use crate::soap;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use certpilot_core::{
    CertificateFiles, Credentials, DeviceInstaller, Error, InstallReport, Result,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Installs the agent's certificate for a domain onto an Axis device
///
/// Each install uploads the pair under a fresh identifier, activates it for
/// HTTPS with every cipher the device supports, then deletes the
/// identifiers left behind by earlier installs.
#[derive(Debug)]
pub struct VapixInstaller {
    client: DeviceClient,
    certs_dir: PathBuf,
}

impl VapixInstaller {
    /// Installer for the device at `device_url`, reading from `certs_dir`
    pub fn new(
        device_url: impl Into<String>,
        credentials: Credentials,
        certs_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self::with_client(
            DeviceClient::new(device_url, credentials)?,
            certs_dir,
        ))
    }

    /// Installer over an existing client
    pub fn with_client(client: DeviceClient, certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            certs_dir: certs_dir.into(),
        }
    }

    /// Upload the certificate and key under `id`
    pub async fn upload(&self, id: &str, certificate_der: &[u8], key_pkcs8: &[u8]) -> Result<()> {
        let body = soap::load_certificate_body(
            id,
            &STANDARD.encode(certificate_der),
            &STANDARD.encode(key_pkcs8),
        );
        self.client
            .call(&body)
            .await
            .map_err(|e| e.context("failed to upload certificate"))?;
        debug!(certificate_id = %id, "Certificate uploaded");
        Ok(())
    }

    /// Make `id` the HTTPS certificate
    pub async fn activate(&self, id: &str) -> Result<()> {
        let ciphers = self
            .client
            .fetch_ciphers()
            .await
            .map_err(|e| e.context("failed to fetch ciphers"))?;
        debug!(count = ciphers.len(), "Fetched supported ciphers");

        self.client
            .call(&soap::set_tls_configuration_body(id, &ciphers))
            .await
            .map_err(|e| e.context("failed to set HTTPS configuration"))?;
        Ok(())
    }

    /// Identifiers of every certificate on the device
    pub async fn list_certificate_ids(&self) -> Result<Vec<String>> {
        let body = self.client.call(soap::get_certificates_body()).await?;
        Ok(soap::extract_certificate_ids(&body))
    }

    /// Delete every identifier this installer created except `current`
    ///
    /// Individual delete failures are logged and skipped. Returns how many
    /// identifiers were deleted.
    pub async fn cleanup(&self, current: &str) -> Result<usize> {
        let stale: Vec<String> = self
            .list_certificate_ids()
            .await?
            .into_iter()
            .filter(|id| cert_id::is_managed(id) && id != current)
            .collect();

        let mut removed = 0;
        for id in &stale {
            match self.client.call(&soap::delete_certificate_body(id)).await {
                Ok(_) => {
                    debug!(certificate_id = %id, "Deleted stale certificate");
                    removed += 1;
                }
                Err(e) => warn!(certificate_id = %id, "Failed to delete stale certificate: {}", e),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl DeviceInstaller for VapixInstaller {
    async fn install(&self, domain: &str) -> Result<InstallReport> {
        let files = CertificateFiles::for_domain(&self.certs_dir, domain);

        let certificate = read_file(&files.certificate, "certificate").await?;
        let certificate = keys::first_pem_block(&certificate)
            .map_err(|e| e.context("failed to decode certificate PEM"))?;
        if certificate.label != "CERTIFICATE" {
            return Err(Error::parse(format!(
                "failed to decode certificate PEM: unexpected block {}",
                certificate.label
            )));
        }

        let key = read_file(&files.private_key, "private key").await?;
        let key = keys::first_pem_block(&key)
            .map_err(|e| e.context("failed to decode private key PEM"))?;
        let key_der =
            keys::to_pkcs8(&key).map_err(|e| e.context("failed to convert key to PKCS#8"))?;

        let id = cert_id::derive(domain, cert_id::issue_instant(Utc::now()));
        info!(domain = %domain, certificate_id = %id, "Uploading certificate to device");

        self.upload(&id, &certificate.der, &key_der).await?;
        self.activate(&id).await?;

        let removed = self.cleanup(&id).await.unwrap_or_else(|e| {
            warn!("Failed to clean up old certificates: {}", e);
            0
        });

        Ok(InstallReport {
            certificate_id: id,
            removed,
        })
    }

    fn installer_name(&self) -> &'static str {
        "vapix"
    }
}

async fn read_file(path: &Path, what: &str) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::not_found(format!("failed to read {what}: {}", path.display()))
            }
            _ => Error::Io(e),
        })
}
