//! On-disk certificate material
//!
//! The agent writes `<certs>/certificates/<domain>.crt`, `.key` and
//! `.issuer.crt`. Nothing here is cached: every call reads the files again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use x509_parser::prelude::{GeneralName, Pem};

use crate::error::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Paths of the files the agent writes for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub issuer: PathBuf,
}

impl CertificateFiles {
    /// Files for `domain` under the agent's output directory
    ///
    /// The agent stores wildcard domains with `*` replaced by `_`.
    pub fn for_domain(certs_dir: &Path, domain: &str) -> Self {
        let dir = certs_dir.join("certificates");
        let domain = domain.replace('*', "_");
        Self {
            certificate: dir.join(format!("{domain}.crt")),
            private_key: dir.join(format!("{domain}.key")),
            issuer: dir.join(format!("{domain}.issuer.crt")),
        }
    }

    /// Path of one file
    pub fn path(&self, kind: CertificateFileKind) -> &Path {
        match kind {
            CertificateFileKind::Certificate => &self.certificate,
            CertificateFileKind::PrivateKey => &self.private_key,
            CertificateFileKind::Issuer => &self.issuer,
        }
    }

    /// Both the certificate and its key exist
    pub fn is_complete(&self) -> bool {
        self.certificate.exists() && self.private_key.exists()
    }
}

/// Downloadable certificate file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateFileKind {
    Certificate,
    PrivateKey,
    Issuer,
}

impl FromStr for CertificateFileKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "crt" => Ok(Self::Certificate),
            "key" => Ok(Self::PrivateKey),
            "issuer" => Ok(Self::Issuer),
            other => Err(Error::config(format!(
                "invalid certificate file type {other:?}, use: crt, key, issuer"
            ))),
        }
    }
}

/// Decoded certificate fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    /// Issuer common name
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
    /// DNS subject alternative names
    pub san: Vec<String>,
    /// Serial number in decimal
    pub serial: String,
    #[serde(skip)]
    pub expires_at: DateTime<Utc>,
}

fn read_first_pem(path: &Path) -> Result<Pem> {
    let data = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(format!("certificate {} does not exist", path.display()))
        } else {
            Error::Io(e)
        }
    })?;

    Pem::iter_from_buffer(&data)
        .next()
        .transpose()
        .map_err(|e| Error::parse(format!("invalid PEM in {}: {e}", path.display())))?
        .ok_or_else(|| Error::parse(format!("no PEM block in {}", path.display())))
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| Error::parse(format!("certificate time {timestamp} out of range")))
}

/// Decode the first certificate in a PEM file
pub fn inspect_certificate(path: &Path) -> Result<CertificateInfo> {
    let pem = read_first_pem(path)?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::parse(format!("invalid x509 certificate: {e}")))?;

    let issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let validity = cert.validity();
    let not_before = to_utc(validity.not_before.timestamp())?;
    let not_after = to_utc(validity.not_after.timestamp())?;

    let san = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => {
            return Err(Error::parse(format!(
                "failed to parse subject alternative name: {e}"
            )));
        }
    };

    Ok(CertificateInfo {
        issuer,
        not_before: not_before.format(TIMESTAMP_FORMAT).to_string(),
        not_after: not_after.format(TIMESTAMP_FORMAT).to_string(),
        san,
        serial: cert.serial.to_string(),
        expires_at: not_after,
    })
}

const SECONDS_PER_DAY: i64 = 86_400;

/// Whole days until expiry, rounded down
///
/// Negative once the certificate has expired.
pub fn days_until(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_seconds().div_euclid(SECONDS_PER_DAY)
}

/// Whole days until the certificate at `path` expires
pub fn days_remaining(path: &Path, now: DateTime<Utc>) -> Result<i64> {
    let pem = read_first_pem(path)?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::parse(format!("invalid x509 certificate: {e}")))?;
    let expires_at = to_utc(cert.validity().not_after.timestamp())?;
    Ok(days_until(expires_at, now))
}

/// Certificate summary for the primary domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateStatus {
    pub domain: String,
    /// Certificate and key both exist
    pub has_cert: bool,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Decoded fields; absent when the certificate is missing or unreadable
    #[serde(flatten)]
    pub info: Option<CertificateInfo>,
}

impl CertificateStatus {
    /// Inspect the files for `domain`
    pub fn for_domain(certs_dir: &Path, domain: &str) -> Self {
        let files = CertificateFiles::for_domain(certs_dir, domain);
        let info = if files.certificate.exists() {
            match inspect_certificate(&files.certificate) {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::debug!("Failed to inspect {}: {}", files.certificate.display(), e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            domain: domain.to_string(),
            has_cert: files.is_complete(),
            cert_path: files.certificate,
            key_path: files.private_key,
            info,
        }
    }
}
