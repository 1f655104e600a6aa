//! Agent binary manager
//!
//! Acquires the external ACME client (`lego`) from its GitHub releases and
//! discovers which DNS providers it supports.
//!
//! ## Download Phases
//!
//! Progress is reported through the [`Hub`] on a single 0-100 scale:
//!
//! | Percent | Phase                                    |
//! |---------|------------------------------------------|
//! | 0       | resolving the latest release tag         |
//! | 5..90   | streaming the archive (scaled by bytes)  |
//! | 90      | extracting the executable                |
//!
//! Any failure broadcasts `download_error` and is also returned, so a
//! detached caller still gets its result delivered.

pub mod probe;

use flate2::read::GzDecoder;
use serde::Deserialize;
use std::ffi::OsStr;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::hub::{Hub, HubEvent};

/// Percent reported once the archive request starts
pub const DOWNLOAD_START_PERCENT: u8 = 5;

/// Share of the scale covered by the archive transfer
pub const DOWNLOAD_SPAN_PERCENT: u8 = 85;

/// Percent reported when extraction starts
pub const EXTRACT_PERCENT: u8 = DOWNLOAD_START_PERCENT + DOWNLOAD_SPAN_PERCENT;

/// Name of the executable inside the release archive
const AGENT_BINARY_NAME: &str = "lego";

/// Release architecture name for the running platform
pub fn detect_arch() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        "amd64"
    }
    #[cfg(target_arch = "aarch64")]
    {
        "arm64"
    }
    #[cfg(target_arch = "arm")]
    {
        "armv7"
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
    {
        "unknown"
    }
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Manages the agent executable and its capability cache
#[derive(Debug, Clone)]
pub struct AgentManager {
    settings: EngineSettings,
    client: reqwest::Client,
    arch: &'static str,
}

impl AgentManager {
    /// Create a manager for the given deployment settings
    pub fn new(settings: EngineSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("certpilot/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(settings.http_timeout())
            .build()?;

        Ok(Self {
            settings,
            client,
            arch: detect_arch(),
        })
    }

    /// Path of the agent executable
    pub fn binary_path(&self) -> PathBuf {
        self.settings.binary_path()
    }

    /// Whether the agent executable exists
    pub fn is_ready(&self) -> bool {
        self.binary_path().exists()
    }

    /// Query the releases endpoint for the latest version tag
    pub async fn resolve_latest_version(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.settings.releases_url)
            .timeout(self.settings.http_timeout())
            .send()
            .await
            .map_err(|e| Error::network(format!("failed to query release endpoint: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::network(format!(
                "release endpoint returned status {}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::network(format!("failed to read release response: {e}")))?;
        let release: Release = serde_json::from_str(&body)
            .map_err(|e| Error::parse(format!("failed to parse release response: {e}")))?;

        if release.tag_name.trim().is_empty() {
            return Err(Error::parse("release response has an empty tag_name"));
        }
        Ok(release.tag_name)
    }

    /// Archive URL for a release tag on this platform
    pub fn archive_url(&self, tag: &str) -> String {
        format!(
            "{}/{tag}/lego_{tag}_linux_{}.tar.gz",
            self.settings.download_base_url.trim_end_matches('/'),
            self.arch
        )
    }

    /// Download, extract and probe the latest agent release
    ///
    /// Returns the installed version tag.
    pub async fn download(&self, hub: &Hub) -> Result<String> {
        match self.download_inner(hub).await {
            Ok(tag) => Ok(tag),
            Err(e) => {
                error!("Agent download failed: {}", e);
                hub.broadcast(HubEvent::DownloadError {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn download_inner(&self, hub: &Hub) -> Result<String> {
        hub.broadcast(HubEvent::progress("Fetching latest lego version...", 0));
        let tag = self.resolve_latest_version().await?;

        let url = self.archive_url(&tag);
        info!(version = %tag, arch = self.arch, url = %url, "Downloading agent");
        hub.broadcast(HubEvent::progress(
            format!("Downloading lego {tag} for {}...", self.arch),
            DOWNLOAD_START_PERCENT,
        ));

        let request = self.client.get(&url).send();
        let mut response = tokio::time::timeout(self.settings.http_timeout(), request)
            .await
            .map_err(|_| Error::network("archive request timed out"))?
            .map_err(|e| Error::network(format!("failed to download lego: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::network(format!(
                "download failed with status {}",
                status.as_u16()
            )));
        }

        tokio::fs::create_dir_all(&self.settings.data_dir).await?;

        let spool = self.settings.archive_spool_path();
        let installed = self.install_from(&mut response, &spool, hub).await;
        if let Err(e) = tokio::fs::remove_file(&spool).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %spool.display(), "Failed to remove archive spool: {}", e);
            }
        }
        installed?;
        info!(path = %self.binary_path().display(), "Agent binary installed");

        if let Err(e) = self.probe().await {
            warn!("Could not extract DNS providers: {}", e);
            hub.broadcast(HubEvent::output(format!(
                "Warning: could not extract DNS providers: {e}"
            )));
        }

        hub.broadcast(HubEvent::DownloadComplete {
            message: format!("Lego {tag} downloaded successfully"),
            version: tag.clone(),
        });
        Ok(tag)
    }

    /// Stream the archive body into `spool`, then extract the agent from it
    async fn install_from(
        &self,
        response: &mut reqwest::Response,
        spool: &Path,
        hub: &Hub,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(spool).await?;
        let mut counter = ProgressCounter::new(response.content_length());
        while let Some(chunk) = self.next_chunk(response).await? {
            file.write_all(&chunk).await?;
            if let Some(percent) = counter.advance(chunk.len() as u64) {
                hub.broadcast(HubEvent::progress(counter.message(), percent));
            }
        }
        file.flush().await?;
        drop(file);
        debug!(bytes = counter.downloaded(), "Archive downloaded");

        hub.broadcast(HubEvent::progress("Extracting lego binary...", EXTRACT_PERCENT));
        let archive = spool.to_path_buf();
        let dest = self.binary_path();
        tokio::task::spawn_blocking(move || extract_agent(&archive, &dest))
            .await
            .map_err(|e| Error::Other(format!("extraction task failed: {e}")))?
    }

    /// Next body chunk, bounded by the idle timeout
    async fn next_chunk(&self, response: &mut reqwest::Response) -> Result<Option<bytes::Bytes>> {
        match tokio::time::timeout(self.settings.http_timeout(), response.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(Error::network(format!("failed to read archive: {e}"))),
            Err(_) => Err(Error::network("archive download stalled")),
        }
    }

    /// Probe the agent for supported providers and refresh the cache
    pub async fn probe(&self) -> Result<Vec<String>> {
        let providers = probe::run_probe(&self.binary_path()).await?;
        probe::write_cache(&self.settings.providers_cache_path(), &providers).await?;
        Ok(providers)
    }

    /// Cached provider list
    ///
    /// Fails with `NotFound` when the cache is absent or malformed.
    pub async fn list_capabilities(&self) -> Result<Vec<String>> {
        probe::read_cache(&self.settings.providers_cache_path()).await
    }

    /// Cached provider list, re-probing the agent when the cache is unusable
    pub async fn capabilities(&self) -> Result<Vec<String>> {
        match self.list_capabilities().await {
            Err(Error::NotFound(reason)) if self.is_ready() => {
                debug!("Provider cache unusable ({}), probing agent", reason);
                self.probe().await
            }
            other => other,
        }
    }
}

/// Byte counter mapping transfer progress onto the download sub-range
///
/// Only reports when the integer percent changes.
#[derive(Debug, Clone)]
pub struct ProgressCounter {
    total: Option<u64>,
    downloaded: u64,
    last_percent: u8,
}

impl ProgressCounter {
    /// `total` is the advertised body length, if any
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            downloaded: 0,
            last_percent: DOWNLOAD_START_PERCENT,
        }
    }

    /// Record `n` more bytes; returns the new percent if it changed
    pub fn advance(&mut self, n: u64) -> Option<u8> {
        self.downloaded += n;
        let total = self.total?;
        let done = self.downloaded.min(total);
        let percent = DOWNLOAD_START_PERCENT
            + (done * u64::from(DOWNLOAD_SPAN_PERCENT) / total) as u8;
        if percent == self.last_percent {
            return None;
        }
        self.last_percent = percent;
        Some(percent)
    }

    /// Bytes seen so far
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    fn message(&self) -> String {
        match self.total {
            Some(total) => format!("Downloading... {} / {} bytes", self.downloaded, total),
            None => format!("Downloading... {} bytes", self.downloaded),
        }
    }
}

/// Extract the agent executable from the gzip+tar archive at `archive`
///
/// Only a regular-file entry whose base name is `lego` qualifies. The entry
/// is copied next to `dest`, made executable and renamed into place.
pub fn extract_agent(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    unpack_agent(BufReader::new(file), dest)
}

fn unpack_agent<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| Error::parse(format!("failed to read archive: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::parse(format!("failed to read tar entry: {e}")))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let is_agent = entry
            .path()
            .map(|p| p.file_name() == Some(OsStr::new(AGENT_BINARY_NAME)))
            .unwrap_or(false);
        if !is_agent {
            continue;
        }

        let partial = dest.with_extension("download");
        let mut file = std::fs::File::create(&partial)?;
        if let Err(e) = std::io::copy(&mut entry, &mut file) {
            drop(file);
            let _ = std::fs::remove_file(&partial);
            return Err(Error::parse(format!("failed to read lego entry: {e}")));
        }
        file.sync_all()?;
        drop(file);

        set_executable(&partial)?;
        std::fs::rename(&partial, dest)?;
        return Ok(());
    }

    Err(Error::not_found("lego binary not found in archive"))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
