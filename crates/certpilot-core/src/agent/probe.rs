//! Capability probe
//!
//! The agent prints its supported DNS providers as one comma-separated
//! block after a fixed marker, followed by a footer:
//!
//! ```text
//! Credentials for DNS providers must be passed through environment variables.
//!
//! Here is an example bash command using the CloudFlare DNS provider:
//!   ...
//!
//! Supported DNS providers:
//!   acme-dns, alidns, allinkl, arvancloud, azure, ..., zoneee, zonomi
//!
//! More information: https://go-acme.github.io/lego/dns
//! ```

use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Marker preceding the provider list
pub const PROVIDERS_MARKER: &str = "Supported DNS providers:";

/// Footer following the provider list
pub const PROVIDERS_FOOTER: &str = "More information:";

/// Extract the provider identifiers from help output
///
/// Fails with `Parse` when the marker is missing or the list is empty.
pub fn parse_providers(help: &str) -> Result<Vec<String>> {
    let start = help
        .find(PROVIDERS_MARKER)
        .ok_or_else(|| Error::parse("could not find provider list in dnshelp output"))?;
    let mut block = &help[start + PROVIDERS_MARKER.len()..];
    if let Some(end) = block.find(PROVIDERS_FOOTER) {
        block = &block[..end];
    }

    let providers: Vec<String> = block
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.starts_with("http"))
        .map(str::to_string)
        .collect();

    if providers.is_empty() {
        return Err(Error::parse("no providers found in dnshelp output"));
    }
    Ok(providers)
}

/// Run the agent's help subcommand and return the parsed provider list
pub async fn run_probe(binary: &Path) -> Result<Vec<String>> {
    debug!(binary = %binary.display(), "Probing agent capabilities");

    let output = Command::new(binary).arg("dnshelp").output().await?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(Error::Process {
            reason: format!("lego dnshelp: {}", output.status),
            output: text,
        });
    }

    parse_providers(&text)
}

/// Persist the provider list as a JSON array
pub async fn write_cache(path: &Path, providers: &[String]) -> Result<()> {
    let json = serde_json::to_vec(providers)?;
    tokio::fs::write(path, json).await?;
    info!(count = providers.len(), "Cached DNS provider list");
    Ok(())
}

/// Read the cached provider list
///
/// Fails with `NotFound` when the cache is absent or malformed.
pub async fn read_cache(path: &Path) -> Result<Vec<String>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!(
                "provider cache {} does not exist",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data).map_err(|e| {
        Error::not_found(format!("provider cache {} is malformed: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELP: &str = "Credentials for DNS providers must be passed through environment variables.

Supported DNS providers:
  acme-dns, alidns, cloudflare,
  digitalocean, route53, zonomi

More information: https://go-acme.github.io/lego/dns
";

    #[test]
    fn parses_multiline_block_until_footer() {
        let providers = parse_providers(HELP).unwrap();
        assert_eq!(
            providers,
            vec!["acme-dns", "alidns", "cloudflare", "digitalocean", "route53", "zonomi"]
        );
    }

    #[test]
    fn missing_marker_is_parse_error() {
        assert!(matches!(
            parse_providers("usage: lego [global options]"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn empty_block_is_parse_error() {
        let help = "Supported DNS providers:\n\nMore information: https://example.com\n";
        assert!(matches!(parse_providers(help), Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn malformed_cache_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        assert!(matches!(read_cache(&path).await, Err(Error::NotFound(_))));

        tokio::fs::write(&path, b"{\"oops\": 1}").await.unwrap();
        assert!(matches!(read_cache(&path).await, Err(Error::NotFound(_))));

        write_cache(&path, &["foo".to_string()]).await.unwrap();
        assert_eq!(read_cache(&path).await.unwrap(), vec!["foo"]);
    }
}
