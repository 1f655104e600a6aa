//! Test doubles and common utilities for engine contract tests
//!
//! The agent is replaced by a small shell script written into a scratch
//! data directory, so runs exercise real subprocess supervision.

#![allow(dead_code)]

use async_trait::async_trait;
use certpilot_core::config::{DesiredConfig, EngineSettings};
use certpilot_core::error::{Error, Result};
use certpilot_core::hub::{HubEvent, Subscription};
use certpilot_core::state::MemoryStore;
use certpilot_core::traits::{DeviceInstaller, InstallReport};
use certpilot_core::{CertificateFiles, Controller};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Help output in the shape the real agent prints
pub const DNSHELP_FIXTURE: &str = "Supported DNS providers: foo, bar, More information: https://go-acme.github.io/lego/dns";

/// Write an executable shell script as the agent binary
pub fn write_fake_agent(data_dir: &Path, body: &str) -> PathBuf {
    std::fs::create_dir_all(data_dir).unwrap();
    let path = data_dir.join("lego");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Agent that answers `dnshelp` with the fixture and otherwise runs `body`
pub fn agent_script(body: &str) -> String {
    format!(
        "if [ \"$1\" = \"dnshelp\" ]; then\n  echo \"{DNSHELP_FIXTURE}\"\n  exit 0\nfi\n{body}"
    )
}

/// Agent that prints one line and then blocks until killed
pub const BLOCKING_AGENT: &str = "echo started\nexec sleep 30";

/// Configuration that passes validation
pub fn test_config() -> DesiredConfig {
    DesiredConfig {
        email: "ops@example.com".to_string(),
        domains: "cam.example.com".to_string(),
        dns_provider: "cloudflare".to_string(),
        env_vars: r#"{"CF_DNS_API_TOKEN":"test-token"}"#.to_string(),
        auto_mode: true,
        auto_days: 30,
        ..Default::default()
    }
    .with_defaults()
}

/// Controller over a memory store seeded with `config`
pub fn test_controller(
    data_dir: &Path,
    config: DesiredConfig,
    installer: Option<Arc<dyn DeviceInstaller>>,
) -> (Controller, MemoryStore) {
    let store = MemoryStore::with_config(config);
    let mut settings = EngineSettings::new(data_dir);
    settings.initial_delay_secs = 0;
    settings.check_interval_secs = 3600;

    let controller = Controller::new(
        settings,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        installer,
    )
    .expect("controller construction succeeds");
    (controller, store)
}

/// Write a self-signed certificate for `domain` expiring in `days` days
///
/// An extra hour keeps the floor of the remaining days at exactly `days`.
pub fn write_certificate(data_dir: &Path, domain: &str, days: i64) -> CertificateFiles {
    let files = CertificateFiles::for_domain(&data_dir.join("certs"), domain);
    std::fs::create_dir_all(files.certificate.parent().unwrap()).unwrap();

    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(days) + time::Duration::hours(1);

    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    std::fs::write(&files.certificate, cert.pem()).unwrap();
    std::fs::write(&files.private_key, key.serialize_pem()).unwrap();
    files
}

/// Installer that records calls and succeeds or fails on demand
#[derive(Clone, Default)]
pub struct RecordingInstaller {
    calls: Arc<AtomicUsize>,
    domains: Arc<std::sync::Mutex<Vec<String>>>,
    fail_with: Option<String>,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installer whose every install fails with a protocol fault
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn domains(&self) -> Vec<String> {
        self.domains.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceInstaller for RecordingInstaller {
    async fn install(&self, domain: &str) -> Result<InstallReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.domains.lock().unwrap().push(domain.to_string());
        match &self.fail_with {
            Some(message) => Err(Error::protocol_fault(message.clone())),
            None => Ok(InstallReport {
                certificate_id: format!("lego-{}-250101000000", domain.replace('.', "-")),
                removed: 0,
            }),
        }
    }

    fn installer_name(&self) -> &'static str {
        "recording"
    }
}

/// Wait for the next event, failing the test after five seconds
pub async fn next_event(sub: &mut Subscription) -> HubEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.next_event())
        .await
        .expect("event arrives within 5 seconds")
        .expect("hub keeps the subscription open")
}

/// Wait until an output event with `line` arrives
pub async fn wait_for_line(sub: &mut Subscription, line: &str) {
    loop {
        if let HubEvent::AgentOutput { line: got } = next_event(sub).await {
            if got == line {
                return;
            }
        }
    }
}

/// Poll `condition` every 10ms for up to five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5 seconds");
}
