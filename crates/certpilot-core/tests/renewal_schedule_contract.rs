//! Contract Test: Auto-Renewal Scheduling
//!
//! Constraints verified:
//! - A certificate inside the threshold triggers renew, then install
//! - A certificate outside the threshold triggers nothing
//! - Disabled auto-mode, a missing agent or a missing certificate skip
//!   silently
//! - Renewal and install each leave a run record; install failures are
//!   recorded and broadcast, never propagated
//! - The loop exits on shutdown
//!
//! If this test fails, the scheduler renews when it should not (or vice
//! versa), or a failure escapes the tick.

#![cfg(unix)]

mod common;

use certpilot_core::hub::HubEvent;
use certpilot_core::scheduler::{InstallOutcome, TickOutcome};
use certpilot_core::traits::RunHistoryStore;
use common::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn expiring_certificate_is_renewed_and_installed() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_agent(dir.path(), &agent_script("echo renewed"));
    write_certificate(dir.path(), "cam.example.com", 10);

    let installer = RecordingInstaller::new();
    let (controller, store) =
        test_controller(dir.path(), test_config(), Some(Arc::new(installer.clone())));
    let mut sub = controller.hub().subscribe();

    let outcome = controller.scheduler().tick().await;
    assert_eq!(
        outcome,
        TickOutcome::Renewed {
            install: InstallOutcome::Installed("lego-cam-example-com-250101000000".to_string())
        }
    );
    assert_eq!(installer.domains(), vec!["cam.example.com"]);

    let runs = store.list().await.unwrap();
    let commands: Vec<_> = runs.iter().map(|r| r.command.as_str()).collect();
    assert_eq!(commands, vec!["auto-renew", "auto-install"]);
    assert!(runs.iter().all(|r| r.success));
    assert_eq!(runs[1].output, "Certificate installed successfully");

    let events = sub.drain();
    assert!(events.contains(&HubEvent::AgentComplete {
        message: "Certificate renew completed successfully".to_string()
    }));
    assert_eq!(
        events.last(),
        Some(&HubEvent::AgentComplete {
            message: "Certificate auto-installed to camera".to_string()
        })
    );
}

#[tokio::test]
async fn threshold_gates_renewal() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    write_fake_agent(dir.path(), &format!("touch {}", marker.display()));
    write_certificate(dir.path(), "cam.example.com", 10);

    let mut config = test_config();
    config.auto_days = 5;
    let (controller, store) = test_controller(dir.path(), config, None);

    assert_eq!(
        controller.scheduler().tick().await,
        TickOutcome::NotDue {
            days_remaining: 10,
            threshold: 5
        }
    );
    assert!(!marker.exists());
    assert_eq!(store.run_count().await, 0);
}

#[tokio::test]
async fn skips_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();

    // Agent missing
    let (controller, _) = test_controller(dir.path(), test_config(), None);
    assert_eq!(controller.scheduler().tick().await, TickOutcome::AgentNotReady);

    // Certificate missing
    write_fake_agent(dir.path(), "exit 0");
    assert_eq!(controller.scheduler().tick().await, TickOutcome::NoCertificate);

    // Auto-mode off
    let mut config = test_config();
    config.auto_mode = false;
    let (controller, store) = test_controller(dir.path(), config, None);
    assert_eq!(controller.scheduler().tick().await, TickOutcome::Disabled);

    // No domain
    let mut config = test_config();
    config.domains = " , ".to_string();
    let (controller, _) = test_controller(dir.path(), config, None);
    assert_eq!(controller.scheduler().tick().await, TickOutcome::NoDomain);

    assert_eq!(store.run_count().await, 0);
}

#[tokio::test]
async fn failed_renewal_skips_install() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_agent(dir.path(), "echo \"acme: error: 429\"\nexit 1");
    write_certificate(dir.path(), "cam.example.com", 3);

    let installer = RecordingInstaller::new();
    let (controller, store) =
        test_controller(dir.path(), test_config(), Some(Arc::new(installer.clone())));

    assert_eq!(controller.scheduler().tick().await, TickOutcome::RenewFailed);
    assert_eq!(installer.call_count(), 0);

    let record = store.last().await.unwrap().unwrap();
    assert_eq!(record.command, "auto-renew");
    assert!(!record.success);
    assert!(record.output.contains("acme: error: 429"));
}

#[tokio::test]
async fn install_failure_is_recorded_and_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_agent(dir.path(), "echo renewed");
    write_certificate(dir.path(), "cam.example.com", 1);

    let installer = RecordingInstaller::failing("Sender not Authorized");
    let (controller, store) =
        test_controller(dir.path(), test_config(), Some(Arc::new(installer)));
    let mut sub = controller.hub().subscribe();

    assert_eq!(
        controller.scheduler().tick().await,
        TickOutcome::Renewed {
            install: InstallOutcome::Failed
        }
    );

    let record = store.last().await.unwrap().unwrap();
    assert_eq!(record.command, "auto-install");
    assert!(!record.success);
    assert_eq!(record.output, "Sender not Authorized");

    assert_eq!(
        sub.drain().last(),
        Some(&HubEvent::AgentError {
            error: "Auto-install failed: Sender not Authorized".to_string()
        })
    );
}

#[tokio::test]
async fn renewal_without_installer_skips_install() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_agent(dir.path(), "echo renewed");
    write_certificate(dir.path(), "cam.example.com", 0);

    let (controller, store) = test_controller(dir.path(), test_config(), None);
    assert_eq!(
        controller.scheduler().tick().await,
        TickOutcome::Renewed {
            install: InstallOutcome::Skipped
        }
    );
    assert_eq!(store.run_count().await, 1);
}

#[tokio::test]
async fn busy_orchestrator_skips_tick() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_agent(dir.path(), BLOCKING_AGENT);
    write_certificate(dir.path(), "cam.example.com", 2);
    let (controller, store) = test_controller(dir.path(), test_config(), None);

    let mut sub = controller.hub().subscribe();
    let manual = controller.submit_run("obtain").await.unwrap();
    wait_for_line(&mut sub, "started").await;

    assert_eq!(controller.scheduler().tick().await, TickOutcome::Busy);

    controller.stop().unwrap();
    manual.await.unwrap().unwrap();
    let commands: Vec<_> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.command)
        .collect();
    assert_eq!(commands, vec!["obtain"]);
}

#[tokio::test]
async fn loop_runs_initial_check_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_agent(dir.path(), "echo renewed");
    write_certificate(dir.path(), "cam.example.com", 7);
    let (controller, store) = test_controller(dir.path(), test_config(), None);

    let shutdown = CancellationToken::new();
    let handle = controller.scheduler().spawn(shutdown.clone());

    let mut renewed = false;
    for _ in 0..500 {
        if store.run_count().await > 0 {
            renewed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(renewed, "initial check should renew within 5 seconds");

    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("scheduler stops within 5 seconds")
        .unwrap();
}
