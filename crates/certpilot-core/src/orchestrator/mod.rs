//! Process orchestrator
//!
//! Runs the agent binary as a single-flight, cancellable subprocess.
//!
//! ## Single Flight
//!
//! The live run is held in a slot behind a `Mutex`. The lock is taken only
//! for the check-and-set when a run starts, for `stop`, and for the clear
//! when the run returns; it is never held while the subprocess streams.
//! A second `run` while the slot is occupied fails with
//! [`Error::AlreadyRunning`].
//!
//! ## Output
//!
//! stdout and stderr are merged line by line. Lines are split on raw bytes
//! and decoded lossily, so output in a non-UTF-8 locale is kept. Every line
//! is broadcast as `lego_output`, passed to the [`OutputSink`] and appended
//! to the buffer returned to the caller.
//!
//! ## Cancellation
//!
//! [`Orchestrator::stop`] cancels the run's token; the supervisor kills the
//! child, drains what it already wrote for at most [`KILL_DRAIN_GRACE`] and
//! returns the captured output as a success with [`RunOutput::cancelled`]
//! set. Pipes still held open by a grandchild are abandoned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DesiredConfig;
use crate::error::{Error, Result};
use crate::hub::{Hub, HubEvent};

/// Look-ahead window passed to `renew`
pub const RENEW_DAYS: u32 = 30;

/// Notice broadcast when a run is stopped
pub const STOPPED_NOTICE: &str = "--- Process stopped by user ---";

/// How long output is still read after the agent is killed
pub const KILL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Agent operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCommand {
    /// Obtain a new certificate
    Obtain,
    /// Renew the existing certificate
    Renew,
}

impl AgentCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Obtain => "obtain",
            Self::Renew => "renew",
        }
    }

    fn suffix(&self) -> Vec<String> {
        match self {
            Self::Obtain => vec!["run".to_string()],
            Self::Renew => vec![
                "renew".to_string(),
                "--days".to_string(),
                RENEW_DAYS.to_string(),
            ],
        }
    }
}

impl FromStr for AgentCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "obtain" => Ok(Self::Obtain),
            "renew" => Ok(Self::Renew),
            other => Err(Error::InvalidCommand(other.to_string())),
        }
    }
}

impl fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for agent output lines
pub trait OutputSink: Send + Sync {
    fn line(&self, line: &str);
}

impl<F> OutputSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn line(&self, line: &str) {
        self(line)
    }
}

/// Sink that logs every line at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, line: &str) {
        info!("[lego] {}", line);
    }
}

/// Result of a run that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Combined output, one line per `\n`
    pub output: String,
    /// The run was stopped before the agent exited on its own
    pub cancelled: bool,
}

struct ActiveRun {
    command: AgentCommand,
    token: CancellationToken,
}

/// Clears the live-run slot when the run returns, on every path
struct SlotGuard<'a> {
    slot: &'a Mutex<Option<ActiveRun>>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Single-flight supervisor for the agent binary
pub struct Orchestrator {
    binary: PathBuf,
    certs_dir: PathBuf,
    active: Mutex<Option<ActiveRun>>,
}

impl Orchestrator {
    /// Create an orchestrator for `binary`, writing certificates under `certs_dir`
    pub fn new(binary: impl Into<PathBuf>, certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            certs_dir: certs_dir.into(),
            active: Mutex::new(None),
        }
    }

    /// Whether a run is currently live
    pub fn is_running(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// Command of the live run, if any
    pub fn active_command(&self) -> Option<AgentCommand> {
        self.lock_slot().as_ref().map(|run| run.command)
    }

    /// Cancel the live run
    ///
    /// Fails with [`Error::NoProcess`] when nothing is running. Stopping an
    /// already-cancelled run only repeats the notice.
    pub fn stop(&self, hub: &Hub) -> Result<()> {
        {
            let slot = self.lock_slot();
            let run = slot.as_ref().ok_or(Error::NoProcess)?;
            info!(command = %run.command, "Stopping agent run");
            run.token.cancel();
        }
        hub.broadcast(HubEvent::output(STOPPED_NOTICE));
        Ok(())
    }

    /// Run the agent for `command` (`obtain` or `renew`)
    ///
    /// Cancellation is not an error: the output captured so far is
    /// returned with `cancelled` set. A non-zero exit broadcasts
    /// `lego_error` and fails with [`Error::Process`], which carries the
    /// captured output.
    pub async fn run(
        &self,
        config: &DesiredConfig,
        hub: &Hub,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<RunOutput> {
        let command: AgentCommand = command.parse()?;

        if !self.binary.exists() {
            return Err(Error::not_found(
                "lego binary not found, please download first",
            ));
        }

        let args = build_args(config, &self.certs_dir, command);
        let env = config.provider_env()?;

        let token = CancellationToken::new();
        let _guard = self.claim(command, token.clone())?;

        let mut output = String::new();
        let mut emit = |line: &str| {
            hub.broadcast(HubEvent::output(line));
            sink.line(line);
            output.push_str(line);
            output.push('\n');
        };

        emit(&format!("Running: lego {}", display_args(&args)));

        let spawned = Command::new(&self.binary)
            .args(&args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Err(process_failure(hub, format!("failed to start lego: {e}"), output));
            }
        };
        debug!(command = %command, pid = ?child.id(), "Agent started");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(process_failure(hub, "agent output not captured".to_string(), output));
        };
        let mut lines = output_lines(stdout).merge(output_lines(stderr));

        let drain = tokio::time::sleep(KILL_DRAIN_GRACE);
        tokio::pin!(drain);
        let mut killed = false;
        loop {
            tokio::select! {
                _ = token.cancelled(), if !killed => {
                    killed = true;
                    drain.as_mut().reset(tokio::time::Instant::now() + KILL_DRAIN_GRACE);
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill agent: {}", e);
                    }
                }
                () = &mut drain, if killed => {
                    debug!("Agent output still open after kill, abandoning pipes");
                    break;
                }
                line = lines.next() => match line {
                    Some(Ok(raw)) => emit(&decode_line(&raw)),
                    Some(Err(e)) => {
                        warn!("Failed to read agent output: {}", e);
                    }
                    None => break,
                }
            }
        }
        drop(lines);

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                return Err(process_failure(hub, format!("failed to wait for lego: {e}"), output));
            }
        };

        if token.is_cancelled() {
            sink.line("Process stopped by user");
            return Ok(RunOutput {
                output,
                cancelled: true,
            });
        }

        if !status.success() {
            return Err(process_failure(hub, status.to_string(), output));
        }

        let message = format!("Certificate {command} completed successfully");
        hub.broadcast(HubEvent::AgentComplete {
            message: message.clone(),
        });
        sink.line(&message);

        Ok(RunOutput {
            output,
            cancelled: false,
        })
    }

    fn claim(&self, command: AgentCommand, token: CancellationToken) -> Result<SlotGuard<'_>> {
        let mut slot = self.lock_slot();
        if slot.is_some() {
            return Err(Error::AlreadyRunning);
        }
        *slot = Some(ActiveRun { command, token });
        Ok(SlotGuard { slot: &self.active })
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("binary", &self.binary)
            .field("active", &self.active_command())
            .finish()
    }
}

/// Broadcast `reason` as `lego_error` and pair it with the captured output
fn process_failure(hub: &Hub, reason: String, output: String) -> Error {
    hub.broadcast(HubEvent::AgentError {
        error: reason.clone(),
    });
    Error::Process { reason, output }
}

/// Newline-delimited raw frames from one of the agent's pipes
fn output_lines<R: AsyncRead>(reader: R) -> FramedRead<R, AnyDelimiterCodec> {
    FramedRead::new(reader, AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec()))
}

/// One output line as text; invalid UTF-8 becomes U+FFFD and a trailing CR is dropped
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Agent argument vector for `command`
pub fn build_args(config: &DesiredConfig, certs_dir: &Path, command: AgentCommand) -> Vec<String> {
    let mut args = vec![
        "--email".to_string(),
        config.email.clone(),
        "--dns".to_string(),
        config.dns_provider.clone(),
        "--accept-tos".to_string(),
        "--path".to_string(),
        certs_dir.display().to_string(),
    ];

    for domain in config.domains() {
        args.push("--domains".to_string());
        args.push(domain);
    }

    let optional = [
        ("--dns.resolvers", &config.dns_resolvers),
        ("--server", &config.ca_server),
        ("--key-type", &config.key_type),
    ];
    for (flag, value) in optional {
        if !value.is_empty() {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    }

    if let Some((kid, hmac)) = config.eab() {
        args.extend([
            "--eab".to_string(),
            "--kid".to_string(),
            kid.to_string(),
            "--hmac".to_string(),
            hmac.to_string(),
        ]);
    }

    args.extend(command.suffix());
    args
}

/// Arguments joined for display, with the EAB secret masked
fn display_args(args: &[String]) -> String {
    let mut shown = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            shown.push("********");
            mask_next = false;
        } else {
            mask_next = arg == "--hmac";
            shown.push(arg.as_str());
        }
    }
    shown.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DesiredConfig {
        DesiredConfig {
            email: "ops@example.com".to_string(),
            domains: "cam.example.com, *.cam.example.com".to_string(),
            dns_provider: "cloudflare".to_string(),
            ..Default::default()
        }
        .with_defaults()
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(matches!(
            "revoke".parse::<AgentCommand>(),
            Err(Error::InvalidCommand(c)) if c == "revoke"
        ));
        assert_eq!("renew".parse::<AgentCommand>().unwrap(), AgentCommand::Renew);
    }

    #[test]
    fn args_follow_flag_order() {
        let args = build_args(&config(), Path::new("/data/certs"), AgentCommand::Obtain);
        assert_eq!(
            args,
            vec![
                "--email", "ops@example.com",
                "--dns", "cloudflare",
                "--accept-tos",
                "--path", "/data/certs",
                "--domains", "cam.example.com",
                "--domains", "*.cam.example.com",
                "--dns.resolvers", "8.8.8.8:53",
                "--server", "https://acme-v02.api.letsencrypt.org/directory",
                "--key-type", "ec256",
                "run",
            ]
        );
    }

    #[test]
    fn renew_appends_look_ahead_and_eab() {
        let mut config = config();
        config.eab_enabled = true;
        config.eab_kid = "kid-1".to_string();
        config.eab_hmac = "c2VjcmV0".to_string();

        let args = build_args(&config, Path::new("certs"), AgentCommand::Renew);
        let tail: Vec<&str> = args.iter().rev().take(8).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["--eab", "--kid", "kid-1", "--hmac", "c2VjcmV0", "renew", "--days", "30"]
        );

        let shown = display_args(&args);
        assert!(shown.contains("--hmac ******** renew"));
        assert!(!shown.contains("c2VjcmV0"));
    }

    #[test]
    fn lines_decode_lossily() {
        assert_eq!(decode_line(b"acme: error\r"), "acme: error");
        assert_eq!(decode_line(b"caf\xe9 \xff error"), "caf\u{fffd} \u{fffd} error");
        assert_eq!(decode_line(b""), "");
    }

    #[test]
    fn process_failure_is_broadcast_with_output() {
        let hub = Hub::new();
        let mut sub = hub.subscribe();

        let err = process_failure(
            &hub,
            "failed to wait for lego: interrupted".to_string(),
            "Running: lego run\nhalf".to_string(),
        );
        match err {
            Error::Process { reason, output } => {
                assert_eq!(reason, "failed to wait for lego: interrupted");
                assert_eq!(output, "Running: lego run\nhalf");
            }
            other => panic!("expected Process error, got {other:?}"),
        }
        assert_eq!(
            sub.drain(),
            vec![HubEvent::AgentError {
                error: "failed to wait for lego: interrupted".to_string()
            }]
        );
    }

    #[test]
    fn stop_without_run_is_no_process() {
        let orchestrator = Orchestrator::new("/nonexistent/lego", "/tmp");
        let hub = Hub::new();
        assert!(matches!(orchestrator.stop(&hub), Err(Error::NoProcess)));
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let orchestrator = Orchestrator::new("/nonexistent/lego", "/tmp");
        let hub = Hub::new();
        let err = orchestrator
            .run(&config(), &hub, "obtain", &TracingSink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!orchestrator.is_running());
    }
}
