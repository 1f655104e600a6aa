// # certpilot-core
//
// Core library for the certificate lifecycle engine.
//
// ## Architecture Overview
//
// This library supervises an external ACME client (`lego`) and keeps a
// device's HTTPS certificate fresh:
// - **Hub**: Fan-out of progress/result events to live subscribers
// - **AgentManager**: Downloads the agent and probes its DNS providers
// - **Orchestrator**: Single-flight, cancellable agent runs with streamed output
// - **RenewalScheduler**: Daily expiry check that renews and installs
// - **DeviceInstaller**: Trait for pushing certificates onto the device
// - **ConfigStore / RunHistoryStore**: Persistence collaborators
// - **Controller**: Task-submission facade tying the above together
//
// ## Design Principles
//
// 1. **One live agent**: At most one subprocess at any instant
// 2. **Dual-channel reporting**: Failures are broadcast and returned
// 3. **Scheduler never fails**: Ticks log, record and move on
// 4. **Library-First**: Front ends only talk to the Controller

pub mod agent;
pub mod certs;
pub mod config;
pub mod controller;
pub mod error;
pub mod hub;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod traits;

// Re-export core types for convenience
pub use agent::AgentManager;
pub use certs::{CertificateFiles, CertificateInfo, CertificateStatus};
pub use config::{DesiredConfig, EngineSettings};
pub use controller::{Controller, EngineStatus};
pub use error::{Error, Result};
pub use hub::{Hub, HubEvent, Subscriber};
pub use orchestrator::{AgentCommand, Orchestrator, OutputSink, RunOutput, TracingSink};
pub use scheduler::{RenewalScheduler, TickOutcome};
pub use state::{FileStore, MemoryStore};
pub use traits::{
    ConfigStore, CredentialSource, Credentials, DeviceInstaller, InstallReport, RunHistoryStore,
    RunRecord,
};
