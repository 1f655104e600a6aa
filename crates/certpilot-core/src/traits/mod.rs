//! Core traits for the certificate lifecycle engine
//!
//! This module defines the abstract interfaces to the engine's collaborators.
//!
//! - [`ConfigStore`]: Single desired-configuration record
//! - [`RunHistoryStore`]: Append-only run history
//! - [`CredentialSource`]: Device credential retrieval
//! - [`DeviceInstaller`]: Pushes certificates onto the device

pub mod installer;
pub mod stores;

pub use installer::{
    CredentialSource, Credentials, DeviceInstaller, InstallReport, StaticCredentials,
};
pub use stores::{ConfigStore, RunHistoryStore, RunRecord};
