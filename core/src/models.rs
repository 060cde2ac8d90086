//! Service specification and runtime state models.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::supervisor::ChildHandle;

// ============================================================================
// LaunchSpec
// ============================================================================

/// How to start one companion service when no running instance is found.
///
/// Arguments and environment values may contain placeholders that are
/// substituted at launch time:
/// - `{port}`: the port chosen for this service
/// - `{port:<service>}`: another service's resolved port
/// - `{model}`: the active model name from the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    /// Executable path, or a bare command name resolved via `PATH`.
    pub program: PathBuf,

    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the child process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables overlaid on the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// ============================================================================
// ServiceSpec
// ============================================================================

/// Immutable description of how to locate or launch one companion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Logical service name (e.g. `inference`, `backend`).
    pub name: String,

    /// Configured port, tried first and used as the scan base.
    pub port: u16,

    /// Substring expected in the service's root-endpoint response body.
    ///
    /// Distinguishes the intended service from any other process that
    /// happens to occupy the same port. Matched case-insensitively.
    pub fingerprint: String,

    /// Launch command used when no running instance is found.
    pub launch: LaunchSpec,

    /// When false, the service is left unresolved and never launched.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ServiceSpec {
    /// Root URL probed for the fingerprint on the given port.
    pub fn root_url(&self, port: u16) -> String {
        format!("http://127.0.0.1:{}/", port)
    }
}

// ============================================================================
// ServiceState
// ============================================================================

/// Lifecycle state of one managed service.
///
/// `Unresolved -> {ConfiguredMatch | Discovered | Launching}`, then
/// `Launching -> {Healthy | TimedOut}`. `Stopped` is reachable from any
/// non-`Unresolved` state via an explicit stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceState {
    /// No correct instance found and none launched.
    Unresolved,
    /// A matching service answered on the configured port.
    ConfiguredMatch,
    /// A matching service was found on a nearby port; not started by us.
    Discovered,
    /// A child process was launched and is being polled for health.
    Launching,
    /// A launched child answered with the expected fingerprint.
    Healthy,
    /// A launched child never became healthy within the budget.
    ///
    /// Not an error: the resolved port is retained and callers proceed
    /// optimistically.
    TimedOut,
    /// Explicitly stopped; any launched child has been terminated.
    Stopped,
}

// ============================================================================
// ServiceHandle
// ============================================================================

/// Mutable runtime record for one service, owned exclusively by the
/// orchestrator instance that created it.
///
/// Invariant: `launched == false` implies `process` is `None`; services
/// discovered already running are never eligible for termination.
#[derive(Debug)]
pub(crate) struct ServiceHandle {
    pub name: String,

    /// The port ultimately in use. Starts as the configured port and is
    /// overwritten once discovery or launch settles on a real one.
    pub resolved_port: u16,

    /// True only if this orchestrator instance started the process.
    pub launched: bool,

    pub state: ServiceState,

    /// Present only while `launched` is true and the child has not been
    /// stopped.
    pub process: Option<ChildHandle>,
}

impl ServiceHandle {
    pub fn new(name: &str, configured_port: u16) -> Self {
        Self {
            name: name.to_string(),
            resolved_port: configured_port,
            launched: false,
            state: ServiceState::Unresolved,
            process: None,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: self.name.clone(),
            resolved_port: self.resolved_port,
            launched: self.launched,
            state: self.state,
        }
    }
}

// ============================================================================
// ServiceStatus
// ============================================================================

/// Cloneable external snapshot of a service's resolution outcome.
///
/// The process handle itself never leaves the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub resolved_port: u16,
    pub launched: bool,
    pub state: ServiceState,
}
