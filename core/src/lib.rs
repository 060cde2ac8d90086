//! Companion Core Library
//!
//! Orchestrates the local companion services of the Semantic Engine: the
//! inference server and the API backend. Both are independent long-running
//! HTTP services that may already be running (started manually or by a
//! previous session), so the orchestrator never assumes it owns the
//! machine's ports or process table. Per service it:
//! - Probes the configured port and verifies the responder's fingerprint
//! - Scans nearby ports for an instance that moved
//! - Launches a hidden child process on a free port and polls it to health
//! - Terminates only processes it started itself
//!
//! All failure modes degrade to "service unreachable" rather than erroring
//! across the public boundary; the embedding host must keep running even
//! when a companion service cannot be reached.

pub mod allocator;
pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod probe;
pub mod supervisor;

// Re-export commonly used types
pub use config::{CompanionConfig, ConfigStore, BACKEND_SERVICE, INFERENCE_SERVICE};
pub use error::{Error, Result};
pub use models::{LaunchSpec, ServiceSpec, ServiceState, ServiceStatus};
pub use orchestrator::ServiceOrchestrator;
pub use probe::{HttpProber, Probe};
pub use supervisor::{ChildHandle, ProcessSupervisor};
