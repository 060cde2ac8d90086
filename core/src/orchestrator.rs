//! Per-service resolution pipeline and lifecycle ownership.
//!
//! For each managed service the orchestrator runs the same sequential
//! pipeline: check the configured port, scan its neighborhood, and only
//! then launch a new instance on a free port and poll it to health. A
//! service found already running is adopted, never restarted: launching a
//! duplicate would waste resources and leave two instances with divergent
//! state (different loaded models, for one).
//!
//! Failure modes degrade: a missing executable or exhausted port range
//! leaves the service `Unresolved` on its configured port, and a health
//! timeout keeps the launched service registered. Nothing here is allowed
//! to take the embedding host down.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator;
use crate::config::CompanionConfig;
use crate::error::{Error, Result};
use crate::health;
use crate::models::{LaunchSpec, ServiceHandle, ServiceSpec, ServiceState, ServiceStatus};
use crate::probe::{HttpProber, Probe};
use crate::supervisor::ProcessSupervisor;

/// Bound on waiting for another service's resolved port when substituting
/// `{port:<service>}` placeholders at launch time.
const PEER_PORT_WAIT: Duration = Duration::from_secs(20);

/// Owns the resolution state and any launched children for one set of
/// companion services.
///
/// One orchestrator instance exclusively owns its `ServiceHandle`s. On
/// reconfiguration the caller stops this instance (completing all kills),
/// discards it, and constructs a new one; two live orchestrators would
/// race each other's free-port detection. Launched children are killed on
/// drop as a backstop; [`ServiceOrchestrator::stop_all`] is the orderly
/// path.
pub struct ServiceOrchestrator<P: Probe = HttpProber> {
    config: CompanionConfig,
    prober: P,
    supervisor: ProcessSupervisor,

    /// Runtime record per service. Key: logical service name.
    handles: RwLock<HashMap<String, ServiceHandle>>,

    /// Serializes concurrent ensure operations for the same service.
    ensure_locks: HashMap<String, AsyncMutex<()>>,

    /// Single-writer publication of each service's resolved port, read by
    /// the HTTP-bridge collaborator and by dependent launches.
    resolved: HashMap<String, watch::Sender<Option<u16>>>,

    /// Aborts in-flight health polls when the orchestrator is stopped.
    cancel: CancellationToken,
}

impl ServiceOrchestrator<HttpProber> {
    /// Creates an orchestrator probing over real HTTP.
    pub fn new(config: CompanionConfig) -> Result<Self> {
        let prober = HttpProber::with_timeout(Duration::from_secs(config.probe_timeout_secs))?;
        Ok(Self::with_prober(config, prober))
    }
}

impl<P: Probe> ServiceOrchestrator<P> {
    /// Creates an orchestrator with a custom prober implementation.
    pub fn with_prober(config: CompanionConfig, prober: P) -> Self {
        let mut handles = HashMap::new();
        let mut ensure_locks = HashMap::new();
        let mut resolved = HashMap::new();

        for spec in &config.services {
            handles.insert(spec.name.clone(), ServiceHandle::new(&spec.name, spec.port));
            ensure_locks.insert(spec.name.clone(), AsyncMutex::new(()));
            let (tx, _) = watch::channel(None);
            resolved.insert(spec.name.clone(), tx);
        }

        Self {
            config,
            prober,
            supervisor: ProcessSupervisor::new(),
            handles: RwLock::new(handles),
            ensure_locks,
            resolved,
            cancel: CancellationToken::new(),
        }
    }

    /// The configuration this orchestrator was built from.
    pub fn config(&self) -> &CompanionConfig {
        &self.config
    }

    // =========================================================================
    // Ensure
    // =========================================================================

    /// Ensures every configured service is reachable, concurrently.
    ///
    /// The services are independent tasks; no cross-service ordering is
    /// guaranteed beyond dependent launches awaiting the peer ports their
    /// launch specs reference.
    pub async fn ensure_all(&self) -> Vec<ServiceStatus> {
        let names: Vec<String> = self.config.services.iter().map(|s| s.name.clone()).collect();
        let ensures = names.iter().map(|name| self.ensure_service(name));

        join_all(ensures)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("ensure failed: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Runs the check -> scan -> launch -> poll pipeline for one service.
    ///
    /// Steps execute strictly in order; concurrent calls for the same
    /// service are serialized. Configuration problems (missing executable,
    /// no free port) log and leave the service `Unresolved`; the caller
    /// copes with an unreachable service at request time instead.
    pub async fn ensure_service(&self, name: &str) -> Result<ServiceStatus> {
        let spec = self
            .config
            .service(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown service '{}'", name)))?;
        let lock = self
            .ensure_locks
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown service '{}'", name)))?;
        let _guard = lock.lock().await;

        if self.cancel.is_cancelled() {
            return Ok(self.snapshot(&spec));
        }

        // 1. Auto-launch may be disabled per service.
        if !spec.enabled {
            debug!("[{}] auto-launch disabled", spec.name);
            return Ok(self.snapshot(&spec));
        }

        // 2. The configured port may already host the right service.
        if self
            .prober
            .probe(&spec.root_url(spec.port), &spec.fingerprint)
            .await
        {
            info!(
                "[{}] matching service already on configured port {}",
                spec.name, spec.port
            );
            self.update(&spec.name, |handle| {
                handle.resolved_port = spec.port;
                handle.launched = false;
                handle.state = ServiceState::ConfiguredMatch;
            });
            self.publish(&spec.name, spec.port);
            return Ok(self.snapshot(&spec));
        }

        // 3. It may have shifted to a nearby port.
        if let Some(port) = allocator::scan_for_fingerprint(
            &self.prober,
            spec.port,
            self.config.scan_range,
            &spec.fingerprint,
        )
        .await
        {
            info!("[{}] discovered running instance on port {}", spec.name, port);
            self.update(&spec.name, |handle| {
                handle.resolved_port = port;
                handle.launched = false;
                handle.state = ServiceState::Discovered;
            });
            self.publish(&spec.name, port);
            return Ok(self.snapshot(&spec));
        }

        // A stop may have been requested while we were probing; past this
        // point the pipeline starts allocating and launching, so bail out
        // before creating anything new.
        if self.cancel.is_cancelled() {
            return Ok(self.snapshot(&spec));
        }

        // 4. Nothing suitable is running; we have to launch our own.
        let Some(program) = self.supervisor.locate_program(&spec.launch.program) else {
            warn!(
                "[{}] launch executable {} not found; leaving service unresolved",
                spec.name,
                spec.launch.program.display()
            );
            return Ok(self.snapshot(&spec));
        };

        // 5. Pick a free port to launch on.
        let Some(port) = allocator::find_free_port(spec.port, self.config.scan_range).await
        else {
            warn!(
                "[{}] no free port near {}; leaving service unresolved",
                spec.name, spec.port
            );
            return Ok(self.snapshot(&spec));
        };

        // 6. Launch with the chosen port substituted into args and env.
        let vars = self.template_vars(&spec, port).await;
        let args = substitute_list(&spec.launch.args, &vars);
        let env = substitute_map(&spec.launch.env, &vars);

        // Last check before the spawn: awaiting peer ports above may have
        // overlapped with a stop request.
        if self.cancel.is_cancelled() {
            return Ok(self.snapshot(&spec));
        }

        let child = match self.supervisor.start_hidden(
            &spec.name,
            &program,
            &args,
            spec.launch.working_dir.as_deref(),
            &env,
        ) {
            Ok(child) => child,
            Err(e) => {
                warn!("[{}] {}", spec.name, e);
                return Ok(self.snapshot(&spec));
            }
        };

        self.update(&spec.name, |handle| {
            handle.resolved_port = port;
            handle.launched = true;
            handle.state = ServiceState::Launching;
            handle.process = Some(child);
        });
        self.publish(&spec.name, port);

        // 7. Poll until healthy or the budget runs out. A timeout keeps the
        // service registered on its port; later requests either fail until
        // the service catches up or succeed once it does.
        let healthy = health::poll_until_match(
            &self.prober,
            &spec.root_url(port),
            &spec.fingerprint,
            Duration::from_secs(self.config.health_timeout_secs),
            &self.cancel,
        )
        .await;

        self.update(&spec.name, |handle| {
            // A stop may have raced the poll; don't resurrect it.
            if handle.state == ServiceState::Launching {
                handle.state = if healthy {
                    ServiceState::Healthy
                } else {
                    ServiceState::TimedOut
                };
            }
            if !healthy {
                if let Some(process) = handle.process.as_mut() {
                    if !process.is_running() {
                        // Likely lost the port to a concurrent bind between
                        // the free-port check and startup.
                        warn!("[{}] child exited before becoming healthy", handle.name);
                    }
                }
            }
        });

        if healthy {
            info!("[{}] healthy on port {}", spec.name, port);
        } else {
            warn!(
                "[{}] not healthy after {}s; continuing with port {}",
                spec.name, self.config.health_timeout_secs, port
            );
        }

        Ok(self.snapshot(&spec))
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stops one service: kills the child only if this orchestrator
    /// launched it, marks the handle `Stopped`, and clears the process
    /// reference. Safe to call repeatedly; a discovered external instance
    /// is left running.
    ///
    /// Takes the service's ensure lock, so a stop cannot interleave with
    /// an in-flight ensure for the same service and observe (or leave
    /// behind) a half-resolved handle.
    pub async fn stop_service(&self, name: &str) {
        let _guard = match self.ensure_locks.get(name) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let process = {
            let mut handles = self.handles.write();
            match handles.get_mut(name) {
                Some(handle) => {
                    if handle.state != ServiceState::Unresolved {
                        handle.state = ServiceState::Stopped;
                    }
                    handle.process.take()
                }
                None => None,
            }
        };

        if let Some(mut child) = process {
            child.kill().await;
        }
    }

    /// Stops every service this orchestrator manages.
    ///
    /// Cancels in-flight ensure operations first, then waits for each one
    /// to wind down (via the per-service ensure locks) before killing, so
    /// a discarded orchestrator cannot keep polling or launch late; every
    /// kill has completed by the time this returns, which is what allows
    /// a replacement orchestrator to start cleanly.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        for spec in &self.config.services {
            self.stop_service(&spec.name).await;
        }
    }

    // =========================================================================
    // State Access
    // =========================================================================

    /// Snapshot of one service's resolution outcome.
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.handles.read().get(name).map(|handle| handle.status())
    }

    /// Snapshots of all services, in configuration order.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.config
            .services
            .iter()
            .filter_map(|spec| self.status(&spec.name))
            .collect()
    }

    /// The resolved port, if discovery or launch has settled on one.
    pub fn resolved_port(&self, name: &str) -> Option<u16> {
        self.resolved.get(name).and_then(|tx| *tx.borrow())
    }

    /// Subscribes to a service's resolved port. The channel starts at
    /// `None` and is written exactly by the ensure operation that resolves
    /// the service.
    pub fn watch_resolved(&self, name: &str) -> Option<watch::Receiver<Option<u16>>> {
        self.resolved.get(name).map(|tx| tx.subscribe())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn update<F>(&self, name: &str, updater: F)
    where
        F: FnOnce(&mut ServiceHandle),
    {
        let mut handles = self.handles.write();
        if let Some(handle) = handles.get_mut(name) {
            updater(handle);
        }
    }

    fn snapshot(&self, spec: &ServiceSpec) -> ServiceStatus {
        self.status(&spec.name)
            .unwrap_or_else(|| ServiceHandle::new(&spec.name, spec.port).status())
    }

    fn publish(&self, name: &str, port: u16) {
        if let Some(tx) = self.resolved.get(name) {
            tx.send_replace(Some(port));
        }
    }

    /// Placeholder values for a launch: `{port}`, `{model}`, and one
    /// `{port:<service>}` per peer the launch spec references.
    async fn template_vars(&self, spec: &ServiceSpec, port: u16) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("port".to_string(), port.to_string());
        vars.insert("model".to_string(), self.config.model.clone());

        for peer in peer_references(&spec.launch) {
            let value = self.await_peer_port(&peer).await;
            vars.insert(format!("port:{}", peer), value.to_string());
        }

        vars
    }

    /// Waits (bounded) for a referenced service's resolved port, falling
    /// back to its configured port so concurrent ensures cannot deadlock
    /// on each other.
    async fn await_peer_port(&self, peer: &str) -> u16 {
        let configured = self.config.service(peer).map(|s| s.port).unwrap_or(0);

        let Some(tx) = self.resolved.get(peer) else {
            warn!("launch spec references unknown service '{}'", peer);
            return configured;
        };

        let mut rx = tx.subscribe();
        let resolved = async {
            loop {
                if let Some(port) = *rx.borrow_and_update() {
                    return port;
                }
                if rx.changed().await.is_err() {
                    return configured;
                }
            }
        };

        tokio::select! {
            port = resolved => port,
            _ = self.cancel.cancelled() => configured,
            _ = sleep(PEER_PORT_WAIT) => {
                warn!(
                    "timed out waiting for '{}' to resolve; using configured port {}",
                    peer, configured
                );
                configured
            }
        }
    }
}

/// Extracts the peer names mentioned in `{port:<service>}` placeholders.
fn peer_references(launch: &LaunchSpec) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    {
        let mut scan = |text: &str| {
            let mut rest = text;
            while let Some(start) = rest.find("{port:") {
                let tail = &rest[start + 6..];
                let Some(end) = tail.find('}') else { break };
                let name = &tail[..end];
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                rest = &tail[end + 1..];
            }
        };

        for arg in &launch.args {
            scan(arg);
        }
        for value in launch.env.values() {
            scan(value);
        }
    }
    names
}

fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = input.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

fn substitute_list(items: &[String], vars: &HashMap<String, String>) -> Vec<String> {
    items.iter().map(|item| substitute(item, vars)).collect()
}

fn substitute_map(
    map: &BTreeMap<String, String>,
    vars: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    map.iter()
        .map(|(key, value)| (key.clone(), substitute(value, vars)))
        .collect()
}
