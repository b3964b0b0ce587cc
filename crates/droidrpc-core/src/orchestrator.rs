//! Concurrent per-device task orchestration.
//!
//! [`Orchestrator`] runs one tokio task per device. Each task gets (or
//! creates) the device's session from the [`SessionRegistry`], takes the
//! device lock for its whole run, and executes a [`DeviceScript`] for a fixed
//! number of iterations. Devices run in parallel; iterations on one device
//! are strictly sequential.
//!
//! Cancellation is cooperative. Every task holds a child of the
//! orchestrator's shutdown token and checks it before each iteration, so a
//! cancelled device may finish the iteration it is in. Each task ends with a
//! [`DeviceReport`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use droidrpc_core::binding::Binding;
//! use droidrpc_core::orchestrator::Orchestrator;
//! use droidrpc_core::registry::SessionRegistry;
//! use droidrpc_core::script::ReplyScript;
//! use droidrpc_core::session::ConnectOptions;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), droidrpc_core::RpcError> {
//!     let binding = Binding::load("lib/libmytrpc.so")?;
//!     let registry = Arc::new(SessionRegistry::new(binding, ConnectOptions::default()));
//!     let mut orchestrator = Orchestrator::new(registry, Arc::new(ReplyScript::default()), 100);
//!
//!     orchestrator.spawn_device("192.168.1.181", 7101);
//!     orchestrator.spawn_device("192.168.1.181", 7102);
//!
//!     for report in orchestrator.shutdown_after_completion().await {
//!         println!("{report}");
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::registry::SessionRegistry;
use crate::script::DeviceScript;
use crate::session::DeviceKey;

/// How a device task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// Every iteration ran.
    Completed,
    /// The task stopped at a cancellation check.
    Cancelled,
    /// Connecting or an iteration failed.
    Failed(String),
}

/// Summary of one device task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub key: DeviceKey,
    pub completed_iterations: u32,
    pub outcome: Outcome,
}

impl DeviceReport {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Completed => write!(f, "{}: completed {} iterations", self.key, self.completed_iterations),
            Outcome::Cancelled => write!(
                f,
                "{}: cancelled after {} iterations",
                self.key, self.completed_iterations
            ),
            Outcome::Failed(reason) => write!(
                f,
                "{}: failed after {} iterations: {}",
                self.key, self.completed_iterations, reason
            ),
        }
    }
}

struct DeviceTask {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<DeviceReport>,
}

/// Runs a [`DeviceScript`] on many devices at once.
pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    script: Arc<dyn DeviceScript>,
    iterations: u32,
    shutdown: CancellationToken,
    tasks: BTreeMap<DeviceKey, DeviceTask>,
}

impl Orchestrator {
    pub fn new(registry: Arc<SessionRegistry>, script: Arc<dyn DeviceScript>, iterations: u32) -> Self {
        Self {
            registry,
            script,
            iterations,
            shutdown: CancellationToken::new(),
            tasks: BTreeMap::new(),
        }
    }

    /// Starts the task for `host:port` and returns its key.
    ///
    /// A device that already has a task keeps it; no second task is started.
    pub fn spawn_device(&mut self, host: &str, port: u16) -> DeviceKey {
        let key = DeviceKey::new(host, port);
        if self.tasks.contains_key(&key) {
            warn!(device = %key, "device task already running");
            return key;
        }

        let cancel_token = self.shutdown.child_token();
        let span = info_span!("device", device = %key);
        let join_handle = tokio::spawn(
            run_device(
                self.registry.clone(),
                self.script.clone(),
                key.clone(),
                self.iterations,
                cancel_token.clone(),
            )
            .instrument(span),
        );

        self.tasks.insert(
            key.clone(),
            DeviceTask {
                cancel_token,
                join_handle,
            },
        );
        key
    }

    /// Asks one device's task to stop. Returns `false` for an unknown key.
    pub fn cancel_device(&self, key: &DeviceKey) -> bool {
        match self.tasks.get(key) {
            Some(task) => {
                task.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns a token that cancels every device task when cancelled, for
    /// wiring to a signal handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the keys of devices with a task.
    pub fn devices(&self) -> Vec<DeviceKey> {
        self.tasks.keys().cloned().collect()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Waits for every task to end and returns their reports, ordered by key.
    pub async fn wait(&mut self) -> Vec<DeviceReport> {
        let tasks = std::mem::take(&mut self.tasks);
        let mut reports = Vec::with_capacity(tasks.len());
        for (key, task) in tasks {
            let report = match task.join_handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(device = %key, error = %e, "device task panicked");
                    DeviceReport {
                        key,
                        completed_iterations: 0,
                        outcome: Outcome::Failed(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    /// Cancels every task, waits for them, then closes all sessions.
    pub async fn shutdown(&mut self) -> Vec<DeviceReport> {
        info!(devices = self.tasks.len(), "shutting down");
        self.shutdown.cancel();
        self.shutdown_after_completion().await
    }

    /// Waits for every task to end on its own, then closes all sessions.
    pub async fn shutdown_after_completion(&mut self) -> Vec<DeviceReport> {
        let reports = self.wait().await;
        self.registry.close_all().await;
        reports
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("script", &self.script.name())
            .field("iterations", &self.iterations)
            .field("devices", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn run_device(
    registry: Arc<SessionRegistry>,
    script: Arc<dyn DeviceScript>,
    key: DeviceKey,
    iterations: u32,
    cancel_token: CancellationToken,
) -> DeviceReport {
    let report = |completed_iterations, outcome| DeviceReport {
        key: key.clone(),
        completed_iterations,
        outcome,
    };

    let connected = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => {
            info!("cancelled before connecting");
            return report(0, Outcome::Cancelled);
        }
        result = registry.get_or_create(&key.host, key.port) => result,
    };
    let shared = match connected {
        Ok(shared) => shared,
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "device initialisation failed");
            return report(0, Outcome::Failed(e.to_string()));
        }
    };

    let device = shared.lock_owned().await;
    info!(script = script.name(), iterations, "device task started");

    let mut completed = 0;
    for iteration in 0..iterations {
        if cancel_token.is_cancelled() {
            info!(completed, "device task cancelled");
            return report(completed, Outcome::Cancelled);
        }

        let span = info_span!("iteration", n = iteration + 1);
        if let Err(e) = script.run_iteration(&device, iteration).instrument(span).await {
            error!(completed, error = %e, "device loop aborted");
            return report(completed, Outcome::Failed(e.to_string()));
        }
        completed += 1;
    }

    info!(completed, "device task finished");
    report(completed, Outcome::Completed)
}
