//! Sandbox drivers: how a node actually runs a workload.

use std::collections::HashMap;
use std::future::Future;
use std::net::TcpListener;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use strata_entity::schema::SandboxSpec;
use strata_entity::EntityId;

use crate::error::{RunnerError, RunnerResult};

/// A workload that came up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    /// `host:port` the workload serves on.
    pub address: String,
}

/// Runs sandboxes on the local node.
pub trait SandboxDriver: Send + Sync + 'static {
    fn start(
        &self,
        sandbox: &EntityId,
        spec: &SandboxSpec,
    ) -> impl Future<Output = RunnerResult<Started>> + Send;

    /// Stop a sandbox. Unknown sandboxes are a no-op.
    fn stop(&self, sandbox: &EntityId) -> impl Future<Output = RunnerResult<()>> + Send;

    fn is_running(&self, sandbox: &EntityId) -> bool;

    /// Sandboxes whose workload exited on its own since the last call,
    /// with a reason.
    fn reap(&self) -> Vec<(EntityId, String)> {
        Vec::new()
    }
}

/// Runs each sandbox as a child process listening on `PORT`.
///
/// Processes share the host network, so every sandbox gets its own
/// free port on `host` instead of the port in its spec.
pub struct ProcessDriver {
    host: String,
    stop_timeout: Duration,
    children: Mutex<HashMap<EntityId, Child>>,
}

impl ProcessDriver {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            stop_timeout: Duration::from_secs(10),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// How long a stopped process may take to exit after the kill.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn children(&self) -> MutexGuard<'_, HashMap<EntityId, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn free_port(&self) -> RunnerResult<u16> {
        let port_error = |source| RunnerError::Port {
            host: self.host.clone(),
            source,
        };
        let listener = TcpListener::bind((self.host.as_str(), 0)).map_err(port_error)?;
        Ok(listener.local_addr().map_err(port_error)?.port())
    }
}

impl SandboxDriver for ProcessDriver {
    async fn start(&self, sandbox: &EntityId, spec: &SandboxSpec) -> RunnerResult<Started> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| RunnerError::EmptyCommand(sandbox.to_string()))?;
        let port = self.free_port()?;

        let child = Command::new(program)
            .args(args)
            .env("PORT", port.to_string())
            .env("STRATA_SANDBOX", sandbox.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                sandbox: sandbox.to_string(),
                source,
            })?;

        info!(%sandbox, pid = ?child.id(), port, "sandbox process spawned");
        self.children().insert(sandbox.clone(), child);
        Ok(Started {
            address: format!("{}:{port}", self.host),
        })
    }

    async fn stop(&self, sandbox: &EntityId) -> RunnerResult<()> {
        let Some(mut child) = self.children().remove(sandbox) else {
            return Ok(());
        };
        if let Err(e) = child.start_kill() {
            debug!(%sandbox, error = %e, "kill failed, process already gone");
        }
        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => info!(%sandbox, %status, "sandbox process stopped"),
            Ok(Err(e)) => warn!(%sandbox, error = %e, "waiting for sandbox process failed"),
            Err(_) => warn!(%sandbox, timeout = ?self.stop_timeout, "sandbox process did not exit"),
        }
        Ok(())
    }

    fn is_running(&self, sandbox: &EntityId) -> bool {
        self.children().contains_key(sandbox)
    }

    fn reap(&self) -> Vec<(EntityId, String)> {
        let mut children = self.children();
        let mut exited = Vec::new();
        children.retain(|id, child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                exited.push((id.clone(), format!("process exited: {status}")));
                false
            }
            Err(e) => {
                exited.push((id.clone(), format!("process lost: {e}")));
                false
            }
        });
        exited
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(command: &[&str]) -> SandboxSpec {
        SandboxSpec {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..SandboxSpec::default()
        }
    }

    fn sid(name: &str) -> EntityId {
        EntityId::new("sandbox", name).unwrap()
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let driver = ProcessDriver::new("127.0.0.1");
        let err = driver.start(&sid("s1"), &spec(&[])).await.unwrap_err();
        assert!(matches!(err, RunnerError::EmptyCommand(_)));
        assert!(!driver.is_running(&sid("s1")));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let driver = ProcessDriver::new("127.0.0.1");
        let err = driver
            .start(&sid("s1"), &spec(&["/nonexistent/strata-test-binary"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn started_process_reports_address_and_stops() {
        let driver = ProcessDriver::new("127.0.0.1");
        let started = driver.start(&sid("s1"), &spec(&["sleep", "30"])).await.unwrap();
        assert!(started.address.starts_with("127.0.0.1:"));
        assert!(driver.is_running(&sid("s1")));

        driver.stop(&sid("s1")).await.unwrap();
        assert!(!driver.is_running(&sid("s1")));
        // Stopping twice is fine.
        driver.stop(&sid("s1")).await.unwrap();
    }

    #[tokio::test]
    async fn exited_process_is_reaped() {
        let driver = ProcessDriver::new("127.0.0.1");
        driver.start(&sid("s1"), &spec(&["true"])).await.unwrap();

        let mut reaped = Vec::new();
        for _ in 0..100 {
            reaped = driver.reap();
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, sid("s1"));
        assert!(!driver.is_running(&sid("s1")));
    }
}
