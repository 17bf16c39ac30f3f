//! Worker container orchestration boundary.
//!
//! The relay does not manage containers itself; it asks an [`Orchestrator`]
//! to launch a worker for a session and to stop it again. The shipped
//! container implementation shells out to docker or podman; the noop
//! implementation is for tests and deployments where an external system
//! launches workers.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

/// Opaque handle to a launched worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef(pub String);

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a worker needs to find its relay.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: String,
    /// Per-session capability token the agent presents on connect.
    pub access_token: String,
    /// WebSocket URL of this relay, reachable from inside the worker.
    pub relay_url: String,
    /// Extra environment for the worker.
    pub env: HashMap<String, String>,
}

/// Container orchestration boundary.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Launch a worker for a session.
    async fn launch(&self, spec: LaunchSpec) -> Result<TaskRef>;

    /// Stop a previously launched worker.
    async fn stop(&self, task_ref: &TaskRef) -> Result<()>;
}

// ============================================================================
// Container runtime (docker / podman CLI)
// ============================================================================

/// Container runtime binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    Podman,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Orchestrator backed by the docker/podman CLI.
pub struct ContainerOrchestrator {
    binary: String,
    image: String,
}

impl ContainerOrchestrator {
    pub fn new(runtime: RuntimeType, image: impl Into<String>) -> Self {
        Self {
            binary: runtime.to_string(),
            image: image.into(),
        }
    }

    /// Probe for an available runtime, docker first.
    pub async fn auto_detect(image: impl Into<String>) -> Result<Self> {
        for runtime in [RuntimeType::Docker, RuntimeType::Podman] {
            let probe = Command::new(runtime.to_string())
                .arg("version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if matches!(probe, Ok(status) if status.success()) {
                info!("Using container runtime: {}", runtime);
                return Ok(Self::new(runtime, image));
            }
        }
        bail!("no container runtime found (tried docker, podman)")
    }

    fn container_name(session_id: &str) -> String {
        format!("quay-session-{session_id}")
    }
}

#[async_trait]
impl Orchestrator for ContainerOrchestrator {
    async fn launch(&self, spec: LaunchSpec) -> Result<TaskRef> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["run", "-d", "--rm"])
            .args(["--name", &Self::container_name(&spec.session_id)])
            .args(["-e", &format!("QUAY_SESSION_ID={}", spec.session_id)])
            .args(["-e", &format!("QUAY_ACCESS_TOKEN={}", spec.access_token)])
            .args(["-e", &format!("QUAY_RELAY_URL={}", spec.relay_url)]);
        for (key, value) in &spec.env {
            cmd.args(["-e", &format!("{key}={value}")]);
        }
        cmd.arg(&self.image);

        debug!(
            "Launching worker container for session {} ({})",
            spec.session_id, self.image
        );
        let output = cmd
            .output()
            .await
            .with_context(|| format!("running {} run", self.binary))?;
        if !output.status.success() {
            bail!(
                "container launch failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(
            "Launched container {} for session {}",
            container_id, spec.session_id
        );
        Ok(TaskRef(container_id))
    }

    async fn stop(&self, task_ref: &TaskRef) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["rm", "-f", &task_ref.0])
            .output()
            .await
            .with_context(|| format!("running {} rm", self.binary))?;
        if !output.status.success() {
            bail!(
                "container stop failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!("Stopped container {}", task_ref);
        Ok(())
    }
}

// ============================================================================
// Noop
// ============================================================================

/// Orchestrator that launches nothing. Used by tests and by deployments
/// where workers are started externally and connect on their own.
#[derive(Default)]
pub struct NoopOrchestrator;

impl NoopOrchestrator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Orchestrator for NoopOrchestrator {
    async fn launch(&self, spec: LaunchSpec) -> Result<TaskRef> {
        debug!(
            "Noop orchestrator: session {} expects an externally launched worker",
            spec.session_id
        );
        Ok(TaskRef(format!("noop:{}", spec.session_id)))
    }

    async fn stop(&self, task_ref: &TaskRef) -> Result<()> {
        debug!("Noop orchestrator: stop {}", task_ref);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_roundtrip() {
        let orchestrator = NoopOrchestrator::new();
        let task = orchestrator
            .launch(LaunchSpec {
                session_id: "s1".to_string(),
                access_token: "t".to_string(),
                relay_url: "ws://localhost/ws/relay/s1".to_string(),
                env: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(task.0, "noop:s1");
        orchestrator.stop(&task).await.unwrap();
    }

    #[test]
    fn test_container_name() {
        assert_eq!(
            ContainerOrchestrator::container_name("abc"),
            "quay-session-abc"
        );
    }
}
