//! Compute control plane gateway.

use std::fmt;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// Coarse power state reported by the compute plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerState {
    Active,
    Shelved,
    /// Anything else (building, shelving in progress, error). Carries the
    /// raw status for logging.
    Unknown(String),
}

impl PowerState {
    /// Map a Nova server status onto the active/shelved axis.
    pub fn from_nova_status(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "ACTIVE" => Self::Active,
            "SHELVED" | "SHELVED_OFFLOADED" => Self::Shelved,
            "" => Self::Unknown("UNKNOWN".to_string()),
            _ => Self::Unknown(normalized),
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Shelved => f.write_str("shelved"),
            Self::Unknown(raw) => write!(f, "unknown ({raw})"),
        }
    }
}

/// Start, shelve, and inspect the managed instance.
///
/// Implementations may be slow; callers bound every call with
/// [`with_timeout`](crate::with_timeout).
#[async_trait]
pub trait ComputeGateway: Send + Sync {
    async fn start_instance(&self) -> GatewayResult<()>;

    async fn shelve_instance(&self) -> GatewayResult<()>;

    async fn instance_status(&self) -> GatewayResult<PowerState>;
}

/// Drives the compute plane through the `openstack` command-line client.
///
/// Start and shelve run with `--wait`, so a successful return means the
/// compute plane finished the transition.
#[derive(Debug, Clone)]
pub struct CommandComputeGateway {
    program: String,
    global_args: Vec<String>,
    instance: String,
}

impl CommandComputeGateway {
    pub fn new(program: impl Into<String>, global_args: Vec<String>, instance: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            global_args,
            instance: instance.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.global_args)
            .args(args)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null());
        cmd
    }

    async fn run(&self, operation: &'static str, args: &[&str]) -> GatewayResult<String> {
        debug!(program = %self.program, ?args, instance = %self.instance, "running compute command");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| GatewayError::failed(operation, format!("spawn {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::failed(
                operation,
                format!("{} ({})", stderr.trim(), output.status),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ComputeGateway for CommandComputeGateway {
    async fn start_instance(&self) -> GatewayResult<()> {
        self.run("start_instance", &["server", "unshelve", "--wait", &self.instance])
            .await
            .map(|_| ())
    }

    async fn shelve_instance(&self) -> GatewayResult<()> {
        self.run("shelve_instance", &["server", "shelve", "--wait", &self.instance])
            .await
            .map(|_| ())
    }

    async fn instance_status(&self) -> GatewayResult<PowerState> {
        let stdout = self
            .run(
                "instance_status",
                &["server", "show", &self.instance, "-f", "value", "-c", "status"],
            )
            .await?;
        Ok(PowerState::from_nova_status(&stdout))
    }
}
