//! Service launchers — how a role instance is actually started and stopped.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use corral_core::{InstanceKey, RoleCatalog};

/// Where and what to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub key: InstanceKey,
    /// Address of the hosting member.
    pub address: String,
}

/// A failed start or stop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not spawn {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
}

/// Starts and stops role instances on members.
#[async_trait]
pub trait ServiceLauncher: Send + Sync + 'static {
    async fn start(&self, target: &LaunchTarget) -> Result<(), LaunchError>;

    async fn stop(&self, target: &LaunchTarget) -> Result<(), LaunchError>;
}

/// For roles whose processes are managed outside the controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLauncher;

#[async_trait]
impl ServiceLauncher for NoopLauncher {
    async fn start(&self, target: &LaunchTarget) -> Result<(), LaunchError> {
        debug!(instance = %target.key, "noop start");
        Ok(())
    }

    async fn stop(&self, target: &LaunchTarget) -> Result<(), LaunchError> {
        debug!(instance = %target.key, "noop stop");
        Ok(())
    }
}

/// Runs each role's configured `start_command` / `stop_command`.
///
/// Commands receive `CORRAL_ROLE`, `CORRAL_MEMBER` and `CORRAL_ADDRESS`
/// in their environment. Roles without a command succeed immediately.
pub struct CommandLauncher {
    catalog: Arc<RoleCatalog>,
    timeout: Duration,
}

impl CommandLauncher {
    pub fn new(catalog: Arc<RoleCatalog>) -> Self {
        Self {
            catalog,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, argv: &[String], target: &LaunchTarget) -> Result<(), LaunchError> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env("CORRAL_ROLE", target.key.role.as_str())
            .env("CORRAL_MEMBER", &target.key.member)
            .env("CORRAL_ADDRESS", &target.address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| LaunchError::Spawn {
            command: program.clone(),
            message: e.to_string(),
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(LaunchError::Spawn {
                    command: program.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => return Err(LaunchError::Timeout(self.timeout)),
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(instance = %target.key, code = ?output.status.code(), %stderr, "command failed");
            Err(LaunchError::Exited {
                code: output.status.code(),
                stderr,
            })
        }
    }
}

#[async_trait]
impl ServiceLauncher for CommandLauncher {
    async fn start(&self, target: &LaunchTarget) -> Result<(), LaunchError> {
        let argv = self
            .catalog
            .get(&target.key.role)
            .map(|d| d.start_command.clone())
            .unwrap_or_default();
        info!(instance = %target.key, address = %target.address, "starting instance");
        self.run(&argv, target).await
    }

    async fn stop(&self, target: &LaunchTarget) -> Result<(), LaunchError> {
        let argv = self
            .catalog
            .get(&target.key.role)
            .map(|d| d.stop_command.clone())
            .unwrap_or_default();
        info!(instance = %target.key, address = %target.address, "stopping instance");
        self.run(&argv, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{RoleDefinition, RoleTag};

    fn catalog(start: &[&str], stop: &[&str]) -> Arc<RoleCatalog> {
        let mut def = RoleDefinition::new("broker", 10, &[]);
        def.start_command = start.iter().map(|s| s.to_string()).collect();
        def.stop_command = stop.iter().map(|s| s.to_string()).collect();
        Arc::new(RoleCatalog::new(vec![def]).unwrap())
    }

    fn target() -> LaunchTarget {
        LaunchTarget {
            key: InstanceKey::new(RoleTag::new("broker"), "m1"),
            address: "127.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn missing_command_succeeds() {
        let launcher = CommandLauncher::new(catalog(&[], &[]));
        assert!(launcher.start(&target()).await.is_ok());
        assert!(launcher.stop(&target()).await.is_ok());
    }

    #[tokio::test]
    async fn command_sees_instance_environment() {
        let launcher = CommandLauncher::new(catalog(
            &["sh", "-c", "test \"$CORRAL_ROLE/$CORRAL_MEMBER\" = broker/m1"],
            &[],
        ));
        assert!(launcher.start(&target()).await.is_ok());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let launcher = CommandLauncher::new(catalog(&["sh", "-c", "echo boom >&2; exit 3"], &[]));
        let err = launcher.start(&target()).await.unwrap_err();
        assert_eq!(
            err,
            LaunchError::Exited {
                code: Some(3),
                stderr: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let launcher = CommandLauncher::new(catalog(&["sleep", "5"], &[]))
            .with_timeout(Duration::from_millis(100));
        assert!(matches!(
            launcher.start(&target()).await,
            Err(LaunchError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn unknown_program_fails_to_spawn() {
        let launcher = CommandLauncher::new(catalog(&["/nonexistent/corral-test-binary"], &[]));
        assert!(matches!(
            launcher.start(&target()).await,
            Err(LaunchError::Spawn { .. })
        ));
    }
}
