use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: String },
}

/// Powers the host off. Success usually means the process is about to die.
#[async_trait]
pub trait ShutdownAction: Send + Sync {
    async fn shutdown(&self) -> Result<(), ShutdownError>;
}

pub struct HostShutdown {
    program: String,
    args: Vec<String>,
}

impl HostShutdown {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for HostShutdown {
    fn default() -> Self {
        Self::new(
            "sudo",
            vec!["shutdown".to_string(), "-h".to_string(), "now".to_string()],
        )
    }
}

#[async_trait]
impl ShutdownAction for HostShutdown {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        let command = self.command_line();
        info!(%command, "dispatching host shutdown");

        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .await
            .map_err(|err| ShutdownError::Spawn {
                command: command.clone(),
                reason: err.to_string(),
            })?;

        if !status.success() {
            return Err(ShutdownError::Failed {
                command,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}
