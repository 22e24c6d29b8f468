use std::io;
use std::process::Command;

use fleet_core::protocol::AppDescriptor;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("no apps command configured")]
    NotConfigured,
    #[error("apps command failed to run: {0}")]
    Io(#[from] io::Error),
    #[error("apps command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("apps output is not a descriptor list: {0}")]
    Parse(String),
}

pub trait AppsProvider: Send + Sync {
    fn collect(&self) -> Result<Vec<AppDescriptor>, CollectError>;
}

// Runs an operator-supplied command and reads the managed-app catalog from
// its stdout as a JSON array of descriptors.
pub struct ScriptProvider {
    command: Vec<String>,
}

impl ScriptProvider {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl AppsProvider for ScriptProvider {
    fn collect(&self) -> Result<Vec<AppDescriptor>, CollectError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(CollectError::NotConfigured);
        };
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(CollectError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let apps: Vec<AppDescriptor> = serde_json::from_str(stdout.trim())
            .map_err(|err| CollectError::Parse(err.to_string()))?;
        debug!("collected {} app descriptors", apps.len());
        Ok(apps)
    }
}
