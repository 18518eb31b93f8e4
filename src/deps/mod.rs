//! Package installation for job dependencies.
//!
//! Runs the configured installer (by default `python -m pip install --user`)
//! with the package names appended, inside the job workspace. The whole run
//! is bounded by one timeout; on expiry the installer is killed and the
//! attempt fails. There is no retry.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::DependencyConfig;
use crate::utils::apply_creation_flags;

#[derive(thiserror::Error, Debug)]
pub enum InstallError {
    #[error("no install command configured")]
    NotConfigured,

    #[error("installer did not finish within {0:?}")]
    Timeout(Duration),

    #[error("installer exited with {code:?}")]
    Failed { code: Option<i32>, output: String },

    #[error("failed to run installer: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    /// Installer output captured before the failure, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependencyInstaller {
    command: Vec<String>,
    timeout: Duration,
}

impl DependencyInstaller {
    pub fn new(cfg: &DependencyConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            timeout: cfg.timeout(),
        }
    }

    /// Install `packages` from `working_dir`. Returns the combined
    /// stdout/stderr of the installer.
    pub async fn install(&self, working_dir: &Path, packages: &[String]) -> Result<String, InstallError> {
        let (program, base_args) = self.command.split_first().ok_or(InstallError::NotConfigured)?;
        tracing::info!("Installing {:?} in {}", packages, working_dir.display());

        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .args(packages)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if working_dir.is_dir() {
            cmd.current_dir(working_dir);
        }
        apply_creation_flags(&mut cmd);

        let child = cmd.spawn()?;
        // dropping the timed-out future drops the child, which kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!("Installer for {:?} timed out after {:?}", packages, self.timeout);
                return Err(InstallError::Timeout(self.timeout));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(text)
        } else {
            tracing::warn!("Installer for {:?} failed: {}", packages, output.status);
            Err(InstallError::Failed {
                code: output.status.code(),
                output: text,
            })
        }
    }
}
