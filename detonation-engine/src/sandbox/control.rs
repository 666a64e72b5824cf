/// Virtualization control plane client
///
/// Every hypervisor and guest operation goes through a [`ControlPlane`], which
/// takes an argument vector and reports whether the tool could be found, ran
/// and failed, or ran and succeeded. [`VBoxManage`] is the production
/// implementation and shells out to the VirtualBox CLI.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Outcome of one control-plane invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The tool exited successfully; carries captured stdout
    Succeeded(String),
    /// The tool ran and exited non-zero (or was killed); carries its diagnostic
    Failed { code: Option<i32>, output: String },
    /// The tool itself could not be launched
    ToolNotFound(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded(_))
    }

    /// Captured stdout on success, diagnostic text otherwise
    pub fn output(&self) -> &str {
        match self {
            CommandOutcome::Succeeded(out) => out,
            CommandOutcome::Failed { output, .. } => output,
            CommandOutcome::ToolNotFound(msg) => msg,
        }
    }

    /// `Ok(stdout)` on success, `Err(diagnostic)` otherwise
    pub fn into_result(self) -> Result<String, String> {
        match self {
            CommandOutcome::Succeeded(out) => Ok(out),
            CommandOutcome::Failed { output, .. } => Err(output),
            CommandOutcome::ToolNotFound(msg) => Err(msg),
        }
    }
}

/// Executes hypervisor CLI commands
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Run the control tool with `args` (the program itself is implied)
    async fn execute(&self, args: &[String]) -> CommandOutcome;
}

/// VirtualBox `VBoxManage` executor
#[derive(Debug, Clone)]
pub struct VBoxManage {
    program: PathBuf,
}

impl VBoxManage {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ControlPlane for VBoxManage {
    async fn execute(&self, args: &[String]) -> CommandOutcome {
        debug!(
            "Executing: {} {}",
            self.program.display(),
            redact_args(args).join(" ")
        );

        // kill_on_drop lets callers bound a command with tokio::time::timeout
        let output = match Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                error!("Control tool not found at {}", self.program.display());
                return CommandOutcome::ToolNotFound(format!(
                    "VBoxManage not found at {}",
                    self.program.display()
                ));
            }
            Err(e) => {
                error!("Failed to launch {}: {}", self.program.display(), e);
                return CommandOutcome::Failed {
                    code: None,
                    output: format!("Failed to launch {}: {}", self.program.display(), e),
                };
            }
        };

        if output.status.success() {
            debug!("Command succeeded");
            return CommandOutcome::Succeeded(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr);
        info!(
            "Command exited with {}: {}",
            code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
            stderr.trim()
        );

        CommandOutcome::Failed {
            code,
            output: format!(
                "Return Code: {}\n{}",
                code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
                stderr
            ),
        }
    }
}

/// Mask credentials before an argument vector reaches the logs
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut hide_next = false;

    for arg in args {
        if hide_next {
            redacted.push("****".to_string());
            hide_next = false;
        } else if arg == "--password" {
            redacted.push(arg.clone());
            hide_next = true;
        } else if arg.starts_with("-p") && arg.len() > 2 {
            // 7-Zip takes its passphrase glued to the switch
            redacted.push("-p****".to_string());
        } else {
            redacted.push(arg.clone());
        }
    }

    redacted
}
