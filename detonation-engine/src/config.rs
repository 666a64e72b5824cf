/// Configuration module for the Detonation Engine
///
/// This module provides centralized configuration management with support for:
/// - Environment variable loading (with optional `.env` file)
/// - Default values
/// - Configuration validation
/// - Sandbox, storage, server and logging sections

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for the Detonation Engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            server: ServerConfig::from_env()?,
            sandbox: SandboxConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.sandbox.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid {}", key))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub max_upload_mb: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_string("SERVER_HOST", "0.0.0.0"),
            port: env_or("SERVER_PORT", "8002")?,
            enable_cors: env_or("ENABLE_CORS", "true").unwrap_or(true),
            max_upload_mb: env_or("MAX_UPLOAD_MB", "100")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        if self.max_upload_mb == 0 {
            anyhow::bail!("Max upload size must be greater than 0");
        }
        Ok(())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8002,
            enable_cors: true,
            max_upload_mb: 100,
        }
    }
}

/// How a cloned VM is powered on (`VBoxManage startvm --type`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    Gui,
    Headless,
    Separate,
}

impl StartMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartMode::Gui => "gui",
            StartMode::Headless => "headless",
            StartMode::Separate => "separate",
        }
    }
}

impl FromStr for StartMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gui" => Ok(StartMode::Gui),
            "headless" => Ok(StartMode::Headless),
            "separate" => Ok(StartMode::Separate),
            other => anyhow::bail!("Unknown VM start type '{}'", other),
        }
    }
}

/// Sandbox (hypervisor + guest) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Path or name of the hypervisor control binary
    pub vboxmanage_path: PathBuf,
    /// Base VM every sandbox is cloned from
    pub base_vm_name: String,
    pub start_mode: StartMode,
    pub guest_username: String,
    pub guest_password: String,
    /// Guest folder the archive is copied to and extracted into
    pub guest_sample_dir: String,
    /// Guest folder artifacts are gathered into before copy-back
    pub guest_results_dir: String,
    /// Guest folder the analysis script writes its per-run output to
    pub guest_runs_dir: String,
    pub guest_script_path: String,
    pub guest_archiver_path: String,
    pub guest_powershell_path: String,
    pub detonation_timeout_secs: u64,
    /// Extra host-side allowance on top of the script's own timeout
    pub detonation_grace_secs: u64,
    /// Fixed boot delay used when readiness probing is off or unavailable
    pub boot_wait_secs: u64,
    pub readiness_probe: bool,
    pub readiness_poll_secs: u64,
    pub readiness_max_wait_secs: u64,
    /// Pause between power-off and unregister so the hypervisor releases file locks
    pub poweroff_settle_secs: u64,
    pub accepted_extensions: Vec<String>,
    pub executable_extension: String,
    pub max_concurrent_sandboxes: usize,
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            vboxmanage_path: PathBuf::from(env_string("VBOXMANAGE_PATH", "VBoxManage")),
            base_vm_name: env_string("BASE_VM_NAME", &defaults.base_vm_name),
            start_mode: env_or("VM_START_TYPE", defaults.start_mode.as_str())?,
            guest_username: env_string("VM_USERNAME", &defaults.guest_username),
            guest_password: env_string("VM_PASSWORD", &defaults.guest_password),
            guest_sample_dir: env_string("VM_DESTINATION_FOLDER", &defaults.guest_sample_dir),
            guest_results_dir: env_string("VM_RESULTS_FOLDER", &defaults.guest_results_dir),
            guest_runs_dir: env_string("VM_RUNS_FOLDER", &defaults.guest_runs_dir),
            guest_script_path: env_string("VM_SCRIPT_PATH", &defaults.guest_script_path),
            guest_archiver_path: env_string("VM_ARCHIVER_PATH", &defaults.guest_archiver_path),
            guest_powershell_path: env_string(
                "VM_POWERSHELL_PATH",
                &defaults.guest_powershell_path,
            ),
            detonation_timeout_secs: env_or("DETONATION_TIMEOUT_SECS", "120")?,
            detonation_grace_secs: env_or("DETONATION_GRACE_SECS", "60")?,
            boot_wait_secs: env_or("BOOT_WAIT_SECS", "60")?,
            readiness_probe: env_or("READINESS_PROBE", "true").unwrap_or(true),
            readiness_poll_secs: env_or("READINESS_POLL_SECS", "5")?,
            readiness_max_wait_secs: env_or("READINESS_MAX_WAIT_SECS", "180")?,
            poweroff_settle_secs: env_or("POWEROFF_SETTLE_SECS", "2")?,
            accepted_extensions: env_string("ACCEPTED_EXTENSIONS", "zip,7z,rar")
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            executable_extension: env_string("EXECUTABLE_EXTENSION", "exe")
                .trim_start_matches('.')
                .to_lowercase(),
            max_concurrent_sandboxes: env_or("MAX_CONCURRENT_SANDBOXES", "1")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_vm_name.trim().is_empty() {
            anyhow::bail!("Base VM name cannot be empty");
        }
        if self.guest_username.is_empty() {
            anyhow::bail!("Guest username cannot be empty");
        }
        if self.accepted_extensions.is_empty() {
            anyhow::bail!("At least one accepted archive extension is required");
        }
        if self.executable_extension.is_empty() {
            anyhow::bail!("Executable extension cannot be empty");
        }
        if self.detonation_timeout_secs == 0 {
            anyhow::bail!("Detonation timeout must be greater than 0");
        }
        if self.readiness_probe
            && self.readiness_poll_secs == 0
            && self.readiness_max_wait_secs > 0
        {
            anyhow::bail!("Readiness poll interval must be greater than 0");
        }
        if self.max_concurrent_sandboxes == 0 {
            anyhow::bail!("Max concurrent sandboxes must be at least 1");
        }
        Ok(())
    }

    /// Whether `filename` carries one of the accepted archive extensions
    pub fn accepts(&self, filename: &str) -> bool {
        match filename.rsplit_once('.') {
            Some((_, ext)) => {
                let ext = ext.to_lowercase();
                self.accepted_extensions.iter().any(|allowed| *allowed == ext)
            }
            None => false,
        }
    }

    pub fn detonation_timeout(&self) -> Duration {
        Duration::from_secs(self.detonation_timeout_secs)
    }

    /// Host-side bound on the detonation command
    pub fn detonation_deadline(&self) -> Duration {
        Duration::from_secs(self.detonation_timeout_secs + self.detonation_grace_secs)
    }

    pub fn boot_wait(&self) -> Duration {
        Duration::from_secs(self.boot_wait_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_secs)
    }

    pub fn readiness_max_wait(&self) -> Duration {
        Duration::from_secs(self.readiness_max_wait_secs)
    }

    pub fn poweroff_settle(&self) -> Duration {
        Duration::from_secs(self.poweroff_settle_secs)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            vboxmanage_path: PathBuf::from("VBoxManage"),
            base_vm_name: "Windows-ent-10".to_string(),
            start_mode: StartMode::Gui,
            guest_username: "sandbox".to_string(),
            guest_password: "sandbox".to_string(),
            guest_sample_dir: "C:\\Users\\sandbox\\Desktop\\Malware".to_string(),
            guest_results_dir: "C:\\Users\\sandbox\\Desktop\\DetonationResults".to_string(),
            guest_runs_dir: "C:\\Detonation\\Runs".to_string(),
            guest_script_path: "C:\\Detonation\\run.ps1".to_string(),
            guest_archiver_path: "C:\\Program Files\\7-Zip\\7z.exe".to_string(),
            guest_powershell_path:
                "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe".to_string(),
            detonation_timeout_secs: 120,
            detonation_grace_secs: 60,
            boot_wait_secs: 60,
            readiness_probe: true,
            readiness_poll_secs: 5,
            readiness_max_wait_secs: 180,
            poweroff_settle_secs: 2,
            accepted_extensions: vec!["zip".to_string(), "7z".to_string(), "rar".to_string()],
            executable_extension: "exe".to_string(),
            max_concurrent_sandboxes: 1,
        }
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Staging area for uploaded samples; files live here only for the duration of a run
    pub upload_dir: PathBuf,
    /// Durable per-run artifact store
    pub results_dir: PathBuf,
    /// Host copy of the analysis script pushed into every guest
    pub analysis_script: PathBuf,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            upload_dir: PathBuf::from(env_string("UPLOAD_DIR", "uploads")),
            results_dir: PathBuf::from(env_string("RESULTS_DIR", "analysis_results")),
            analysis_script: PathBuf::from(env_string("ANALYSIS_SCRIPT", "scripts/run.ps1")),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload_dir.as_os_str().is_empty() {
            anyhow::bail!("Upload directory cannot be empty");
        }
        if self.results_dir.as_os_str().is_empty() {
            anyhow::bail!("Results directory cannot be empty");
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            results_dir: PathBuf::from("analysis_results"),
            analysis_script: PathBuf::from("scripts/run.ps1"),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact format
    Compact,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => anyhow::bail!("Unknown log format '{}'", other),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            level: env_string("LOG_LEVEL", "info"),
            format: env_or("LOG_FORMAT", "pretty")?,
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
