//! Detonation pipeline
//!
//! Drives one sample through an ordered sequence of sandbox steps:
//! - Stage the upload on the host
//! - Clone, start and wait for a sandbox
//! - Push sample and analysis script, extract, locate and detonate
//! - Collect artifacts and copy them back to the results store
//! - Tear the sandbox down, whatever happened before
pub mod classify;

use anyhow::{Context, Result};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{Config, SandboxConfig};
use crate::error::RunFailure;
use crate::events::{EventEmitter, RunReporter, Terminal};
use crate::sandbox::{
    generate_clone_name, guest_join, ControlPlane, Readiness, SandboxLease, SandboxManager,
    Teardown, VBoxCommands,
};
use crate::storage::{ReportStore, StagedSample, StagingArea};

pub use classify::{classify_extraction_failure, extraction_failure_message, ExtractionFailure};

/// Filename reported for a sample that arrived without one
pub const UNNAMED_SAMPLE: &str = "N/A";

/// Progress steps, numbered as they appear in the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Step {
    Accepted = 0,
    Provision = 1,
    Start = 2,
    BootWait = 3,
    CopySample = 4,
    CopyScript = 5,
    Extract = 6,
    Locate = 7,
    Detonate = 8,
    Collect = 9,
    CopyBack = 10,
    CleanupStart = 11,
    CleanupDone = 12,
}

impl Step {
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// One uploaded file as received from the caller
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub filename: Option<String>,
    pub content: Vec<u8>,
}

impl Sample {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: Some(filename.into()),
            content: content.into(),
        }
    }

    fn display_name(&self) -> &str {
        self.filename
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(UNNAMED_SAMPLE)
    }
}

/// Resources a run acquired and cleanup has to release
struct RunResources {
    lease: SandboxLease,
    staged: Option<StagedSample>,
}

pub struct DetonationPipeline {
    config: Arc<SandboxConfig>,
    sandboxes: SandboxManager,
    staging: StagingArea,
    reports: ReportStore,
    analysis_script: PathBuf,
}

impl DetonationPipeline {
    /// Build the pipeline, creating the staging and results directories
    pub fn new(config: &Config, control: Arc<dyn ControlPlane>) -> Result<Self> {
        let staging = StagingArea::new(&config.storage.upload_dir).with_context(|| {
            format!(
                "Failed to prepare upload directory {}",
                config.storage.upload_dir.display()
            )
        })?;
        let reports = ReportStore::new(&config.storage.results_dir).with_context(|| {
            format!(
                "Failed to prepare results directory {}",
                config.storage.results_dir.display()
            )
        })?;

        let analysis_script = absolute(&config.storage.analysis_script)?;
        if !analysis_script.is_file() {
            warn!(
                "Analysis script {} does not exist; every run will fail at step {}",
                analysis_script.display(),
                Step::CopyScript.number()
            );
        }

        let sandbox_config = Arc::new(config.sandbox.clone());
        Ok(Self {
            sandboxes: SandboxManager::new(control, sandbox_config.clone()),
            config: sandbox_config,
            staging,
            reports,
            analysis_script,
        })
    }

    pub fn reports(&self) -> &ReportStore {
        &self.reports
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Run one sample to its terminal event.
    ///
    /// Never returns an error: every outcome is reported on `emitter`, and a
    /// sandbox that was requested is torn down before the terminal event.
    pub async fn run(
        &self,
        run_id: &str,
        sample: Sample,
        passphrase: Option<&str>,
        emitter: &EventEmitter,
    ) {
        let mut reporter = emitter.for_run(run_id, sample.display_name());

        let filename = match sample.filename.as_deref().filter(|n| !n.is_empty()) {
            None => {
                warn!(id = %run_id, "Rejected sample without a filename");
                reporter.reject("Invalid file provided.");
                return;
            }
            Some(name) if !self.config.accepts(name) => {
                warn!(id = %run_id, "Rejected {}: unsupported file type", name);
                reporter.reject("Invalid file type.");
                return;
            }
            Some(name) => name.to_string(),
        };

        reporter.info(Step::Accepted.number(), "File accepted. Saving locally...");

        let clone_name = generate_clone_name(&self.config.base_vm_name, &filename);
        reporter.set_clone_name(clone_name.clone());
        let mut resources = RunResources {
            lease: SandboxLease::new(clone_name),
            staged: None,
        };

        let outcome = AssertUnwindSafe(self.advance(
            &mut resources,
            &mut reporter,
            &filename,
            &sample.content,
            passphrase,
        ))
        .catch_unwind()
        .await;

        let terminal = match outcome {
            Ok(Ok(results_dir)) => {
                info!(id = %run_id, "Analysis of {} finished: {}", filename, results_dir.display());
                Terminal::Complete {
                    results_path: results_dir.display().to_string(),
                }
            }
            Ok(Err(failure)) => {
                warn!(id = %run_id, "Analysis of {} failed: {}", filename, failure);
                Terminal::Error {
                    message: failure.to_string(),
                }
            }
            Err(panic) => {
                let description = panic_message(&*panic);
                error!(id = %run_id, "Analysis of {} panicked: {}", filename, description);
                Terminal::Error {
                    message: RunFailure::internal(description).to_string(),
                }
            }
        };

        self.cleanup(&mut resources, &mut reporter).await;
        reporter.finish(terminal);
    }

    /// Steps 1 to 10. Returns the local results directory.
    async fn advance(
        &self,
        resources: &mut RunResources,
        reporter: &mut RunReporter,
        filename: &str,
        content: &[u8],
        passphrase: Option<&str>,
    ) -> Result<PathBuf, RunFailure> {
        let staged = self.staging.stage(filename, content).await?;
        let host_archive = staged.path.display().to_string();
        let guest_archive = guest_join(&self.config.guest_sample_dir, &staged.file_name);
        resources.staged = Some(staged);

        let commands = VBoxCommands::new(&self.config);
        let clone = resources.lease.name().to_string();

        reporter.info(Step::Provision.number(), format!("Cloning sandbox: {}", clone));
        self.sandboxes
            .provision(&mut resources.lease)
            .await
            .map_err(|out| {
                RunFailure::step(Step::Provision.number(), format!("Clone failed: {}", out))
            })?;

        reporter.info(Step::Start.number(), "Starting virtual machine...");
        self.sandboxes.start(&resources.lease).await.map_err(|out| {
            RunFailure::step(Step::Start.number(), format!("Failed to start VM: {}", out))
        })?;

        reporter.info(
            Step::BootWait.number(),
            format!(
                "Waiting for VM to boot (up to {}s)...",
                if self.config.readiness_probe {
                    self.config.readiness_max_wait_secs
                } else {
                    self.config.boot_wait_secs
                }
            ),
        );
        let readiness = self.sandboxes.wait_until_ready(&resources.lease).await;
        if let Readiness::TimedOut { waited } = readiness {
            warn!("Proceeding with {} after {:?} without a readiness answer", clone, waited);
        }

        reporter.info(Step::CopySample.number(), format!("Copying {} to guest...", filename));
        self.guest(commands.copy_to(&clone, &host_archive, &guest_archive))
            .await
            .map_err(|out| {
                RunFailure::step(Step::CopySample.number(), format!("Copy failed: {}", out))
            })?;

        reporter.info(Step::CopyScript.number(), "Copying analysis script to guest...");
        let host_script = self.analysis_script.display().to_string();
        self.guest(commands.copy_to(&clone, &host_script, &self.config.guest_script_path))
            .await
            .map_err(|out| {
                RunFailure::step(
                    Step::CopyScript.number(),
                    format!("Failed to copy analysis script: {}", out),
                )
            })?;

        let extract_message = if passphrase.is_some() {
            "Extracting password-protected archive in guest..."
        } else {
            "Extracting archive in guest..."
        };
        reporter.info(Step::Extract.number(), extract_message);
        if let Err(out) = self
            .guest(commands.extract_archive(&clone, &guest_archive, passphrase))
            .await
        {
            let kind = classify_extraction_failure(&out);
            warn!("Extraction in {} failed ({:?})", clone, kind);
            return Err(RunFailure::step(
                Step::Extract.number(),
                extraction_failure_message(kind, &out),
            ));
        }

        reporter.info(Step::Locate.number(), "Searching for executable in archive...");
        let executable = match self.guest(commands.find_executables(&clone)).await {
            Ok(listing) => first_entry(&listing).ok_or(listing),
            Err(out) => Err(out),
        }
        .map_err(|out| {
            let message = if out.trim().is_empty() {
                "No executable found in archive.".to_string()
            } else {
                format!("No executable found in archive: {}", out.trim())
            };
            RunFailure::step(Step::Locate.number(), message)
        })?;
        info!("Found executable in {}: {}", clone, executable);

        reporter.info(
            Step::Detonate.number(),
            format!(
                "Detonating {} (Timeout: {}s)...",
                guest_base_name(&executable),
                self.config.detonation_timeout_secs
            ),
        );
        self.detonate(&commands, &clone, &executable).await;

        reporter.info(Step::Collect.number(), "Collecting analysis artifacts in guest...");
        if let Err(out) = self.guest(commands.collect_artifacts(&clone)).await {
            warn!("Artifact collection in {} failed: {}", clone, out.trim());
        }

        reporter.info(Step::CopyBack.number(), "Copying results back to host...");
        let results_dir = self.reports.create_run_dir(&clone).await?;
        let host_results = results_dir.display().to_string();
        if let Err(out) = self.guest(commands.copy_results_back(&clone, &host_results)).await {
            warn!("Copying results of {} back failed: {}", clone, out.trim());
        }

        Ok(results_dir)
    }

    /// Runs the analysis script under a host-side deadline; never fails the run
    async fn detonate(&self, commands: &VBoxCommands<'_>, clone: &str, executable: &str) {
        let deadline = self.config.detonation_deadline();
        let control = self.sandboxes.control();

        let args = commands.detonate(clone, executable);

        match tokio::time::timeout(deadline, control.execute(&args)).await {
            Ok(outcome) if outcome.is_success() => info!("Detonation in {} finished", clone),
            Ok(outcome) => warn!(
                "Analysis script in {} reported a failure, continuing: {}",
                clone,
                outcome.output().trim()
            ),
            Err(_) => warn!("Detonation in {} exceeded {:?}, continuing", clone, deadline),
        }
    }

    /// Steps 11 and 12. Runs exactly once per accepted sample and never fails.
    async fn cleanup(&self, resources: &mut RunResources, reporter: &mut RunReporter) {
        reporter.info(Step::CleanupStart.number(), "Cleaning up sandbox environment...");

        if let Some(staged) = resources.staged.take() {
            if let Err(e) = self.staging.remove(&staged).await {
                error!("Failed to remove staged sample {}: {}", staged.path.display(), e);
            }
        }

        let teardown = AssertUnwindSafe(self.sandboxes.destroy(&mut resources.lease))
            .catch_unwind()
            .await;
        match teardown {
            Ok(Teardown::Leaked) => error!(
                "Sandbox {} was left behind and needs manual removal",
                resources.lease.name()
            ),
            Ok(_) => {}
            Err(panic) => error!(
                "Teardown of {} panicked: {}",
                resources.lease.name(),
                panic_message(&*panic)
            ),
        }

        reporter.info(Step::CleanupDone.number(), "Cleanup complete.");
    }

    async fn guest(&self, args: Vec<String>) -> Result<String, String> {
        self.sandboxes.control().execute(&args).await.into_result()
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    Ok(cwd.join(path))
}

/// First non-empty line of a directory listing
fn first_entry(listing: &str) -> Option<String> {
    listing
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn guest_base_name(path: &str) -> &str {
    path.rsplit(|c| c == '\\' || c == '/').next().unwrap_or(path)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
