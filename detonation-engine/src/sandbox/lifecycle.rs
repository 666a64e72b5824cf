/// Sandbox lifecycle management
///
/// Owns creation and guaranteed destruction of one ephemeral VM clone per
/// sample. A [`SandboxLease`] records how far provisioning got so that
/// [`SandboxManager::destroy`] can be called on any exit path, any number of
/// times.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::commands::VBoxCommands;
use super::control::{CommandOutcome, ControlPlane};
use crate::config::SandboxConfig;

const MAX_STEM_LEN: usize = 40;

/// Handle on one sandbox clone for the duration of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLease {
    name: String,
    requested: bool,
    destroyed: bool,
}

impl SandboxLease {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requested: false,
            destroyed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A clone was asked for, so teardown has something to do
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

/// How the boot wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The guest answered the probe
    Ready { after: Duration },
    /// The probe kept failing until the configured cap
    TimedOut { waited: Duration },
    /// Slept the fixed boot delay without probing
    FixedDelay { waited: Duration },
}

/// What teardown did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// No clone was ever requested
    NothingToDo,
    AlreadyDestroyed,
    Deleted,
    /// Unregister/delete failed; the clone may still exist on the host
    Leaked,
}

/// Generate a clone name unique across concurrent and rapid sequential runs
pub fn generate_clone_name(base_vm: &str, filename: &str) -> String {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    let mut sanitized: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_STEM_LEN)
        .collect();
    if sanitized.is_empty() {
        sanitized.push_str("sample");
    }

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
    let suffix = Uuid::new_v4().simple().to_string();

    format!("{}_Clone_{}_{}_{}", base_vm, sanitized, timestamp, &suffix[..8])
}

/// Creates, starts and destroys sandbox clones
#[derive(Clone)]
pub struct SandboxManager {
    control: Arc<dyn ControlPlane>,
    config: Arc<SandboxConfig>,
}

impl SandboxManager {
    pub fn new(control: Arc<dyn ControlPlane>, config: Arc<SandboxConfig>) -> Self {
        Self { control, config }
    }

    pub fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    fn commands(&self) -> VBoxCommands<'_> {
        VBoxCommands::new(&self.config)
    }

    /// Clone the base image and register the clone under the hypervisor
    pub async fn provision(&self, lease: &mut SandboxLease) -> Result<(), String> {
        // Mark first: a clone that failed half-way may still need deleting
        lease.requested = true;
        info!("Cloning {} into {}", self.config.base_vm_name, lease.name);

        self.control
            .execute(&self.commands().clone_vm(&lease.name))
            .await
            .into_result()
            .map(|_| ())
    }

    pub async fn start(&self, lease: &SandboxLease) -> Result<(), String> {
        info!("Starting {} ({})", lease.name, self.config.start_mode.as_str());

        self.control
            .execute(&self.commands().start_vm(&lease.name, self.config.start_mode))
            .await
            .into_result()
            .map(|_| ())
    }

    /// Block until guest commands are likely to work.
    ///
    /// Polls a trivial in-guest command up to the configured cap. The fixed
    /// boot delay is only used when probing is disabled or the control tool
    /// cannot be launched at all.
    pub async fn wait_until_ready(&self, lease: &SandboxLease) -> Readiness {
        if !self.config.readiness_probe {
            return self.fixed_delay().await;
        }

        let started = Instant::now();
        let max_wait = self.config.readiness_max_wait();
        let probe = self.commands().readiness_probe(&lease.name);

        loop {
            // A hung guest command must not outlive the cap
            let remaining = max_wait.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, self.control.execute(&probe)).await {
                Ok(CommandOutcome::Succeeded(_)) => {
                    let after = started.elapsed();
                    info!("Guest {} ready after {:?}", lease.name, after);
                    return Readiness::Ready { after };
                }
                Ok(CommandOutcome::ToolNotFound(msg)) => {
                    warn!("Readiness probe unavailable ({}), falling back to fixed delay", msg);
                    return self.fixed_delay().await;
                }
                Ok(CommandOutcome::Failed { output, .. }) => {
                    debug!("Guest {} not ready yet: {}", lease.name, output.trim());
                }
                Err(_) => {
                    debug!("Guest {} did not answer the readiness check in time", lease.name);
                }
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                warn!(
                    "Guest {} did not answer within {:?}; continuing anyway",
                    lease.name, max_wait
                );
                return Readiness::TimedOut { waited };
            }

            tokio::time::sleep(self.config.readiness_poll().min(max_wait - waited)).await;
        }
    }

    async fn fixed_delay(&self) -> Readiness {
        let waited = self.config.boot_wait();
        tokio::time::sleep(waited).await;
        Readiness::FixedDelay { waited }
    }

    /// Power off, unregister and delete the clone. Never fails; safe to call twice.
    pub async fn destroy(&self, lease: &mut SandboxLease) -> Teardown {
        if !lease.requested {
            debug!("No sandbox was requested for {}, nothing to destroy", lease.name);
            return Teardown::NothingToDo;
        }
        if lease.destroyed {
            debug!("Sandbox {} already destroyed", lease.name);
            return Teardown::AlreadyDestroyed;
        }
        // Not retried: one attempt per lease
        lease.destroyed = true;

        info!("Starting cleanup for {}", lease.name);

        let commands = self.commands();
        if let Err(output) = self
            .control
            .execute(&commands.power_off(&lease.name))
            .await
            .into_result()
        {
            // Expected when the clone never started
            debug!("Power off of {} failed: {}", lease.name, output.trim());
        }

        tokio::time::sleep(self.config.poweroff_settle()).await;

        match self
            .control
            .execute(&commands.unregister_and_delete(&lease.name))
            .await
            .into_result()
        {
            Ok(_) => {
                info!("Deleted sandbox {}", lease.name);
                Teardown::Deleted
            }
            Err(output) => {
                error!(
                    "CRITICAL: failed to delete sandbox {}: {}",
                    lease.name,
                    output.trim()
                );
                Teardown::Leaked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartMode;
    use crate::sandbox::control::testing::ScriptedControlPlane;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio_test::{assert_err, assert_ok};

    fn fast_config() -> SandboxConfig {
        SandboxConfig {
            boot_wait_secs: 0,
            readiness_poll_secs: 0,
            readiness_max_wait_secs: 0,
            poweroff_settle_secs: 0,
            ..SandboxConfig::default()
        }
    }

    fn manager(control: Arc<ScriptedControlPlane>, config: SandboxConfig) -> SandboxManager {
        SandboxManager::new(control, Arc::new(config))
    }

    /// Guest commands never return; everything else succeeds
    struct HungGuest;

    #[async_trait]
    impl ControlPlane for HungGuest {
        async fn execute(&self, args: &[String]) -> CommandOutcome {
            if args.iter().any(|a| a == "guestcontrol") {
                std::future::pending::<()>().await;
            }
            CommandOutcome::Succeeded(String::new())
        }
    }

    #[test]
    fn test_clone_names_are_unique_and_sanitized() {
        let names: HashSet<String> = (0..200)
            .map(|_| generate_clone_name("Windows-ent-10", "my sample (1).zip"))
            .collect();
        assert_eq!(names.len(), 200);

        let name = names.iter().next().unwrap();
        assert!(name.starts_with("Windows-ent-10_Clone_my_sample__1__"));
        assert!(!name.contains(' '));
        assert!(!name.contains('('));
    }

    #[test]
    fn test_clone_name_falls_back_for_empty_stem() {
        let name = generate_clone_name("base", ".zip");
        assert!(name.starts_with("base_Clone_"));
        let name = generate_clone_name("base", "");
        assert!(name.starts_with("base_Clone_sample_"));
    }

    #[tokio::test]
    async fn test_destroy_without_provision_is_a_noop() {
        let control = Arc::new(ScriptedControlPlane::new());
        let mgr = manager(control.clone(), fast_config());
        let mut lease = SandboxLease::new("vm1");

        assert_eq!(mgr.destroy(&mut lease).await, Teardown::NothingToDo);
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_runs_every_command_even_after_failures() {
        let control = Arc::new(
            ScriptedControlPlane::new()
                .fail("clonevm", "VBOX_E_FILE_ERROR")
                .fail("poweroff", "machine is not running"),
        );
        let mgr = manager(control.clone(), fast_config());
        let mut lease = SandboxLease::new("vm1");

        assert!(mgr.provision(&mut lease).await.is_err());
        assert!(lease.is_requested());

        assert_eq!(mgr.destroy(&mut lease).await, Teardown::Deleted);
        assert_eq!(control.calls_to("controlvm").len(), 1);
        assert_eq!(control.calls_to("unregistervm").len(), 1);
    }

    #[tokio::test]
    async fn test_start_uses_configured_mode_and_surfaces_diagnostic() {
        let control = Arc::new(ScriptedControlPlane::new());
        let mgr = manager(
            control.clone(),
            SandboxConfig {
                start_mode: StartMode::Headless,
                ..fast_config()
            },
        );
        let mut lease = SandboxLease::new("vm1");

        assert_ok!(mgr.provision(&mut lease).await);
        assert_ok!(mgr.start(&lease).await);
        assert_eq!(
            control.calls_to("startvm")[0],
            vec!["startvm", "vm1", "--type", "headless"]
        );

        let failing =
            Arc::new(ScriptedControlPlane::new().fail("startvm", "VT-x is not available"));
        let mgr = manager(failing, fast_config());
        let diagnostic = assert_err!(mgr.start(&lease).await);
        assert!(diagnostic.contains("VT-x"));
    }

    #[tokio::test]
    async fn test_destroy_twice_only_tears_down_once() {
        let control = Arc::new(ScriptedControlPlane::new());
        let mgr = manager(control.clone(), fast_config());
        let mut lease = SandboxLease::new("vm1");

        mgr.provision(&mut lease).await.unwrap();
        assert_eq!(mgr.destroy(&mut lease).await, Teardown::Deleted);
        assert_eq!(mgr.destroy(&mut lease).await, Teardown::AlreadyDestroyed);
        assert_eq!(control.calls_to("unregistervm").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_is_reported_not_raised() {
        let control = Arc::new(ScriptedControlPlane::new().fail("unregistervm", "locked"));
        let mgr = manager(control.clone(), fast_config());
        let mut lease = SandboxLease::new("vm1");

        mgr.provision(&mut lease).await.unwrap();
        assert_eq!(mgr.destroy(&mut lease).await, Teardown::Leaked);
        assert!(lease.is_destroyed());
    }

    #[tokio::test]
    async fn test_readiness_returns_once_probe_succeeds() {
        let control = Arc::new(ScriptedControlPlane::new());
        let mgr = manager(control.clone(), fast_config());
        let lease = SandboxLease::new("vm1");

        let readiness = mgr.wait_until_ready(&lease).await;
        assert!(matches!(readiness, Readiness::Ready { .. }));
        assert_eq!(control.count_matching("echo ready"), 1);
    }

    #[tokio::test]
    async fn test_readiness_gives_up_at_cap() {
        let control = Arc::new(ScriptedControlPlane::new().fail("echo ready", "VERR_NOT_READY"));
        let mgr = manager(control.clone(), fast_config());
        let lease = SandboxLease::new("vm1");

        let readiness = mgr.wait_until_ready(&lease).await;
        assert!(matches!(readiness, Readiness::TimedOut { .. }));
        assert!(control.count_matching("echo ready") >= 1);
    }

    #[tokio::test]
    async fn test_readiness_cap_bounds_a_hung_guest_command() {
        let config = SandboxConfig {
            readiness_max_wait_secs: 1,
            ..fast_config()
        };
        let mgr = SandboxManager::new(Arc::new(HungGuest), Arc::new(config));

        let readiness = tokio::time::timeout(
            Duration::from_secs(5),
            mgr.wait_until_ready(&SandboxLease::new("vm1")),
        )
        .await
        .expect("readiness wait must respect its cap");
        assert!(matches!(readiness, Readiness::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_readiness_falls_back_to_fixed_delay_without_tool() {
        let control = Arc::new(ScriptedControlPlane::new().respond(
            "echo ready",
            CommandOutcome::ToolNotFound("VBoxManage not found".into()),
        ));
        let mgr = manager(control, fast_config());

        let readiness = mgr.wait_until_ready(&SandboxLease::new("vm1")).await;
        assert_eq!(readiness, Readiness::FixedDelay { waited: Duration::ZERO });
    }

    #[tokio::test]
    async fn test_probe_disabled_uses_fixed_delay() {
        let control = Arc::new(ScriptedControlPlane::new());
        let config = SandboxConfig {
            readiness_probe: false,
            ..fast_config()
        };
        let mgr = manager(control.clone(), config);

        let readiness = mgr.wait_until_ready(&SandboxLease::new("vm1")).await;
        assert!(matches!(readiness, Readiness::FixedDelay { .. }));
        assert!(control.calls().is_empty());
    }
}
