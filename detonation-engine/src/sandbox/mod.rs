/// Sandbox module for isolated dynamic analysis
///
/// This module drives disposable VirtualBox clones used to detonate samples:
/// - Control plane client (`VBoxManage` argument vectors in, outcomes out)
/// - Lifecycle management (clone, start, readiness, guaranteed teardown)

pub mod commands;
pub mod control;
pub mod lifecycle;

pub use commands::{guest_join, VBoxCommands};
pub use control::{CommandOutcome, ControlPlane, VBoxManage};
pub use lifecycle::{generate_clone_name, Readiness, SandboxLease, SandboxManager, Teardown};
