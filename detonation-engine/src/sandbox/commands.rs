//! `VBoxManage` argument vectors for lifecycle and guest operations

use crate::config::{SandboxConfig, StartMode};

/// Builds argument vectors for one sandbox, carrying the guest credentials
#[derive(Debug, Clone)]
pub struct VBoxCommands<'a> {
    config: &'a SandboxConfig,
}

fn owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

impl<'a> VBoxCommands<'a> {
    pub fn new(config: &'a SandboxConfig) -> Self {
        Self { config }
    }

    pub fn clone_vm(&self, clone_name: &str) -> Vec<String> {
        owned(&[
            "clonevm",
            &self.config.base_vm_name,
            "--name",
            clone_name,
            "--register",
        ])
    }

    pub fn start_vm(&self, clone_name: &str, mode: StartMode) -> Vec<String> {
        owned(&["startvm", clone_name, "--type", mode.as_str()])
    }

    pub fn power_off(&self, clone_name: &str) -> Vec<String> {
        owned(&["controlvm", clone_name, "poweroff"])
    }

    pub fn unregister_and_delete(&self, clone_name: &str) -> Vec<String> {
        owned(&["unregistervm", clone_name, "--delete"])
    }

    fn credentials(&self) -> [&str; 4] {
        [
            "--username",
            &self.config.guest_username,
            "--password",
            &self.config.guest_password,
        ]
    }

    pub fn copy_to(&self, clone_name: &str, host_path: &str, guest_path: &str) -> Vec<String> {
        let mut args = owned(&["guestcontrol", clone_name, "copyto", host_path, guest_path]);
        args.extend(owned(&self.credentials()));
        args
    }

    pub fn copy_from(&self, clone_name: &str, guest_path: &str, host_path: &str) -> Vec<String> {
        let mut args = owned(&["guestcontrol", clone_name, "copyfrom", guest_path, host_path]);
        args.extend(owned(&self.credentials()));
        args.push("--recursive".to_string());
        args
    }

    /// `guestcontrol run --exe <exe> ... -- <argv>`
    pub fn run_in_guest(&self, clone_name: &str, exe: &str, argv: &[String]) -> Vec<String> {
        let mut args = owned(&["guestcontrol", clone_name, "run", "--exe", exe]);
        args.extend(owned(&self.credentials()));
        args.push("--".to_string());
        args.extend(argv.iter().cloned());
        args
    }

    /// `cmd /c <command line>` inside the guest
    pub fn guest_shell(&self, clone_name: &str, command_line: &str) -> Vec<String> {
        self.run_in_guest(clone_name, "cmd.exe", &owned(&["cmd", "/c", command_line]))
    }

    /// Cheap command used to decide whether guest execution works yet
    pub fn readiness_probe(&self, clone_name: &str) -> Vec<String> {
        self.guest_shell(clone_name, "echo ready")
    }

    pub fn extract_archive(
        &self,
        clone_name: &str,
        guest_archive: &str,
        passphrase: Option<&str>,
    ) -> Vec<String> {
        let mut argv = vec![
            "x".to_string(),
            guest_archive.to_string(),
            format!("-o{}", self.config.guest_sample_dir),
            "-y".to_string(),
        ];
        if let Some(pass) = passphrase {
            argv.push(format!("-p{}", pass));
        }
        self.run_in_guest(clone_name, &self.config.guest_archiver_path, &argv)
    }

    pub fn find_executables(&self, clone_name: &str) -> Vec<String> {
        let command_line = format!(
            "dir {}\\*.{} /s /b",
            self.config.guest_sample_dir, self.config.executable_extension
        );
        self.guest_shell(clone_name, &command_line)
    }

    pub fn detonate(&self, clone_name: &str, guest_executable: &str) -> Vec<String> {
        let argv = owned(&[
            "powershell",
            "-ExecutionPolicy",
            "Bypass",
            "-File",
            &self.config.guest_script_path,
            "-ExePath",
            guest_executable,
            "-TimeoutSec",
            &self.config.detonation_timeout_secs.to_string(),
        ]);
        self.run_in_guest(clone_name, &self.config.guest_powershell_path, &argv)
    }

    pub fn collect_artifacts(&self, clone_name: &str) -> Vec<String> {
        let command_line = format!(
            "xcopy {}\\* {} /E /Y",
            self.config.guest_runs_dir, self.config.guest_results_dir
        );
        self.guest_shell(clone_name, &command_line)
    }

    pub fn copy_results_back(&self, clone_name: &str, host_dir: &str) -> Vec<String> {
        let guest_dir = format!("{}\\", self.config.guest_results_dir);
        self.copy_from(clone_name, &guest_dir, host_dir)
    }
}

/// Join a guest directory and a file name with a Windows separator
pub fn guest_join(dir: &str, name: &str) -> String {
    format!("{}\\{}", dir.trim_end_matches('\\'), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clone_and_start_vectors() {
        let config = SandboxConfig::default();
        let cmds = VBoxCommands::new(&config);

        assert_eq!(
            cmds.clone_vm("Windows-ent-10_Clone_a_1"),
            vec!["clonevm", "Windows-ent-10", "--name", "Windows-ent-10_Clone_a_1", "--register"]
        );
        assert_eq!(
            cmds.start_vm("vm1", StartMode::Headless),
            vec!["startvm", "vm1", "--type", "headless"]
        );
    }

    #[test]
    fn test_extract_appends_password_only_when_given() {
        let config = SandboxConfig::default();
        let cmds = VBoxCommands::new(&config);

        let plain = cmds.extract_archive("vm1", "C:\\in\\a.zip", None);
        assert!(!plain.iter().any(|a| a.starts_with("-p")));
        assert_eq!(plain.last().map(String::as_str), Some("-y"));

        let locked = cmds.extract_archive("vm1", "C:\\in\\a.zip", Some("infected"));
        assert_eq!(locked.last().map(String::as_str), Some("-pinfected"));
        assert!(locked.contains(&format!("-o{}", config.guest_sample_dir)));
    }

    #[test]
    fn test_guest_run_carries_credentials_before_separator() {
        let config = SandboxConfig::default();
        let cmds = VBoxCommands::new(&config);
        let args = cmds.find_executables("vm1");

        let sep = args.iter().position(|a| a == "--").unwrap();
        let user = args.iter().position(|a| a == "--username").unwrap();
        assert!(user < sep);
        assert_eq!(
            args.last().unwrap(),
            &format!("dir {}\\*.exe /s /b", config.guest_sample_dir)
        );
    }

    #[test]
    fn test_detonate_passes_timeout() {
        let config = SandboxConfig {
            detonation_timeout_secs: 90,
            ..SandboxConfig::default()
        };
        let args = VBoxCommands::new(&config).detonate("vm1", "C:\\x\\a.exe");
        let idx = args.iter().position(|a| a == "-TimeoutSec").unwrap();
        assert_eq!(args[idx + 1], "90");
        assert!(args.contains(&"C:\\x\\a.exe".to_string()));
    }

    #[test]
    fn test_guest_join() {
        assert_eq!(guest_join("C:\\dir\\", "a.zip"), "C:\\dir\\a.zip");
        assert_eq!(guest_join("C:\\dir", "a.zip"), "C:\\dir\\a.zip");
    }
}
