use std::path::PathBuf;
use std::process::Command;

use serde_json::Value;

use crate::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Windows,
    Wsl,
}

impl RuntimeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeMode::Windows => "windows",
            RuntimeMode::Wsl => "wsl",
        }
    }
}

/// Detect the current host runtime. Non-WSL Linux hosts use posix path
/// style, which is the same thing the mount logic needs, so they report as
/// `wsl`.
pub fn detect_runtime() -> RuntimeMode {
    if cfg!(windows) {
        return RuntimeMode::Windows;
    }
    if let Ok(version) = std::fs::read_to_string("/proc/version") {
        if version.to_lowercase().contains("microsoft") {
            return RuntimeMode::Wsl;
        }
    }
    RuntimeMode::Wsl
}

fn wslpath_to_win(wsl_path: &str) -> Option<String> {
    let out = Command::new("wsl")
        .args(["wslpath", "-w", wsl_path])
        .output()
        .ok()?;
    if out.status.success() {
        let converted = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if !converted.is_empty() {
            return Some(converted);
        }
    }
    None
}

fn win_to_wslpath(win_path: &str) -> Option<String> {
    let out = Command::new("wslpath").args(["-u", win_path]).output().ok()?;
    if out.status.success() {
        let converted = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if !converted.is_empty() {
            return Some(converted);
        }
    }
    None
}

/// One workspace root seen from both sides of the Windows/WSL boundary.
///
/// `host_native` is the absolute path the current process can read and
/// write; `docker_mount` is what `docker run -v` needs on this host.
pub struct HostPathAdapter {
    workspace_root_win: String,
    workspace_root_wsl: String,
    runtime: RuntimeMode,
}

impl HostPathAdapter {
    pub fn from_settings(settings: &Value) -> Self {
        let sandbox = settings.get("sandbox").cloned().unwrap_or_default();
        let get = |key: &str| {
            sandbox
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string()
        };
        let runtime = match get("runtime_mode").to_lowercase().as_str() {
            "windows" => RuntimeMode::Windows,
            "wsl" => RuntimeMode::Wsl,
            _ => detect_runtime(),
        };
        Self {
            workspace_root_win: get("workspace_root_win"),
            workspace_root_wsl: get("workspace_root_wsl"),
            runtime,
        }
    }

    pub fn runtime(&self) -> RuntimeMode {
        self.runtime
    }

    /// Returns `(host_native, docker_mount)` for the workspace root.
    pub fn resolve_workspace_root(&self) -> Result<(String, String), SandboxError> {
        match self.runtime {
            RuntimeMode::Windows => {
                let mut native = self.workspace_root_win.clone();
                if native.is_empty() && !self.workspace_root_wsl.is_empty() {
                    native = wslpath_to_win(&self.workspace_root_wsl).unwrap_or_default();
                }
                if native.is_empty() {
                    return Err(SandboxError::Runtime(
                        "sandbox.workspace_root_win is not configured and wslpath -w conversion failed"
                            .to_string(),
                    ));
                }
                let docker = native.clone();
                Ok((native, docker))
            }
            RuntimeMode::Wsl => {
                let mut native = self.workspace_root_wsl.clone();
                if native.is_empty() && !self.workspace_root_win.is_empty() {
                    native = win_to_wslpath(&self.workspace_root_win).unwrap_or_default();
                }
                if native.is_empty() {
                    return Err(SandboxError::Runtime(
                        "sandbox.workspace_root_wsl is not configured and wslpath -u conversion failed"
                            .to_string(),
                    ));
                }
                let docker = native.clone();
                Ok((native, docker))
            }
        }
    }

    /// Absolute native path of a relative location inside the workspace.
    pub fn host_path_native(&self, parts: &[&str]) -> Result<PathBuf, SandboxError> {
        let (root, _) = self.resolve_workspace_root()?;
        let mut path = PathBuf::from(root);
        for part in parts {
            path.push(part);
        }
        Ok(path)
    }

    /// Host-side absolute path handed to `docker run -v`.
    pub fn docker_mount_path(&self, parts: &[&str]) -> Result<String, SandboxError> {
        let (_, docker_root) = self.resolve_workspace_root()?;
        let mut path = PathBuf::from(docker_root);
        for part in parts {
            path.push(part);
        }
        Ok(path.to_string_lossy().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(win: &str, wsl: &str, mode: &str) -> Value {
        json!({"sandbox": {
            "workspace_root_win": win,
            "workspace_root_wsl": wsl,
            "runtime_mode": mode,
        }})
    }

    #[test]
    fn wsl_mode_uses_posix_root_for_both_sides() {
        let adapter =
            HostPathAdapter::from_settings(&settings("D:\\ws", "/mnt/d/ws", "wsl"));
        let (native, docker) = adapter.resolve_workspace_root().unwrap();
        assert_eq!(native, "/mnt/d/ws");
        assert_eq!(docker, "/mnt/d/ws");
    }

    #[test]
    fn missing_roots_error_out() {
        let adapter = HostPathAdapter::from_settings(&settings("", "", "wsl"));
        assert!(adapter.resolve_workspace_root().is_err());
    }

    #[test]
    fn relative_paths_land_under_the_root() {
        let adapter = HostPathAdapter::from_settings(&settings("", "/mnt/d/ws", "wsl"));
        let native = adapter
            .host_path_native(&["projects", "p1", "artifacts"])
            .unwrap();
        assert_eq!(native, PathBuf::from("/mnt/d/ws/projects/p1/artifacts"));
    }

    #[test]
    fn invalid_mode_falls_back_to_detection() {
        let adapter = HostPathAdapter::from_settings(&settings("", "/ws", "bogus"));
        assert!(matches!(
            adapter.runtime(),
            RuntimeMode::Windows | RuntimeMode::Wsl
        ));
    }
}
