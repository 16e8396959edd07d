use std::process::Command;

use serde_json::{json, Value};

use crate::path_adapter::HostPathAdapter;

fn run_capture(cli_path: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cli_path).args(args).output().ok()?;
    let text = if !out.stdout.is_empty() {
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    } else {
        String::from_utf8_lossy(&out.stderr).trim().to_string()
    };
    if text.is_empty() {
        return None;
    }
    Some(text.lines().take(30).collect::<Vec<_>>().join("\n"))
}

/// Kernel release string, e.g. `5.15.167-microsoft-standard-WSL2`. Probed
/// via `uname -r` on posix hosts and `ver` on Windows; empty when neither
/// responds.
fn kernel_release() -> String {
    if cfg!(windows) {
        return run_capture("cmd", &["/c", "ver"]).unwrap_or_default();
    }
    run_capture("uname", &["-r"]).unwrap_or_default()
}

/// Structured sandbox health report: runtime mode, both workspace root forms,
/// docker cli summaries, platform info, and a writable check. Never errors;
/// every probe failure degrades to a controlled value.
pub fn sandbox_health(settings: &Value) -> Value {
    let cli_path = settings
        .pointer("/sandbox/docker/cli_path")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("docker")
        .to_string();

    let adapter = HostPathAdapter::from_settings(settings);
    let runtime_mode = adapter.runtime().as_str().to_string();
    let (workspace_root_native, workspace_root_docker_mount) =
        adapter.resolve_workspace_root().unwrap_or_default();

    let writable_check = if workspace_root_native.is_empty() {
        json!({"ok": false, "error": "workspace root not configured"})
    } else {
        let probe_dir =
            std::path::Path::new(&workspace_root_native).join("projects/_health_check");
        match std::fs::create_dir_all(&probe_dir)
            .and_then(|_| std::fs::write(probe_dir.join(".probe.tmp"), b""))
        {
            Ok(()) => {
                let _ = std::fs::remove_file(probe_dir.join(".probe.tmp"));
                let _ = std::fs::remove_dir(&probe_dir);
                json!({"ok": true})
            }
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        }
    };

    json!({
        "runtime_mode": runtime_mode,
        "workspace_root_native": workspace_root_native,
        "workspace_root_docker_mount": workspace_root_docker_mount,
        "docker_cli_path": cli_path,
        "docker_version": run_capture(&cli_path, &["version"]).unwrap_or_else(|| "(not found)".to_string()),
        "docker_context": run_capture(&cli_path, &["context", "show"]).unwrap_or_else(|| "(not found)".to_string()),
        "docker_info": run_capture(&cli_path, &["info"]).unwrap_or_else(|| "(not found)".to_string()),
        "platform": {
            "os": std::env::consts::OS,
            "release": kernel_release(),
            "is_wsl": runtime_mode == "wsl",
        },
        "writable_check": writable_check,
    })
}
