use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Effective execution limits for one sandbox exec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxPolicy {
    pub net_mode: String,
    pub timeout_ms: u64,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    pub max_artifacts_bytes_total: u64,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids: u32,
    pub max_concurrent_execs: usize,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            net_mode: "none".to_string(),
            timeout_ms: 60_000,
            max_stdout_bytes: 1_048_576,
            max_stderr_bytes: 1_048_576,
            max_artifacts_bytes_total: 52_428_800,
            memory_mb: 1024,
            cpu_cores: 1.0,
            pids: 256,
            max_concurrent_execs: 4,
        }
    }
}

fn merge_layer(base: &mut Value, overlay: &Value) {
    if let (Value::Object(base_map), Value::Object(overlay_map)) = (&mut *base, overlay) {
        for (key, value) in overlay_map {
            match base_map.get_mut(key) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    merge_layer(existing, value)
                }
                _ => {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Deep-merge policy layers in order: system defaults ← settings ←
/// manifest limits ← request-level overrides. Unknown keys are ignored by
/// the typed deserialize at the end.
pub fn merge_policy(
    settings_policy: Option<&Value>,
    manifest_limits: Option<&Value>,
    request_overrides: Option<&Value>,
) -> SandboxPolicy {
    let mut merged = serde_json::to_value(SandboxPolicy::default()).unwrap_or_default();
    for layer in [settings_policy, manifest_limits, request_overrides]
        .into_iter()
        .flatten()
    {
        merge_layer(&mut merged, layer);
    }
    serde_json::from_value(merged).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn later_layers_win() {
        let policy = merge_policy(
            Some(&json!({"timeout_ms": 30_000, "memory_mb": 512})),
            Some(&json!({"timeout_ms": 20_000})),
            Some(&json!({"timeout_ms": 10_000})),
        );
        assert_eq!(policy.timeout_ms, 10_000);
        assert_eq!(policy.memory_mb, 512);
        assert_eq!(policy.net_mode, "none");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let policy = merge_policy(Some(&json!({"mystery": true, "pids": 64})), None, None);
        assert_eq!(policy.pids, 64);
        assert_eq!(policy.max_concurrent_execs, 4);
    }

    #[test]
    fn defaults_match_system_policy() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.net_mode, "none");
        assert_eq!(policy.max_stdout_bytes, 1_048_576);
        assert_eq!(policy.max_artifacts_bytes_total, 52_428_800);
    }
}
