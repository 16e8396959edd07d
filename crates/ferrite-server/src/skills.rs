use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

fn skill_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(\.[a-z0-9]+)+$").expect("skill id regex"))
}

/// `skills/<id>/manifest.json`, the unit of skill discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub runtime: Value,
    #[serde(default)]
    pub interface: Value,
    #[serde(default)]
    pub permissions: Value,
    #[serde(default)]
    pub limits: Value,
}

impl SkillManifest {
    pub fn entrypoint(&self) -> String {
        self.runtime
            .get("entrypoint")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_lowercase()
    }
}

/// Loads skill manifests from the configured root. No root configured
/// means the skills API reports `SKILLS_NOT_CONFIGURED`.
pub struct SkillService {
    root: Option<PathBuf>,
}

impl SkillService {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn is_configured(&self) -> bool {
        self.root.as_ref().map(|r| r.is_dir()).unwrap_or(false)
    }

    pub fn list_skills(&self) -> Vec<SkillManifest> {
        let Some(root) = self.root.as_ref().filter(|r| r.is_dir()) else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(root) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let manifest_path = entry.path().join("manifest.json");
            if !manifest_path.is_file() {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(&manifest_path) else {
                continue;
            };
            let Ok(manifest) = serde_json::from_str::<SkillManifest>(&raw) else {
                tracing::warn!(path = %manifest_path.display(), "unparseable skill manifest");
                continue;
            };
            if !skill_id_re().is_match(&manifest.id) {
                tracing::warn!(id = %manifest.id, "skill id does not match the required pattern");
                continue;
            }
            if manifest.runtime.get("kind").and_then(|v| v.as_str()) != Some("docker") {
                tracing::warn!(id = %manifest.id, "skill runtime kind must be docker");
                continue;
            }
            out.push(manifest);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn get_skill(&self, skill_id: &str) -> Option<SkillManifest> {
        self.list_skills().into_iter().find(|s| s.id == skill_id)
    }
}

/// Serialize a manifest the way `GET /skills` exposes it.
pub fn skill_to_api(manifest: &SkillManifest) -> Value {
    json!({
        "id": manifest.id,
        "name": manifest.name,
        "description": manifest.description,
        "runtime": manifest.runtime,
        "interface": manifest.interface,
        "permissions": manifest.permissions,
        "limits": manifest.limits,
    })
}
