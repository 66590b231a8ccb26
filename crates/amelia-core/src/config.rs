use std::collections::HashMap;
use std::path::{Path, PathBuf};

use amelia_types::Profile;
use anyhow::{bail, Context};
use serde_yaml::Value;
use tokio::fs;

/// Profile YAML parsing and the legacy-shape migration path of §6.3.
/// Layered the way `tandem-core::config::ConfigStore` layers global and
/// project config, but with a single profile-directory layer: a profile
/// loaded from `$AMELIA_CONFIG_DIR/profiles/<name>.yaml` overrides the
/// bundled default of the same name, never the other way round.
pub struct ProfileStore {
    search_dirs: Vec<PathBuf>,
}

impl ProfileStore {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    pub fn from_default_dirs() -> Self {
        let mut dirs = Vec::new();
        if let Ok(path) = std::env::var("AMELIA_CONFIG_DIR") {
            dirs.push(PathBuf::from(path).join("profiles"));
        }
        if let Some(config_dir) = dirs::config_dir() {
            dirs.push(config_dir.join("amelia").join("profiles"));
        }
        dirs.push(PathBuf::from(".amelia/profiles"));
        Self::new(dirs)
    }

    pub async fn load(&self, name: &str) -> anyhow::Result<Profile> {
        for dir in &self.search_dirs {
            let path = dir.join(format!("{name}.yaml"));
            if path.exists() {
                return load_profile_file(&path).await;
            }
        }
        bail!("no profile named `{name}` found in any of {:?}", self.search_dirs)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for dir in &self.search_dirs {
            let Ok(mut entries) = fs::read_dir(dir).await else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

async fn load_profile_file(path: &Path) -> anyhow::Result<Profile> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading profile file {}", path.display()))?;
    parse_profile_yaml(&raw).with_context(|| format!("parsing profile file {}", path.display()))
}

/// Parses `raw` as a `Profile`. Rejects the legacy flat `driver:`/`model:`
/// profile-level shape with an error that embeds the migrated YAML, so the
/// caller can paste the error output straight back into the profile file
/// (§6.3, SPEC_FULL.md §9).
pub fn parse_profile_yaml(raw: &str) -> anyhow::Result<Profile> {
    let value: Value = serde_yaml::from_str(raw).context("invalid YAML")?;

    if let Some(migrated) = detect_legacy_shape(&value) {
        bail!(
            "profile uses the legacy flat `driver:`/`model:` shape, which is no longer \
             accepted; migrate to the per-role shape, e.g.:\n\n{migrated}"
        );
    }

    serde_yaml::from_value(value).context("profile does not match the expected shape")
}

/// A legacy profile has top-level `driver`/`model` keys instead of an
/// `agents:` map. When found, returns a migrated YAML document applying
/// the flat driver/model to every known agent role.
fn detect_legacy_shape(value: &Value) -> Option<String> {
    let map = value.as_mapping()?;
    let has_flat_driver = map.contains_key(Value::String("driver".into()));
    let has_flat_model = map.contains_key(Value::String("model".into()));
    if !(has_flat_driver && has_flat_model) {
        return None;
    }

    let driver = map
        .get(Value::String("driver".into()))
        .and_then(Value::as_str)
        .unwrap_or("api")
        .to_string();
    let model = map
        .get(Value::String("model".into()))
        .and_then(Value::as_str)
        .unwrap_or("claude-sonnet-4-6")
        .to_string();
    let name = map
        .get(Value::String("name".into()))
        .and_then(Value::as_str)
        .unwrap_or("migrated")
        .to_string();

    let mut agents = serde_yaml::Mapping::new();
    for role in ["architect", "plan_validator", "developer", "reviewer", "evaluator"] {
        let mut entry = serde_yaml::Mapping::new();
        entry.insert(Value::String("driver".into()), Value::String(driver.clone()));
        entry.insert(Value::String("model".into()), Value::String(model.clone()));
        agents.insert(Value::String(role.into()), Value::Mapping(entry));
    }

    let mut migrated = serde_yaml::Mapping::new();
    migrated.insert(Value::String("name".into()), Value::String(name));
    migrated.insert(Value::String("agents".into()), Value::Mapping(agents));
    migrated.insert(
        Value::String("working_dir".into()),
        Value::String(".".into()),
    );
    migrated.insert(
        Value::String("plan_output_dir".into()),
        Value::String("plans".into()),
    );

    serde_yaml::to_string(&Value::Mapping(migrated)).ok()
}

/// Snapshot of every loaded profile, used by the server's profile-listing
/// endpoint (§6.1) without re-reading disk on each request.
#[derive(Clone, Default)]
pub struct ProfileCache {
    profiles: HashMap<String, Profile>,
}

impl ProfileCache {
    pub async fn load_all(store: &ProfileStore) -> anyhow::Result<Self> {
        let mut profiles = HashMap::new();
        for name in store.list().await? {
            let profile = store.load(&name).await?;
            profiles.insert(name, profile);
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_PROFILE: &str = r#"
name: default
agents:
  architect:
    driver: api
    model: claude-sonnet-4-6
  developer:
    driver: api
    model: claude-sonnet-4-6
    options:
      max_iterations: 5
working_dir: .
plan_output_dir: plans
"#;

    const LEGACY_PROFILE: &str = r#"
name: old-style
driver: cli
model: claude-sonnet-4-6
"#;

    #[test]
    fn parses_a_well_formed_profile() {
        let profile = parse_profile_yaml(VALID_PROFILE).unwrap();
        assert_eq!(profile.name, "default");
        assert!(profile.agents.contains_key(&amelia_types::Role::Developer));
    }

    #[test]
    fn rejects_legacy_flat_shape_and_embeds_migrated_yaml() {
        let err = parse_profile_yaml(LEGACY_PROFILE).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("legacy flat"));
        assert!(message.contains("agents:"));
        assert!(message.contains("driver: cli"));
    }

    #[tokio::test]
    async fn profile_store_prefers_first_matching_search_dir() {
        let dir = tempfile::tempdir().unwrap();
        let profiles_dir = dir.path().join("profiles");
        fs::create_dir_all(&profiles_dir).await.unwrap();
        fs::write(profiles_dir.join("default.yaml"), VALID_PROFILE)
            .await
            .unwrap();

        let store = ProfileStore::new(vec![profiles_dir]);
        let profile = store.load("default").await.unwrap();
        assert_eq!(profile.name, "default");
    }

    #[tokio::test]
    async fn profile_store_errors_when_profile_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(vec![dir.path().to_path_buf()]);
        assert!(store.load("missing").await.is_err());
    }
}
