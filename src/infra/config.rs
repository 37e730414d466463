use super::migrate::{self, CURRENT_CONFIG_VERSION, MigrateError};
use super::paths;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory not found")]
    HomeDirNotFound,

    #[error("failed to read config: {0}")]
    Read(#[source] io::Error),

    #[error("failed to migrate config: {0}")]
    Migrate(#[from] MigrateError),

    #[error("config does not match the expected shape: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to write config: {0}")]
    Write(#[source] io::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
    #[serde(default)]
    pub keymap: KeymapConfig,
    #[serde(default)]
    pub plugins: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_CONFIG_VERSION,
            ui: UiConfig::default(),
            projects: ProjectsConfig::default(),
            keymap: KeymapConfig::default(),
            plugins: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiConfig {
    #[serde(default)]
    pub theme: ThemeConfig,
    #[serde(default = "default_true")]
    pub show_clock: bool,
    #[serde(default)]
    pub nerd_fonts_enabled: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            theme: ThemeConfig::default(),
            show_clock: true,
            nerd_fonts_enabled: false,
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ThemeConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community: Option<String>,
    /// Role name to `#rrggbb`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ThemeConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> &str {
        if let Some(community) = self.community.as_deref() {
            return community;
        }
        if self.name.is_empty() {
            "default"
        } else {
            &self.name
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectsConfig {
    #[serde(default)]
    pub list: Vec<ProjectConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<ThemeConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectConfig {
    /// `~` expanded and resolved.
    pub fn resolved_path(&self) -> PathBuf {
        let raw = PathBuf::from(&self.path);
        paths::resolve(&raw).unwrap_or(raw)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeymapConfig {
    /// `"key@context"` to command id.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for project in &self.projects.list {
            if project.name.trim().is_empty() {
                return Err(ConfigError::Invalid("project name is empty".to_string()));
            }
            if project.path.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "project {:?} has an empty path",
                    project.name
                )));
            }
            if !names.insert(project.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate project name {:?}",
                    project.name
                )));
            }
            if let Some(theme) = &project.theme {
                validate_theme(theme)?;
            }
        }
        validate_theme(&self.ui.theme)?;
        for key in self.keymap.overrides.keys() {
            if key.trim().is_empty() {
                return Err(ConfigError::Invalid("empty keymap override key".to_string()));
            }
        }
        Ok(())
    }

    /// The project whose path contains `root`, preferring the deepest match.
    pub fn project_for(&self, root: &Path) -> Option<&ProjectConfig> {
        self.projects
            .list
            .iter()
            .filter(|project| paths::is_under(&project.resolved_path(), root))
            .max_by_key(|project| project.resolved_path().components().count())
    }

    /// Per-project theme when one is set, else the global one.
    pub fn theme_for(&self, root: Option<&Path>) -> &ThemeConfig {
        root.and_then(|root| self.project_for(root))
            .and_then(|project| project.theme.as_ref())
            .unwrap_or(&self.ui.theme)
    }
}

fn validate_theme(theme: &ThemeConfig) -> Result<(), ConfigError> {
    for (role, color) in &theme.overrides {
        if parse_hex_color(color).is_none() {
            return Err(ConfigError::Invalid(format!(
                "theme override {role:?} is not a #rrggbb color: {color:?}"
            )));
        }
    }
    Ok(())
}

pub fn parse_hex_color(raw: &str) -> Option<(u8, u8, u8)> {
    let hex = raw.trim().strip_prefix('#')?;
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
    Some((channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

pub fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Some(override_dir) = std::env::var_os("SIDECAR_CONFIG_DIR") {
        return Ok(PathBuf::from(override_dir));
    }
    let Some(home) = dirs::home_dir() else {
        return Err(ConfigError::HomeDirNotFound);
    };
    Ok(home.join(".config").join("sidecar"))
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.json")
}

/// Reads, migrates, decodes, and validates. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Arc<Config>, ConfigError> {
    match fs::metadata(path) {
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Ok(Arc::new(Config::default()));
        }
        Err(error) => return Err(ConfigError::Read(error)),
    }

    migrate::migrate_file(path)?;
    let raw = fs::read(path).map_err(ConfigError::Read)?;
    let mut config: Config = serde_json::from_slice(&raw)?;
    config.version = config.version.min(CURRENT_CONFIG_VERSION);
    config.validate()?;
    Ok(Arc::new(config))
}

/// Persists a theme globally, or for the project containing `project_root`. Other keys are left as they are.
pub fn save_theme(
    path: &Path,
    theme: &ThemeConfig,
    project_root: Option<&Path>,
) -> Result<(), ConfigError> {
    let mut doc = match fs::read(path) {
        Ok(raw) => serde_json::from_slice::<Value>(&raw)?,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            serde_json::json!({ "version": CURRENT_CONFIG_VERSION })
        }
        Err(error) => return Err(ConfigError::Read(error)),
    };
    let Some(root) = doc.as_object_mut() else {
        return Err(ConfigError::Invalid("config root must be an object".to_string()));
    };
    let theme_value = serde_json::to_value(theme)?;

    let mut stored = false;
    if let Some(project_root) = project_root {
        if let Some(list) = root
            .get_mut("projects")
            .and_then(|projects| projects.get_mut("list"))
            .and_then(Value::as_array_mut)
        {
            for project in list.iter_mut() {
                let matches = project
                    .get("path")
                    .and_then(Value::as_str)
                    .and_then(|raw| paths::resolve(Path::new(raw)))
                    .is_some_and(|resolved| paths::is_under(&resolved, project_root));
                if let (true, Some(project)) = (matches, project.as_object_mut()) {
                    project.insert("theme".to_string(), theme_value.clone());
                    stored = true;
                    break;
                }
            }
        }
    }

    if !stored {
        let ui = root
            .entry("ui")
            .or_insert_with(|| Value::Object(Map::new()));
        if !ui.is_object() {
            *ui = Value::Object(Map::new());
        }
        if let Some(ui) = ui.as_object_mut() {
            ui.insert("theme".to_string(), theme_value);
        }
    }

    let mut text = serde_json::to_string_pretty(&doc)?;
    text.push('\n');
    migrate::write_atomic(path, text.as_bytes()).map_err(ConfigError::Write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("config.json")).expect("load");
        assert_eq!(config.version, CURRENT_CONFIG_VERSION);
        assert!(config.ui.show_clock);
        assert_eq!(config.ui.theme.display_name(), "default");
    }

    #[test]
    fn loads_full_shape_and_keeps_unknown_keys() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            json!({
                "version": 2,
                "ui": {"theme": {"name": "dracula", "overrides": {"primary": "#ff00aa"}}, "showClock": false, "nerdFontsEnabled": true, "density": "compact"},
                "projects": {"list": [{"name": "api", "path": "/srv/api", "theme": {"name": "light"}}]},
                "keymap": {"overrides": {"ctrl+p@global": "open-palette"}},
                "plugins": {"conversations": {"showSubAgents": false}},
                "experimental": true
            })
            .to_string(),
        )
        .expect("write");

        let config = load_config(&path).expect("load");
        assert!(!config.ui.show_clock);
        assert!(config.ui.nerd_fonts_enabled);
        assert_eq!(config.ui.theme.overrides["primary"], "#ff00aa");
        assert_eq!(config.ui.extra["density"], json!("compact"));
        assert_eq!(config.projects.list[0].theme.as_ref().map(|t| t.name.as_str()), Some("light"));
        assert_eq!(config.keymap.overrides["ctrl+p@global"], "open-palette");
        assert_eq!(config.extra["experimental"], json!(true));

        let round_trip: Value = serde_json::to_value(config.as_ref()).expect("encode");
        assert_eq!(round_trip["experimental"], json!(true));
        assert_eq!(round_trip["ui"]["density"], json!("compact"));
    }

    #[test]
    fn rejects_duplicate_projects_and_bad_colors() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"version":2,"projects":{"list":[{"name":"a","path":"/a"},{"name":"a","path":"/b"}]}}"#,
        )
        .expect("write");
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));

        fs::write(&path, r#"{"version":2,"ui":{"theme":{"overrides":{"primary":"red"}}}}"#)
            .expect("write");
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn newer_version_is_clamped_for_reading() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"version":9,"ui":{"showClock":false}}"#).expect("write");
        let config = load_config(&path).expect("load");
        assert_eq!(config.version, CURRENT_CONFIG_VERSION);
        assert!(fs::read_to_string(&path).expect("read").contains("\"version\":9"));
    }

    #[test]
    fn saves_theme_per_project_without_touching_other_keys() {
        let dir = tempdir().expect("tempdir");
        let project = dir.path().join("proj");
        fs::create_dir_all(&project).expect("mkdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            json!({
                "version": 2,
                "projects": {"list": [{"name": "proj", "path": project.display().to_string()}]},
                "custom": [1, 2]
            })
            .to_string(),
        )
        .expect("write");

        save_theme(&path, &ThemeConfig::named("nord"), Some(&project)).expect("save project");
        save_theme(&path, &ThemeConfig::named("light"), None).expect("save global");

        let config = load_config(&path).expect("load");
        assert_eq!(config.theme_for(Some(&project)).name, "nord");
        assert_eq!(config.theme_for(None).name, "light");
        assert_eq!(config.extra["custom"], json!([1, 2]));
    }

    #[test]
    fn parses_hex_colors() {
        assert_eq!(parse_hex_color("#0a0B0c"), Some((10, 11, 12)));
        assert_eq!(parse_hex_color("0a0b0c"), None);
        assert_eq!(parse_hex_color("#abc"), None);
    }
}
