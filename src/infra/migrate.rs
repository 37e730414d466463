use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const CURRENT_CONFIG_VERSION: u64 = 2;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("failed to read config: {0}")]
    Read(#[source] io::Error),

    #[error("config is not valid json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config root must be a json object")]
    NotAnObject,

    #[error("config version must be a non-negative integer, found {0}")]
    InvalidVersion(Value),

    #[error("no migration registered from version {0}")]
    MissingStep(u64),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One registered transform between adjacent config versions.
pub struct Migration {
    pub from: u64,
    pub to: u64,
    pub apply: fn(&mut Map<String, Value>),
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    from: 1,
    to: 2,
    apply: community_theme_out_of_overrides,
}];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MigrationOutcome {
    pub from: u64,
    pub to: u64,
    pub changed: bool,
}

/// Missing `version` means v1.
pub fn detect_version(doc: &Map<String, Value>) -> Result<u64, MigrateError> {
    match doc.get("version") {
        None | Some(Value::Null) => Ok(1),
        Some(Value::Number(number)) => number
            .as_u64()
            .map(|v| v.max(1))
            .ok_or_else(|| MigrateError::InvalidVersion(Value::Number(number.clone()))),
        Some(other) => Err(MigrateError::InvalidVersion(other.clone())),
    }
}

/// Runs every step from the document's version up to the current one, then stamps the version.
/// Documents newer than this build are left alone.
pub fn migrate_document(doc: &mut Value) -> Result<MigrationOutcome, MigrateError> {
    let Value::Object(map) = doc else {
        return Err(MigrateError::NotAnObject);
    };
    let from = detect_version(map)?;
    if from >= CURRENT_CONFIG_VERSION {
        return Ok(MigrationOutcome {
            from,
            to: from,
            changed: false,
        });
    }

    let mut version = from;
    while version < CURRENT_CONFIG_VERSION {
        let step = MIGRATIONS
            .iter()
            .find(|step| step.from == version)
            .ok_or(MigrateError::MissingStep(version))?;
        (step.apply)(map);
        version = step.to;
    }
    stamp_version(map, version);

    Ok(MigrationOutcome {
        from,
        to: version,
        changed: true,
    })
}

/// Migrates the file in place. The original bytes go to `<name>.bak` before the first rewrite.
pub fn migrate_file(path: &Path) -> Result<MigrationOutcome, MigrateError> {
    let original = fs::read(path).map_err(MigrateError::Read)?;
    let mut doc: Value = serde_json::from_slice(&original)?;
    let outcome = migrate_document(&mut doc)?;
    if !outcome.changed {
        return Ok(outcome);
    }

    let backup = backup_path(path);
    fs::write(&backup, &original).map_err(|source| MigrateError::Write {
        path: backup.clone(),
        source,
    })?;

    let mut text = serde_json::to_string_pretty(&doc)?;
    text.push('\n');
    write_atomic(path, text.as_bytes()).map_err(|source| MigrateError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        path = %path.display(),
        from = outcome.from,
        to = outcome.to,
        "migrated config"
    );
    Ok(outcome)
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes)?;
    fs::rename(tmp, path)
}

// Version goes first so it is the first thing a reader sees.
fn stamp_version(map: &mut Map<String, Value>, version: u64) {
    let mut stamped = Map::with_capacity(map.len() + 1);
    stamped.insert("version".to_string(), Value::from(version));
    for (key, value) in std::mem::take(map) {
        if key != "version" {
            stamped.insert(key, value);
        }
    }
    *map = stamped;
}

// v1 kept the community palette name inside the color overrides map.
fn community_theme_out_of_overrides(doc: &mut Map<String, Value>) {
    if let Some(theme) = doc
        .get_mut("ui")
        .and_then(|ui| ui.get_mut("theme"))
        .and_then(Value::as_object_mut)
    {
        lift_community_name(theme);
    }

    if let Some(list) = doc
        .get_mut("projects")
        .and_then(|projects| projects.get_mut("list"))
        .and_then(Value::as_array_mut)
    {
        for project in list {
            if let Some(theme) = project.get_mut("theme").and_then(Value::as_object_mut) {
                lift_community_name(theme);
            }
        }
    }
}

fn lift_community_name(theme: &mut Map<String, Value>) {
    let Some(overrides) = theme.get_mut("overrides").and_then(Value::as_object_mut) else {
        return;
    };
    let Some(community) = overrides.shift_remove("communityName") else {
        return;
    };
    let overrides_empty = overrides.is_empty();
    if overrides_empty {
        theme.shift_remove("overrides");
    }
    if !theme.contains_key("community") {
        theme.insert("community".to_string(), community);
    }
}
