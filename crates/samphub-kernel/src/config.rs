//! Hub configuration from `~/.samphub/config.toml`.
//!
//! A config file may list other TOML files under `include = [...]`. Includes
//! are merged in order and the including file overrides them. Include paths
//! must be relative and stay inside the including file's directory.

use samphub_types::config::HubConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

const MAX_INCLUDE_DEPTH: u32 = 10;
const INCLUDE_KEY: &str = "include";

/// Load the hub configuration, falling back to defaults on any error.
pub fn load_config(path: Option<&Path>) -> HubConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return HubConfig::default();
    }

    match read_merged(&config_path) {
        Ok(value) => match value.try_into::<HubConfig>() {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Invalid configuration, using defaults"
                );
                HubConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load configuration, using defaults"
            );
            HubConfig::default()
        }
    }
}

/// Read `path` and fold its includes into a single TOML value.
///
/// A broken include is logged and skipped; the root file still applies.
fn read_merged(path: &Path) -> Result<toml::Value, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("read failed: {e}"))?;
    let mut root: toml::Value =
        toml::from_str(&contents).map_err(|e| format!("parse failed: {e}"))?;

    let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));

    match merge_includes(&root, &dir, &mut visited, 0) {
        Ok(Some(mut merged)) => {
            deep_merge_toml(&mut merged, &root);
            root = merged;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Config includes ignored"),
    }
    strip_include(&mut root);
    Ok(root)
}

/// Merge the files `value` includes, recursively. `None` if it has none.
fn merge_includes(
    value: &toml::Value,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<Option<toml::Value>, String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!("include depth exceeds {MAX_INCLUDE_DEPTH}"));
    }
    let includes: Vec<&str> = match value.get(INCLUDE_KEY).and_then(|v| v.as_array()) {
        Some(list) => list.iter().filter_map(|v| v.as_str()).collect(),
        None => return Ok(None),
    };
    if includes.is_empty() {
        return Ok(None);
    }

    let mut merged = toml::Value::Table(toml::map::Map::new());
    for include in includes {
        let file = resolve_include(include, dir)?;
        if !visited.insert(file.clone()) {
            return Err(format!("circular include: {include}"));
        }
        info!(include, "Loading config include");

        let contents = std::fs::read_to_string(&file)
            .map_err(|e| format!("cannot read include '{include}': {e}"))?;
        let mut included: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("cannot parse include '{include}': {e}"))?;

        let include_dir = file.parent().unwrap_or(dir).to_path_buf();
        if let Some(mut nested) = merge_includes(&included, &include_dir, visited, depth + 1)? {
            deep_merge_toml(&mut nested, &included);
            included = nested;
        }
        strip_include(&mut included);
        deep_merge_toml(&mut merged, &included);
    }
    Ok(Some(merged))
}

/// Validate an include path and resolve it inside `dir`.
fn resolve_include(include: &str, dir: &Path) -> Result<PathBuf, String> {
    let relative = Path::new(include);
    if relative.is_absolute() {
        return Err(format!("absolute include path rejected: {include}"));
    }
    if relative.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("include path traversal rejected: {include}"));
    }

    let file = std::fs::canonicalize(dir.join(relative))
        .map_err(|e| format!("include '{include}' cannot be resolved: {e}"))?;
    let root = std::fs::canonicalize(dir)
        .map_err(|e| format!("config dir cannot be resolved: {e}"))?;
    if !file.starts_with(&root) {
        return Err(format!("include '{include}' escapes the config directory"));
    }
    Ok(file)
}

fn strip_include(value: &mut toml::Value) {
    if let toml::Value::Table(table) = value {
        table.remove(INCLUDE_KEY);
    }
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; any other
/// value in `overlay` replaces the one in `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge_toml(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// The hub's home directory, `~/.samphub`.
pub fn samphub_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".samphub")
}

pub fn default_config_path() -> PathBuf {
    samphub_home().join("config.toml")
}
