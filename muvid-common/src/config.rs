//! Configuration loading and root folder resolution

use crate::{Error, Result};
use std::path::PathBuf;

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
///
/// The root folder holds the SQLite database and the blob store tree.
pub fn resolve_root_folder(cli_arg: Option<&str>, env_var_name: &str) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(PathBuf::from(path));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    // Priority 3: TOML config file
    if let Ok(config_path) = find_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                    return Ok(PathBuf::from(root_folder));
                }
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    Ok(default_root_folder())
}

/// Locate the muvid config file for the platform
///
/// Linux checks the user config dir first, then /etc/muvid/config.toml.
pub fn find_config_file() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        if let Some(path) = dirs::config_dir().map(|d| d.join("muvid").join("config.toml")) {
            if path.exists() {
                return Ok(path);
            }
        }
        let system_config = PathBuf::from("/etc/muvid/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
        Err(Error::Config("No config file found".to_string()))
    } else {
        let path = dirs::config_dir()
            .map(|d| d.join("muvid").join("config.toml"))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::Config("No config file found".to_string()))
        }
    }
}

/// Compiled default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("muvid"))
        .unwrap_or_else(|| PathBuf::from("./muvid-data"))
}

/// Load the full config file as a TOML value, if one exists
pub fn load_config_toml() -> Option<toml::Value> {
    let path = find_config_file().ok()?;
    let content = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<toml::Value>(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed config file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_cli_arg_wins() {
        std::env::set_var("MUVID_TEST_ROOT", "/from/env");
        let resolved = resolve_root_folder(Some("/from/cli"), "MUVID_TEST_ROOT").unwrap();
        assert_eq!(resolved, PathBuf::from("/from/cli"));
        std::env::remove_var("MUVID_TEST_ROOT");
    }

    #[test]
    #[serial]
    fn test_env_var_used_when_no_cli_arg() {
        std::env::set_var("MUVID_TEST_ROOT", "/from/env");
        let resolved = resolve_root_folder(None, "MUVID_TEST_ROOT").unwrap();
        assert_eq!(resolved, PathBuf::from("/from/env"));
        std::env::remove_var("MUVID_TEST_ROOT");
    }

    #[test]
    #[serial]
    fn test_fallback_to_default() {
        std::env::remove_var("MUVID_TEST_ROOT_UNSET");
        let resolved = resolve_root_folder(None, "MUVID_TEST_ROOT_UNSET").unwrap();
        // Either a config file value or the compiled default; both are absolute-ish
        assert!(!resolved.as_os_str().is_empty());
    }
}
