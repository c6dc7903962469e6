//! Configuration file loading and merging

use super::schema::Config;
use crate::error::{RedirectError, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const BUILTIN_TOML: &str = include_str!("../../default-policy.toml");

pub struct ConfigLoader;

impl ConfigLoader {
    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        // Priority order:
        // 1. $AUTO_REDIRECT_CONFIG
        // 2. $XDG_CONFIG_HOME/auto-redirect/config.toml
        // 3. ~/.config/auto-redirect/config.toml

        if let Ok(path) = env::var("AUTO_REDIRECT_CONFIG") {
            return PathBuf::from(path);
        }

        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("auto-redirect/config.toml");
        }

        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(".config/auto-redirect/config.toml");
        }

        PathBuf::from("config.toml")
    }

    fn read_table(path: &Path) -> Result<toml::Table> {
        let contents = fs::read_to_string(path).map_err(|e| RedirectError::ConfigLoad {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load config from a file without the built-in layer
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let table = Self::read_table(path.as_ref())?;
        Ok(toml::Value::Table(table).try_into()?)
    }

    /// Load built-in configuration embedded in the binary
    pub fn load_builtin() -> Result<Config> {
        Ok(toml::from_str(BUILTIN_TOML)?)
    }

    /// Merge user values on top of built-in values, key by key.
    /// Nested tables are merged recursively; arrays and scalars are replaced.
    pub fn merge_tables(builtin: toml::Table, user: toml::Table) -> toml::Table {
        let mut merged = builtin;

        for (key, value) in user {
            match (merged.remove(&key), value) {
                (Some(toml::Value::Table(base)), toml::Value::Table(over)) => {
                    merged.insert(key, toml::Value::Table(Self::merge_tables(base, over)));
                }
                (_, value) => {
                    merged.insert(key, value);
                }
            }
        }

        merged
    }

    fn load_layered(path: &Path) -> Result<Config> {
        let builtin: toml::Table = toml::from_str(BUILTIN_TOML)?;
        let user = Self::read_table(path)?;
        Ok(toml::Value::Table(Self::merge_tables(builtin, user)).try_into()?)
    }

    /// Load config from optional path or default with built-in merge
    /// Priority: Explicit path > User config > Built-in config
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Config> {
        if let Some(p) = path {
            return Self::load_layered(&p);
        }

        let path = Self::default_config_path();
        if path.exists() {
            Self::load_layered(&path)
        } else {
            tracing::debug!("User config not found at {:?}, using built-in defaults", path);
            Self::load_builtin()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::CompanionKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_builtin_config() {
        let config = ConfigLoader::load_builtin().unwrap();
        assert_eq!(config.redirect.tun_name, "tun0");
        assert_eq!(config.redirect.input_mark, 0x2023);
        assert_eq!(config.redirect.output_mark, 0x2024);
        assert_eq!(config.runtime.companion, CompanionKind::None);
    }

    #[test]
    fn test_user_overrides_builtin() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[redirect]
tun_name = "utun9"
redirect_port = 9090
exclude_interface = ["eth1"]
route_exclude_address = ["192.168.0.0/16"]

[runtime]
companion = "firewall4"
"#
        )
        .unwrap();

        let config = ConfigLoader::load_or_default(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.redirect.tun_name, "utun9");
        assert_eq!(config.redirect.redirect_port, 9090);
        assert_eq!(config.redirect.exclude_interface, vec!["eth1".to_string()]);
        assert_eq!(
            config.redirect.route_exclude_address,
            vec!["192.168.0.0/16".parse::<ipnet::IpNet>().unwrap()]
        );
        // Untouched keys keep their built-in values
        assert_eq!(config.redirect.table_name, "auto_redirect");
        assert_eq!(config.runtime.poll_interval_secs, 5);
        assert_eq!(config.runtime.companion, CompanionKind::Firewall4);
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_from_file("/nonexistent/auto-redirect.toml");
        assert!(matches!(result, Err(RedirectError::ConfigLoad { .. })));
    }

    #[test]
    fn test_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[redirect]\nredirect_port = \"not a port\"").unwrap();

        let result = ConfigLoader::load_from_file(file.path());
        assert!(matches!(result, Err(RedirectError::ConfigParse(_))));
    }
}
