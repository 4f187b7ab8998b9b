use std::{env, fmt, fs, io, path};

use dialtesting::ProbeConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    ParseFailed { path: path::PathBuf, source: toml::de::Error },
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config path available, set XDG_CONFIG_HOME or HOME")]
    ConfigPathUnavailable,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task definitions, relative paths resolve against the config file.
    pub tasks: path::PathBuf,
    pub probe: ProbeConfig,
    pub log: Log,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    pub level: String,
    pub format: String,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: "info".into(), format: "compact".into() }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/dialtesting/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("dialtesting/config.toml"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tasks: "tasks.json".into(),
            probe: ProbeConfig::default(),
            log: Log::default(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Dial Testing Configuration:")?;
        write_1(f, "Tasks", &self.tasks.display())?;
        write_title_1(f, "Probe")?;
        write_1(f, "Max ICMP Concurrency", &self.probe.max_icmp_concurrency)?;
        write_1(f, "IP Preference", &format!("{:?}", self.probe.ip_preference))?;
        write_1(f, "Script Max Operations", &self.probe.script_max_operations)?;
        write_title_1(f, "Log")?;
        write_1(f, "Level", &self.log.level)?;
        write_1(f, "Format", &self.log.format)?;

        Ok(())
    }
}

impl Config {
    /// Load the config file, writing a default one when it does not exist.
    ///
    /// Returns the config together with the path it was read from.
    pub fn from_config(
        optional_path: Option<impl AsRef<path::Path>>,
    ) -> Result<(Self, path::PathBuf), ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())
                .map_err(|source| ConfigError::ParseFailed { path: config_path.clone(), source })?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };
        Ok((config, config_path))
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str).map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }

    /// Location of the task definitions for a config loaded from `config_path`.
    pub fn tasks_path(&self, config_path: &path::Path) -> path::PathBuf {
        if self.tasks.is_absolute() {
            return self.tasks.clone();
        }
        match config_path.parent() {
            Some(dir) => dir.join(&self.tasks),
            None => self.tasks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_written_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config");

        let (config, loaded_from) = Config::from_config(Some(&path)).unwrap();
        assert_eq!(loaded_from, dir.path().join("nested/config.toml"));
        assert!(loaded_from.exists());
        assert_eq!(config.tasks, path::PathBuf::from("tasks.json"));
        assert_eq!(config.tasks_path(&loaded_from), dir.path().join("nested/tasks.json"));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "tasks = \"/etc/dial/tasks.json\"\n[probe]\nmax_icmp_concurrency = 8\n[log]\nformat = \"json\"\n")
            .unwrap();

        let (config, _) = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.probe.max_icmp_concurrency, 8);
        assert_eq!(config.probe.script_max_operations, ProbeConfig::default().script_max_operations);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "json");
        assert_eq!(config.tasks_path(&path), path::PathBuf::from("/etc/dial/tasks.json"));
    }

    #[test]
    fn test_invalid_config_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "tasks = [").unwrap();
        assert!(matches!(Config::from_config(Some(&path)), Err(ConfigError::ParseFailed { .. })));
    }

    #[test]
    fn test_display_lists_sections() {
        let rendered = Config::default().to_string();
        assert!(rendered.contains("Probe"));
        assert!(rendered.contains("Max ICMP Concurrency: 1000"));
        assert!(rendered.contains("Format: compact"));
    }
}
