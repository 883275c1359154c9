use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the collected predicate may be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScope {
    /// usable inside the producing worker
    Local,
    /// only meaningful after cross-worker aggregation
    Global,
}

/// How a lane's partial result is published to the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterEncoding {
    Bloom,
    #[serde(alias = "set", alias = "exact")]
    Hashset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteringConfig {
    #[serde(default = "default_max_positions")]
    pub max_filter_positions_count: usize,
    #[serde(default = "default_max_size")]
    pub max_filter_size_bytes: u64,
    #[serde(default = "default_data_structure")]
    pub data_structure: FilterEncoding,
    #[serde(default = "default_scope")]
    pub scope: FilterScope,
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_ms: u64,
}

fn default_max_positions() -> usize {
    10_000
}
fn default_max_size() -> u64 {
    1048576 // 1MiB
}
fn default_data_structure() -> FilterEncoding {
    FilterEncoding::Bloom
}
fn default_scope() -> FilterScope {
    FilterScope::Local
}
fn default_completion_timeout() -> u64 {
    5_000
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            max_filter_positions_count: default_max_positions(),
            max_filter_size_bytes: default_max_size(),
            data_structure: default_data_structure(),
            scope: default_scope(),
            completion_timeout_ms: default_completion_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub filtering: FilteringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dynfilter")
            .join("config.toml")
    }

    pub fn load() -> crate::Result<Self> {
        let path = if let Ok(env_path) = std::env::var("DYNFILTER_CONFIG") {
            PathBuf::from(env_path) // $DYNFILTER_CONFIG overrides default config path
        } else {
            Self::config_path()
        };
        Self::load_from(&path)
    }

    /// Missing files yield the defaults; malformed files are an error.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::DynamicFilterError::Config(e.to_string()))
    }

    pub fn save(&self) -> crate::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::DynamicFilterError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.filtering.max_filter_positions_count, 10_000);
        assert_eq!(cfg.filtering.data_structure, FilterEncoding::Bloom);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[filtering]\nscope = \"global\"\ndata_structure = \"set\"\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.filtering.scope, FilterScope::Global);
        assert_eq!(cfg.filtering.data_structure, FilterEncoding::Hashset);
        assert_eq!(cfg.filtering.max_filter_size_bytes, 1048576);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = Config::default();
        cfg.filtering.max_filter_positions_count = 42;
        cfg.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.filtering.max_filter_positions_count, 42);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[filtering\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(crate::DynamicFilterError::Config(_))
        ));
    }
}
