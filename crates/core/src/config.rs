//! Configuration loading: `<root>/.config/xerp.yaml` plus env-var overrides,
//! falling back to documented defaults when nothing is present on disk.

use crate::error::{Result, XerpError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// 0 means auto-detect per file from the most common indent delta.
    pub tab_width: usize,
    pub max_token_len: usize,
    pub max_block_lines: usize,
    pub window_size: usize,
    pub window_overlap: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { tab_width: 0, max_token_len: 128, max_block_lines: 200, window_size: 50, window_overlap: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub cooc_window_size: usize,
    pub salience_percent: f64,
    pub salience_min: usize,
    pub salience_max: usize,
    pub min_count: u32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self { cooc_window_size: 5, salience_percent: 0.30, salience_min: 8, salience_max: 64, min_count: 3 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    Concentration,
    Centroid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub top_k: usize,
    pub max_candidates: usize,
    pub expansion_top_k: usize,
    pub min_similarity: f64,
    pub max_df_percent: f64,
    /// Reserved: accepted and round-tripped, not read by the scorer.
    pub w_idf: f64,
    pub w_feedback: f64,
    pub cluster_mode: ClusterMode,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            max_candidates: 1000,
            expansion_top_k: 8,
            min_similarity: 0.25,
            max_df_percent: 22.0,
            w_idf: 0.1,
            w_feedback: 0.2,
            cluster_mode: ClusterMode::Centroid,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub train: TrainConfig,
    pub query: QueryConfig,
    /// Resolved workspace root; not read from YAML, filled in by [`Config::load`].
    #[serde(skip)]
    pub root: PathBuf,
    /// Resolved path to the on-disk store; not read from YAML.
    #[serde(skip)]
    pub db_path: PathBuf,
}

impl Config {
    /// Loads `<root>/.config/xerp.yaml` if present, else starts from defaults,
    /// then applies the `XERP_ROOT` / `XERP_DB_PATH` environment overrides.
    /// A missing config file is not an error; malformed YAML is.
    pub fn load(root: &Path) -> Result<Self> {
        let root = std::env::var("XERP_ROOT").map(PathBuf::from).unwrap_or_else(|_| root.to_path_buf());

        let config_path = root.join(".config").join("xerp.yaml");
        let mut config: Config = if config_path.exists() {
            let text = std::fs::read_to_string(&config_path)
                .map_err(|e| XerpError::Input(format!("reading {}: {e}", config_path.display())))?;
            serde_yaml::from_str(&text)
                .map_err(|e| XerpError::Input(format!("parsing {}: {e}", config_path.display())))?
        } else {
            Config::default()
        };

        config.root = root.clone();
        config.db_path = std::env::var("XERP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join(".cache").join("xerp.db"));

        tracing::debug!(root = %config.root.display(), db = %config.db_path.display(), "config resolved");
        Ok(config)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.db_path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.join(".cache"))
    }

    pub fn ann_path(&self, name: &str) -> PathBuf {
        self.cache_dir().join(format!("xerp.{name}.ann"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.index.max_token_len, 128);
        assert_eq!(config.query.top_k, 20);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".config")).unwrap();
        std::fs::write(
            dir.path().join(".config").join("xerp.yaml"),
            "query:\n  top_k: 5\nindex:\n  tab_width: 4\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.query.top_k, 5);
        assert_eq!(config.index.tab_width, 4);
        // Unmentioned keys keep their defaults.
        assert_eq!(config.index.max_token_len, 128);
    }

    #[test]
    fn malformed_yaml_is_input_error() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".config")).unwrap();
        std::fs::write(dir.path().join(".config").join("xerp.yaml"), "query: [this is not\n a map").unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, XerpError::Input(_)));
    }
}
