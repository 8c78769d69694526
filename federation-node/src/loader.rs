//! # Configuration Loading
//!
//! Builds a [`FederationConfig`] from defaults, an optional TOML file and `FEDERATION_*`
//! environment variables, in that order, then validates the result.
//!
//! Environment keys map onto the config tree with `__` separating levels, so
//! `FEDERATION_TIMING__STALE_THRESHOLD_SECS=120` sets `timing.stale_threshold_secs`. The
//! cluster seal is read from `FEDERATION_CLUSTER_SEAL` separately and never enters the
//! config tree.

use federation_cluster::{Error, FederationConfig, Result};
use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Environment variable suffix holding the cluster seal
const SEAL_KEY: &str = "CLUSTER_SEAL";

/// File names tried in each search path
const CONFIG_NAMES: [&str; 2] = ["federation.toml", "federation-node.toml"];

/// Configuration loader with support for multiple sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a loader searching the working directory and `/etc/federation`
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("./config"),
                PathBuf::from("/etc/federation"),
            ],
            file: None,
            env_prefix: "FEDERATION".to_string(),
        }
    }

    /// Use this file instead of searching; a missing file is then an error
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Add a search path for configuration files
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Load from every source, reading the process environment
    pub fn load(&self) -> Result<FederationConfig> {
        self.load_with_env(env::vars())
    }

    /// Load from every source with an explicit set of environment variables
    pub fn load_with_env<I>(&self, vars: I) -> Result<FederationConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config_value = toml::Value::try_from(FederationConfig::default())
            .map_err(|e| Error::configuration(format!("Failed to serialize default config: {e}")))?;

        match self.config_file()? {
            Some(path) => {
                let file_config = load_config_file(&path)?;
                merge_config(&mut config_value, file_config);
                info!(path = %path.display(), "Loaded configuration file");
            },
            None => debug!("No configuration file found in search paths"),
        }

        let overrides = self.collect_env_vars(vars);
        debug!(count = overrides.len(), "Applying environment overrides");
        for (key, value) in &overrides {
            let parts: Vec<&str> = key.split('.').collect();
            set_nested_value(&mut config_value, &parts, value);
        }

        let config: FederationConfig = config_value
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to deserialize config: {e}")))?;
        config.validate_config()?;

        info!(node_id = %config.node_id, peers = config.peers.len(), "Configuration loaded and validated");
        Ok(config)
    }

    /// Read the cluster seal from the process environment
    pub fn cluster_seal(&self) -> Result<Zeroizing<String>> {
        let var = format!("{}_{SEAL_KEY}", self.env_prefix);
        match env::var(&var).map(Zeroizing::new) {
            Ok(seal) if !seal.is_empty() => Ok(seal),
            Ok(_) => Err(Error::Authentication(format!("{var} is empty"))),
            Err(_) => Err(Error::Authentication(format!("{var} is not set"))),
        }
    }

    fn config_file(&self) -> Result<Option<PathBuf>> {
        if let Some(file) = &self.file {
            if !file.exists() {
                return Err(Error::configuration(format!(
                    "Config file {} does not exist",
                    file.display()
                )));
            }
            return Ok(Some(file.clone()));
        }

        Ok(self
            .search_paths
            .iter()
            .flat_map(|dir| CONFIG_NAMES.iter().map(move |name| dir.join(name)))
            .find(|path| path.exists()))
    }

    /// Prefixed variables as dotted config keys, minus the seal
    fn collect_env_vars<I>(&self, vars: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = format!("{}_", self.env_prefix);
        vars.into_iter()
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(&prefix)?;
                (rest != SEAL_KEY).then(|| (rest.to_lowercase().replace("__", "."), value))
            })
            .collect()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_config_file(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::configuration(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    content.parse::<toml::Value>().map_err(|e| {
        Error::configuration(format!("Failed to parse config file {}: {e}", path.display()))
    })
}

/// Merge `overlay` into `base`, recursing into tables and replacing everything else
fn merge_config(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        merge_config(existing, value);
                    },
                    _ => {
                        base_table.insert(key, value);
                    },
                }
            }
        },
        (base, overlay) => *base = overlay,
    }
}

fn set_nested_value(config: &mut toml::Value, parts: &[&str], value: &str) {
    let toml::Value::Table(table) = config else {
        return;
    };

    match parts {
        [] => {},
        [leaf] => {
            // Keep string fields as strings even when the value looks numeric
            let parsed = match table.get(*leaf) {
                Some(toml::Value::String(_)) => toml::Value::String(value.to_string()),
                _ => parse_env_value(value),
            };
            table.insert((*leaf).to_string(), parsed);
        },
        [head, rest @ ..] => {
            let entry = table
                .entry((*head).to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
            set_nested_value(entry, rest, value);
        },
    }
}

/// Parse an environment value to the narrowest TOML type
fn parse_env_value(value: &str) -> toml::Value {
    if let Ok(b) = value.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = value.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(value.to_string())
}
