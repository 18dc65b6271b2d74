use serde::{Deserialize, Serialize};

/// Rollouts controller configuration file (YAML).
///
/// Example `rollouts.yaml`:
/// ```yaml
/// data-dir: /var/lib/k3rs/data
/// workers: 8
/// resync-secs: 60
/// log-format: json
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, alias = "resync-secs")]
    pub resync_secs: Option<u64>,
    /// `text` or `json`
    #[serde(default, alias = "log-format")]
    pub log_format: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
