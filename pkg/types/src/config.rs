use serde::{Deserialize, Serialize};

/// Server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 8443
/// data-dir: /var/lib/sharedquota/data
/// resync-period-secs: 300
/// max-concurrent-reconciles: 8
/// admission-workers: 10
/// admission-timeout-ms: 10000
/// log-json: false
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "resync-period-secs")]
    pub resync_period_secs: Option<u64>,
    #[serde(default, alias = "max-concurrent-reconciles")]
    pub max_concurrent_reconciles: Option<usize>,
    #[serde(default, alias = "admission-workers")]
    pub admission_workers: Option<usize>,
    #[serde(default, alias = "admission-timeout-ms")]
    pub admission_timeout_ms: Option<u64>,
    #[serde(default, alias = "log-json")]
    pub log_json: Option<bool>,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: ServerConfigFile =
            load_config_file("/nonexistent/sharedquota/config.yaml").unwrap();
        assert!(cfg.port.is_none());
        assert!(cfg.resync_period_secs.is_none());
    }

    #[test]
    fn parses_dashed_keys() {
        let cfg: ServerConfigFile = serde_yaml::from_str(
            "port: 9443\ndata-dir: /data\nresync-period-secs: 60\nmax-concurrent-reconciles: 2\nadmission-workers: 4\nlog-json: true\n",
        )
        .unwrap();
        assert_eq!(cfg.port, Some(9443));
        assert_eq!(cfg.data_dir.as_deref(), Some("/data"));
        assert_eq!(cfg.resync_period_secs, Some(60));
        assert_eq!(cfg.max_concurrent_reconciles, Some(2));
        assert_eq!(cfg.admission_workers, Some(4));
        assert_eq!(cfg.log_json, Some(true));
    }
}
