use serde::{Deserialize, Serialize};

use crate::cluster::DEFAULT_CLUSTER_NAME;

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name.
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Log driver stamped on new tasks that do not name one.
    #[serde(default)]
    pub log_driver: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            log_driver: None,
        }
    }
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cluster_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.name, "default");
        assert!(config.log_driver.is_none());
    }

    #[test]
    fn test_parse_cluster_config() {
        let toml = r#"
            name = "production"
            log_driver = "journald"
        "#;

        let config: ClusterConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.name, "production");
        assert_eq!(config.log_driver.as_deref(), Some("journald"));
    }
}
