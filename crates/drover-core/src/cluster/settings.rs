use crate::id::ClusterId;

/// Name of the cluster object the control plane reads its settings from.
pub const DEFAULT_CLUSTER_NAME: &str = "default";

/// Defaults stamped onto every new task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskDefaults {
    /// Log driver used when the task spec does not name one.
    pub log_driver: Option<String>,
}

/// Cluster-wide specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub task_defaults: TaskDefaults,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLUSTER_NAME.to_string(),
            task_defaults: TaskDefaults::default(),
        }
    }
}

/// Cluster settings object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: ClusterId,
    pub spec: ClusterSpec,
}

impl Cluster {
    /// Create a cluster object with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ClusterId::new(),
            spec: ClusterSpec {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Whether this is the cluster the control plane reads settings from.
    pub fn is_default(&self) -> bool {
        self.spec.name == DEFAULT_CLUSTER_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cluster() {
        let cluster = Cluster::new(DEFAULT_CLUSTER_NAME);
        assert!(cluster.is_default());
        assert!(cluster.spec.task_defaults.log_driver.is_none());

        let other = Cluster::new("staging");
        assert!(!other.is_default());
    }
}
