pub mod metrics;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Field manager name used for status patches and child-resource apply calls.
pub(crate) const MANAGER_NAME: &str = "mongo-cluster-operator";

/// Hashes a serializable spec so child resources can be annotated with it and
/// compared against the cluster's current spec to detect drift.
pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Identifies one managed cluster across the operator's internal caches
/// (connection pool, backup ledger, restore ledger, per-cluster locks).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
