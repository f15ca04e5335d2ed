use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Replica counts a `MongoCluster` is allowed to request. MongoDB replica
/// sets need an odd member count to keep elections unambiguous; 7 is the
/// largest voting set MongoDB itself recommends.
pub const ALLOWED_REPLICA_COUNTS: [u8; 3] = [3, 5, 7];

fn default_cpu_limit() -> String {
    "1".to_string()
}

fn default_memory_limit() -> String {
    "2Gi".to_string()
}

fn default_wired_tiger_cache_size() -> String {
    "256M".to_string()
}

fn default_run_as_user() -> String {
    "50000".to_string()
}

fn default_service_account() -> String {
    "hostpath".to_string()
}

fn default_storage_mount_path() -> String {
    "/var/lib/mongodb/data/".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MongoDbSpec {
    pub replicas: u8,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_wired_tiger_cache_size")]
    pub wired_tiger_cache_size: String,
    #[serde(default = "default_run_as_user")]
    pub run_as_user: String,
    #[serde(default = "default_service_account")]
    pub service_account: String,
    pub host_path: String,
    #[serde(default = "default_storage_mount_path")]
    pub storage_mount_path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct UsersSpec {
    pub admin_password: String,
    pub user_name: String,
    pub user_password: String,
    pub database_name: String,
}

/// The literal value of `restoreFrom` that asks the operator to resolve the
/// most recently written backup file instead of a specific path.
pub const LATEST_BACKUP_SENTINEL: &str = "latest";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BackupsSpec {
    pub cron: Option<String>,
    pub restore_from: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "storage.mongodb.example.com",
    version = "v1",
    kind = "MongoCluster",
    plural = "mongoclusters",
    derive = "PartialEq",
    status = "MongoClusterStatus",
    namespaced
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct MongoClusterSpec {
    pub mongodb: MongoDbSpec,
    pub users: UsersSpec,
    #[serde(default)]
    pub backups: BackupsSpec,
}

impl MongoClusterSpec {
    /// Validates the fields the original operator's model layer enforced
    /// before a reconcile was ever attempted: configuration errors are
    /// fatal for the cluster and no children are touched.
    pub fn validate(&self) -> Result<(), String> {
        if !ALLOWED_REPLICA_COUNTS.contains(&self.mongodb.replicas) {
            return Err(format!(
                "replicas must be one of {:?}, got {}",
                ALLOWED_REPLICA_COUNTS, self.mongodb.replicas
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Initializing,
    Reconciling,
    Healthy,
    Degraded,
    Error,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Initializing => write!(f, "Initializing"),
            ClusterPhase::Reconciling => write!(f, "Reconciling"),
            ClusterPhase::Healthy => write!(f, "Healthy"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
            ClusterPhase::Error => write!(f, "Error"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MongoClusterStatus {
    pub phase: ClusterPhase,
    #[serde(default)]
    pub replicas: u32,
    pub message: Option<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(replicas: u8) -> MongoClusterSpec {
        MongoClusterSpec {
            mongodb: MongoDbSpec {
                replicas,
                cpu_limit: default_cpu_limit(),
                memory_limit: default_memory_limit(),
                wired_tiger_cache_size: default_wired_tiger_cache_size(),
                run_as_user: default_run_as_user(),
                service_account: default_service_account(),
                host_path: "/data/mongo".to_string(),
                storage_mount_path: default_storage_mount_path(),
            },
            users: UsersSpec {
                admin_password: "x".to_string(),
                user_name: "app".to_string(),
                user_password: "y".to_string(),
                database_name: "app".to_string(),
            },
            backups: BackupsSpec::default(),
        }
    }

    #[test]
    fn accepts_allowed_replica_counts() {
        for n in ALLOWED_REPLICA_COUNTS {
            assert!(spec(n).validate().is_ok());
        }
    }

    #[test]
    fn rejects_even_or_out_of_range_replica_counts() {
        for n in [0, 1, 2, 4, 6, 8, 9] {
            assert!(spec(n).validate().is_err());
        }
    }
}
