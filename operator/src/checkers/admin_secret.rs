//! Generates and stores the admin/app credentials a cluster's members and
//! the operator itself authenticate with.

use super::ResourceChecker;
use crate::util::{self, Error};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, Resource, ResourceExt, api::ObjectMeta};
use mongo_operator_common::annotations;
use mongo_operator_types::MongoCluster;
use std::collections::BTreeMap;

pub struct AdminSecretChecker {
    api: Api<Secret>,
}

impl AdminSecretChecker {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    /// Name format mirrored exactly because the stateful workload's env vars
    /// reference it by this name, not a lookup.
    pub fn secret_name(cluster_name: &str) -> String {
        format!("{cluster_name}-admin-credentials")
    }
}

impl ResourceChecker for AdminSecretChecker {
    type Resource = Secret;

    fn api(&self) -> &Api<Secret> {
        &self.api
    }

    fn resource_name(cluster: &MongoCluster) -> String {
        Self::secret_name(&cluster.name_any())
    }

    fn cluster_name_from_resource(resource_name: &str) -> String {
        resource_name
            .strip_suffix("-admin-credentials")
            .unwrap_or(resource_name)
            .to_string()
    }

    fn desired(&self, cluster: &MongoCluster) -> Result<Secret, Error> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::UserInput("MongoCluster is missing metadata.namespace".into()))?;
        let mut string_data = BTreeMap::new();
        string_data.insert(
            "database-admin-password".to_string(),
            cluster.spec.users.admin_password.clone(),
        );
        string_data.insert(
            "database-user".to_string(),
            cluster.spec.users.user_name.clone(),
        );
        string_data.insert(
            "database-password".to_string(),
            cluster.spec.users.user_password.clone(),
        );
        string_data.insert(
            "database-name".to_string(),
            cluster.spec.users.database_name.clone(),
        );

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(Self::secret_name(&name)),
                namespace: Some(namespace),
                labels: Some(super::default_labels(&name)),
                annotations: Some(annotation_map(cluster)),
                owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            string_data: Some(string_data),
            ..Default::default()
        })
    }
}

fn annotation_map(cluster: &MongoCluster) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        annotations::SPEC_HASH.to_string(),
        util::hash_spec(&cluster.spec.users),
    );
    annotations.insert(
        annotations::CREATED_BY.to_string(),
        "mongo-cluster-operator".to_string(),
    );
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_name_matches_the_env_var_wiring_in_the_stateful_workload() {
        assert_eq!(
            AdminSecretChecker::secret_name("rs"),
            "rs-admin-credentials"
        );
    }

    #[test]
    fn cluster_name_from_resource_inverts_secret_name() {
        assert_eq!(
            AdminSecretChecker::cluster_name_from_resource(&AdminSecretChecker::secret_name("rs")),
            "rs"
        );
    }
}
