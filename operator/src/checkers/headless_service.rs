//! The headless service (`ClusterIP: None`) that gives each stateful
//! workload member a stable DNS name, including ones that aren't Ready yet —
//! required for replica set members to find each other during initiation.

use super::ResourceChecker;
use super::client_service::MONGO_PORT;
use crate::util::Error;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::{Api, Client, Resource, ResourceExt, api::ObjectMeta};
use mongo_operator_common::annotations;
use mongo_operator_types::MongoCluster;
use std::collections::BTreeMap;

pub struct HeadlessServiceChecker {
    api: Api<Service>,
}

impl HeadlessServiceChecker {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    /// Matches the `svc-<name>-internal` naming the stateful workload's
    /// `MONGODB_SERVICE_NAME` env var and `serviceName` field both rely on.
    pub fn service_name(cluster_name: &str) -> String {
        format!("svc-{cluster_name}-internal")
    }
}

impl ResourceChecker for HeadlessServiceChecker {
    type Resource = Service;

    fn api(&self) -> &Api<Service> {
        &self.api
    }

    fn resource_name(cluster: &MongoCluster) -> String {
        Self::service_name(&cluster.name_any())
    }

    fn cluster_name_from_resource(resource_name: &str) -> String {
        resource_name
            .strip_prefix("svc-")
            .and_then(|s| s.strip_suffix("-internal"))
            .unwrap_or(resource_name)
            .to_string()
    }

    fn desired(&self, cluster: &MongoCluster) -> Result<Service, Error> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::UserInput("MongoCluster is missing metadata.namespace".into()))?;
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "service.alpha.kubernetes.io/tolerate-unready-endpoints".to_string(),
            "true".to_string(),
        );
        annotations.insert(
            annotations::CREATED_BY.to_string(),
            "mongo-cluster-operator".to_string(),
        );

        Ok(Service {
            metadata: ObjectMeta {
                name: Some(Self::service_name(&name)),
                namespace: Some(namespace),
                labels: Some(super::default_labels(&name)),
                annotations: Some(annotations),
                owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(super::default_labels(&name)),
                ports: Some(vec![ServicePort {
                    name: Some("mongod".to_string()),
                    port: MONGO_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_matches_the_mongodb_service_name_env_var() {
        assert_eq!(HeadlessServiceChecker::service_name("rs"), "svc-rs-internal");
    }

    #[test]
    fn cluster_name_from_resource_inverts_service_name() {
        assert_eq!(
            HeadlessServiceChecker::cluster_name_from_resource(&HeadlessServiceChecker::service_name("rs")),
            "rs"
        );
    }
}
