//! The `ClusterIP` service clients outside the replica set connect through.

use super::ResourceChecker;
use crate::util::Error;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::{Api, Client, Resource, ResourceExt, api::ObjectMeta};
use mongo_operator_common::annotations;
use mongo_operator_types::MongoCluster;
use std::collections::BTreeMap;

pub const MONGO_PORT: i32 = 27017;

pub struct ClientServiceChecker {
    api: Api<Service>,
}

impl ClientServiceChecker {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

impl ResourceChecker for ClientServiceChecker {
    type Resource = Service;

    fn api(&self) -> &Api<Service> {
        &self.api
    }

    fn resource_name(cluster: &MongoCluster) -> String {
        cluster.name_any()
    }

    fn cluster_name_from_resource(resource_name: &str) -> String {
        resource_name.to_string()
    }

    fn desired(&self, cluster: &MongoCluster) -> Result<Service, Error> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::UserInput("MongoCluster is missing metadata.namespace".into()))?;
        let mut annotations = BTreeMap::new();
        annotations.insert(
            annotations::CREATED_BY.to_string(),
            "mongo-cluster-operator".to_string(),
        );

        Ok(Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace),
                labels: Some(super::default_labels(&name)),
                annotations: Some(annotations),
                owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(super::default_labels(&name)),
                ports: Some(vec![ServicePort {
                    name: Some("mongod".to_string()),
                    port: MONGO_PORT,
                    protocol: Some("TCP".to_string()),
                    target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
                        MONGO_PORT,
                    )),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        })
    }
}
