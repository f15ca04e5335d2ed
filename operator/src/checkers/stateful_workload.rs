//! Builds the `StatefulSet` running the replica set's `mongod` members.
//! The container wiring (env vars, probes, affinity, host path volume) is
//! load-bearing: mongod needs `MONGODB_SERVICE_NAME`/`MONGODB_REPLICA_NAME`
//! to construct its own advertised hostname, and the admin secret feeds the
//! credentials the orchestrator later authenticates with.

use super::ResourceChecker;
use super::admin_secret::AdminSecretChecker;
use super::headless_service::HeadlessServiceChecker;
use crate::util::{self, Error};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction, ObjectFieldSelector,
    PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SELinuxOptions, SecretKeySelector, SecurityContext, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Api, Client, Resource, ResourceExt, api::ObjectMeta};
use mongo_operator_common::annotations;
use mongo_operator_types::MongoCluster;
use std::collections::BTreeMap;

/// These are fixed so that Mongo boots in replica-set mode with the wrapper
/// entrypoint the image ships.
const MONGO_IMAGE: &str = "docker-registry.example.com/mongodb-operator/mongod:3.6";
const MONGO_COMMAND: &str = "run-mongod-replication";

/// The operator's own keyfile contents for internal replica-set auth. Every
/// member of every cluster shares this value; rotating it would require a
/// rolling restart coordinated with `replSetReconfig`, which this operator
/// does not yet implement.
const MONGODB_KEYFILE_VALUE: &str = "supersecretkeyfile123";

pub struct StatefulWorkloadChecker {
    api: Api<StatefulSet>,
}

impl StatefulWorkloadChecker {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

impl ResourceChecker for StatefulWorkloadChecker {
    type Resource = StatefulSet;

    fn api(&self) -> &Api<StatefulSet> {
        &self.api
    }

    fn resource_name(cluster: &MongoCluster) -> String {
        cluster.name_any()
    }

    fn cluster_name_from_resource(resource_name: &str) -> String {
        resource_name.to_string()
    }

    fn desired(&self, cluster: &MongoCluster) -> Result<StatefulSet, Error> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::UserInput("MongoCluster is missing metadata.namespace".into()))?;
        let spec = &cluster.spec.mongodb;
        let secret_name = AdminSecretChecker::secret_name(&name);
        let service_name = HeadlessServiceChecker::service_name(&name);

        let mongo_container = Container {
            name: name.clone(),
            image: Some(MONGO_IMAGE.to_string()),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec![MONGO_COMMAND.to_string()]),
            ports: Some(vec![ContainerPort {
                name: Some("mongodb".to_string()),
                container_port: super::client_service::MONGO_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(vec![
                EnvVar {
                    name: "POD_IP".to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            api_version: Some("v1".to_string()),
                            field_path: "status.podIP".to_string(),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                secret_env_var("MONGODB_PASSWORD", &secret_name, "database-password"),
                secret_env_var("MONGODB_USER", &secret_name, "database-user"),
                secret_env_var("MONGODB_DATABASE", &secret_name, "database-name"),
                secret_env_var(
                    "MONGODB_ADMIN_PASSWORD",
                    &secret_name,
                    "database-admin-password",
                ),
                EnvVar {
                    name: "WIREDTIGER_CACHE_SIZE".to_string(),
                    value: Some(spec.wired_tiger_cache_size.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: "MONGODB_REPLICA_NAME".to_string(),
                    value: Some(name.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: "MONGODB_SERVICE_NAME".to_string(),
                    value: Some(service_name.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: "MONGODB_KEYFILE_VALUE".to_string(),
                    value: Some(MONGODB_KEYFILE_VALUE.to_string()),
                    ..Default::default()
                },
            ]),
            liveness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(super::client_service::MONGO_PORT),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(30),
                period_seconds: Some(30),
                timeout_seconds: Some(1),
                success_threshold: Some(1),
                failure_threshold: Some(3),
                ..Default::default()
            }),
            readiness_probe: Some(Probe {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "/bin/sh".to_string(),
                        "-i".to_string(),
                        "-c".to_string(),
                        "mongo 127.0.0.1:27017/$MONGODB_DATABASE -u $MONGODB_USER -p $MONGODB_PASSWORD --eval=\"quit()\"".to_string(),
                    ]),
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                timeout_seconds: Some(1),
                success_threshold: Some(1),
                failure_threshold: Some(3),
                ..Default::default()
            }),
            security_context: Some(SecurityContext {
                run_as_user: spec.run_as_user.parse().ok(),
                se_linux_options: Some(SELinuxOptions {
                    level: Some("s0".to_string()),
                    type_: Some("spc_t".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            termination_message_path: Some("/dev/termination-log".to_string()),
            volume_mounts: Some(vec![VolumeMount {
                name: "mongo-data".to_string(),
                read_only: Some(false),
                mount_path: spec.storage_mount_path.clone(),
                ..Default::default()
            }]),
            resources: Some(ResourceRequirements {
                limits: Some(resource_map(spec)),
                requests: Some(resource_map(spec)),
                ..Default::default()
            }),
            ..Default::default()
        };

        let affinity = Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_expressions: Some(vec![LabelSelectorRequirement {
                            key: "app".to_string(),
                            operator: "In".to_string(),
                            values: Some(vec![name.clone()]),
                        }]),
                        ..Default::default()
                    }),
                    topology_key: "kubernetes.io/hostname".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let volumes = vec![Volume {
            name: "mongo-data".to_string(),
            host_path: Some(k8s_openapi::api::core::v1::HostPathVolumeSource {
                path: spec.host_path.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }];

        let mut pod_annotations = BTreeMap::new();
        pod_annotations.insert(
            annotations::SPEC_HASH.to_string(),
            util::hash_spec(&cluster.spec),
        );
        pod_annotations.insert(
            annotations::CREATED_BY.to_string(),
            "mongo-cluster-operator".to_string(),
        );

        Ok(StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace),
                labels: Some(super::default_labels(&name)),
                annotations: Some(pod_annotations.clone()),
                owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(spec.replicas as i32),
                service_name: Some(service_name.clone()),
                selector: LabelSelector {
                    match_labels: Some(super::default_labels(&name)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(super::default_labels(&name)),
                        annotations: Some(pod_annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        affinity: Some(affinity),
                        containers: vec![mongo_container],
                        node_selector: Some(
                            [("compute".to_string(), "mongodb".to_string())]
                                .into_iter()
                                .collect(),
                        ),
                        service_account_name: Some(spec.service_account.clone()),
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        })
    }
}

fn secret_env_var(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resource_map(spec: &mongo_operator_types::MongoDbSpec) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    map.insert("cpu".to_string(), Quantity(spec.cpu_limit.clone()));
    map.insert("memory".to_string(), Quantity(spec.memory_limit.clone()));
    map
}
