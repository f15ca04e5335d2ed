//! Owns every live connection to a managed replica set and drives it toward
//! the desired membership: initiating a brand new set, reconfiguring one
//! whose member count has drifted from the spec, and creating the
//! application/admin users once the set is reachable.

pub mod events;

use crate::util::{ClusterKey, Error};
use events::{ClusterSdamListener, OrchestratorEvent};
use mongodb::bson::{Document, doc};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::Client as MongoClient;
use kube::ResourceExt;
use mongo_operator_types::MongoCluster;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc::UnboundedSender};

const NO_REPLICA_SET_RESPONSE: &str = "no replset config has been received";
const MONGO_COMMAND_RETRIES: u32 = 4;
const MONGO_COMMAND_WAIT: Duration = Duration::from_secs(15);

pub fn member_hostname(index: u8, cluster_name: &str, namespace: &str) -> String {
    format!(
        "{cluster_name}-{index}.svc-{cluster_name}-internal.{namespace}.svc.cluster.local:27017"
    )
}

pub fn member_hostnames(cluster: &MongoCluster, namespace: &str) -> Vec<String> {
    (0..cluster.spec.mongodb.replicas)
        .map(|i| member_hostname(i, &cluster.name_any(), namespace))
        .collect()
}

pub struct MongoOrchestrator {
    clients: Mutex<HashMap<ClusterKey, MongoClient>>,
    restored: Mutex<HashSet<ClusterKey>>,
    event_tx: UnboundedSender<OrchestratorEvent>,
}

impl MongoOrchestrator {
    pub fn new(event_tx: UnboundedSender<OrchestratorEvent>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            restored: Mutex::new(HashSet::new()),
            event_tx,
        }
    }

    /// Mirrors `MongoService.checkOrCreateReplicaSet`: probes `replSetGetStatus`,
    /// and either initiates a fresh set or reconfigures an existing one whose
    /// member count no longer matches the spec.
    pub async fn check_or_create_replica_set(
        &self,
        cluster: &MongoCluster,
        namespace: &str,
    ) -> Result<(), Error> {
        let key = ClusterKey::new(namespace, cluster.name_any());
        match self
            .execute_admin_command(cluster, namespace, doc! { "replSetGetStatus": 1 })
            .await
        {
            Ok(status) => {
                let members = status
                    .get_array("members")
                    .map(|m| m.len())
                    .unwrap_or(0);
                println!(
                    "replica set {key} reports {members}/{} members",
                    cluster.spec.mongodb.replicas
                );
                if members != cluster.spec.mongodb.replicas as usize {
                    self.reconfigure_replica_set(cluster, namespace).await?;
                }
                Ok(())
            }
            Err(Error::Mongo { source }) if is_uninitialized(&source) => {
                self.initialize_replica_set(cluster, namespace).await
            }
            Err(e) => Err(e),
        }
    }

    /// Mirrors `MongoService.createUsers`: builds the admin-creation payload
    /// from the admin credentials and, if the admin user is absent, issues
    /// the `createUser` admin command.
    pub async fn create_admin_user_if_missing(
        &self,
        cluster: &MongoCluster,
        namespace: &str,
    ) -> Result<(), Error> {
        const ADMIN_USERNAME: &str = "admin";
        if self.user_exists(cluster, namespace, ADMIN_USERNAME).await? {
            println!("admin user already exists, skipping creation");
            return Ok(());
        }
        let command = doc! {
            "createUser": ADMIN_USERNAME,
            "pwd": cluster.spec.users.admin_password.clone(),
            "roles": [{ "role": "root", "db": "admin" }],
        };
        self.execute_admin_command(cluster, namespace, command)
            .await?;
        println!("created admin user");
        Ok(())
    }

    /// Whether the cluster's first `ReplicaSetReady` event has already run
    /// its restore-if-needed check. The backup scheduler waits on this
    /// before touching a cluster, so a just-initiated set can't be backed up
    /// before a pending restore has had a chance to run.
    pub async fn has_completed_initial_restore(&self, key: &ClusterKey) -> bool {
        self.restored.lock().await.contains(key)
    }

    /// Drops the cached client and restore bookkeeping for a cluster that's
    /// being deleted, so a cluster recreated under the same name doesn't
    /// inherit a stale connection or skip its own first restore.
    pub async fn invalidate(&self, key: &ClusterKey) {
        self.clients.lock().await.remove(key);
        self.restored.lock().await.remove(key);
    }

    pub async fn user_exists(
        &self,
        cluster: &MongoCluster,
        namespace: &str,
        username: &str,
    ) -> Result<bool, Error> {
        let response = self
            .execute_admin_command(cluster, namespace, doc! { "usersInfo": username })
            .await?;
        Ok(response
            .get_array("users")
            .map(|u| !u.is_empty())
            .unwrap_or(false))
    }

    /// Called when the manager drains a [`OrchestratorEvent`] off the
    /// channel. `ReplicaSetReady` triggers the at-most-once restore followed
    /// by user creation; `AllHostsReady` re-runs the membership check so a
    /// freshly scaled-up set gets reconfigured as soon as every new member
    /// answers a heartbeat.
    pub async fn handle_event(
        &self,
        event: OrchestratorEvent,
        cluster: &MongoCluster,
        namespace: &str,
        restore: &crate::restore::RestoreHelper,
    ) -> Result<(), Error> {
        match event {
            OrchestratorEvent::ReplicaSetReady(key) => {
                let already_restored = {
                    let restored = self.restored.lock().await;
                    restored.contains(&key)
                };
                if !already_restored {
                    restore.restore_if_needed(cluster).await?;
                    self.restored.lock().await.insert(key);
                }
                self.create_admin_user_if_missing(cluster, namespace).await
            }
            OrchestratorEvent::AllHostsReady(_) => {
                self.check_or_create_replica_set(cluster, namespace).await
            }
        }
    }

    async fn reconfigure_replica_set(
        &self,
        cluster: &MongoCluster,
        namespace: &str,
    ) -> Result<(), Error> {
        let name = cluster.name_any();
        let hosts = member_hostnames(cluster, namespace);
        let members: Vec<Document> = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| doc! { "_id": i as i32, "host": host.clone() })
            .collect();
        let config = doc! {
            "_id": name.clone(),
            "members": members,
        };
        let response = self
            .execute_admin_command(
                cluster,
                namespace,
                doc! { "replSetReconfig": config, "force": true },
            )
            .await?;
        if response.get_i32("ok").unwrap_or(0) != 1 {
            return Err(Error::UserInput(format!(
                "unexpected response reconfiguring replica set {name}: {response:?}"
            )));
        }
        println!("reconfigured replica set {name} to {} members", hosts.len());
        Ok(())
    }

    /// Initiates a brand new replica set by connecting directly to member 0
    /// rather than through the replica-set-aware cached client — the set
    /// doesn't exist yet, so a replica-set connection string has nothing to
    /// discover. This bypasses [`Self::clients`] by design.
    async fn initialize_replica_set(
        &self,
        cluster: &MongoCluster,
        namespace: &str,
    ) -> Result<(), Error> {
        let name = cluster.name_any();
        let host = member_hostname(0, &name, namespace);
        let mut options = ClientOptions::parse(format!("mongodb://{host}")).await?;
        options.credential = Some(
            Credential::builder()
                .username("admin".to_string())
                .password(cluster.spec.users.admin_password.clone())
                .source("admin".to_string())
                .build(),
        );
        let client = MongoClient::with_options(options)?;

        let hosts = member_hostnames(cluster, namespace);
        let members: Vec<Document> = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| doc! { "_id": i as i32, "host": host.clone() })
            .collect();
        let config = doc! { "_id": name.clone(), "members": members };

        let response = client
            .database("admin")
            .run_command(doc! { "replSetInitiate": config })
            .await?;
        if response.get_i32("ok").unwrap_or(0) != 1 {
            return Err(Error::UserInput(format!(
                "unexpected response initializing replica set {name}: {response:?}"
            )));
        }
        println!("initialized replica set {name}");
        Ok(())
    }

    async fn execute_admin_command(
        &self,
        cluster: &MongoCluster,
        namespace: &str,
        command: Document,
    ) -> Result<Document, Error> {
        let mut last_err = None;
        for attempt in 0..MONGO_COMMAND_RETRIES {
            let client = match self.client_for(cluster, namespace).await {
                Ok(c) => c,
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(MONGO_COMMAND_WAIT).await;
                    continue;
                }
            };
            match client.database("admin").run_command(command.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if is_connection_failure(&err) => {
                    eprintln!("mongo connection failure on attempt {attempt}: {err}");
                    self.clients
                        .lock()
                        .await
                        .remove(&ClusterKey::new(namespace, cluster.name_any()));
                    last_err = Some(err.into());
                    tokio::time::sleep(MONGO_COMMAND_WAIT).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::Timeout(format!(
                "admin command against {namespace}/{} did not succeed after {MONGO_COMMAND_RETRIES} attempts",
                cluster.name_any()
            ))
        }))
    }

    async fn client_for(&self, cluster: &MongoCluster, namespace: &str) -> Result<MongoClient, Error> {
        let key = ClusterKey::new(namespace, cluster.name_any());
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = self.build_client(cluster, namespace, &key).await?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn build_client(
        &self,
        cluster: &MongoCluster,
        namespace: &str,
        key: &ClusterKey,
    ) -> Result<MongoClient, Error> {
        let hosts: Vec<ServerAddress> = member_hostnames(cluster, namespace)
            .into_iter()
            .map(|h| ServerAddress::parse(h).expect("member hostname is a valid address"))
            .collect();
        let expected = cluster.spec.mongodb.replicas as usize;
        let mut options = ClientOptions::builder()
            .hosts(hosts)
            .repl_set_name(Some(cluster.name_any()))
            .connect_timeout(Duration::from_secs(120))
            .server_selection_timeout(Duration::from_secs(120))
            .credential(
                Credential::builder()
                    .username("admin".to_string())
                    .password(cluster.spec.users.admin_password.clone())
                    .source("admin".to_string())
                    .build(),
            )
            .build();
        options.sdam_event_handler = Some(std::sync::Arc::new(ClusterSdamListener::new(
            key.clone(),
            expected,
            self.event_tx.clone(),
        )));
        Ok(MongoClient::with_options(options)?)
    }
}

fn is_uninitialized(err: &mongodb::error::Error) -> bool {
    err.to_string().contains(NO_REPLICA_SET_RESPONSE)
}

fn is_connection_failure(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    matches!(
        *err.kind,
        ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } | ErrorKind::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_hostname_targets_the_headless_service() {
        assert_eq!(
            member_hostname(0, "my-set", "db"),
            "my-set-0.svc-my-set-internal.db.svc.cluster.local:27017"
        );
        assert_eq!(
            member_hostname(2, "my-set", "db"),
            "my-set-2.svc-my-set-internal.db.svc.cluster.local:27017"
        );
    }

    #[test]
    fn member_hostnames_covers_every_replica() {
        let cluster = test_cluster(3);
        let hosts = member_hostnames(&cluster, "db");
        assert_eq!(hosts.len(), 3);
        assert!(hosts[0].starts_with("rs-0."));
        assert!(hosts[2].starts_with("rs-2."));
    }

    fn test_cluster(replicas: u8) -> MongoCluster {
        use mongo_operator_types::{BackupsSpec, MongoClusterSpec, MongoDbSpec, UsersSpec};
        MongoCluster::new(
            "rs",
            MongoClusterSpec {
                mongodb: MongoDbSpec {
                    replicas,
                    cpu_limit: "1".into(),
                    memory_limit: "2Gi".into(),
                    wired_tiger_cache_size: "256M".into(),
                    run_as_user: "50000".into(),
                    service_account: "hostpath".into(),
                    host_path: "/data/mongo".into(),
                    storage_mount_path: "/var/lib/mongodb/data/".into(),
                },
                users: UsersSpec {
                    admin_password: "admin-pw".into(),
                    user_name: "app".into(),
                    user_password: "app-pw".into(),
                    database_name: "app".into(),
                },
                backups: BackupsSpec::default(),
            },
        )
    }
}
