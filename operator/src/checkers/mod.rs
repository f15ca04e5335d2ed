//! Each child resource kind a `MongoCluster` owns (the admin secret, the two
//! services, the stateful workload) gets one checker. A checker knows how to
//! build the desired object, and how to list every object it has ever
//! created across all namespaces so the manager can sweep up children whose
//! owning `MongoCluster` was deleted while the operator wasn't watching.

pub mod admin_secret;
pub mod client_service;
pub mod headless_service;
pub mod stateful_workload;

use crate::util::Error;
use kube::{Api, Client, ResourceExt, core::NamespaceResourceScope, api::{ListParams, Resource}};
use mongo_operator_types::MongoCluster;
use std::collections::HashSet;
use std::fmt::Debug;

/// Label selector shared by every resource this operator creates, used to
/// list children for the orphan sweep without tracking ownership elsewhere.
pub const MANAGED_LABEL_SELECTOR: &str = "operated-by=storage.mongodb.example.com";

/// The label set stamped on every child resource, identical across kinds so
/// a single selector finds them all.
pub fn default_labels(name: &str) -> std::collections::BTreeMap<String, String> {
    use mongo_operator_common::labels;
    let mut map = std::collections::BTreeMap::new();
    map.insert(
        labels::OPERATED_BY.to_string(),
        "storage.mongodb.example.com".to_string(),
    );
    map.insert(labels::HERITAGE.to_string(), "mongoclusters".to_string());
    map.insert(labels::NAME.to_string(), name.to_string());
    map.insert(labels::APP.to_string(), name.to_string());
    map
}

pub trait ResourceChecker {
    type Resource: Clone
        + Debug
        + Resource<Scope = NamespaceResourceScope>
        + serde::Serialize
        + serde::de::DeserializeOwned;

    fn api(&self) -> &Api<Self::Resource>;

    /// Builds the object's desired state from the owning cluster's spec.
    fn desired(&self, cluster: &MongoCluster) -> Result<Self::Resource, Error>;

    /// The child object's name for the given cluster (deterministic, derived
    /// from the cluster name so a missing child can be looked up by name).
    fn resource_name(cluster: &MongoCluster) -> String;

    /// The inverse of [`Self::resource_name`]: recovers the owning cluster's
    /// name from a child object's name, the way `AdminSecretChecker
    /// .getClusterName` strips its `NAME_FORMAT` suffix back off.
    fn cluster_name_from_resource(resource_name: &str) -> String;

    /// Ensures the child resource exists and matches the cluster's current
    /// spec, creating or replacing it as needed. Returns whether a write was
    /// made.
    async fn reconcile(&self, cluster: &MongoCluster) -> Result<bool, Error> {
        let name = Self::resource_name(cluster);
        let desired = self.desired(cluster)?;
        match self.api().get(&name).await {
            Ok(existing) => {
                if needs_replace(&existing, &desired) {
                    self.api()
                        .replace(&name, &Default::default(), &desired)
                        .await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                match self.api().create(&Default::default(), &desired).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the child resource for a cluster that no longer exists.
    /// Tolerates the resource already being gone.
    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.api().delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists every resource of this kind this operator manages, across every
    /// namespace, via [`MANAGED_LABEL_SELECTOR`]. Mirrors
    /// `AdminSecretChecker.listResources`/`listAllSecretsWithLabels`.
    async fn list_all(client: &Client) -> Result<Vec<Self::Resource>, Error>
    where
        Self: Sized,
        <Self::Resource as Resource>::DynamicType: Default,
    {
        let api: Api<Self::Resource> = Api::all(client.clone());
        let lp = ListParams::default().labels(MANAGED_LABEL_SELECTOR);
        Ok(api.list(&lp).await?.items)
    }

    /// Deletes every managed child whose owning cluster name (recovered via
    /// [`Self::cluster_name_from_resource`]) isn't present in `known`
    /// (namespace, cluster name) pairs taken from the live `MongoCluster`
    /// list. Catches children left behind by a cluster deleted while the
    /// operator was down, which owner-ref garbage collection never sees.
    async fn sweep_orphans(client: &Client, known: &HashSet<(String, String)>) -> Result<(), Error>
    where
        Self: Sized,
        <Self::Resource as Resource>::DynamicType: Default,
    {
        for item in Self::list_all(client).await? {
            let name = item.name_any();
            let namespace = item.namespace().unwrap_or_default();
            let cluster_name = Self::cluster_name_from_resource(&name);
            if known.contains(&(namespace.clone(), cluster_name)) {
                continue;
            }
            let api: Api<Self::Resource> = Api::namespaced(client.clone(), &namespace);
            match api.delete(&name, &Default::default()).await {
                Ok(_) => println!("swept orphaned {name} in {namespace}"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn needs_replace<T>(existing: &T, desired: &T) -> bool
where
    T: ResourceExt,
{
    let existing_hash = existing
        .annotations()
        .get(mongo_operator_common::annotations::SPEC_HASH);
    let desired_hash = desired
        .annotations()
        .get(mongo_operator_common::annotations::SPEC_HASH);
    existing_hash != desired_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_labels_are_identical_across_resources_for_the_same_name() {
        let a = default_labels("rs");
        let b = default_labels("rs");
        assert_eq!(a, b);
        assert_eq!(a.get("app"), Some(&"rs".to_string()));
        assert_eq!(a.get("name"), Some(&"rs".to_string()));
    }

    #[test]
    fn default_labels_differ_by_name() {
        assert_ne!(default_labels("rs-a"), default_labels("rs-b"));
    }
}
