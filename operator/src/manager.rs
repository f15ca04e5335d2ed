//! Wires the `MongoCluster` controller loop together: the `kube-runtime`
//! `Controller`, the per-child-kind checkers, the Mongo orchestrator, the
//! backup scheduler, and the task that drains orchestrator events off their
//! channel. This operator assumes it's the sole active writer for the
//! clusters it watches, so there is no leader election.

use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::{Controller, controller::Action};
use kube::{Api, Client, ResourceExt};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::backup::BackupScheduler;
use crate::checkers::admin_secret::AdminSecretChecker;
use crate::checkers::client_service::ClientServiceChecker;
use crate::checkers::headless_service::HeadlessServiceChecker;
use crate::checkers::stateful_workload::StatefulWorkloadChecker;
use crate::checkers::ResourceChecker;
use crate::orchestrator::events::OrchestratorEvent;
use crate::orchestrator::MongoOrchestrator;
use crate::restore::RestoreHelper;
use crate::util::{
    ClusterKey, Error,
    colors::{FG1, FG2},
};
use mongo_operator_types::{ClusterPhase, MongoCluster};

/// How often the orphan sweep lists every managed child across all
/// namespaces and deletes ones whose owning cluster no longer exists.
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

pub struct ManagerOptions {
    pub namespace: Option<String>,
    pub backup_interval: Duration,
    /// How long a healthy or no-op cluster waits before its next reconcile.
    /// Named after the original operator's `sleep_per_run` ioloop interval.
    pub sleep_per_run: Duration,
    #[cfg(feature = "metrics")]
    pub metrics_port: u16,
}

/// Entrypoint for the `MongoCluster` controller.
pub async fn run(client: Client, options: ManagerOptions) -> Result<(), Error> {
    println!("{}", "⚙️ Starting MongoCluster controller...".green());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(ClusterKey, OrchestratorEvent)>();
    let context = Arc::new(ContextData::new(client.clone(), event_tx, options.sleep_per_run));

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        mongo_operator_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    mongo_operator_common::signal_ready();

    let crd_api: Api<MongoCluster> = match &options.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let child_api: Api<StatefulSet> = match &options.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    #[cfg(feature = "metrics")]
    let metrics_task = {
        let metrics = context.metrics.clone();
        let port = options.metrics_port;
        tokio::spawn(async move {
            if let Err(err) = crate::util::metrics::serve(metrics, port).await {
                eprintln!("metrics server exited: {err}");
            }
        })
    };

    let backup_task = {
        let context = context.clone();
        let crd_api = crd_api.clone();
        let interval = options.backup_interval;
        tokio::spawn(async move { run_backup_ticker(context, crd_api, interval).await })
    };

    let sweep_task = {
        let client = client.clone();
        let crd_api = crd_api.clone();
        tokio::spawn(async move { run_orphan_sweep_ticker(client, crd_api, ORPHAN_SWEEP_INTERVAL).await })
    };

    let event_task = {
        let context = context.clone();
        let client = client.clone();
        tokio::spawn(async move {
            while let Some((key, event)) = event_rx.recv().await {
                if let Err(err) = handle_orchestrator_event(&context, &client, key, event).await {
                    eprintln!("{}", format!("orchestrator event handling failed: {err}").red());
                }
            }
        })
    };

    println!("{}", "🚀 MongoCluster controller started.".green());
    let controller = Controller::new(crd_api, Default::default())
        .owns(child_api, Default::default())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {});

    controller.await;
    backup_task.abort();
    sweep_task.abort();
    event_task.abort();
    #[cfg(feature = "metrics")]
    metrics_task.abort();
    Ok(())
}

async fn run_backup_ticker(context: Arc<ContextData>, api: Api<MongoCluster>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        let clusters = match api.list(&Default::default()).await {
            Ok(list) => list.items,
            Err(err) => {
                eprintln!("backup ticker: failed to list MongoClusters: {err}");
                continue;
            }
        };
        for cluster in clusters {
            let namespace = cluster.namespace().unwrap_or_default();
            let name = cluster.name_any();
            let key = ClusterKey::new(namespace.clone(), name.clone());

            if !context.orchestrator.has_completed_initial_restore(&key).await {
                continue;
            }

            let lock = context.lock_for(&key).await;
            let _guard = lock.lock().await;

            let now = chrono::Utc::now();
            if let Err(err) = context.backups.backup_if_needed(&cluster, now).await {
                eprintln!("backup failed for {key}: {err}");
            }
        }
    }
}

/// Periodically lists every managed child across all namespaces and deletes
/// ones whose owning `MongoCluster` no longer exists, catching deletes that
/// happened while the operator wasn't running to see the owner-ref GC.
async fn run_orphan_sweep_ticker(client: Client, crd_api: Api<MongoCluster>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        let clusters = match crd_api.list(&Default::default()).await {
            Ok(list) => list.items,
            Err(err) => {
                eprintln!("orphan sweep: failed to list MongoClusters: {err}");
                continue;
            }
        };
        let known: std::collections::HashSet<(String, String)> = clusters
            .iter()
            .map(|c| (c.namespace().unwrap_or_default(), c.name_any()))
            .collect();

        for result in [
            AdminSecretChecker::sweep_orphans(&client, &known).await,
            ClientServiceChecker::sweep_orphans(&client, &known).await,
            HeadlessServiceChecker::sweep_orphans(&client, &known).await,
            StatefulWorkloadChecker::sweep_orphans(&client, &known).await,
        ] {
            if let Err(err) = result {
                eprintln!("orphan sweep failed: {err}");
            }
        }
    }
}

async fn handle_orchestrator_event(
    context: &ContextData,
    client: &Client,
    key: ClusterKey,
    event: OrchestratorEvent,
) -> Result<(), Error> {
    let lock = context.lock_for(&key).await;
    let _guard = lock.lock().await;

    let api: Api<MongoCluster> = Api::namespaced(client.clone(), &key.namespace);
    let cluster = api.get(&key.name).await?;
    context
        .orchestrator
        .handle_event(event, &cluster, &key.namespace, &context.restore)
        .await
}

/// Context injected with each `reconcile` and `on_error` invocation.
struct ContextData {
    client: Client,
    orchestrator: Arc<MongoOrchestrator>,
    restore: RestoreHelper,
    backups: BackupScheduler,
    sleep_per_run: Duration,

    #[cfg(feature = "metrics")]
    metrics: Arc<ControllerMetrics>,

    /// Per-cluster lock serializing reconciles of the same cluster so two
    /// concurrent watch events never race to reconfigure the same replica
    /// set at once. Also held by the orchestrator event-drain task and the
    /// backup ticker so a cluster's restore-then-create-users sequence can't
    /// interleave with either.
    cluster_locks: Mutex<HashMap<ClusterKey, Arc<Mutex<()>>>>,
    last_action: Mutex<HashMap<ClusterKey, (ClusterAction, Instant)>>,
}

impl ContextData {
    fn new(
        client: Client,
        event_tx: mpsc::UnboundedSender<(ClusterKey, OrchestratorEvent)>,
        sleep_per_run: Duration,
    ) -> Self {
        let (orch_tx, mut orch_rx) = mpsc::unbounded_channel::<OrchestratorEvent>();
        tokio::spawn(async move {
            while let Some(event) = orch_rx.recv().await {
                let key = match &event {
                    OrchestratorEvent::ReplicaSetReady(k) | OrchestratorEvent::AllHostsReady(k) => k.clone(),
                };
                let _ = event_tx.send((key, event));
            }
        });

        Self {
            client,
            orchestrator: Arc::new(MongoOrchestrator::new(orch_tx)),
            restore: RestoreHelper::new(),
            backups: BackupScheduler::new(),
            sleep_per_run,
            #[cfg(feature = "metrics")]
            metrics: Arc::new(ControllerMetrics::new("mongo_cluster_operator")),
            cluster_locks: Mutex::new(HashMap::new()),
            last_action: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, key: &ClusterKey) -> Arc<Mutex<()>> {
        let mut locks = self.cluster_locks.lock().await;
        locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum ClusterAction {
    InvalidSpec(String),
    ProvisioningChildren,
    EnsuringReplicaSet,
    CreatingUsers,
    Healthy,
    Error(String),
    NoOp,
}

impl ClusterAction {
    fn to_str(&self) -> &str {
        match self {
            ClusterAction::InvalidSpec(_) => "InvalidSpec",
            ClusterAction::ProvisioningChildren => "ProvisioningChildren",
            ClusterAction::EnsuringReplicaSet => "EnsuringReplicaSet",
            ClusterAction::CreatingUsers => "CreatingUsers",
            ClusterAction::Healthy => "Healthy",
            ClusterAction::Error(_) => "Error",
            ClusterAction::NoOp => "NoOp",
        }
    }
}

async fn reconcile(instance: Arc<MongoCluster>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance.namespace().ok_or_else(|| {
        Error::UserInput("MongoCluster resources must be namespaced".to_string())
    })?;
    let name = instance.name_any();
    let key = ClusterKey::new(namespace.clone(), name.clone());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let lock = context.lock_for(&key).await;
    let _guard = lock.lock().await;

    let action = determine_and_apply(&client, &context, &instance, &namespace, &name).await?;

    if action != ClusterAction::NoOp {
        let mut la = context.last_action.lock().await;
        let changed = la
            .get(&key)
            .map(|(last, at)| *last != action || at.elapsed() > Duration::from_secs(300))
            .unwrap_or(true);
        if changed {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                format!("{action:?}").color(FG2),
            );
        }
        la.insert(key, (action.clone(), Instant::now()));
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();
    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    Ok(match action {
        ClusterAction::InvalidSpec(_) | ClusterAction::Error(_) => Action::requeue(Duration::from_secs(30)),
        ClusterAction::Healthy | ClusterAction::NoOp => Action::requeue(context.sleep_per_run),
        _ => Action::requeue(Duration::from_secs(5)),
    })
}

/// Read-then-write phase combined into one pass: the checkers and
/// orchestrator calls here are themselves idempotent, so determining the
/// action and taking it don't need to be separated. Returns the action
/// taken, for logging/metrics.
async fn determine_and_apply(
    client: &Client,
    context: &ContextData,
    instance: &MongoCluster,
    namespace: &str,
    name: &str,
) -> Result<ClusterAction, Error> {
    if instance.metadata.deletion_timestamp.is_some() {
        let key = ClusterKey::new(namespace.to_string(), name.to_string());
        context.orchestrator.invalidate(&key).await;
        return Ok(ClusterAction::NoOp);
    }

    if let Err(msg) = instance.spec.validate() {
        patch_phase(client.clone(), instance, ClusterPhase::Error, Some(msg.clone())).await?;
        return Ok(ClusterAction::InvalidSpec(msg));
    }

    let secret_checker = AdminSecretChecker::new(client.clone(), namespace);
    let client_svc_checker = ClientServiceChecker::new(client.clone(), namespace);
    let headless_svc_checker = HeadlessServiceChecker::new(client.clone(), namespace);
    let workload_checker = StatefulWorkloadChecker::new(client.clone(), namespace);

    let mut provisioned = false;
    provisioned |= secret_checker.reconcile(instance).await?;
    provisioned |= client_svc_checker.reconcile(instance).await?;
    provisioned |= headless_svc_checker.reconcile(instance).await?;
    provisioned |= workload_checker.reconcile(instance).await?;

    if provisioned {
        patch_phase(
            client.clone(),
            instance,
            ClusterPhase::Initializing,
            Some(format!("provisioning child resources for {name}")),
        )
        .await?;
        return Ok(ClusterAction::ProvisioningChildren);
    }

    let outcome = context
        .orchestrator
        .check_or_create_replica_set(instance, namespace)
        .await;
    if let Err(err) = outcome {
        patch_phase(client.clone(), instance, ClusterPhase::Degraded, Some(err.to_string())).await?;
        return Ok(ClusterAction::Error(err.to_string()));
    }

    context
        .orchestrator
        .create_admin_user_if_missing(instance, namespace)
        .await?;

    patch_phase(
        client.clone(),
        instance,
        ClusterPhase::Healthy,
        Some("replica set reconciled".to_string()),
    )
    .await?;
    Ok(ClusterAction::Healthy)
}

async fn patch_phase(
    client: Client,
    instance: &MongoCluster,
    phase: ClusterPhase,
    message: Option<String>,
) -> Result<(), Error> {
    crate::util::patch::patch_status(client, instance, |status: &mut mongo_operator_types::MongoClusterStatus| {
        status.phase = phase;
        status.message = message;
        if phase == ClusterPhase::Healthy {
            status.replicas = instance.spec.mongodb.replicas as u32;
        }
    })
    .await?;
    Ok(())
}

fn on_error(instance: Arc<MongoCluster>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error for {}: {error}", instance.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}
