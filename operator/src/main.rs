mod backup;
mod checkers;
mod manager;
mod orchestrator;
mod restore;
mod util;

use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;
use std::time::Duration;

/// Watches `MongoCluster` custom resources and reconciles them into running,
/// backed-up MongoDB replica sets.
#[derive(Parser, Debug)]
#[command(name = "mongo-cluster-operator", version)]
struct Args {
    /// Restrict the controller to a single namespace. Defaults to
    /// watching every namespace the service account can see.
    #[arg(long, env = "NAMESPACE")]
    namespace: Option<String>,

    /// How often, in seconds, to sweep all clusters for due backups.
    #[arg(long, env = "BACKUP_INTERVAL_SECS", default_value_t = 10)]
    backup_interval_secs: u64,

    /// How long, in seconds, a healthy or no-op cluster waits before its
    /// next reconcile. Named after the original operator's `sleep_per_run`.
    #[arg(long, env = "SLEEP_PER_RUN", default_value_t = 5)]
    sleep_per_run: u64,

    /// Port the Prometheus `/metrics` endpoint listens on.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("{}", format!("Failed to create Kubernetes client: {err}").red());
            std::process::exit(1);
        }
    };

    let options = manager::ManagerOptions {
        namespace: args.namespace,
        backup_interval: Duration::from_secs(args.backup_interval_secs),
        sleep_per_run: Duration::from_secs(args.sleep_per_run),
        #[cfg(feature = "metrics")]
        metrics_port: args.metrics_port,
    };

    if let Err(err) = manager::run(client, options).await {
        eprintln!("{}", format!("Controller exited with error: {err}").red());
        std::process::exit(1);
    }
}
