//! Cron-scheduled `mongodump` backups, mirroring `BackupHelper.py`'s
//! `backup_if_needed`/`backup`. The manager ticks this checker once per
//! scheduling interval for every cluster that declares a `backups.cron`.

use crate::util::{ClusterKey, Error};
use chrono::{DateTime, Utc};
use cron::Schedule;
use kube::ResourceExt;
use mongo_operator_types::MongoCluster;
use std::collections::HashMap;
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;
use tokio::sync::Mutex;

const MONGODUMP_BIN: &str = "/usr/bin/mongodump";

pub struct BackupScheduler {
    last_backup: Mutex<HashMap<ClusterKey, DateTime<Utc>>>,
}

impl BackupScheduler {
    pub fn new() -> Self {
        Self {
            last_backup: Mutex::new(HashMap::new()),
        }
    }

    /// Checks whether `cluster` is due for a backup and runs `mongodump` if
    /// so. Returns whether a backup was taken.
    pub async fn backup_if_needed(&self, cluster: &MongoCluster, now: DateTime<Utc>) -> Result<bool, Error> {
        let Some(cron_expr) = cluster.spec.backups.cron.as_deref() else {
            return Ok(false);
        };
        let key = ClusterKey::new(cluster.namespace().unwrap_or_default(), cluster.name_any());

        let due = {
            let last = self.last_backup.lock().await;
            match last.get(&key) {
                None => true,
                Some(last_backup) => next_fire_after(cron_expr, *last_backup)?
                    .map(|next| next <= now)
                    .unwrap_or(false),
            }
        };

        if !due {
            return Ok(false);
        }

        self.backup(cluster, now).await?;
        self.last_backup.lock().await.insert(key, now);
        Ok(true)
    }

    async fn backup(&self, cluster: &MongoCluster, now: DateTime<Utc>) -> Result<(), Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let backup_file = format!(
            "/data/{name}/mongodb-backup-{namespace}-{name}-{}.archive.gz",
            now.format("%Y-%m-%d_%H%M%S")
        );
        if let Some(dir) = std::path::Path::new(&backup_file).parent() {
            std::fs::create_dir_all(dir)?;
        }

        let replicas = cluster.spec.mongodb.replicas;
        let pod_index = replicas.saturating_sub(1);
        let hostname = crate::orchestrator::member_hostname(pod_index, &name, &namespace);

        println!("backing up {namespace}/{name} from {hostname} to {backup_file}");

        let output = Command::new(MONGODUMP_BIN)
            .arg("--authenticationDatabase=admin")
            .arg("-u")
            .arg("admin")
            .arg("-p")
            .arg(&cluster.spec.users.admin_password)
            .arg("--host")
            .arg(&hostname)
            .arg("--gzip")
            .arg(format!("--archive={backup_file}"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::UserInput(format!(
                "could not back up '{hostname}' to '{backup_file}': {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

impl Default for BackupScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// The `cron` crate requires a leading seconds field (6 or 7 fields); the
/// standard 5-field dialect cluster specs are written in doesn't have one.
/// A 5-field expression is widened to 6 fields by firing on the minute.
fn normalize_cron_expr(cron_expr: &str) -> std::borrow::Cow<'_, str> {
    if cron_expr.split_whitespace().count() == 5 {
        std::borrow::Cow::Owned(format!("0 {cron_expr}"))
    } else {
        std::borrow::Cow::Borrowed(cron_expr)
    }
}

fn next_fire_after(cron_expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, Error> {
    let schedule = Schedule::from_str(&normalize_cron_expr(cron_expr))?;
    Ok(schedule.after(&after).next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_fire_after_hourly_schedule_lands_on_the_hour() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        let next = next_fire_after("0 0 * * * *", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap());
    }

    #[test]
    fn rejects_malformed_cron_expressions() {
        assert!(next_fire_after("not a cron expression", Utc::now()).is_err());
    }

    #[test]
    fn accepts_standard_five_field_cron_expressions() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 2, 0).unwrap();
        let next = next_fire_after("*/5 * * * *", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
    }
}
