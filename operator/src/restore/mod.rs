//! Restores a backup archive into a replica set the first time it becomes
//! ready, mirroring `RestoreHelper.py`'s `restoreIfNeeded`/`restore`.

use crate::util::Error;
use kube::ResourceExt;
use mongo_operator_types::{LATEST_BACKUP_SENTINEL, MongoCluster};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const RESTORE_RETRIES: u32 = 4;
const RESTORE_WAIT: Duration = Duration::from_secs(15);
const MONGORESTORE_BIN: &str = "/usr/bin/mongorestore";

pub struct RestoreHelper;

impl RestoreHelper {
    pub fn new() -> Self {
        Self
    }

    /// Returns whether a restore was performed.
    pub async fn restore_if_needed(&self, cluster: &MongoCluster) -> Result<bool, Error> {
        let Some(restore_from) = cluster.spec.backups.restore_from.as_deref() else {
            return Ok(false);
        };

        let backup_file = if restore_from == LATEST_BACKUP_SENTINEL {
            Self::latest_backup_file()?
        } else {
            restore_from.to_string()
        };

        println!(
            "restoring {backup_file} into {}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any()
        );
        self.restore(cluster, &backup_file).await?;
        Ok(true)
    }

    /// Globs `/data/mongodb-backup-*.gz` and returns the most recently
    /// created match. This is a flat, single-directory glob even though
    /// `BackupScheduler` writes into a per-cluster subdirectory, so restores
    /// across multiple clusters sharing the same volume can pick up the
    /// wrong cluster's backup; preserved from the original tool rather than
    /// silently fixed.
    fn latest_backup_file() -> Result<String, Error> {
        let mut candidates: Vec<(std::time::SystemTime, String)> = glob::glob("/data/mongodb-backup-*.gz")
            .map_err(|e| Error::UserInput(e.to_string()))?
            .filter_map(Result::ok)
            .filter_map(|path| {
                let created = std::fs::metadata(&path).and_then(|m| m.created()).ok()?;
                Some((created, path.to_string_lossy().into_owned()))
            })
            .collect();
        candidates.sort_by_key(|(created, _)| *created);
        candidates
            .pop()
            .map(|(_, path)| path)
            .ok_or_else(|| Error::UserInput("no backup files found under /data".to_string()))
    }

    async fn restore(&self, cluster: &MongoCluster, backup_file: &str) -> Result<(), Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let hosts = crate::orchestrator::member_hostnames(cluster, &namespace).join(",");

        let mut last_err = None;
        for attempt in 0..RESTORE_RETRIES {
            let output = Command::new(MONGORESTORE_BIN)
                .arg("--authenticationDatabase=admin")
                .arg("-u")
                .arg("admin")
                .arg("-p")
                .arg(&cluster.spec.users.admin_password)
                .arg("--host")
                .arg(&hosts)
                .arg("--gzip")
                .arg(format!("--archive={backup_file}"))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await?;

            if output.status.success() {
                if let Err(err) = std::fs::remove_file(backup_file) {
                    eprintln!("unable to remove {backup_file} after restore: {err}");
                }
                return Ok(());
            }

            eprintln!(
                "mongorestore attempt {attempt} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            last_err = Some(String::from_utf8_lossy(&output.stderr).into_owned());
            tokio::time::sleep(RESTORE_WAIT).await;
        }
        Err(Error::Timeout(format!(
            "could not restore '{backup_file}' after {RESTORE_RETRIES} retries: {}",
            last_err.unwrap_or_default()
        )))
    }
}

impl Default for RestoreHelper {
    fn default() -> Self {
        Self::new()
    }
}
