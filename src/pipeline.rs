//! Drives the restore as a sequence of work units: shuffle prefixes, list
//! versions, select target versions, apply actions. Each unit runs to
//! completion before the next starts, so the selector always observes the
//! complete version history of its keys. Units fan out over shard files with
//! a bounded worker fleet; each worker consumes its shard sequentially.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use aws_sdk_s3::Client;
use camino::{Utf8Path, Utf8PathBuf};
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RestoreError;
use crate::prefix_source;
use crate::record::{Action, ActionOutcome, VersionRecord};
use crate::restore::{plan_action, PlannedAction};
use crate::selector::{group_by_key, select_target_version};
use crate::shuffle::{read_shard, ShuffleWriter};
use crate::version_stream::stream_versions;
use crate::{copy_object_with_retries, delete_object_with_retries, RestoreConfig};

/// Multiplier applied to the worker-slot count to size the prefix shuffle.
/// More shards than slots keeps every slot busy when prefixes are uneven.
const PREFIX_SHARDS_PER_SLOT: f64 = 3.5;

pub struct RestorePipeline {
    config: Arc<RestoreConfig>,
    s3_client: Arc<Client>,
    workspace: Utf8PathBuf,
    concurrency: usize,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub prefixes: u64,
    pub versions_listed: u64,
    pub keys_selected: u64,
    pub copied: u64,
    pub deleted: u64,
    pub noops: u64,
    /// Per-key failures, as (key, error). These are reported but do not by
    /// themselves fail the run.
    pub failed: Vec<(String, String)>,
}

impl RestoreSummary {
    fn merge(&mut self, other: RestoreSummary) {
        self.prefixes += other.prefixes;
        self.versions_listed += other.versions_listed;
        self.keys_selected += other.keys_selected;
        self.copied += other.copied;
        self.deleted += other.deleted;
        self.noops += other.noops;
        self.failed.extend(other.failed);
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn summary_string(&self) -> String {
        format!(
            "Listed {} versions under {} prefixes, selected {} keys: {} copied, {} deleted, {} unchanged, {} failed",
            self.versions_listed,
            self.prefixes,
            self.keys_selected,
            self.copied,
            self.deleted,
            self.noops,
            self.failed.len(),
        )
    }
}

impl RestorePipeline {
    pub fn new(
        config: RestoreConfig,
        s3_client: Arc<Client>,
        workspace: Utf8PathBuf,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            s3_client,
            workspace,
            concurrency,
            cancel,
        }
    }

    pub fn workspace(&self) -> &Utf8Path {
        &self.workspace
    }

    pub async fn run(
        &self,
        prefixes_path: Option<&Utf8Path>,
    ) -> Result<RestoreSummary, RestoreError> {
        tokio::fs::create_dir_all(&self.workspace)
            .await
            .with_context(|| format!("create workspace directory {}", self.workspace))
            .map_err(RestoreError::BadInput)?;

        info!("Running step: shuffle-prefixes");
        let (prefix_shards, prefixes) = self.shuffle_prefixes(prefixes_path).await?;
        self.check_cancelled()?;

        info!("Running step: list-versions");
        let (version_shards, versions_listed) = self.list_versions(&prefix_shards).await?;
        self.check_cancelled()?;

        info!("Running step: select-versions");
        let (target_files, keys_selected) = self.select_versions(&version_shards).await?;
        self.check_cancelled()?;

        info!("Running step: restore");
        let mut summary = self.restore(&target_files).await?;
        summary.prefixes = prefixes;
        summary.versions_listed = versions_listed;
        summary.keys_selected = keys_selected;
        Ok(summary)
    }

    fn check_cancelled(&self) -> Result<(), RestoreError> {
        if self.cancel.is_cancelled() {
            Err(RestoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn shuffle_prefixes(
        &self,
        prefixes_path: Option<&Utf8Path>,
    ) -> Result<(Vec<Utf8PathBuf>, u64), RestoreError> {
        let prefixes = prefix_source::read_prefixes(prefixes_path).await?;
        let shard_count = (self.concurrency as f64 * PREFIX_SHARDS_PER_SLOT).ceil() as usize;
        let writer = ShuffleWriter::create(&self.workspace, "prefixes", shard_count)
            .await
            .map_err(RestoreError::Other)?;
        for prefix in &prefixes {
            writer.write(prefix, &[]).await.map_err(RestoreError::Other)?;
        }
        let paths = writer.finish().await.map_err(RestoreError::Other)?;
        info!(
            "Shuffled {} prefixes into {} shards",
            prefixes.len(),
            paths.len()
        );
        Ok((paths, prefixes.len() as u64))
    }

    async fn list_versions(
        &self,
        prefix_shards: &[Utf8PathBuf],
    ) -> Result<(Vec<Utf8PathBuf>, u64), RestoreError> {
        let writer = ShuffleWriter::create(&self.workspace, "versions", self.concurrency)
            .await
            .map_err(RestoreError::Other)?;

        let listed = tokio_stream::iter(prefix_shards.iter().map(Ok::<_, RestoreError>))
            .map_ok(|shard| self.list_shard(shard, &writer))
            .try_buffer_unordered(self.concurrency)
            .try_fold(0u64, |acc, listed| async move {
                Ok::<u64, RestoreError>(acc + listed)
            })
            .await?;

        let paths = writer.finish().await.map_err(RestoreError::Other)?;
        info!("Listed {listed} versions into {} shards", paths.len());
        Ok((paths, listed))
    }

    async fn list_shard(
        &self,
        shard: &Utf8Path,
        writer: &ShuffleWriter,
    ) -> Result<u64, RestoreError> {
        let mut listed = 0u64;
        for (prefix, _) in read_shard(shard).await? {
            let list_prefix = format!("{}{}", self.config.src_prefix, prefix);
            let versions = stream_versions(
                &self.s3_client,
                &self.config.src_bucket,
                list_prefix,
                &self.cancel,
            );
            let mut versions = std::pin::pin!(versions);
            while let Some(record) = versions.try_next().await? {
                writer
                    .write(&record.key, &record.encode())
                    .await
                    .map_err(RestoreError::Other)?;
                listed += 1;
            }
        }
        debug!("Listed {listed} versions for prefix shard {shard}");
        Ok(listed)
    }

    async fn select_versions(
        &self,
        version_shards: &[Utf8PathBuf],
    ) -> Result<(Vec<Utf8PathBuf>, u64), RestoreError> {
        let outputs: Vec<(Utf8PathBuf, u64)> =
            tokio_stream::iter(version_shards.iter().enumerate().map(Ok::<_, RestoreError>))
                .map_ok(|(index, shard)| self.select_shard(index, shard))
                .try_buffer_unordered(self.concurrency)
                .try_collect()
                .await?;

        let keys = outputs.iter().map(|(_, keys)| keys).sum();
        info!("Selected target versions for {keys} keys");
        Ok((outputs.into_iter().map(|(path, _)| path).collect(), keys))
    }

    /// Reduces one version shard: group by key, pick the target version per
    /// key, write one `key TAB json` line each.
    async fn select_shard(
        &self,
        index: usize,
        shard: &Utf8Path,
    ) -> Result<(Utf8PathBuf, u64), RestoreError> {
        let mut records = Vec::new();
        for (_key, value) in read_shard(shard).await? {
            records.push(VersionRecord::decode(value)?);
        }
        let groups: HashMap<String, Vec<VersionRecord>> = group_by_key(records);

        let path = self.workspace.join(format!("versions_{index:04}.tsv"));
        let mut out = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("create stage output {path}"))
                .map_err(RestoreError::Other)?,
        );
        let mut keys = 0u64;
        for (key, versions) in groups {
            let target = select_target_version(
                &self.config.src_bucket,
                &key,
                versions,
                self.config.restore_time,
            );
            let target_json = serde_json::to_string(&target)
                .context("serialize target version")
                .map_err(RestoreError::Other)?;
            out.write_all(format!("{key}\t{target_json}\n").as_bytes())
                .await
                .with_context(|| format!("write stage output {path}"))
                .map_err(RestoreError::Other)?;
            keys += 1;
        }
        out.flush()
            .await
            .with_context(|| format!("flush stage output {path}"))
            .map_err(RestoreError::Other)?;
        debug!("Selected {keys} targets in shard {index}");
        Ok((path, keys))
    }

    async fn restore(&self, target_files: &[Utf8PathBuf]) -> Result<RestoreSummary, RestoreError> {
        let shard_summaries: Vec<RestoreSummary> =
            tokio_stream::iter(target_files.iter().enumerate().map(Ok::<_, RestoreError>))
                .map_ok(|(index, targets)| self.restore_shard(index, targets))
                .try_buffer_unordered(self.concurrency)
                .try_collect()
                .await?;

        let mut summary = RestoreSummary::default();
        for shard_summary in shard_summaries {
            summary.merge(shard_summary);
        }
        info!(
            "Applied actions: {} copied, {} deleted, {} unchanged, {} failed",
            summary.copied,
            summary.deleted,
            summary.noops,
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Applies the planned action for every target in one `versions` shard
    /// and records the outcome in the matching `restored` output. Per-key
    /// failures are captured; fatal ones abort the run.
    async fn restore_shard(
        &self,
        index: usize,
        targets: &Utf8Path,
    ) -> Result<RestoreSummary, RestoreError> {
        let input = tokio::fs::read_to_string(targets)
            .await
            .with_context(|| format!("read stage output {targets}"))
            .map_err(RestoreError::Other)?;

        let path = self.workspace.join(format!("restored_{index:04}.tsv"));
        let mut out = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("create stage output {path}"))
                .map_err(RestoreError::Other)?,
        );

        let mut summary = RestoreSummary::default();
        for line in input.lines() {
            let (key, target_json) = line
                .split_once('\t')
                .with_context(|| format!("malformed target line {line:?}"))
                .map_err(RestoreError::Other)?;
            let target: VersionRecord = serde_json::from_str(target_json)
                .with_context(|| format!("parse target version of key {key:?}"))
                .map_err(RestoreError::Other)?;

            let outcome = match self.apply_one(&target).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Restore of key {key:?} failed: {e}");
                    summary.failed.push((key.to_owned(), e.to_string()));
                    ActionOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            match &outcome {
                ActionOutcome::Copied { .. } => summary.copied += 1,
                ActionOutcome::Deleted { .. } => summary.deleted += 1,
                ActionOutcome::Noop { .. } => summary.noops += 1,
                ActionOutcome::Failed { .. } => {}
            }
            let outcome_json = serde_json::to_string(&outcome)
                .context("serialize action outcome")
                .map_err(RestoreError::Other)?;
            out.write_all(format!("{key}\t{outcome_json}\n").as_bytes())
                .await
                .with_context(|| format!("write stage output {path}"))
                .map_err(RestoreError::Other)?;
        }
        out.flush()
            .await
            .with_context(|| format!("flush stage output {path}"))
            .map_err(RestoreError::Other)?;
        Ok(summary)
    }

    async fn apply_one(&self, target: &VersionRecord) -> Result<ActionOutcome, RestoreError> {
        match plan_action(&self.config, target)? {
            PlannedAction::Skip(reason) => Ok(ActionOutcome::Noop { reason }),
            PlannedAction::Run(Action::Delete {
                dest_bucket,
                dest_key,
            }) => {
                delete_object_with_retries(&self.s3_client, &dest_bucket, &dest_key, &self.cancel)
                    .await?;
                Ok(ActionOutcome::Deleted {
                    dest_bucket,
                    dest_key,
                })
            }
            PlannedAction::Run(Action::Copy {
                src_bucket,
                src_key,
                src_version_id,
                dest_bucket,
                dest_key,
            }) => {
                copy_object_with_retries(
                    &self.s3_client,
                    &src_bucket,
                    &src_key,
                    &src_version_id,
                    &dest_bucket,
                    &dest_key,
                    &self.cancel,
                )
                .await?;
                Ok(ActionOutcome::Copied {
                    src_bucket,
                    src_key,
                    src_version_id,
                    dest_bucket,
                    dest_key,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_s3::config::{BehaviorVersion, Region};
    use chrono::TimeZone;
    use chrono::Utc;

    use super::*;
    use crate::record::NoopReason;

    fn offline_client() -> Arc<Client> {
        // never sends a request in these tests
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::v2024_03_28())
            .region(Region::new("us-east-1"))
            .build();
        Arc::new(Client::from_conf(conf))
    }

    fn pipeline(workspace: Utf8PathBuf, delete: bool) -> RestorePipeline {
        let config = RestoreConfig {
            src_bucket: "BUCKET".to_owned(),
            src_prefix: "".to_owned(),
            dest_bucket: "BUCKET".to_owned(),
            dest_prefix: "".to_owned(),
            restore_time: Utc.timestamp_millis_opt(25).single().unwrap(),
            delete,
        };
        RestorePipeline::new(
            config,
            offline_client(),
            workspace,
            2,
            CancellationToken::new(),
        )
    }

    fn version(key: &str, version_id: &str, millis: i64, delete_marker: bool) -> VersionRecord {
        VersionRecord {
            key: key.to_owned(),
            bucket_name: "BUCKET".to_owned(),
            version_id: Some(version_id.to_owned()),
            last_modified: Some(Utc.timestamp_millis_opt(millis).single().unwrap()),
            delete_marker,
            is_current: false,
        }
    }

    #[test]
    fn summaries_merge() {
        let mut total = RestoreSummary::default();
        total.merge(RestoreSummary {
            copied: 2,
            noops: 1,
            ..Default::default()
        });
        total.merge(RestoreSummary {
            deleted: 1,
            failed: vec![("k".to_owned(), "boom".to_owned())],
            ..Default::default()
        });
        assert_eq!(total.copied, 2);
        assert_eq!(total.deleted, 1);
        assert_eq!(total.noops, 1);
        assert!(total.has_failures());
        assert!(total.summary_string().contains("1 failed"));
    }

    #[tokio::test]
    async fn select_shard_emits_one_target_per_key() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path().to_owned(), false);

        let writer = ShuffleWriter::create(dir.path(), "versions", 1).await.unwrap();
        for record in [
            version("prefix1/a", "t9", 9, false),
            version("prefix1/a", "t5", 5, false),
            version("prefix2/x", "t0", 0, false),
            version("prefix2/y/z", "t100", 100, false),
        ] {
            writer.write(&record.key, &record.encode()).await.unwrap();
        }
        let shards = writer.finish().await.unwrap();

        let (path, keys) = pipeline.select_shard(0, &shards[0]).await.unwrap();
        assert_eq!(keys, 3);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let mut targets = HashMap::new();
        for line in contents.lines() {
            let (key, json) = line.split_once('\t').unwrap();
            let target: VersionRecord = serde_json::from_str(json).unwrap();
            targets.insert(key.to_owned(), target);
        }
        assert_eq!(targets.len(), 3);
        assert_eq!(targets["prefix1/a"].version_id.as_deref(), Some("t9"));
        assert!(targets["prefix1/a"].is_current);
        assert!(targets["prefix2/x"].is_current);
        // created after the restore time: synthesized tombstone
        assert!(targets["prefix2/y/z"].delete_marker);
        assert_eq!(targets["prefix2/y/z"].version_id, None);
    }

    #[tokio::test]
    async fn restore_shard_records_noops_without_touching_the_store() {
        let dir = camino_tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path().to_owned(), false);

        // an in-place current version and a delete-gated tombstone: both noops
        let mut current = version("prefix2/x", "t0", 0, false);
        current.is_current = true;
        let tombstone = VersionRecord::tombstone("prefix2/y/z", "BUCKET");

        let targets_path = dir.path().join("versions_0000.tsv");
        let mut lines = String::new();
        for target in [&current, &tombstone] {
            lines.push_str(&format!(
                "{}\t{}\n",
                target.key,
                serde_json::to_string(target).unwrap()
            ));
        }
        tokio::fs::write(&targets_path, lines).await.unwrap();

        let summary = pipeline.restore_shard(0, &targets_path).await.unwrap();
        assert_eq!(summary.noops, 2);
        assert_eq!(summary.copied, 0);
        assert_eq!(summary.deleted, 0);
        assert!(!summary.has_failures());

        let restored = tokio::fs::read_to_string(dir.path().join("restored_0000.tsv"))
            .await
            .unwrap();
        let mut outcomes = HashMap::new();
        for line in restored.lines() {
            let (key, json) = line.split_once('\t').unwrap();
            let outcome: ActionOutcome = serde_json::from_str(json).unwrap();
            outcomes.insert(key.to_owned(), outcome);
        }
        assert_eq!(
            outcomes["prefix2/x"],
            ActionOutcome::Noop {
                reason: NoopReason::AlreadyCurrent
            }
        );
        assert_eq!(
            outcomes["prefix2/y/z"],
            ActionOutcome::Noop {
                reason: NoopReason::DeleteDisabled
            }
        );
    }

    #[tokio::test]
    async fn prefix_mismatch_is_captured_not_fatal() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path().to_owned(), false);
        Arc::get_mut(&mut pipeline.config).unwrap().src_prefix = "live/".to_owned();
        Arc::get_mut(&mut pipeline.config).unwrap().dest_prefix = "live/".to_owned();

        let mut foreign = version("other/key", "t1", 1, false);
        foreign.is_current = true;
        let targets_path = dir.path().join("versions_0000.tsv");
        tokio::fs::write(
            &targets_path,
            format!(
                "{}\t{}\n",
                foreign.key,
                serde_json::to_string(&foreign).unwrap()
            ),
        )
        .await
        .unwrap();

        let summary = pipeline.restore_shard(0, &targets_path).await.unwrap();
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "other/key");

        let restored = tokio::fs::read_to_string(dir.path().join("restored_0000.tsv"))
            .await
            .unwrap();
        assert!(restored.contains("\"outcome\":\"failed\""));
    }
}
