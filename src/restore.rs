use crate::error::RestoreError;
use crate::record::{Action, NoopReason, VersionRecord};
use crate::RestoreConfig;

/// What the restorer decided for one key: the action to run, or the reason
/// there is nothing to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Run(Action),
    Skip(NoopReason),
}

/// Rewrites `key` from the source prefix namespace into the destination one.
/// A key outside the source prefix fails that record, not the run.
pub fn switch_prefixes(
    src_prefix: &str,
    dest_prefix: &str,
    key: &str,
) -> Result<String, RestoreError> {
    match key.strip_prefix(src_prefix) {
        Some(suffix) => Ok(format!("{dest_prefix}{suffix}")),
        None => Err(RestoreError::PrefixMismatch {
            key: key.to_owned(),
            src_prefix: src_prefix.to_owned(),
        }),
    }
}

/// Decides the single action to apply for one key.
///
/// Delete markers are examined first: an in-place restore with deletions
/// enabled must still remove a key whose tombstone is the current version.
/// Real versions that already are the current version of an in-place
/// destination are suppressed, which is what makes re-runs copy-free.
pub fn plan_action(
    config: &RestoreConfig,
    target: &VersionRecord,
) -> Result<PlannedAction, RestoreError> {
    let dest_key = switch_prefixes(&config.src_prefix, &config.dest_prefix, &target.key)?;
    if target.delete_marker {
        if config.delete {
            return Ok(PlannedAction::Run(Action::Delete {
                dest_bucket: config.dest_bucket.clone(),
                dest_key,
            }));
        }
        return Ok(PlannedAction::Skip(NoopReason::DeleteDisabled));
    }
    if config.is_in_place() && target.is_current {
        return Ok(PlannedAction::Skip(NoopReason::AlreadyCurrent));
    }
    let src_version_id = target.version_id.clone().ok_or_else(|| {
        RestoreError::Other(anyhow::anyhow!(
            "version of key {:?} carries no version id",
            target.key
        ))
    })?;
    Ok(PlannedAction::Run(Action::Copy {
        src_bucket: config.src_bucket.clone(),
        src_key: target.key.clone(),
        src_version_id,
        dest_bucket: config.dest_bucket.clone(),
        dest_key,
    }))
}
