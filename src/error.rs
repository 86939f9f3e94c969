/// Reasons for the restore pipeline, or a single record inside it, to fail.
///
/// The orchestrator routes on the variant: per-record variants are captured
/// into the `restored` stage output and do not poison sibling records, while
/// fatal variants abort the whole run.
#[derive(Debug)]
pub enum RestoreError {
    /// Validation or other error caused by user input, e.g. an unreadable
    /// prefix file. Fails the run before any listing starts.
    BadInput(anyhow::Error),
    /// A listed key does not begin with the configured source prefix.
    /// Per-record: logged and captured, does not abort the run.
    PrefixMismatch { key: String, src_prefix: String },
    /// A cancellation token aborted the run, typically on shutdown.
    Cancelled,
    /// Authorization failure or a missing bucket. Aborts the whole run.
    Fatal(anyhow::Error),
    /// Transient trouble that survived all retries, and other per-record
    /// failures.
    Other(anyhow::Error),
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreError::BadInput(e) => write!(f, "bad input: {e:#}"),
            RestoreError::PrefixMismatch { key, src_prefix } => {
                write!(f, "key {key:?} does not start with source prefix {src_prefix:?}")
            }
            RestoreError::Cancelled => write!(f, "cancelled, shutting down"),
            RestoreError::Fatal(e) => write!(f, "fatal storage error: {e:#}"),
            RestoreError::Other(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for RestoreError {}

impl RestoreError {
    /// Returns true if the error should not be retried with backoff.
    pub fn is_permanent(&self) -> bool {
        use RestoreError::*;
        match self {
            BadInput(_) | PrefixMismatch { .. } | Cancelled | Fatal(_) => true,
            Other(_) => false,
        }
    }

    /// Returns true if the error poisons the whole run rather than the one
    /// record it was raised for.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RestoreError::Fatal(_) | RestoreError::BadInput(_) | RestoreError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_mismatch_is_permanent_but_not_fatal() {
        let err = RestoreError::PrefixMismatch {
            key: "other/key".to_owned(),
            src_prefix: "data/".to_owned(),
        };
        assert!(err.is_permanent());
        assert!(!err.is_fatal());
    }

    #[test]
    fn transient_errors_are_retried() {
        let err = RestoreError::Other(anyhow::anyhow!("timeout"));
        assert!(!err.is_permanent());
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatal_errors_abort_the_run() {
        let err = RestoreError::Fatal(anyhow::anyhow!("AccessDenied"));
        assert!(err.is_permanent());
        assert!(err.is_fatal());
    }
}
