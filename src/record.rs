use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RestoreError;

/// One historical version of one key in a versioned bucket: either a real
/// version (carries a version id) or a delete marker. Tombstones synthesized
/// for keys that did not exist at the restore time carry neither a version id
/// nor a timestamp.
///
/// Serialized as JSON in the `versions`/`restored` stage outputs; crosses the
/// shuffle in the binary form of [`VersionRecord::encode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub key: String,
    pub bucket_name: String,
    pub version_id: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub delete_marker: bool,
    #[serde(default)]
    pub is_current: bool,
}

const HAS_VERSION_ID: u8 = 1 << 0;
const HAS_LAST_MODIFIED: u8 = 1 << 1;
const DELETE_MARKER: u8 = 1 << 2;
const IS_CURRENT: u8 = 1 << 3;

impl VersionRecord {
    /// Tombstone for a key that had no version at the restore time.
    pub fn tombstone(key: &str, bucket_name: &str) -> Self {
        Self {
            key: key.to_owned(),
            bucket_name: bucket_name.to_owned(),
            version_id: None,
            last_modified: None,
            delete_marker: true,
            is_current: false,
        }
    }

    /// Binary form for shuffle transit: length-prefixed UTF-8 strings,
    /// the timestamp as integer milliseconds.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.key.len() + self.bucket_name.len());
        let mut flags = 0u8;
        if self.version_id.is_some() {
            flags |= HAS_VERSION_ID;
        }
        if self.last_modified.is_some() {
            flags |= HAS_LAST_MODIFIED;
        }
        if self.delete_marker {
            flags |= DELETE_MARKER;
        }
        if self.is_current {
            flags |= IS_CURRENT;
        }
        buf.put_u8(flags);
        put_string(&mut buf, &self.key);
        put_string(&mut buf, &self.bucket_name);
        if let Some(version_id) = &self.version_id {
            put_string(&mut buf, version_id);
        }
        if let Some(last_modified) = &self.last_modified {
            buf.put_i64(last_modified.timestamp_millis());
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, RestoreError> {
        fn decode_inner(buf: &mut Bytes) -> anyhow::Result<VersionRecord> {
            anyhow::ensure!(buf.has_remaining(), "empty version record");
            let flags = buf.get_u8();
            let key = get_string(buf).context("key")?;
            let bucket_name = get_string(buf).context("bucket_name")?;
            let version_id = if flags & HAS_VERSION_ID != 0 {
                Some(get_string(buf).context("version_id")?)
            } else {
                None
            };
            let last_modified = if flags & HAS_LAST_MODIFIED != 0 {
                anyhow::ensure!(buf.remaining() >= 8, "truncated last_modified");
                let millis = buf.get_i64();
                Some(
                    Utc.timestamp_millis_opt(millis)
                        .single()
                        .with_context(|| format!("timestamp {millis}ms out of range"))?,
                )
            } else {
                None
            };
            anyhow::ensure!(!buf.has_remaining(), "trailing bytes after version record");
            Ok(VersionRecord {
                key,
                bucket_name,
                version_id,
                last_modified,
                delete_marker: flags & DELETE_MARKER != 0,
                is_current: flags & IS_CURRENT != 0,
            })
        }
        decode_inner(&mut buf)
            .context("decode version record")
            .map_err(RestoreError::Other)
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> anyhow::Result<String> {
    anyhow::ensure!(buf.remaining() >= 4, "truncated string length");
    let len = buf.get_u32() as usize;
    anyhow::ensure!(buf.remaining() >= len, "truncated string body");
    String::from_utf8(buf.split_to(len).to_vec()).context("string is not UTF-8")
}

/// The single side effect the restorer may apply for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Copy {
        src_bucket: String,
        src_key: String,
        src_version_id: String,
        dest_bucket: String,
        dest_key: String,
    },
    Delete {
        dest_bucket: String,
        dest_key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoopReason {
    /// The target already is the current version of an in-place destination.
    AlreadyCurrent,
    /// The target is a tombstone but deletions were not enabled.
    DeleteDisabled,
}

/// Per-key line item of the `restored` stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Copied {
        src_bucket: String,
        src_key: String,
        src_version_id: String,
        dest_bucket: String,
        dest_key: String,
    },
    Deleted {
        dest_bucket: String,
        dest_key: String,
    },
    Noop {
        reason: NoopReason,
    },
    Failed {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version_id: Option<&str>, millis: Option<i64>, delete_marker: bool) -> VersionRecord {
        VersionRecord {
            key: "prefix1/a".to_owned(),
            bucket_name: "BUCKET".to_owned(),
            version_id: version_id.map(str::to_owned),
            last_modified: millis.map(|m| Utc.timestamp_millis_opt(m).single().unwrap()),
            delete_marker,
            is_current: false,
        }
    }

    #[test]
    fn binary_roundtrip_real_version() {
        let mut r = record(Some("v-123"), Some(25_000), false);
        r.is_current = true;
        let decoded = VersionRecord::decode(r.encode()).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn binary_roundtrip_tombstone() {
        let r = VersionRecord::tombstone("prefix2/y/z", "BUCKET");
        let decoded = VersionRecord::decode(r.encode()).unwrap();
        assert_eq!(decoded, r);
        assert!(decoded.delete_marker);
        assert_eq!(decoded.version_id, None);
        assert_eq!(decoded.last_modified, None);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let encoded = record(Some("v-123"), Some(25_000), false).encode();
        let truncated = encoded.slice(..encoded.len() - 3);
        assert!(VersionRecord::decode(truncated).is_err());
    }

    #[test]
    fn json_uses_iso_timestamps_and_nullable_fields() {
        let r = record(Some("v-123"), Some(25_000), false);
        let json: serde_json::Value = serde_json::to_value(&r).unwrap();
        assert_eq!(json["version_id"], "v-123");
        assert_eq!(json["last_modified"], "1970-01-01T00:00:25Z");
        assert_eq!(json["delete_marker"], false);

        let tombstone = VersionRecord::tombstone("k", "b");
        let json: serde_json::Value = serde_json::to_value(&tombstone).unwrap();
        assert_eq!(json["version_id"], serde_json::Value::Null);
        assert_eq!(json["last_modified"], serde_json::Value::Null);
        assert_eq!(json["delete_marker"], true);
    }

    #[test]
    fn outcome_json_is_tagged() {
        let outcome = ActionOutcome::Noop {
            reason: NoopReason::DeleteDisabled,
        };
        let json: serde_json::Value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "noop");
        assert_eq!(json["reason"], "delete_disabled");
    }
}
