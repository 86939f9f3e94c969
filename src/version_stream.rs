use anyhow::Context;
use async_stream::try_stream;
use aws_sdk_s3::Client;
use chrono::{DateTime, TimeZone, Utc};
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::RestoreError;
use crate::list_versions_with_retries;
use crate::record::VersionRecord;

/// Lazily pages through `ListObjectVersions` under one prefix, emitting every
/// version and delete marker the store reports. The next page is requested
/// only once the current page has been drained downstream, so a slow consumer
/// never piles up buffered pages.
///
/// Within a page, real versions are emitted before delete markers; the
/// selector re-sorts per key, so only equal-timestamp ties observe this
/// order.
pub fn stream_versions<'a>(
    s3_client: &'a Client,
    bucket: &'a str,
    prefix: String,
    cancel: &'a CancellationToken,
) -> impl Stream<Item = Result<VersionRecord, RestoreError>> + 'a {
    try_stream! {
        let mut key_marker: Option<String> = None;
        let mut version_id_marker: Option<String> = None;
        loop {
            let page = list_versions_with_retries(
                s3_client,
                bucket,
                &prefix,
                key_marker.take(),
                version_id_marker.take(),
                cancel,
            )
            .await?;

            for version in page.versions() {
                yield version_record(
                    bucket,
                    version.key(),
                    version.version_id(),
                    version.last_modified().cloned(),
                    false,
                )?;
            }
            for marker in page.delete_markers() {
                yield version_record(
                    bucket,
                    marker.key(),
                    marker.version_id(),
                    marker.last_modified().cloned(),
                    true,
                )?;
            }

            if page.is_truncated() != Some(true) {
                break;
            }
            key_marker = page.next_key_marker().map(str::to_owned);
            version_id_marker = page.next_version_id_marker().map(str::to_owned);
            if key_marker.is_none() && version_id_marker.is_none() {
                Err(RestoreError::Other(anyhow::anyhow!(
                    "truncated ListObjectVersions response for prefix {prefix:?} carries \
                     neither next_key_marker nor next_version_id_marker"
                )))?;
            }
        }
    }
}

fn version_record(
    bucket: &str,
    key: Option<&str>,
    version_id: Option<&str>,
    last_modified: Option<aws_sdk_s3::primitives::DateTime>,
    delete_marker: bool,
) -> Result<VersionRecord, RestoreError> {
    fn convert(
        bucket: &str,
        key: Option<&str>,
        version_id: Option<&str>,
        last_modified: Option<aws_sdk_s3::primitives::DateTime>,
        delete_marker: bool,
    ) -> anyhow::Result<VersionRecord> {
        let key = key.context("version summary without a key")?;
        let last_modified = last_modified
            .map(|t| -> anyhow::Result<DateTime<Utc>> {
                let millis = t
                    .to_millis()
                    .with_context(|| format!("timestamp of key {key:?} overflows milliseconds"))?;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .with_context(|| format!("timestamp {millis}ms of key {key:?} out of range"))
            })
            .transpose()?;
        Ok(VersionRecord {
            key: key.to_owned(),
            bucket_name: bucket.to_owned(),
            version_id: version_id.map(str::to_owned),
            last_modified,
            delete_marker,
            is_current: false,
        })
    }
    convert(bucket, key, version_id, last_modified, delete_marker).map_err(RestoreError::Other)
}
