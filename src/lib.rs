#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]
pub mod backoff;
pub mod error;
pub mod pipeline;
pub mod prefix_source;
pub mod record;
pub mod restore;
pub mod selector;
pub mod shuffle;
pub mod version_stream;

use std::env;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::Context;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::list_object_versions::ListObjectVersionsOutput;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::RestoreError;

pub const CLI_NAME: &str = "s3_restore";

/// ListObjectVersions page size; the store caps it at 1000 anyway.
pub const MAX_KEYS_PER_LIST_PAGE: i32 = 1000;

const WARN_THRESHOLD: u32 = 3;
const MAX_RETRIES: u32 = 10;

/// Service error codes that indicate the whole run cannot succeed, as opposed
/// to transient trouble worth retrying.
const FATAL_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "NoSuchBucket",
];

/// Bucket/prefix locator parsed from an `s3://bucket[/prefix]` (or
/// `s3n://…`) URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Uri {
    pub bucket: String,
    pub prefix: String,
}

impl FromStr for S3Uri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("s3://")
            .or_else(|| s.strip_prefix("s3n://"))
            .with_context(|| format!("URI {s:?} does not start with s3:// or s3n://"))?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix),
            None => (rest, ""),
        };
        anyhow::ensure!(!bucket.is_empty(), "URI {s:?} has an empty bucket name");
        Ok(Self {
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
        })
    }
}

impl Display for S3Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.prefix)
        }
    }
}

/// Immutable description of one restore run. Built once from the CLI and
/// shared read-only with every worker; workers never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    pub src_bucket: String,
    pub src_prefix: String,
    pub dest_bucket: String,
    pub dest_prefix: String,
    pub restore_time: DateTime<Utc>,
    pub delete: bool,
}

impl RestoreConfig {
    pub fn new(
        src: &S3Uri,
        dest: Option<&S3Uri>,
        restore_time: DateTime<Utc>,
        delete: bool,
    ) -> Self {
        let dest = dest.unwrap_or(src);
        Self {
            src_bucket: src.bucket.clone(),
            src_prefix: src.prefix.clone(),
            dest_bucket: dest.bucket.clone(),
            dest_prefix: dest.prefix.clone(),
            restore_time,
            delete,
        }
    }

    /// True when the destination is exactly the source (in-place restore).
    pub fn is_in_place(&self) -> bool {
        self.src_bucket == self.dest_bucket && self.src_prefix == self.dest_prefix
    }
}

pub fn init_logging(file_name: &str) -> Option<WorkerGuard> {
    let stderr_logs = fmt::Layer::new()
        .with_target(false)
        .with_writer(std::io::stderr);

    let disable_file_logging = match env::var("S3_RESTORE_DISABLE_FILE_LOGGING") {
        Ok(s) => s == "1" || s.to_lowercase() == "true",
        Err(_) => false,
    };

    if disable_file_logging {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stderr_logs)
            .init();
        None
    } else {
        let (file_writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never("./logs/", file_name));
        let file_logs = fmt::Layer::new()
            .with_target(false)
            .with_ansi(false)
            .with_writer(file_writer);
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stderr_logs)
            .with(file_logs)
            .init();
        Some(guard)
    }
}

/// Builds the S3 client from the default credential/region chain. `REGION`
/// overrides the region, `AWS_ENDPOINT_URL` points at S3-compatible stores.
pub async fn init_s3_client() -> Client {
    let mut loader = aws_config::defaults(BehaviorVersion::v2024_03_28());
    if let Ok(region) = env::var("REGION") {
        loader = loader.region(Region::new(region));
    }
    if let Ok(endpoint) = env::var("AWS_ENDPOINT_URL") {
        loader = loader.endpoint_url(endpoint);
    }
    let config = loader.load().await;
    Client::new(&config)
}

fn classify_sdk_error<E, R>(what: &str, err: SdkError<E, R>) -> RestoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().map(str::to_owned);
    let wrapped = anyhow::anyhow!("{what}: {}", DisplayErrorContext(err));
    match code.as_deref() {
        Some(code) if FATAL_ERROR_CODES.contains(&code) => RestoreError::Fatal(wrapped),
        _ => RestoreError::Other(wrapped),
    }
}

pub async fn list_versions_with_retries(
    s3_client: &Client,
    bucket: &str,
    prefix: &str,
    key_marker: Option<String>,
    version_id_marker: Option<String>,
    cancel: &CancellationToken,
) -> Result<ListObjectVersionsOutput, RestoreError> {
    backoff::retry(
        || async {
            s3_client
                .list_object_versions()
                .bucket(bucket)
                .prefix(prefix)
                .max_keys(MAX_KEYS_PER_LIST_PAGE)
                .set_key_marker(key_marker.clone())
                .set_version_id_marker(version_id_marker.clone())
                .send()
                .await
                .map_err(|e| classify_sdk_error("list_object_versions", e))
        },
        RestoreError::is_permanent,
        WARN_THRESHOLD,
        MAX_RETRIES,
        "list_object_versions",
        cancel,
    )
    .await
    .unwrap_or(Err(RestoreError::Cancelled))
}

/// Copies one specific source version onto the destination key. Retried: a
/// copy pinned to a version id lands the same bytes on every attempt.
pub async fn copy_object_with_retries(
    s3_client: &Client,
    src_bucket: &str,
    src_key: &str,
    src_version_id: &str,
    dest_bucket: &str,
    dest_key: &str,
    cancel: &CancellationToken,
) -> Result<(), RestoreError> {
    let copy_source = format!(
        "{src_bucket}/{}?versionId={}",
        urlencoding::encode(src_key),
        urlencoding::encode(src_version_id),
    );
    backoff::retry(
        || async {
            s3_client
                .copy_object()
                .bucket(dest_bucket)
                .key(dest_key)
                .copy_source(copy_source.clone())
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error("copy_object", e))
        },
        RestoreError::is_permanent,
        WARN_THRESHOLD,
        MAX_RETRIES,
        "copy_object",
        cancel,
    )
    .await
    .unwrap_or(Err(RestoreError::Cancelled))
}

/// Deletes one destination key. Deleting an already-absent key succeeds, so
/// retries are safe.
pub async fn delete_object_with_retries(
    s3_client: &Client,
    bucket: &str,
    key: &str,
    cancel: &CancellationToken,
) -> Result<(), RestoreError> {
    backoff::retry(
        || async {
            s3_client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify_sdk_error("delete_object", e))
        },
        RestoreError::is_permanent,
        WARN_THRESHOLD,
        MAX_RETRIES,
        "delete_object",
        cancel,
    )
    .await
    .unwrap_or(Err(RestoreError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bucket_and_prefix() {
        let uri: S3Uri = "s3://some-bucket/some/prefix".parse().unwrap();
        assert_eq!(uri.bucket, "some-bucket");
        assert_eq!(uri.prefix, "some/prefix");
    }

    #[test]
    fn parse_bucket_only() {
        let uri: S3Uri = "s3://some-bucket".parse().unwrap();
        assert_eq!(uri.bucket, "some-bucket");
        assert_eq!(uri.prefix, "");

        let uri: S3Uri = "s3://some-bucket/".parse().unwrap();
        assert_eq!(uri.prefix, "");
    }

    #[test]
    fn parse_s3n_scheme() {
        let uri: S3Uri = "s3n://other-bucket/p".parse().unwrap();
        assert_eq!(uri.bucket, "other-bucket");
        assert_eq!(uri.prefix, "p");
    }

    #[test]
    fn reject_non_s3_uris() {
        assert!("http://some-bucket/p".parse::<S3Uri>().is_err());
        assert!("some-bucket/p".parse::<S3Uri>().is_err());
        assert!("s3://".parse::<S3Uri>().is_err());
    }

    #[test]
    fn dest_defaults_to_src() {
        let src: S3Uri = "s3://bucket/prefix".parse().unwrap();
        let config = RestoreConfig::new(&src, None, Utc::now(), false);
        assert!(config.is_in_place());
        assert_eq!(config.dest_bucket, "bucket");
        assert_eq!(config.dest_prefix, "prefix");

        let dest: S3Uri = "s3://other/prefix".parse().unwrap();
        let config = RestoreConfig::new(&src, Some(&dest), Utc::now(), false);
        assert!(!config.is_in_place());
    }
}
