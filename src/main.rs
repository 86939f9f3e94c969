use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use clap::Parser;
use s3_restore::pipeline::RestorePipeline;
use s3_restore::{init_logging, init_s3_client, RestoreConfig, S3Uri, CLI_NAME};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Restores a versioned bucket prefix to the state it had at a given point
/// in time: newer versions are overwritten with the version in effect at the
/// restore time, deleted objects are resurrected, and objects that did not
/// exist yet can optionally be deleted.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help(true))]
struct Cli {
    /// Source bucket and prefix, `s3://bucket[/prefix]` or `s3n://…`.
    #[arg(long)]
    src: S3Uri,

    /// Point in time the destination should reflect, as an ISO-8601
    /// timestamp, e.g. `2024-06-01T00:00:00Z`.
    #[arg(long, value_parser = parse_restore_time)]
    restore_time: DateTime<Utc>,

    /// Destination bucket and prefix; defaults to `--src` (in-place restore).
    #[arg(long)]
    dest: Option<S3Uri>,

    /// File with one listing prefix per line, to fan the listing stage out.
    #[arg(long)]
    prefixes: Option<Utf8PathBuf>,

    /// Directory for intermediate stage outputs; a fresh temporary directory
    /// by default.
    #[arg(long)]
    version_info_output: Option<Utf8PathBuf>,

    /// Delete destination objects whose key did not exist at the restore
    /// time.
    #[arg(long, default_value_t = false)]
    delete: bool,

    /// Parallel worker slots.
    #[arg(long = "concurrency", short = 'j', default_value_t = 8)]
    concurrency: usize,
}

fn parse_restore_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("cannot parse restore time {s:?} as an ISO-8601 timestamp"))?;
    Ok(parsed.with_timezone(&Utc))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let delete_suffix = if cli.delete { "_delete" } else { "" };
    let _guard = init_logging(&format!(
        "{}_{}_{}{}.log",
        CLI_NAME,
        cli.src.bucket,
        Utc::now().format("%Y_%m_%d__%H_%M_%S"),
        delete_suffix,
    ));

    let config = RestoreConfig::new(&cli.src, cli.dest.as_ref(), cli.restore_time, cli.delete);
    if config.delete {
        warn!(
            "Deletions enabled: keys missing at {} will be removed from the destination",
            config.restore_time
        );
    } else {
        info!(
            "Deletions disabled: keys missing at {} are left in place",
            config.restore_time
        );
    }
    info!(
        "Restoring s3://{}/{} to its state at {} into s3://{}/{}",
        config.src_bucket,
        config.src_prefix,
        config.restore_time,
        config.dest_bucket,
        config.dest_prefix
    );

    let workspace = match &cli.version_info_output {
        Some(dir) => dir.clone(),
        None => {
            let tmp = std::env::temp_dir().join(format!(
                "{CLI_NAME}_{}",
                Utc::now().format("%Y_%m_%d__%H_%M_%S")
            ));
            Utf8PathBuf::from_path_buf(tmp)
                .map_err(|p| anyhow::anyhow!("temp dir {} is not valid UTF-8", p.display()))?
        }
    };

    let s3_client = Arc::new(init_s3_client().await);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing the current step");
                cancel.cancel();
            }
        });
    }

    let pipeline = RestorePipeline::new(config, s3_client, workspace, cli.concurrency, cancel);
    let summary = pipeline
        .run(cli.prefixes.as_deref())
        .await
        .context("restore pipeline")?;

    if summary.has_failures() {
        warn!(
            "{} keys failed to restore; see the restored outputs in {}",
            summary.failed.len(),
            pipeline.workspace()
        );
    }
    println!("{}", summary.summary_string());
    Ok(())
}
