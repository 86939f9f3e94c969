use anyhow::Context;
use camino::Utf8Path;

use crate::error::RestoreError;

/// Reads the listing prefixes for one run: one prefix per line, in file
/// order, empty lines skipped. Without an input file the whole source prefix
/// is listed as a single unit of work, represented by one empty prefix.
///
/// An unreadable file fails the run before any listing starts.
pub async fn read_prefixes(path: Option<&Utf8Path>) -> Result<Vec<String>, RestoreError> {
    let Some(path) = path else {
        return Ok(vec![String::new()]);
    };
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read prefix file {path}"))
        .map_err(RestoreError::BadInput)?;
    Ok(contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}
