//! Stage-to-stage repartitioning. Records are length-delimited `(key, value)`
//! pairs appended to a fixed set of shard files; the shard is chosen by
//! hashing the key, which both randomizes worker assignment (no worker
//! serializes on one hot prefix) and keeps all records of one key in one
//! shard so the selector sees complete version groups.

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use twox_hash::xxh3;

use crate::error::RestoreError;

pub fn encode_record(key: &str, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + key.len() + value.len());
    buf.put_u32(key.len() as u32);
    buf.put_slice(key.as_bytes());
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
    buf.freeze()
}

pub fn decode_records(mut buf: Bytes) -> Result<Vec<(String, Bytes)>, RestoreError> {
    let mut records = Vec::new();
    while buf.has_remaining() {
        let key = get_chunk(&mut buf)?;
        let key = String::from_utf8(key.to_vec())
            .context("shuffle record key is not UTF-8")
            .map_err(RestoreError::Other)?;
        let value = get_chunk(&mut buf)?;
        records.push((key, value));
    }
    Ok(records)
}

fn get_chunk(buf: &mut Bytes) -> Result<Bytes, RestoreError> {
    fn get_chunk_inner(buf: &mut Bytes) -> anyhow::Result<Bytes> {
        anyhow::ensure!(buf.remaining() >= 4, "truncated shuffle record length");
        let len = buf.get_u32() as usize;
        anyhow::ensure!(buf.remaining() >= len, "truncated shuffle record body");
        Ok(buf.split_to(len))
    }
    get_chunk_inner(buf).map_err(RestoreError::Other)
}

/// Appends records to `shard_count` shard files. Shared between workers; each
/// shard file sits behind its own async mutex so appends stay whole.
pub struct ShuffleWriter {
    shards: Vec<Mutex<BufWriter<fs::File>>>,
    paths: Vec<Utf8PathBuf>,
}

impl ShuffleWriter {
    pub async fn create(
        dir: &Utf8Path,
        stem: &str,
        shard_count: usize,
    ) -> anyhow::Result<Self> {
        let mut shards = Vec::with_capacity(shard_count);
        let mut paths = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let path = dir.join(format!("{stem}_{shard:04}.bin"));
            let file = fs::File::create(&path)
                .await
                .with_context(|| format!("create shuffle shard {path}"))?;
            shards.push(Mutex::new(BufWriter::new(file)));
            paths.push(path);
        }
        Ok(Self { shards, paths })
    }

    pub fn shard_of(&self, key: &str) -> usize {
        (xxh3::hash64(key.as_bytes()) % self.shards.len() as u64) as usize
    }

    pub async fn write(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let record = encode_record(key, value);
        let shard = self.shard_of(key);
        let mut writer = self.shards[shard].lock().await;
        writer
            .write_all(&record)
            .await
            .with_context(|| format!("append to shuffle shard {}", self.paths[shard]))
    }

    /// Flushes every shard and hands back their paths for the next stage.
    pub async fn finish(self) -> anyhow::Result<Vec<Utf8PathBuf>> {
        for (writer, path) in self.shards.iter().zip(&self.paths) {
            let mut writer = writer.lock().await;
            writer
                .flush()
                .await
                .with_context(|| format!("flush shuffle shard {path}"))?;
        }
        Ok(self.paths)
    }
}

pub async fn read_shard(path: &Utf8Path) -> Result<Vec<(String, Bytes)>, RestoreError> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("read shuffle shard {path}"))
        .map_err(RestoreError::Other)?;
    decode_records(Bytes::from(bytes))
}
