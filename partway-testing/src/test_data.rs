//! Local test fixtures: random payloads and scratch files.
use crate::Result;
use rand::prelude::*;
use std::path::{Path, PathBuf};

/// A buffer of `size` random bytes.
pub fn test_bytes(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill(&mut data[..]);
    data
}

/// Write `size` random bytes to `name` under `dir`, returning the path and
/// the data for later comparison.
pub async fn test_file(dir: &Path, name: &str, size: usize) -> Result<(PathBuf, Vec<u8>)> {
    let path = dir.join(name);
    let data = test_bytes(size);

    tokio::fs::write(&path, &data).await?;

    Ok((path, data))
}
