//! Per-job options shared by the three transfer modes.
use crate::checkpoint;
use crate::remote::InitiateOptions;
use std::path::{Path, PathBuf};

/// Checkpointing configuration for one transfer.
///
/// With checkpointing enabled the engine persists its progress after every
/// part, and a later invocation with the same arguments resumes instead of
/// starting over.  Without it a failed transfer releases its server-side
/// session immediately and a retry re-transfers everything.
#[derive(Clone, Debug)]
pub struct CheckpointOptions {
    path: Option<PathBuf>,
}

impl CheckpointOptions {
    /// Enable checkpointing at the default location: the local file path plus
    /// `.cp` for uploads and downloads, the base name of the destination key
    /// plus `.cp` for copies.
    pub fn enabled() -> Self {
        Self { path: None }
    }

    /// Enable checkpointing with an explicit checkpoint file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub(crate) fn resolve(&self, default_base: &Path) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => checkpoint::default_path(default_base),
        }
    }
}

/// The option set every job builder carries.  Builders expose these through
/// their own methods; this struct just keeps the plumbing in one place.
#[derive(Clone, Debug)]
pub(crate) struct JobOptions {
    pub routines: usize,
    pub checkpoint: Option<CheckpointOptions>,
    pub verify_crc: bool,
    pub initiate: InitiateOptions,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            routines: 1,
            checkpoint: None,
            verify_crc: true,
            initiate: InitiateOptions::default(),
        }
    }
}
