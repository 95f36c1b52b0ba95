//! The durable record that lets an interrupted transfer resume: the part
//! plan, per-part progress, and a fingerprint of the source, protected by a
//! self-MD5 so tampering and truncation are detectable from the file alone.
//!
//! The record is plain JSON.  The `parts`, `part_status` and `part_tokens`
//! arrays are co-indexed; `self_md5` is the base64 MD5 of the record
//! serialized with that one field blanked.  A checkpoint is only trusted when
//! its magic matches the transfer mode, the self-MD5 round-trips, and the
//! fingerprint still matches the source; anything else is discarded and the
//! transfer restarts from nothing.
use crate::error::{self, Result};
use crate::plan::Part;
use crate::remote::{PartToken, Remote};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub(crate) const UPLOAD_CP_MAGIC: &str = "FE8BB4EA-B593-4FAC-AD7A-2459A36E2E62";
pub(crate) const DOWNLOAD_CP_MAGIC: &str = "92611BED-89E2-46B6-89E5-72F273D4B0A3";
pub(crate) const COPY_CP_MAGIC: &str = "84F1F18C-FF1D-403B-A1D8-9DEB5F65910A";

const CHECKPOINT_SUFFIX: &str = ".cp";

/// Evidence that the source a prior run was transferring is still the same
/// bytes.
///
/// For uploads this is the local file's size, its mtime as a nanosecond
/// timestamp rendered to a string, and the streamed MD5 of its contents.  For
/// downloads and copies it is the size, `Last-Modified` string and ETag from
/// a HEAD of the remote source.  All three fields are compared as opaque
/// values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SourceFingerprint {
    pub size: u64,
    pub last_modified: String,
    /// ETag for remote sources; for a local file, the base64 MD5 of its
    /// contents (the same digest the service would call the ETag).
    pub etag: String,
}

/// The mode-specific identity of the transfer session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Session {
    Upload {
        object_key: String,
        upload_id: String,
        file_path: PathBuf,
    },
    Download {
        object_key: String,
        file_path: PathBuf,
    },
    Copy {
        src_bucket: String,
        src_key: String,
        dest_bucket: String,
        dest_key: String,
        upload_id: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    pub magic: String,
    pub self_md5: String,
    pub source_fingerprint: SourceFingerprint,
    pub session: Session,
    pub parts: Vec<Part>,
    pub part_status: Vec<bool>,
    pub part_tokens: Vec<PartToken>,
}

impl Checkpoint {
    pub(crate) fn new(
        magic: &str,
        source_fingerprint: SourceFingerprint,
        session: Session,
        parts: Vec<Part>,
    ) -> Self {
        let count = parts.len();

        Self {
            magic: magic.to_owned(),
            self_md5: String::new(),
            source_fingerprint,
            session,
            parts,
            part_status: vec![false; count],
            part_tokens: vec![PartToken::default(); count],
        }
    }

    /// The parts a resumed run still has to transfer, in plan order.
    pub(crate) fn todo_parts(&self) -> Vec<Part> {
        self.parts
            .iter()
            .zip(&self.part_status)
            .filter(|(_, done)| !**done)
            .map(|(part, _)| *part)
            .collect()
    }

    pub(crate) fn completed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .zip(&self.part_status)
            .filter(|(_, done)| **done)
            .map(|(part, _)| part.size)
            .sum()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|part| part.size).sum()
    }

    /// Record a finished part.  The token lands in the slot its number names;
    /// completion order does not matter.
    pub(crate) fn update_part(&mut self, token: PartToken) {
        let index = (token.number - 1) as usize;
        self.part_status[index] = true;
        self.part_tokens[index] = token;
    }

    pub(crate) fn part_size(&self, number: u32) -> u64 {
        self.parts[(number - 1) as usize].size
    }

    /// All tokens, sorted by part number ascending, ready for `Complete`.
    pub(crate) fn tokens(&self) -> Vec<PartToken> {
        let mut tokens = self.part_tokens.clone();
        tokens.sort_unstable_by_key(|token| token.number);
        tokens
    }

    pub(crate) fn upload_id(&self) -> Option<&str> {
        match &self.session {
            Session::Upload { upload_id, .. } | Session::Copy { upload_id, .. } => Some(upload_id),
            Session::Download { .. } => None,
        }
    }

    /// Whether this record can be trusted for a resume against the given
    /// mode and source.
    pub(crate) fn is_valid(&self, magic: &str, fingerprint: &SourceFingerprint) -> bool {
        // The arrays are co-indexed, so a record that lost that shape is
        // corrupt no matter what its digest says.
        if self.parts.len() != self.part_status.len() || self.parts.len() != self.part_tokens.len()
        {
            return false;
        }

        self.magic == magic
            && self.self_md5 == self.digest()
            && &self.source_fingerprint == fingerprint
    }

    /// MD5 over the canonical JSON of this record with `self_md5` blanked,
    /// encoded as standard base64.
    fn digest(&self) -> String {
        let mut blank = self.clone();
        blank.self_md5 = String::new();

        let serialized =
            serde_json::to_vec(&blank).expect("BUG: checkpoint records always serialize");

        base64::encode(Md5::digest(serialized))
    }
}

/// The default checkpoint location when the caller enabled checkpointing
/// without naming a path.
pub(crate) fn default_path(base: &Path) -> PathBuf {
    let mut path = OsString::from(base.as_os_str());
    path.push(CHECKPOINT_SUFFIX);
    PathBuf::from(path)
}

/// Read a checkpoint from disk.  Any I/O or parse problem means "no
/// checkpoint"; a file that exists but does not parse is removed so it cannot
/// shadow future runs.
pub(crate) async fn load(path: &Path) -> Option<Checkpoint> {
    let contents = tokio::fs::read(path).await.ok()?;

    match serde_json::from_slice(&contents) {
        Ok(record) => Some(record),
        Err(error) => {
            warn!(path = %path.display(), %error, "removing malformed checkpoint file");
            let _ = tokio::fs::remove_file(path).await;
            None
        }
    }
}

/// Load a checkpoint and keep it only if it validates against the expected
/// mode and the current source.  An invalid record is deleted.
pub(crate) async fn load_valid(
    path: &Path,
    magic: &str,
    fingerprint: &SourceFingerprint,
) -> Option<Checkpoint> {
    let record = load(path).await?;

    if record.is_valid(magic, fingerprint) {
        debug!(path = %path.display(), "resuming from checkpoint");
        Some(record)
    } else {
        debug!(path = %path.display(), "discarding checkpoint that no longer matches the source");
        let _ = tokio::fs::remove_file(path).await;
        None
    }
}

/// Persist the record atomically: seal the self-MD5, write the whole record
/// to a sibling temp file, fsync, and rename over the target.  The file on
/// disk is never partially updated.
pub(crate) async fn save(path: &Path, record: &mut Checkpoint) -> Result<()> {
    record.self_md5 = record.digest();

    let serialized = serde_json::to_vec(record).context(error::CheckpointEncodeSnafu)?;

    let mut temp_path = OsString::from(path.as_os_str());
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let save_context = || error::CheckpointSaveSnafu {
        path: path.to_owned(),
    };

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .with_context(|_| save_context())?;
    file.write_all(&serialized)
        .await
        .with_context(|_| save_context())?;
    file.sync_all().await.with_context(|_| save_context())?;
    drop(file);

    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|_| save_context())?;

    Ok(())
}

/// Best-effort removal of the checkpoint file once a transfer has committed.
pub(crate) async fn discard(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), %error, "could not remove checkpoint file");
    }
}

/// Delete a checkpoint file *and* release the multipart session it records.
///
/// A checkpointed upload or copy that fails keeps its session alive on the
/// server so a later run can resume it.  If the caller decides it will never
/// retry, those stored parts sit on the server indefinitely; this operation
/// cleans up both sides.  `remote` must be a handle on the destination
/// bucket.  A session the server no longer knows about is not an error.
pub async fn purge_checkpoint(remote: &dyn Remote, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();

    if let Some(record) = load(path).await {
        let (key, upload_id) = match &record.session {
            Session::Upload {
                object_key,
                upload_id,
                ..
            } => (object_key.as_str(), Some(upload_id.as_str())),
            Session::Copy {
                dest_key,
                upload_id,
                ..
            } => (dest_key.as_str(), Some(upload_id.as_str())),
            Session::Download { object_key, .. } => (object_key.as_str(), None),
        };

        if let Some(upload_id) = upload_id {
            debug!(key, upload_id, "aborting multipart session recorded in checkpoint");

            match remote.abort_multipart(key, upload_id).await {
                Ok(()) => {}
                Err(abort_error) if abort_error.status == 404 => {
                    // Session already gone; nothing left to release.
                }
                Err(abort_error) => {
                    return Err(abort_error).context(error::RemoteSnafu {
                        operation: "AbortMultipartUpload",
                        key: key.to_owned(),
                    });
                }
            }
        }
    }

    discard(path).await;

    Ok(())
}
