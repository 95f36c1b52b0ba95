//! Multipart upload of a local file.
//!
//! The caller builds an [`UploadJob`] with [`UploadJobBuilder`], then calls
//! [`UploadJob::run`] with a progress listener (or
//! [`run_without_progress`](UploadJob::run_without_progress)).  The job
//! fingerprints the source, resumes from a valid checkpoint or initiates a
//! fresh multipart session, drives the unfinished parts through the worker
//! pool, and commits.  With checkpointing enabled a failed run leaves both
//! the checkpoint file and the server-side session in place so the next
//! invocation picks up where this one stopped; without it the session is
//! aborted so orphaned parts do not linger on the server.
use crate::checkpoint::{self, Checkpoint, Session, SourceFingerprint, UPLOAD_CP_MAGIC};
use crate::config::{CheckpointOptions, JobOptions};
use crate::error::{self, Result};
use crate::integrity;
use crate::plan::{self, Part};
use crate::pool::{PartWorker, WorkerPool};
use crate::progress::{NoProgress, ProgressListener, ProgressTally};
use crate::remote::{InitiateOptions, PartToken, Remote};
use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug)]
pub struct UploadJobBuilder {
    remote: Box<dyn Remote>,
    object_key: String,
    file_path: PathBuf,
    part_size: u64,
    options: JobOptions,
}

impl UploadJobBuilder {
    /// Start describing an upload of `file_path` to `object_key` in the
    /// bucket `remote` is scoped to, split into parts of `part_size` bytes.
    pub fn new(
        remote: Box<dyn Remote>,
        object_key: impl Into<String>,
        file_path: impl Into<PathBuf>,
        part_size: u64,
    ) -> Self {
        Self {
            remote,
            object_key: object_key.into(),
            file_path: file_path.into(),
            part_size,
            options: JobOptions::default(),
        }
    }

    /// Number of concurrent part transfers.  Clamped to `[1, 100]`;
    /// default 1.
    pub fn routines(mut self, routines: usize) -> Self {
        self.options.routines = routines;
        self
    }

    /// Enable resume from a checkpoint file.
    pub fn checkpoint(mut self, checkpoint: CheckpointOptions) -> Self {
        self.options.checkpoint = Some(checkpoint);
        self
    }

    /// Whether to compare the local CRC-64 against the service's after
    /// commit.  Default true.
    pub fn verify_crc(mut self, verify: bool) -> Self {
        self.options.verify_crc = verify;
        self
    }

    /// Object attributes (content type, ACL, user metadata, ...) forwarded
    /// when the multipart session is initiated.
    pub fn initiate_options(mut self, options: InitiateOptions) -> Self {
        self.options.initiate = options;
        self
    }

    /// Validate the inputs and stat the source file, but don't start
    /// transferring yet.
    pub async fn build(self) -> Result<UploadJob> {
        ensure!(!self.object_key.is_empty(), error::InvalidObjectKeySnafu);
        plan::check_part_size(self.part_size)?;

        let metadata = tokio::fs::metadata(&self.file_path)
            .await
            .with_context(|_| error::SourceFileSnafu {
                path: self.file_path.clone(),
            })?;

        // The mtime is carried as an opaque nanosecond timestamp string in
        // the fingerprint; only equality matters.
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since_epoch| since_epoch.as_nanos().to_string())
            .unwrap_or_default();

        Ok(UploadJob {
            remote: self.remote,
            object_key: self.object_key,
            file_path: self.file_path,
            part_size: self.part_size,
            size: metadata.len(),
            mtime,
            options: self.options,
        })
    }
}

/// A fully validated upload, ready to run.
#[derive(Debug)]
pub struct UploadJob {
    remote: Box<dyn Remote>,
    object_key: String,
    file_path: PathBuf,
    part_size: u64,
    size: u64,
    mtime: String,
    options: JobOptions,
}

impl UploadJob {
    /// Size of the source file in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.size
    }

    /// Alternative to [`Self::run`] for callers that do not care about
    /// progress information.
    pub async fn run_without_progress(self) -> Result<()> {
        self.run(NoProgress).await
    }

    /// Run the upload to completion, reporting progress to `listener`.
    ///
    /// Returns once the object has been committed (and any checkpoint file
    /// removed), or with the first terminal error.  There is no
    /// partial-success return: a checkpointed failure is retried by simply
    /// invoking the same upload again.
    pub async fn run<P>(self, listener: P) -> Result<()>
    where
        P: ProgressListener + 'static,
    {
        let span = info_span!(
            "upload",
            bucket = self.remote.bucket(),
            object_key = %self.object_key,
            file = %self.file_path.display(),
        );

        async move {
            info!(
                size = self.size,
                part_size = self.part_size,
                "starting multipart upload"
            );

            let listener: Arc<dyn ProgressListener> = Arc::new(listener);

            // One pass over the source yields both the fingerprint MD5 and
            // the CRC-64 compared against the service after commit.
            let sums =
                integrity::file_sums(&self.file_path)
                    .await
                    .with_context(|_| error::SourceFileSnafu {
                        path: self.file_path.clone(),
                    })?;

            let fingerprint = SourceFingerprint {
                size: self.size,
                last_modified: self.mtime.clone(),
                etag: sums.md5.clone(),
            };

            let checkpoint_path = self
                .options
                .checkpoint
                .as_ref()
                .map(|options| options.resolve(&self.file_path));

            let prior = match &checkpoint_path {
                Some(path) => checkpoint::load_valid(path, UPLOAD_CP_MAGIC, &fingerprint).await,
                None => None,
            };

            let mut record = match prior {
                Some(record) => record,
                None => {
                    let parts = plan::plan(self.size, self.part_size)?;

                    let upload_id = self
                        .remote
                        .initiate_multipart(&self.object_key, &self.options.initiate)
                        .await
                        .with_context(|_| error::RemoteSnafu {
                            operation: "InitiateMultipartUpload",
                            key: self.object_key.clone(),
                        })?;

                    debug!(upload_id = %upload_id, parts = parts.len(), "initiated multipart session");

                    let mut record = Checkpoint::new(
                        UPLOAD_CP_MAGIC,
                        fingerprint,
                        Session::Upload {
                            object_key: self.object_key.clone(),
                            upload_id,
                            file_path: self.file_path.clone(),
                        },
                        parts,
                    );

                    if let Some(path) = &checkpoint_path {
                        checkpoint::save(path, &mut record).await?;
                    }

                    record
                }
            };

            let upload_id = record
                .upload_id()
                .expect("BUG: upload sessions always carry an upload id")
                .to_owned();

            let todo = record.todo_parts();
            let total_bytes = record.total_bytes();
            let mut tally =
                ProgressTally::new(listener, record.completed_bytes(), total_bytes);
            tally.started();

            debug!(
                todo = todo.len(),
                of = record.parts.len(),
                "scheduling unfinished parts"
            );

            let worker = Arc::new(UploadPartWorker {
                remote: self.remote.clone(),
                object_key: self.object_key.clone(),
                upload_id: upload_id.clone(),
                file_path: self.file_path.clone(),
            });
            let mut pool = WorkerPool::start(worker, todo.clone(), self.options.routines);

            for _ in 0..todo.len() {
                match pool.next_success().await {
                    Ok(token) => {
                        let part_bytes = record.part_size(token.number);
                        record.update_part(token);

                        if let Some(path) = &checkpoint_path {
                            if let Err(save_error) = checkpoint::save(path, &mut record).await {
                                pool.cancel();
                                tally.failed();
                                return Err(save_error);
                            }
                        }

                        tally.data(part_bytes);
                    }
                    Err(transfer_error) => {
                        tally.failed();

                        if checkpoint_path.is_none() {
                            // No checkpoint means no resume; release the
                            // session instead of leaving orphaned parts
                            // accruing storage on the server.
                            self.abort_session(&upload_id).await;
                        }

                        return Err(transfer_error);
                    }
                }
            }

            let tokens = record.tokens();
            debug!(parts = tokens.len(), "completing multipart upload");

            let output = match self
                .remote
                .complete_multipart(&self.object_key, &upload_id, &tokens)
                .await
            {
                Ok(output) => output,
                Err(complete_error) => {
                    tally.failed();

                    // A checkpointed run keeps the session so a retry can go
                    // straight back to Complete.
                    if checkpoint_path.is_none() {
                        self.abort_session(&upload_id).await;
                    }

                    return Err(complete_error).context(error::RemoteSnafu {
                        operation: "CompleteMultipartUpload",
                        key: self.object_key.clone(),
                    });
                }
            };

            if let Some(path) = &checkpoint_path {
                checkpoint::discard(path).await;
            }

            if self.options.verify_crc {
                if let Some(expected) = output.crc64 {
                    // The object is already committed at this point; a
                    // mismatch tells the caller the service assembled
                    // something other than what we read locally.
                    if expected != sums.crc64 {
                        tally.failed();
                        return error::CrcMismatchSnafu {
                            expected,
                            actual: sums.crc64,
                        }
                        .fail();
                    }
                }
            }

            tally.completed();
            info!(etag = %output.etag, "multipart upload committed");

            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn abort_session(&self, upload_id: &str) {
        if let Err(abort_error) = self
            .remote
            .abort_multipart(&self.object_key, upload_id)
            .await
        {
            warn!(
                upload_id,
                error = %abort_error,
                "could not abort multipart session after failure"
            );
        }
    }
}

/// Transfers one part: open an independent handle on the source, seek to the
/// part's offset, read exactly its size, and hand the bytes to the remote.
struct UploadPartWorker {
    remote: Box<dyn Remote>,
    object_key: String,
    upload_id: String,
    file_path: PathBuf,
}

#[async_trait]
impl PartWorker for UploadPartWorker {
    type Job = Part;
    type Output = PartToken;

    async fn transfer(&self, part: Part) -> Result<PartToken> {
        debug!(
            number = part.number,
            offset = part.offset,
            size = part.size,
            "uploading part"
        );

        let body = read_part(&self.file_path, &part).await?;

        self.remote
            .upload_part(&self.object_key, &self.upload_id, part.number, body)
            .await
            .with_context(|_| error::RemoteSnafu {
                operation: "UploadPart",
                key: self.object_key.clone(),
            })
    }
}

async fn read_part(path: &Path, part: &Part) -> Result<Bytes> {
    let read_context = || error::PartReadSnafu {
        number: part.number,
        path: path.to_owned(),
    };

    let mut file = File::open(path).await.with_context(|_| read_context())?;
    file.seek(SeekFrom::Start(part.offset))
        .await
        .with_context(|_| read_context())?;

    let mut buffer = vec![0u8; part.size as usize];
    file.read_exact(&mut buffer)
        .await
        .with_context(|_| read_context())?;

    Ok(Bytes::from(buffer))
}
