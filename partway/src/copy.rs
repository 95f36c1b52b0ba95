//! Server-side multipart copy between buckets.
//!
//! No object data flows through the client: each part is an
//! `UploadPartCopy` naming an inclusive byte range of the source object, and
//! the service moves the bytes itself.  Everything else (resume, the worker
//! pool, the abort rules) matches the upload path, with the source
//! fingerprint taken from a HEAD of the source object instead of a local
//! stat.
use crate::checkpoint::{self, Checkpoint, Session, SourceFingerprint, COPY_CP_MAGIC};
use crate::config::{CheckpointOptions, JobOptions};
use crate::error::{self, Result};
use crate::plan::{self, Part};
use crate::pool::{PartWorker, WorkerPool};
use crate::progress::{NoProgress, ProgressListener, ProgressTally};
use crate::remote::{InitiateOptions, ObjectMeta, PartToken, Remote};
use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug)]
pub struct CopyJobBuilder {
    src_remote: Box<dyn Remote>,
    src_key: String,
    dest_remote: Box<dyn Remote>,
    dest_key: String,
    part_size: u64,
    options: JobOptions,
}

impl CopyJobBuilder {
    /// Start describing a copy of `src_key` (in the bucket `src_remote` is
    /// scoped to) onto `dest_key` (in `dest_remote`'s bucket), in parts of
    /// `part_size` bytes.
    pub fn new(
        src_remote: Box<dyn Remote>,
        src_key: impl Into<String>,
        dest_remote: Box<dyn Remote>,
        dest_key: impl Into<String>,
        part_size: u64,
    ) -> Self {
        Self {
            src_remote,
            src_key: src_key.into(),
            dest_remote,
            dest_key: dest_key.into(),
            part_size,
            options: JobOptions::default(),
        }
    }

    /// Number of concurrent part copies.  Clamped to `[1, 100]`; default 1.
    pub fn routines(mut self, routines: usize) -> Self {
        self.options.routines = routines;
        self
    }

    /// Enable resume from a checkpoint file.
    pub fn checkpoint(mut self, checkpoint: CheckpointOptions) -> Self {
        self.options.checkpoint = Some(checkpoint);
        self
    }

    /// Whether to compare the source object's CRC-64 against the copy's
    /// after commit.  Default true.
    pub fn verify_crc(mut self, verify: bool) -> Self {
        self.options.verify_crc = verify;
        self
    }

    /// Attributes for the destination object, forwarded when the multipart
    /// session is initiated.
    pub fn initiate_options(mut self, options: InitiateOptions) -> Self {
        self.options.initiate = options;
        self
    }

    /// Validate the inputs and fetch the source object's metadata.
    pub async fn build(self) -> Result<CopyJob> {
        ensure!(
            !self.src_key.is_empty() && !self.dest_key.is_empty(),
            error::InvalidObjectKeySnafu
        );
        plan::check_part_size(self.part_size)?;

        let meta = self
            .src_remote
            .head_object(&self.src_key)
            .await
            .with_context(|_| error::SourceObjectSnafu {
                bucket: self.src_remote.bucket().to_owned(),
                key: self.src_key.clone(),
            })?;

        Ok(CopyJob {
            src_remote: self.src_remote,
            src_key: self.src_key,
            dest_remote: self.dest_remote,
            dest_key: self.dest_key,
            part_size: self.part_size,
            meta,
            options: self.options,
        })
    }
}

/// A fully validated copy, ready to run.
#[derive(Debug)]
pub struct CopyJob {
    src_remote: Box<dyn Remote>,
    src_key: String,
    dest_remote: Box<dyn Remote>,
    dest_key: String,
    part_size: u64,
    meta: ObjectMeta,
    options: JobOptions,
}

impl CopyJob {
    /// Size of the source object in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.meta.size
    }

    /// Alternative to [`Self::run`] for callers that do not care about
    /// progress information.
    pub async fn run_without_progress(self) -> Result<()> {
        self.run(NoProgress).await
    }

    /// Run the copy to completion, reporting progress to `listener`.
    pub async fn run<P>(self, listener: P) -> Result<()>
    where
        P: ProgressListener + 'static,
    {
        let span = info_span!(
            "copy",
            src_bucket = self.src_remote.bucket(),
            src_key = %self.src_key,
            dest_bucket = self.dest_remote.bucket(),
            dest_key = %self.dest_key,
        );

        async move {
            info!(
                size = self.meta.size,
                part_size = self.part_size,
                "starting multipart copy"
            );

            let listener: Arc<dyn ProgressListener> = Arc::new(listener);

            let fingerprint = SourceFingerprint {
                size: self.meta.size,
                last_modified: self.meta.last_modified.clone(),
                etag: self.meta.etag.clone(),
            };

            // The default checkpoint location is derived from the base name
            // of the destination key, since there is no local file involved.
            let default_base = Path::new(&self.dest_key)
                .file_name()
                .map(Path::new)
                .unwrap_or_else(|| Path::new(&self.dest_key))
                .to_owned();
            let checkpoint_path = self
                .options
                .checkpoint
                .as_ref()
                .map(|options| options.resolve(&default_base));

            let prior = match &checkpoint_path {
                Some(path) => checkpoint::load_valid(path, COPY_CP_MAGIC, &fingerprint).await,
                None => None,
            };

            let mut record = match prior {
                Some(record) => record,
                None => {
                    let parts = plan::plan(self.meta.size, self.part_size)?;

                    let upload_id = self
                        .dest_remote
                        .initiate_multipart(&self.dest_key, &self.options.initiate)
                        .await
                        .with_context(|_| error::RemoteSnafu {
                            operation: "InitiateMultipartUpload",
                            key: self.dest_key.clone(),
                        })?;

                    debug!(upload_id = %upload_id, parts = parts.len(), "initiated multipart session");

                    let mut record = Checkpoint::new(
                        COPY_CP_MAGIC,
                        fingerprint,
                        Session::Copy {
                            src_bucket: self.src_remote.bucket().to_owned(),
                            src_key: self.src_key.clone(),
                            dest_bucket: self.dest_remote.bucket().to_owned(),
                            dest_key: self.dest_key.clone(),
                            upload_id,
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
                .expect("BUG: copy sessions always carry an upload id")
                .to_owned();

            let todo = record.todo_parts();
            let total_bytes = record.total_bytes();
            let mut tally = ProgressTally::new(listener, record.completed_bytes(), total_bytes);
            tally.started();

            let worker = Arc::new(CopyPartWorker {
                remote: self.dest_remote.clone(),
                dest_key: self.dest_key.clone(),
                upload_id: upload_id.clone(),
                src_bucket: self.src_remote.bucket().to_owned(),
                src_key: self.src_key.clone(),
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
                            self.abort_session(&upload_id).await;
                        }

                        return Err(transfer_error);
                    }
                }
            }

            let tokens = record.tokens();
            debug!(parts = tokens.len(), "completing multipart copy");

            let output = match self
                .dest_remote
                .complete_multipart(&self.dest_key, &upload_id, &tokens)
                .await
            {
                Ok(output) => output,
                Err(complete_error) => {
                    tally.failed();

                    if checkpoint_path.is_none() {
                        self.abort_session(&upload_id).await;
                    }

                    return Err(complete_error).context(error::RemoteSnafu {
                        operation: "CompleteMultipartUpload",
                        key: self.dest_key.clone(),
                    });
                }
            };

            if let Some(path) = &checkpoint_path {
                checkpoint::discard(path).await;
            }

            if self.options.verify_crc {
                // Whole-object copy, so the destination's CRC must equal the
                // source's when the service reports both.
                if let (Some(expected), Some(actual)) = (self.meta.crc64, output.crc64) {
                    if expected != actual {
                        tally.failed();
                        return error::CrcMismatchSnafu { expected, actual }.fail();
                    }
                }
            }

            tally.completed();
            info!(etag = %output.etag, "multipart copy committed");

            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn abort_session(&self, upload_id: &str) {
        if let Err(abort_error) = self
            .dest_remote
            .abort_multipart(&self.dest_key, upload_id)
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

/// Issues one `UploadPartCopy` per part against the destination session.
struct CopyPartWorker {
    remote: Box<dyn Remote>,
    dest_key: String,
    upload_id: String,
    src_bucket: String,
    src_key: String,
}

#[async_trait]
impl PartWorker for CopyPartWorker {
    type Job = Part;
    type Output = PartToken;

    async fn transfer(&self, part: Part) -> Result<PartToken> {
        debug!(
            number = part.number,
            offset = part.offset,
            size = part.size,
            "copying part"
        );

        let copy_context = || error::RemoteSnafu {
            operation: "UploadPartCopy",
            key: self.dest_key.clone(),
        };

        if part.size == 0 {
            // A zero-length source cannot be expressed as a copy range, so
            // the single empty part is uploaded directly.
            return self
                .remote
                .upload_part(&self.dest_key, &self.upload_id, part.number, Bytes::new())
                .await
                .with_context(|_| copy_context());
        }

        self.remote
            .upload_part_copy(
                &self.dest_key,
                &self.upload_id,
                part.number,
                &self.src_bucket,
                &self.src_key,
                part.copy_range(),
            )
            .await
            .with_context(|_| copy_context())
    }
}
