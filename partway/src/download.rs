//! Multipart download of a remote object to a local file.
//!
//! Download is the one mode without a server-side session: there is nothing
//! to initiate, complete, or abort.  Data lands in a `.temp` sibling of the
//! target, preallocated to the object size, with each worker writing at its
//! part's offset through its own file handle.  Only after every part is in
//! place (and the CRC, when available, checks out) is the temp file renamed
//! onto the target, so the target path never holds a partial object.  On
//! failure the temp file and checkpoint stay behind for the next run to
//! resume from.
use crate::checkpoint::{self, Checkpoint, Session, SourceFingerprint, DOWNLOAD_CP_MAGIC};
use crate::config::{CheckpointOptions, JobOptions};
use crate::error::{self, Result};
use crate::integrity;
use crate::plan::{self, Part};
use crate::pool::{PartWorker, WorkerPool};
use crate::progress::{NoProgress, ProgressListener, ProgressTally};
use crate::remote::{ObjectMeta, PartToken, Remote};
use async_trait::async_trait;
use snafu::prelude::*;
use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, info_span, Instrument};

const TEMP_FILE_SUFFIX: &str = ".temp";

#[derive(Debug)]
pub struct DownloadJobBuilder {
    remote: Box<dyn Remote>,
    object_key: String,
    file_path: PathBuf,
    part_size: u64,
    options: JobOptions,
}

impl DownloadJobBuilder {
    /// Start describing a download of `object_key` into `file_path`, fetched
    /// in parts of `part_size` bytes.
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

    /// Whether to verify the assembled file's CRC-64 against the service's
    /// before renaming it into place.  Default true.
    pub fn verify_crc(mut self, verify: bool) -> Self {
        self.options.verify_crc = verify;
        self
    }

    /// Validate the inputs and fetch the source object's metadata.
    pub async fn build(self) -> Result<DownloadJob> {
        ensure!(!self.object_key.is_empty(), error::InvalidObjectKeySnafu);
        plan::check_part_size(self.part_size)?;

        let meta = self
            .remote
            .head_object(&self.object_key)
            .await
            .with_context(|_| error::SourceObjectSnafu {
                bucket: self.remote.bucket().to_owned(),
                key: self.object_key.clone(),
            })?;

        Ok(DownloadJob {
            remote: self.remote,
            object_key: self.object_key,
            file_path: self.file_path,
            part_size: self.part_size,
            meta,
            options: self.options,
        })
    }
}

/// A fully validated download, ready to run.
#[derive(Debug)]
pub struct DownloadJob {
    remote: Box<dyn Remote>,
    object_key: String,
    file_path: PathBuf,
    part_size: u64,
    meta: ObjectMeta,
    options: JobOptions,
}

impl DownloadJob {
    /// Size of the remote object in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.meta.size
    }

    /// Alternative to [`Self::run`] for callers that do not care about
    /// progress information.
    pub async fn run_without_progress(self) -> Result<()> {
        self.run(NoProgress).await
    }

    /// Run the download to completion, reporting progress to `listener`.
    pub async fn run<P>(self, listener: P) -> Result<()>
    where
        P: ProgressListener + 'static,
    {
        let span = info_span!(
            "download",
            bucket = self.remote.bucket(),
            object_key = %self.object_key,
            file = %self.file_path.display(),
        );

        async move {
            info!(
                size = self.meta.size,
                part_size = self.part_size,
                "starting multipart download"
            );

            let listener: Arc<dyn ProgressListener> = Arc::new(listener);

            let fingerprint = SourceFingerprint {
                size: self.meta.size,
                last_modified: self.meta.last_modified.clone(),
                etag: self.meta.etag.clone(),
            };

            let temp_path = {
                let mut path = OsString::from(self.file_path.as_os_str());
                path.push(TEMP_FILE_SUFFIX);
                PathBuf::from(path)
            };

            let checkpoint_path = self
                .options
                .checkpoint
                .as_ref()
                .map(|options| options.resolve(&self.file_path));

            let prior = match &checkpoint_path {
                Some(path) => {
                    match checkpoint::load_valid(path, DOWNLOAD_CP_MAGIC, &fingerprint).await {
                        // The recorded parts live in the temp file; a
                        // checkpoint without its temp file has nothing to
                        // resume.
                        Some(record)
                            if tokio::fs::try_exists(&temp_path).await.unwrap_or(false) =>
                        {
                            Some(record)
                        }
                        Some(_) => {
                            debug!("discarding checkpoint whose temp file is gone");
                            checkpoint::discard(path).await;
                            None
                        }
                        None => None,
                    }
                }
                None => None,
            };

            let target_context = || error::TargetFileSnafu {
                path: temp_path.clone(),
            };

            let mut record = match prior {
                Some(record) => record,
                None => {
                    let parts = plan::plan(self.meta.size, self.part_size)?;

                    // Fresh run: lay out the full-size temp file the workers
                    // will write into.
                    let file = tokio::fs::File::create(&temp_path)
                        .await
                        .with_context(|_| target_context())?;
                    file.set_len(self.meta.size)
                        .await
                        .with_context(|_| target_context())?;
                    drop(file);

                    let mut record = Checkpoint::new(
                        DOWNLOAD_CP_MAGIC,
                        fingerprint,
                        Session::Download {
                            object_key: self.object_key.clone(),
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

            let todo = record.todo_parts();
            let total_bytes = record.total_bytes();
            let mut tally = ProgressTally::new(listener, record.completed_bytes(), total_bytes);
            tally.started();

            debug!(
                todo = todo.len(),
                of = record.parts.len(),
                "scheduling unfinished parts"
            );

            let worker = Arc::new(DownloadPartWorker {
                remote: self.remote.clone(),
                object_key: self.object_key.clone(),
                temp_path: temp_path.clone(),
            });
            let mut pool = WorkerPool::start(worker, todo.clone(), self.options.routines);

            for _ in 0..todo.len() {
                match pool.next_success().await {
                    Ok(part) => {
                        record.update_part(PartToken {
                            number: part.number,
                            etag: self.meta.etag.clone(),
                        });

                        if let Some(path) = &checkpoint_path {
                            if let Err(save_error) = checkpoint::save(path, &mut record).await {
                                pool.cancel();
                                tally.failed();
                                return Err(save_error);
                            }
                        }

                        tally.data(part.size);
                    }
                    Err(transfer_error) => {
                        // Nothing to abort: there is no server-side session.
                        // The temp file and checkpoint stay for resume.
                        tally.failed();
                        return Err(transfer_error);
                    }
                }
            }

            if self.options.verify_crc {
                if let Some(expected) = self.meta.crc64 {
                    let actual = integrity::file_crc64(&temp_path)
                        .await
                        .with_context(|_| target_context())?;

                    if expected != actual {
                        // The assembled bytes are wrong; scrap the record so
                        // the next run starts from scratch rather than
                        // re-verifying the same bad data.
                        if let Some(path) = &checkpoint_path {
                            checkpoint::discard(path).await;
                        }
                        tally.failed();
                        return error::CrcMismatchSnafu { expected, actual }.fail();
                    }
                }
            }

            tokio::fs::rename(&temp_path, &self.file_path)
                .await
                .with_context(|_| error::FinalizeTargetSnafu {
                    path: self.file_path.clone(),
                })?;

            if let Some(path) = &checkpoint_path {
                checkpoint::discard(path).await;
            }

            tally.completed();
            info!("multipart download finished");

            Ok(())
        }
        .instrument(span)
        .await
    }
}

/// Fetches one part and writes it at the part's offset in the temp file.
/// Every invocation opens its own handle, so seeks never interleave between
/// workers.
struct DownloadPartWorker {
    remote: Box<dyn Remote>,
    object_key: String,
    temp_path: PathBuf,
}

#[async_trait]
impl PartWorker for DownloadPartWorker {
    type Job = Part;
    type Output = Part;

    async fn transfer(&self, part: Part) -> Result<Part> {
        if part.size == 0 {
            // A zero-byte object has one empty part; the preallocated temp
            // file is already complete.
            return Ok(part);
        }

        debug!(
            number = part.number,
            offset = part.offset,
            size = part.size,
            "downloading part"
        );

        let body = self
            .remote
            .get_range(&self.object_key, part.byte_range())
            .await
            .with_context(|_| error::RemoteSnafu {
                operation: "GetObject",
                key: self.object_key.clone(),
            })?;

        ensure!(
            body.len() as u64 == part.size,
            error::TruncatedPartSnafu {
                number: part.number,
                expected: part.size,
                actual: body.len() as u64
            }
        );

        let write_context = || error::PartWriteSnafu {
            number: part.number,
            path: self.temp_path.clone(),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.temp_path)
            .await
            .with_context(|_| write_context())?;
        file.seek(SeekFrom::Start(part.offset))
            .await
            .with_context(|_| write_context())?;
        file.write_all(&body)
            .await
            .with_context(|_| write_context())?;
        file.flush().await.with_context(|_| write_context())?;

        Ok(part)
    }
}
