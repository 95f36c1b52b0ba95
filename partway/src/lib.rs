//! Resumable parallel transfers for S3-compatible object storage.
//!
//! `partway` moves large objects by splitting them into fixed-size parts,
//! driving the parts through a bounded pool of concurrent workers, and
//! persisting a checkpoint after every part so an interrupted transfer can be
//! resumed by simply invoking it again.  Three modes share the machinery:
//!
//! * [`UploadJobBuilder`] — multipart upload of a local file
//! * [`DownloadJobBuilder`] — ranged download into a local file
//! * [`CopyJobBuilder`] — server-side copy between buckets
//!
//! The engine does not speak HTTP itself.  It consumes the narrow [`Remote`]
//! trait, which any S3-compatible client can implement; signing, XML,
//! per-request retry and the rest of the wire protocol live behind that seam.
//! There is deliberately no retry *inside* a run either: the first failure
//! cancels the outstanding workers and surfaces verbatim, and a checkpointed
//! re-invocation transfers only what is missing.
//!
//! ```no_run
//! use partway::{CheckpointOptions, Remote, UploadJobBuilder};
//!
//! # async fn example(remote: Box<dyn Remote>) -> partway::Result<()> {
//! let job = UploadJobBuilder::new(remote, "backups/archive.bin", "/data/archive.bin", 8 * 1024 * 1024)
//!     .routines(4)
//!     .checkpoint(CheckpointOptions::enabled())
//!     .build()
//!     .await?;
//!
//! job.run_without_progress().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Progress is reported through the optional [`ProgressListener`] trait; a
//! listener only hears about a part after its receipt has been durably
//! recorded, so observers can treat reported bytes as work that survives a
//! crash.

mod checkpoint;
mod config;
mod copy;
mod download;
mod error;
mod integrity;
mod plan;
mod pool;
mod progress;
mod remote;
mod upload;

pub use checkpoint::purge_checkpoint;
pub use config::CheckpointOptions;
pub use copy::{CopyJob, CopyJobBuilder};
pub use download::{DownloadJob, DownloadJobBuilder};
pub use error::{Result, TransferError};
pub use plan::{Part, MAX_PART_COUNT, MAX_PART_SIZE, MIN_PART_SIZE};
pub use progress::ProgressListener;
pub use remote::{
    CompleteOutput, InitiateOptions, ObjectMeta, PartToken, Remote, RemoteError,
};
pub use upload::{UploadJob, UploadJobBuilder};
