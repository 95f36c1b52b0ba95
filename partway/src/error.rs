use crate::remote::RemoteError;
use snafu::prelude::*;
use std::path::PathBuf;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

/// The error type for every fallible operation in this crate.
///
/// Per-part errors inside a running transfer are routed through the worker
/// pool's failure channel; the first one wins and is returned to the caller
/// verbatim as one of these variants.  Invalid checkpoint files never surface
/// here at all: they are silently discarded and the transfer restarts fresh.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransferError {
    #[snafu(display(
        "part size {size} is outside the supported range [{min}, {max}]",
        min = crate::plan::MIN_PART_SIZE,
        max = crate::plan::MAX_PART_SIZE
    ))]
    InvalidPartSize { size: u64 },

    #[snafu(display(
        "transferring {size} bytes in parts of {part_size} bytes needs more than {max} parts; use a larger part size",
        max = crate::plan::MAX_PART_COUNT
    ))]
    TooManyParts { size: u64, part_size: u64 },

    #[snafu(display("object key must not be empty"))]
    InvalidObjectKey,

    #[snafu(display("error reading source file '{}'", path.display()))]
    SourceFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error reading metadata of source object '{key}' in bucket '{bucket}'"))]
    SourceObject {
        bucket: String,
        key: String,
        source: RemoteError,
    },

    #[snafu(display("{operation} failed for object '{key}'"))]
    Remote {
        operation: &'static str,
        key: String,
        source: RemoteError,
    },

    #[snafu(display("error reading part {number} from '{}'", path.display()))]
    PartRead {
        number: u32,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error accessing download target '{}'", path.display()))]
    TargetFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error writing part {number} to '{}'", path.display()))]
    PartWrite {
        number: u32,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "part {number} came back with {actual} bytes where {expected} were requested"
    ))]
    TruncatedPart {
        number: u32,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("error serializing checkpoint record"))]
    CheckpointEncode { source: serde_json::Error },

    #[snafu(display("error persisting checkpoint file '{}'", path.display()))]
    CheckpointSave {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error moving downloaded data into place at '{}'", path.display()))]
    FinalizeTarget {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "CRC-64 mismatch: the service reports {expected:#018x} but the transferred bytes hash to {actual:#018x}"
    ))]
    CrcMismatch { expected: u64, actual: u64 },
}
