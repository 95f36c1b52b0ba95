//! The narrow interface the transfer engine consumes from the HTTP layer.
//!
//! Everything below this seam (request signing, header handling, XML
//! marshalling, per-request retry and timeouts) belongs to whatever client
//! implements [`Remote`].  The engine only ever issues the eight operations
//! of the multipart protocol, always against a single bucket, and treats the
//! responses as opaque except for the fields captured in the types here.
use async_trait::async_trait;
use bytes::Bytes;
use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::ops::{Range, RangeInclusive};

/// An error reported by the service or the transport underneath a [`Remote`]
/// implementation.
///
/// `status` is the HTTP status of the response (implementations may use `0`
/// for pure transport failures) and `code` is the service's error code, for
/// example `NoSuchKey` or `NoSuchUpload`.
#[derive(Clone, Debug, Snafu)]
#[snafu(display("{code} (status {status}): {message}"))]
pub struct RemoteError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the object addressed by a HEAD request does
    /// not exist.  This is the only service error the engine distinguishes.
    pub fn is_no_such_key(&self) -> bool {
        self.status == 404 && self.code == "NoSuchKey"
    }
}

/// The server-acknowledged receipt for one transferred part.
///
/// Tokens are what `Complete` ultimately consumes, and they are persisted in
/// the checkpoint so a resumed run can commit parts it never transferred
/// itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartToken {
    pub number: u32,
    pub etag: String,
}

/// Metadata of a remote object as returned by `HeadObject`.
///
/// `last_modified` is kept as the opaque string the service produced; the
/// engine only ever compares it for equality.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: String,
    pub etag: String,
    /// The object's CRC-64/XZ checksum, when the service exposes one.
    pub crc64: Option<u64>,
}

/// The service's answer to a successful `CompleteMultipartUpload`.
#[derive(Clone, Debug)]
pub struct CompleteOutput {
    pub etag: String,
    /// CRC-64/XZ of the assembled object, when the service computes one.
    pub crc64: Option<u64>,
}

/// Object attributes forwarded verbatim to `InitiateMultipartUpload` and
/// nowhere else.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitiateOptions {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub expires: Option<String>,
    pub acl: Option<String>,
    /// User metadata, sent as `x-<service>-meta-*` headers.
    pub metadata: BTreeMap<String, String>,
}

/// A handle on one bucket of an S3-compatible service, exposing exactly the
/// operations the transfer engine needs.
///
/// Implementations must be cheap to clone: every worker in the pool holds its
/// own copy.
#[async_trait]
pub trait Remote: DynClone + Send + Sync + 'static {
    /// Name of the bucket this handle is scoped to.
    fn bucket(&self) -> &str;

    /// Start a multipart session for `key` and return the server-assigned
    /// upload id.
    async fn initiate_multipart(
        &self,
        key: &str,
        options: &InitiateOptions,
    ) -> Result<String, RemoteError>;

    /// Upload one part of an open multipart session.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartToken, RemoteError>;

    /// Copy an inclusive byte range of `src_key` in `src_bucket` into one
    /// part of an open multipart session.  No data flows through the client.
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        src_bucket: &str,
        src_key: &str,
        range: RangeInclusive<u64>,
    ) -> Result<PartToken, RemoteError>;

    /// Fetch a half-open byte range of an object.
    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes, RemoteError>;

    /// Commit a multipart session.  `parts` is sorted by part number
    /// ascending.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartToken],
    ) -> Result<CompleteOutput, RemoteError>;

    /// Abandon a multipart session, releasing the parts stored so far.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), RemoteError>;

    /// Fetch the metadata of an object.
    async fn head_object(&self, key: &str) -> Result<ObjectMeta, RemoteError>;
}

dyn_clone::clone_trait_object!(Remote);

impl std::fmt::Debug for dyn Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("bucket", &self.bucket())
            .finish()
    }
}
