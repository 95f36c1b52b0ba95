//! An in-memory stand-in for an S3-compatible service.
//!
//! Tests get a full multipart implementation without any network or external
//! process: buckets and objects live in hash maps, every API call is
//! counted, and faults can be injected at a chosen part number or byte
//! offset so interruption and resume paths can be exercised
//! deterministically.  The injected failure sleeps briefly before reporting,
//! which gives the other workers in a pool time to finish the parts they
//! have in flight.
use async_trait::async_trait;
use bytes::Bytes;
use crc::{Crc, CRC_64_XZ};
use md5::{Digest, Md5};
use partway::{
    CompleteOutput, InitiateOptions, ObjectMeta, PartToken, Remote, RemoteError,
};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Range, RangeInclusive};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

fn hex(bytes: impl AsRef<[u8]>) -> String {
    bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

/// An object at rest in the in-memory service.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub last_modified: String,
    pub crc64: u64,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

/// How many times each API operation has been invoked, across all buckets.
#[derive(Default)]
pub struct CallCounts {
    initiate: AtomicUsize,
    upload_part: AtomicUsize,
    upload_part_copy: AtomicUsize,
    get_range: AtomicUsize,
    complete: AtomicUsize,
    abort: AtomicUsize,
    head: AtomicUsize,
}

impl CallCounts {
    pub fn initiate(&self) -> usize {
        self.initiate.load(Ordering::SeqCst)
    }
    pub fn upload_part(&self) -> usize {
        self.upload_part.load(Ordering::SeqCst)
    }
    pub fn upload_part_copy(&self) -> usize {
        self.upload_part_copy.load(Ordering::SeqCst)
    }
    pub fn get_range(&self) -> usize {
        self.get_range.load(Ordering::SeqCst)
    }
    pub fn complete(&self) -> usize {
        self.complete.load(Ordering::SeqCst)
    }
    pub fn abort(&self) -> usize {
        self.abort.load(Ordering::SeqCst)
    }
    pub fn head(&self) -> usize {
        self.head.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Faults {
    part_number: Option<u32>,
    range_offset: Option<u64>,
}

/// The whole in-memory service.  Hand out per-bucket [`Remote`] handles with
/// [`bucket`](Self::bucket).
pub struct InMemoryService {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload_id: AtomicU32,
    next_generation: AtomicU32,
    faults: Mutex<Faults>,
    /// Body sizes of every `UploadPart` call, in completion order.
    part_sizes: Mutex<Vec<u64>>,
    /// The `(start, end)` inclusive ranges of every `UploadPartCopy` call.
    copy_ranges: Mutex<Vec<(u64, u64)>>,
    /// The options of every `InitiateMultipartUpload` call, in call order.
    initiate_options: Mutex<Vec<InitiateOptions>>,
    pub calls: CallCounts,
}

impl InMemoryService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_upload_id: AtomicU32::new(1),
            next_generation: AtomicU32::new(1),
            faults: Mutex::new(Faults::default()),
            part_sizes: Mutex::new(Vec::new()),
            copy_ranges: Mutex::new(Vec::new()),
            initiate_options: Mutex::new(Vec::new()),
            calls: CallCounts::default(),
        })
    }

    /// A [`Remote`] implementation scoped to `bucket`, the handle the engine
    /// consumes.
    pub fn bucket(self: &Arc<Self>, bucket: impl Into<String>) -> Box<dyn Remote> {
        Box::new(BucketHandle {
            service: Arc::clone(self),
            bucket: bucket.into(),
        })
    }

    /// Store an object directly, bypassing the multipart API.
    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let object = self.store_from(data);
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_owned(), key.to_owned()), object);
    }

    /// Fetch an object at rest, if present.
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    /// Make every `UploadPart`/`UploadPartCopy` of this part number fail
    /// until cleared.
    pub fn fail_part(&self, number: u32) {
        self.faults.lock().unwrap().part_number = Some(number);
    }

    /// Make every ranged GET starting at `offset` fail until cleared.
    pub fn fail_range_at(&self, offset: u64) {
        self.faults.lock().unwrap().range_offset = Some(offset);
    }

    /// Stop injecting faults.
    pub fn clear_faults(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    /// Whether a multipart session with this id is still open.
    pub fn upload_in_progress(&self, upload_id: &str) -> bool {
        self.uploads.lock().unwrap().contains_key(upload_id)
    }

    pub fn part_sizes(&self) -> Vec<u64> {
        self.part_sizes.lock().unwrap().clone()
    }

    pub fn copy_ranges(&self) -> Vec<(u64, u64)> {
        self.copy_ranges.lock().unwrap().clone()
    }

    pub fn initiate_options(&self) -> Vec<InitiateOptions> {
        self.initiate_options.lock().unwrap().clone()
    }

    fn store_from(&self, data: Bytes) -> StoredObject {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        StoredObject {
            etag: hex(&Md5::digest(&data)),
            // An opaque string is all the engine ever sees; a counter keeps
            // consecutive writes distinguishable even within one clock tick.
            last_modified: format!("generation-{generation}"),
            crc64: CRC64.checksum(&data),
            data,
        }
    }

    fn injected_part_fault(&self, number: u32) -> bool {
        self.faults.lock().unwrap().part_number == Some(number)
    }

    fn injected_range_fault(&self, offset: u64) -> bool {
        self.faults.lock().unwrap().range_offset == Some(offset)
    }
}

/// The per-bucket view of an [`InMemoryService`].
#[derive(Clone)]
struct BucketHandle {
    service: Arc<InMemoryService>,
    bucket: String,
}

impl BucketHandle {
    fn no_such_upload(upload_id: &str) -> RemoteError {
        RemoteError::new(
            404,
            "NoSuchUpload",
            format!("upload '{upload_id}' does not exist"),
        )
    }

    async fn injected_failure() -> RemoteError {
        // Let other in-flight parts finish (and their checkpoint saves
        // complete) first, so interruption tests see a deterministic set of
        // completed parts.
        tokio::time::sleep(Duration::from_millis(500)).await;
        RemoteError::new(500, "InternalError", "injected fault")
    }
}

#[async_trait]
impl Remote for BucketHandle {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn initiate_multipart(
        &self,
        key: &str,
        options: &InitiateOptions,
    ) -> Result<String, RemoteError> {
        self.service.calls.initiate.fetch_add(1, Ordering::SeqCst);

        self.service
            .initiate_options
            .lock()
            .unwrap()
            .push(options.clone());

        let id = self.service.next_upload_id.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("upload-{id:04}");

        self.service.uploads.lock().unwrap().insert(
            upload_id.clone(),
            PendingUpload {
                bucket: self.bucket.clone(),
                key: key.to_owned(),
                parts: BTreeMap::new(),
            },
        );

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<PartToken, RemoteError> {
        self.service
            .calls
            .upload_part
            .fetch_add(1, Ordering::SeqCst);

        if self.service.injected_part_fault(part_number) {
            return Err(Self::injected_failure().await);
        }

        self.service
            .part_sizes
            .lock()
            .unwrap()
            .push(body.len() as u64);

        let etag = hex(&Md5::digest(&body));

        let mut uploads = self.service.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        upload.parts.insert(part_number, body);

        Ok(PartToken {
            number: part_number,
            etag,
        })
    }

    async fn upload_part_copy(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        src_bucket: &str,
        src_key: &str,
        range: RangeInclusive<u64>,
    ) -> Result<PartToken, RemoteError> {
        self.service
            .calls
            .upload_part_copy
            .fetch_add(1, Ordering::SeqCst);

        if self.service.injected_part_fault(part_number) {
            return Err(Self::injected_failure().await);
        }

        self.service
            .copy_ranges
            .lock()
            .unwrap()
            .push((*range.start(), *range.end()));

        let source = self
            .service
            .object(src_bucket, src_key)
            .ok_or_else(|| RemoteError::new(404, "NoSuchKey", "no such source object"))?;

        if *range.end() >= source.data.len() as u64 {
            return Err(RemoteError::new(
                416,
                "InvalidRange",
                "copy range exceeds source object",
            ));
        }

        let body = source
            .data
            .slice(*range.start() as usize..=*range.end() as usize);
        let etag = hex(&Md5::digest(&body));

        let mut uploads = self.service.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        upload.parts.insert(part_number, body);

        Ok(PartToken {
            number: part_number,
            etag,
        })
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes, RemoteError> {
        self.service.calls.get_range.fetch_add(1, Ordering::SeqCst);

        if self.service.injected_range_fault(range.start) {
            return Err(Self::injected_failure().await);
        }

        let object = self
            .service
            .object(&self.bucket, key)
            .ok_or_else(|| RemoteError::new(404, "NoSuchKey", "no such object"))?;

        if range.end > object.data.len() as u64 {
            return Err(RemoteError::new(
                416,
                "InvalidRange",
                "range exceeds object size",
            ));
        }

        Ok(object.data.slice(range.start as usize..range.end as usize))
    }

    async fn complete_multipart(
        &self,
        _key: &str,
        upload_id: &str,
        parts: &[PartToken],
    ) -> Result<CompleteOutput, RemoteError> {
        self.service.calls.complete.fetch_add(1, Ordering::SeqCst);

        let upload = self
            .service
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;

        if !parts.windows(2).all(|pair| pair[0].number < pair[1].number) {
            return Err(RemoteError::new(
                400,
                "InvalidPartOrder",
                "parts are not sorted by part number",
            ));
        }

        let mut data = Vec::new();
        for token in parts {
            let body = upload.parts.get(&token.number).ok_or_else(|| {
                RemoteError::new(400, "InvalidPart", format!("part {} missing", token.number))
            })?;

            if hex(&Md5::digest(body)) != token.etag {
                return Err(RemoteError::new(
                    400,
                    "InvalidPart",
                    format!("part {} etag mismatch", token.number),
                ));
            }

            data.extend_from_slice(body);
        }

        let object = self.service.store_from(Bytes::from(data));
        let output = CompleteOutput {
            etag: object.etag.clone(),
            crc64: Some(object.crc64),
        };

        self.service
            .objects
            .lock()
            .unwrap()
            .insert((upload.bucket, upload.key), object);

        Ok(output)
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), RemoteError> {
        self.service.calls.abort.fetch_add(1, Ordering::SeqCst);

        self.service
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| Self::no_such_upload(upload_id))
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, RemoteError> {
        self.service.calls.head.fetch_add(1, Ordering::SeqCst);

        let object = self
            .service
            .object(&self.bucket, key)
            .ok_or_else(|| RemoteError::new(404, "NoSuchKey", "no such object"))?;

        Ok(ObjectMeta {
            size: object.data.len() as u64,
            last_modified: object.last_modified,
            etag: object.etag,
            crc64: Some(object.crc64),
        })
    }
}
