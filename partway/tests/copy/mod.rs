//! Copy-mode integration tests: server-side multipart copy between buckets,
//! with the byte-range literals the copy API must receive.
use crate::Result;
use partway::{CheckpointOptions, CopyJobBuilder, InitiateOptions, TransferError};
use partway_testing::{remote::InMemoryService, test_data};

const PART_SIZE: u64 = 102_400;
const SOURCE_SIZE: usize = 482_048;

/// Five-part copy across buckets with five workers: one `Initiate` on the
/// destination, five `UploadPartCopy` calls covering exactly the source's
/// byte ranges, one `Complete`, and a destination object matching the
/// source in both content and ETag.
#[tokio::test(flavor = "multi_thread")]
async fn five_part_copy_across_buckets() -> Result<()> {
    let service = InMemoryService::new();

    let data = test_data::test_bytes(SOURCE_SIZE);
    service.put_object("src-bucket", "origin.bin", data.clone());

    CopyJobBuilder::new(
        service.bucket("src-bucket"),
        "origin.bin",
        service.bucket("dest-bucket"),
        "replica.bin",
        PART_SIZE,
    )
    .routines(5)
    .build()
    .await?
    .run_without_progress()
    .await?;

    assert_eq!(service.calls.initiate(), 1);
    assert_eq!(service.calls.upload_part_copy(), 5);
    assert_eq!(service.calls.complete(), 1);
    assert_eq!(service.calls.abort(), 0);
    // The data never flowed through the client.
    assert_eq!(service.calls.get_range(), 0);

    let mut ranges = service.copy_ranges();
    ranges.sort_unstable();
    assert_eq!(
        ranges,
        vec![
            (0, 102_399),
            (102_400, 204_799),
            (204_800, 307_199),
            (307_200, 409_599),
            (409_600, 482_047)
        ]
    );

    let source = service.object("src-bucket", "origin.bin").unwrap();
    let replica = service.object("dest-bucket", "replica.bin").unwrap();
    assert_eq!(replica.data, data);
    assert_eq!(replica.data.len(), source.data.len());
    assert_eq!(replica.etag, source.etag);

    Ok(())
}

/// An interrupted checkpointed copy resumes without a second `Initiate` and
/// copies only the missing part.
#[tokio::test(flavor = "multi_thread")]
async fn interrupted_copy_resumes_from_checkpoint() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;

    let data = test_data::test_bytes(SOURCE_SIZE);
    service.put_object("src-bucket", "origin.bin", data.clone());

    let checkpoint = dir.path().join("replica.cp");

    service.fail_part(5);

    let interrupted = CopyJobBuilder::new(
        service.bucket("src-bucket"),
        "origin.bin",
        service.bucket("dest-bucket"),
        "replica.bin",
        PART_SIZE,
    )
    .routines(3)
    .checkpoint(CheckpointOptions::at(&checkpoint))
    .build()
    .await?
    .run_without_progress()
    .await;
    assert!(matches!(interrupted, Err(TransferError::Remote { .. })));

    assert_eq!(service.calls.initiate(), 1);
    assert_eq!(service.calls.upload_part_copy(), 5);
    assert_eq!(service.calls.abort(), 0);
    assert!(checkpoint.exists());

    service.clear_faults();

    CopyJobBuilder::new(
        service.bucket("src-bucket"),
        "origin.bin",
        service.bucket("dest-bucket"),
        "replica.bin",
        PART_SIZE,
    )
    .routines(3)
    .checkpoint(CheckpointOptions::at(&checkpoint))
    .build()
    .await?
    .run_without_progress()
    .await?;

    assert_eq!(service.calls.initiate(), 1);
    assert_eq!(service.calls.upload_part_copy(), 6);
    assert_eq!(service.calls.complete(), 1);
    assert!(!checkpoint.exists());

    let replica = service.object("dest-bucket", "replica.bin").unwrap();
    assert_eq!(replica.data, data);

    Ok(())
}

/// Destination attributes set on the builder reach the destination
/// bucket's `InitiateMultipartUpload` unchanged.
#[tokio::test(flavor = "multi_thread")]
async fn initiate_options_are_forwarded_to_the_destination() -> Result<()> {
    let service = InMemoryService::new();

    let data = test_data::test_bytes(SOURCE_SIZE);
    service.put_object("src-bucket", "origin.bin", data);

    let options = InitiateOptions {
        content_type: Some("application/octet-stream".to_owned()),
        content_disposition: Some("attachment; filename=replica.bin".to_owned()),
        ..InitiateOptions::default()
    };

    CopyJobBuilder::new(
        service.bucket("src-bucket"),
        "origin.bin",
        service.bucket("dest-bucket"),
        "replica.bin",
        PART_SIZE,
    )
    .initiate_options(options.clone())
    .build()
    .await?
    .run_without_progress()
    .await?;

    assert_eq!(service.initiate_options(), vec![options]);

    Ok(())
}

/// Part-size validation happens before the source object is even HEADed.
#[tokio::test]
async fn invalid_part_size_is_rejected_before_any_remote_call() -> Result<()> {
    let service = InMemoryService::new();

    let result = CopyJobBuilder::new(
        service.bucket("src-bucket"),
        "origin.bin",
        service.bucket("dest-bucket"),
        "replica.bin",
        1024,
    )
    .build()
    .await;

    assert!(matches!(
        result,
        Err(TransferError::InvalidPartSize { size: 1024 })
    ));
    assert_eq!(service.calls.head(), 0);
    assert_eq!(service.calls.initiate(), 0);

    Ok(())
}

/// Changing the source object between runs invalidates the copy checkpoint.
#[tokio::test(flavor = "multi_thread")]
async fn changed_source_object_restarts_the_copy() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;

    let stale = test_data::test_bytes(SOURCE_SIZE);
    service.put_object("src-bucket", "origin.bin", stale);

    let checkpoint = dir.path().join("replica.cp");

    service.fail_part(5);

    let interrupted = CopyJobBuilder::new(
        service.bucket("src-bucket"),
        "origin.bin",
        service.bucket("dest-bucket"),
        "replica.bin",
        PART_SIZE,
    )
    .routines(3)
    .checkpoint(CheckpointOptions::at(&checkpoint))
    .build()
    .await?
    .run_without_progress()
    .await;
    assert!(interrupted.is_err());

    // Same key, same size, new bytes and therefore a new ETag.
    let fresh = test_data::test_bytes(SOURCE_SIZE);
    service.put_object("src-bucket", "origin.bin", fresh.clone());

    service.clear_faults();

    CopyJobBuilder::new(
        service.bucket("src-bucket"),
        "origin.bin",
        service.bucket("dest-bucket"),
        "replica.bin",
        PART_SIZE,
    )
    .routines(3)
    .checkpoint(CheckpointOptions::at(&checkpoint))
    .build()
    .await?
    .run_without_progress()
    .await?;

    assert_eq!(service.calls.initiate(), 2);
    assert_eq!(service.calls.upload_part_copy(), 10);

    let replica = service.object("dest-bucket", "replica.bin").unwrap();
    assert_eq!(replica.data, fresh);

    Ok(())
}

/// `purge_checkpoint` removes the file and aborts the recorded session.
#[tokio::test(flavor = "multi_thread")]
async fn purge_checkpoint_releases_the_session() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;

    let data = test_data::test_bytes(SOURCE_SIZE);
    service.put_object("src-bucket", "origin.bin", data);

    let checkpoint = dir.path().join("replica.cp");

    service.fail_part(5);

    let interrupted = CopyJobBuilder::new(
        service.bucket("src-bucket"),
        "origin.bin",
        service.bucket("dest-bucket"),
        "replica.bin",
        PART_SIZE,
    )
    .routines(3)
    .checkpoint(CheckpointOptions::at(&checkpoint))
    .build()
    .await?
    .run_without_progress()
    .await;
    assert!(interrupted.is_err());
    assert!(service.upload_in_progress("upload-0001"));

    let dest = service.bucket("dest-bucket");
    partway::purge_checkpoint(dest.as_ref(), &checkpoint).await?;

    assert!(!checkpoint.exists());
    assert!(!service.upload_in_progress("upload-0001"));
    assert_eq!(service.calls.abort(), 1);

    Ok(())
}
