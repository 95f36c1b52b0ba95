//! Upload-mode integration tests: fresh uploads, interruption and resume,
//! fingerprint invalidation, and input validation.
use crate::Result;
use partway::{CheckpointOptions, InitiateOptions, TransferError, UploadJobBuilder};
use partway_testing::{remote::InMemoryService, test_data};
use std::collections::BTreeMap;

const PART_SIZE: u64 = 102_400;
const SOURCE_SIZE: usize = 482_048;

/// Five-part upload, no checkpoint, three workers: exactly one `Initiate`,
/// five `UploadPart`s with the expected sizes, one `Complete`, no `Abort`,
/// and the stored object is byte-identical to the source.
#[tokio::test(flavor = "multi_thread")]
async fn five_part_upload_with_three_workers() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, data) = test_data::test_file(dir.path(), "payload.bin", SOURCE_SIZE).await?;

    UploadJobBuilder::new(service.bucket("uploads"), "payload.bin", &path, PART_SIZE)
        .routines(3)
        .build()
        .await?
        .run_without_progress()
        .await?;

    assert_eq!(service.calls.initiate(), 1);
    assert_eq!(service.calls.upload_part(), 5);
    assert_eq!(service.calls.complete(), 1);
    assert_eq!(service.calls.abort(), 0);

    let mut sizes = service.part_sizes();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![72_448, 102_400, 102_400, 102_400, 102_400]);

    let stored = service.object("uploads", "payload.bin").unwrap();
    assert_eq!(stored.data, data);

    Ok(())
}

/// An upload interrupted at part 5 leaves a checkpoint recording four
/// completed parts and keeps the remote session alive; invoking the same
/// upload again transfers only part 5, completes, and removes the
/// checkpoint.
#[tokio::test(flavor = "multi_thread")]
async fn interrupted_upload_resumes_from_checkpoint() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, data) = test_data::test_file(dir.path(), "payload.bin", SOURCE_SIZE).await?;
    let checkpoint = dir.path().join("payload.bin.cp");

    service.fail_part(5);

    let interrupted =
        UploadJobBuilder::new(service.bucket("uploads"), "payload.bin", &path, PART_SIZE)
            .routines(3)
            .checkpoint(CheckpointOptions::at(&checkpoint))
            .build()
            .await?
            .run_without_progress()
            .await;
    assert!(matches!(interrupted, Err(TransferError::Remote { .. })));

    assert_eq!(service.calls.initiate(), 1);
    assert_eq!(service.calls.upload_part(), 5);
    assert_eq!(service.calls.complete(), 0);
    // Checkpointed runs never abort: the session must survive for resume.
    assert_eq!(service.calls.abort(), 0);
    assert!(service.upload_in_progress("upload-0001"));

    let record: serde_json::Value = serde_json::from_slice(&std::fs::read(&checkpoint)?)?;
    assert_eq!(
        record["part_status"],
        serde_json::json!([true, true, true, true, false])
    );

    service.clear_faults();

    UploadJobBuilder::new(service.bucket("uploads"), "payload.bin", &path, PART_SIZE)
        .routines(3)
        .checkpoint(CheckpointOptions::at(&checkpoint))
        .build()
        .await?
        .run_without_progress()
        .await?;

    // No second Initiate, exactly one more UploadPart for the missing part.
    assert_eq!(service.calls.initiate(), 1);
    assert_eq!(service.calls.upload_part(), 6);
    assert_eq!(service.calls.complete(), 1);
    assert!(!checkpoint.exists());

    let stored = service.object("uploads", "payload.bin").unwrap();
    assert_eq!(stored.data, data);

    Ok(())
}

/// Rewriting the source between runs invalidates the fingerprint: the
/// checkpoint is discarded and a fresh session uploads every part again.
#[tokio::test(flavor = "multi_thread")]
async fn changed_source_restarts_the_transfer() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, _stale) = test_data::test_file(dir.path(), "payload.bin", SOURCE_SIZE).await?;
    let checkpoint = dir.path().join("payload.bin.cp");

    service.fail_part(5);

    let interrupted =
        UploadJobBuilder::new(service.bucket("uploads"), "payload.bin", &path, PART_SIZE)
            .routines(3)
            .checkpoint(CheckpointOptions::at(&checkpoint))
            .build()
            .await?
            .run_without_progress()
            .await;
    assert!(interrupted.is_err());
    assert!(checkpoint.exists());

    // Same length, fresh bytes: size alone can't tell the difference, the
    // content fingerprint has to.
    let fresh = test_data::test_bytes(SOURCE_SIZE);
    tokio::fs::write(&path, &fresh).await?;

    service.clear_faults();

    UploadJobBuilder::new(service.bucket("uploads"), "payload.bin", &path, PART_SIZE)
        .routines(3)
        .checkpoint(CheckpointOptions::at(&checkpoint))
        .build()
        .await?
        .run_without_progress()
        .await?;

    // A second session was initiated and all five parts re-uploaded.
    assert_eq!(service.calls.initiate(), 2);
    assert_eq!(service.calls.upload_part(), 10);

    let stored = service.object("uploads", "payload.bin").unwrap();
    assert_eq!(stored.data, fresh);

    Ok(())
}

/// Without a checkpoint a failed upload aborts its session so no orphaned
/// parts linger on the server.
#[tokio::test(flavor = "multi_thread")]
async fn failure_without_checkpoint_aborts_the_session() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, _data) = test_data::test_file(dir.path(), "payload.bin", SOURCE_SIZE).await?;

    service.fail_part(5);

    let interrupted =
        UploadJobBuilder::new(service.bucket("uploads"), "payload.bin", &path, PART_SIZE)
            .routines(3)
            .build()
            .await?
            .run_without_progress()
            .await;
    assert!(interrupted.is_err());

    assert_eq!(service.calls.abort(), 1);
    assert!(!service.upload_in_progress("upload-0001"));

    Ok(())
}

/// Part sizes outside the supported range are rejected before any remote
/// call is issued.
#[tokio::test]
async fn invalid_part_sizes_are_rejected_up_front() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, _data) = test_data::test_file(dir.path(), "payload.bin", 1024).await?;

    let too_small =
        UploadJobBuilder::new(service.bucket("uploads"), "payload.bin", &path, 1024)
            .build()
            .await;
    assert!(matches!(
        too_small,
        Err(TransferError::InvalidPartSize { size: 1024 })
    ));

    let too_big = UploadJobBuilder::new(
        service.bucket("uploads"),
        "payload.bin",
        &path,
        100 * 1024 * 1024 * 1024,
    )
    .build()
    .await;
    assert!(matches!(
        too_big,
        Err(TransferError::InvalidPartSize { .. })
    ));

    assert_eq!(service.calls.initiate(), 0);
    assert_eq!(service.calls.upload_part(), 0);

    Ok(())
}

/// The final object is byte-identical no matter how many workers moved it.
#[tokio::test(flavor = "multi_thread")]
async fn result_is_independent_of_worker_count() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, data) = test_data::test_file(dir.path(), "payload.bin", SOURCE_SIZE).await?;

    for routines in [1, 4, 100] {
        let key = format!("sweep/payload-{routines}.bin");

        UploadJobBuilder::new(service.bucket("uploads"), &key, &path, PART_SIZE)
            .routines(routines)
            .build()
            .await?
            .run_without_progress()
            .await?;

        let stored = service.object("uploads", &key).unwrap();
        assert_eq!(stored.data, data, "object differs with {routines} routines");
    }

    Ok(())
}

/// A zero-byte file still uploads as a single empty part, which is what
/// creates the object on the server.
#[tokio::test]
async fn zero_byte_file_uploads_one_empty_part() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, _data) = test_data::test_file(dir.path(), "empty.bin", 0).await?;

    UploadJobBuilder::new(service.bucket("uploads"), "empty.bin", &path, PART_SIZE)
        .build()
        .await?
        .run_without_progress()
        .await?;

    assert_eq!(service.calls.initiate(), 1);
    assert_eq!(service.calls.upload_part(), 1);
    assert_eq!(service.part_sizes(), vec![0]);

    let stored = service.object("uploads", "empty.bin").unwrap();
    assert!(stored.data.is_empty());

    Ok(())
}

/// Object attributes set on the builder reach `InitiateMultipartUpload`
/// unchanged.
#[tokio::test]
async fn initiate_options_are_forwarded_to_the_session() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, _data) = test_data::test_file(dir.path(), "payload.bin", SOURCE_SIZE).await?;

    let mut metadata = BTreeMap::new();
    metadata.insert("origin".to_owned(), "nightly-batch".to_owned());

    let options = InitiateOptions {
        content_type: Some("application/octet-stream".to_owned()),
        cache_control: Some("no-cache".to_owned()),
        acl: Some("private".to_owned()),
        metadata,
        ..InitiateOptions::default()
    };

    UploadJobBuilder::new(service.bucket("uploads"), "payload.bin", &path, PART_SIZE)
        .initiate_options(options.clone())
        .build()
        .await?
        .run_without_progress()
        .await?;

    assert_eq!(service.initiate_options(), vec![options]);

    Ok(())
}

/// An empty object key is rejected during validation.
#[tokio::test]
async fn empty_object_key_is_rejected() -> Result<()> {
    let service = InMemoryService::new();
    let dir = tempfile::tempdir()?;
    let (path, _data) = test_data::test_file(dir.path(), "payload.bin", 1024).await?;

    let result = UploadJobBuilder::new(service.bucket("uploads"), "", &path, PART_SIZE)
        .build()
        .await;
    assert!(matches!(result, Err(TransferError::InvalidObjectKey)));

    Ok(())
}
