mod common;

use common::{
    BAD_SEGMENT_ETAG, MemoryRunner, RecordingSink, SinkLog, TamperingStore, local_store, md5_hex,
    random_bytes,
};
use guest_backup::{
    errors::PipelineError,
    services::{
        backup_metadata::LSN,
        backup_service::{BackupService, FAILURE_NOTE, SUCCESS_NOTE},
        object_store::{ObjectStore, strip_etag_quotes},
        restore_service::{RestoreService, RestoreStep},
        sink::RestoreSink,
    },
};
use proptest::prelude::*;
use std::sync::Arc;

const CONTAINER: &str = "database_backups";
const LOCATION: &str = "http://swift/v1/AUTH_test/database_backups/123";

fn one_mib() -> Vec<u8> {
    random_bytes(1024 * 1024, 7)
}

#[tokio::test]
async fn happy_path_uploads_two_segments_and_a_verified_manifest() {
    let (_dir, local) = local_store().await;
    let store = Arc::new(TamperingStore::new(local.clone()));
    let service = BackupService::new(store.clone(), 128, 512 * 1024);
    let data = one_mib();
    let mut runner = MemoryRunner::new("123", data.clone());

    let outcome = service.save(CONTAINER, &mut runner).await;

    assert!(outcome.success, "{}", outcome.note);
    assert_eq!(outcome.note, SUCCESS_NOTE);
    assert_eq!(outcome.location.as_deref(), Some(LOCATION));
    assert_eq!(store.segment_puts(), 2);
    assert_eq!(store.manifest_puts(), 1);

    let names: Vec<&str> = outcome.segments.iter().map(|s| s.object_name.as_str()).collect();
    assert_eq!(names, ["123_00000000", "123_00000001"]);

    let (seg0, seg1) = data.split_at(512 * 1024);
    let expected = md5_hex(format!("{}{}", md5_hex(seg0), md5_hex(seg1)).as_bytes());
    assert_eq!(outcome.checksum.as_deref(), Some(expected.as_str()));

    let manifest = local.head_object(CONTAINER, "123").await.unwrap();
    assert_eq!(strip_etag_quotes(&manifest.etag), expected);
    assert_eq!(manifest.content_length, data.len() as u64);
    assert!(runner.closed && !runner.aborted);
}

#[tokio::test]
async fn bad_segment_etag_aborts_before_the_manifest() {
    let (_dir, local) = local_store().await;
    let store = Arc::new(TamperingStore::new(local.clone()).with_bad_segment(0));
    let service = BackupService::new(store.clone(), 128, 512 * 1024);
    let mut runner = MemoryRunner::new("123", one_mib());

    let outcome = service.save(CONTAINER, &mut runner).await;

    assert!(!outcome.success);
    assert!(outcome.note.starts_with(FAILURE_NOTE), "{}", outcome.note);
    assert_eq!(outcome.checksum, None);
    assert_eq!(outcome.location.as_deref(), Some(LOCATION));
    assert!(matches!(
        outcome.error,
        Some(PipelineError::SegmentEtagMismatch { ref etag, .. }) if etag == BAD_SEGMENT_ETAG
    ));
    assert_eq!(store.segment_puts(), 1);
    assert_eq!(store.manifest_puts(), 0);
    assert!(runner.aborted);

    let err = local.head_object(CONTAINER, "123").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn bad_manifest_etag_fails_the_backup() {
    let (_dir, local) = local_store().await;
    let store = Arc::new(TamperingStore::new(local.clone()).with_bad_manifest());
    let service = BackupService::new(store.clone(), 128, 512 * 1024);
    let mut runner = MemoryRunner::new("123", one_mib());

    let outcome = service.save(CONTAINER, &mut runner).await;

    assert!(!outcome.success);
    assert!(outcome.note.starts_with(FAILURE_NOTE));
    assert_eq!(outcome.checksum, None);
    assert_eq!(outcome.location.as_deref(), Some(LOCATION));
    assert!(matches!(
        outcome.error,
        Some(PipelineError::ManifestEtagMismatch { .. })
    ));
    assert_eq!(store.segment_puts(), 2);
    assert_eq!(store.manifest_puts(), 1);
    assert_eq!(outcome.segments.len(), 2);
}

#[tokio::test]
async fn failed_runner_leaves_no_manifest() {
    let (_dir, local) = local_store().await;
    let service = BackupService::new(local.clone(), 64, 1024);
    let mut runner = MemoryRunner::new("123", random_bytes(3000, 1)).failing();

    let outcome = service.save(CONTAINER, &mut runner).await;

    assert!(!outcome.success);
    assert!(matches!(outcome.error, Some(PipelineError::RunnerFailed(_))));
    assert_eq!(outcome.segments.len(), 3);
    assert!(runner.closed);
    assert!(local.head_object(CONTAINER, "123").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn repeated_saves_reuse_the_container() {
    let (_dir, local) = local_store().await;
    let service = BackupService::new(local.clone(), 16, 64);

    for name in ["first", "second"] {
        let mut runner = MemoryRunner::new(name, random_bytes(100, 3));
        let outcome = service.save(CONTAINER, &mut runner).await;
        assert!(outcome.success, "{}", outcome.note);
    }
    let container = local.head_container(CONTAINER).await.unwrap();
    // Two manifests plus two segments each.
    assert_eq!(container.object_count, 6);
}

#[tokio::test]
async fn empty_backup_is_one_empty_segment() {
    let (_dir, local) = local_store().await;
    let service = BackupService::new(local.clone(), 16, 64);
    let mut runner = MemoryRunner::new("empty.sql", Vec::new());

    let outcome = service.save(CONTAINER, &mut runner).await;

    assert!(outcome.success, "{}", outcome.note);
    assert_eq!(outcome.segments.len(), 1);
    assert_eq!(outcome.segments[0].object_name, "empty_00000000");
    assert_eq!(outcome.segments[0].length, 0);
    let expected = md5_hex(md5_hex(b"").as_bytes());
    assert_eq!(outcome.checksum.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn runner_metadata_is_stored_on_the_manifest() {
    let (_dir, local) = local_store().await;
    let service = BackupService::new(local.clone(), 16, 64);
    let mut runner = MemoryRunner::new("full.xbstream", random_bytes(10, 4)).with_metadata(LSN, "1626007");

    let outcome = service.save(CONTAINER, &mut runner).await;
    assert!(outcome.success, "{}", outcome.note);

    let restore = RestoreService::new(local.clone(), true);
    let metadata = restore
        .load_metadata(outcome.location.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(metadata.lsn(), Some("1626007"));
}

async fn save_and_restore(data: Vec<u8>, chunk: usize, max: u64) -> (usize, Vec<u8>) {
    let (_dir, local) = local_store().await;
    let service = BackupService::new(local.clone(), chunk, max);
    let mut runner = MemoryRunner::new("prop.sql", data);
    let outcome = service.save(CONTAINER, &mut runner).await;
    assert!(outcome.success, "{}", outcome.note);

    let restore = RestoreService::new(local.clone(), true);
    let log = Arc::new(SinkLog::default());
    let sink_log = log.clone();
    restore
        .restore(
            outcome.location.as_deref().unwrap(),
            outcome.checksum.as_deref(),
            move |_step: &RestoreStep| {
                Box::new(RecordingSink::new(sink_log.clone())) as Box<dyn RestoreSink>
            },
        )
        .await
        .unwrap();
    let restored = log.restores().concat();
    (outcome.segments.len(), restored)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn saved_backups_restore_byte_for_byte(
        len in 0usize..3000,
        chunk in 1usize..32,
        extra in 0u64..64,
        seed in any::<u64>(),
    ) {
        let max = chunk as u64 * 3 + extra;
        let data = random_bytes(len, seed);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (segments, restored) = runtime.block_on(save_and_restore(data.clone(), chunk, max));

        let effective = (max / chunk as u64) * chunk as u64;
        let expected = if len == 0 { 1 } else { (len as u64).div_ceil(effective) as usize };
        prop_assert_eq!(segments, expected);
        prop_assert_eq!(restored, data);
    }
}
