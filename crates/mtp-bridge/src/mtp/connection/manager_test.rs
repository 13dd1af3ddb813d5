//! End-to-end tests for the connection manager against the virtual device.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{MtpConnectionManager, ProgressCallback};
use crate::config::{Backoff, BridgeConfig};
use crate::mtp::codes::{OperationCode, ResponseCode};
use crate::mtp::errors::MtpError;
use crate::mtp::transport::TransportErrorKind;
use crate::mtp::types::MtpTransferProgress;
use crate::mtp::virtual_device::{Fault, Quirks, VirtualDevice};

const STORAGE: u32 = 0x10001;
const ROOT: u32 = 0xFFFF_FFFF;

fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.session.recovery_delay = Duration::ZERO;
    config.retry.normal.backoff = Backoff::Fixed(Duration::from_millis(1));
    config
}

/// `RUST_LOG=mtp_bridge=trace` shows the wire traffic of a failing test.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manager(device: &VirtualDevice) -> MtpConnectionManager<VirtualDevice> {
    init_logging();
    MtpConnectionManager::new(device.clone(), test_config())
}

fn pattern(len: u32, modulus: u32) -> Vec<u8> {
    (0..len).map(|i| (i % modulus) as u8).collect()
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_scan_reports_device_and_storages() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    let found = manager.scan().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].display_name, "Google Pixel 8");
    assert_eq!(found[0].mtp_version, "1.0");
    assert_eq!(found[0].storages.len(), 1);
    assert_eq!(found[0].storages[0].id, STORAGE);
    assert_eq!(found[0].storages[0].description, "Internal shared storage");
    assert_eq!(manager.pool().len(), 1, "handle goes back to the pool");
}

#[tokio::test]
async fn test_scan_survives_storage_failure() {
    let device = VirtualDevice::new();
    device.inject(
        Some(OperationCode::GET_STORAGE_IDS),
        Fault::Respond(ResponseCode::ACCESS_DENIED),
    );
    let manager = manager(&device);

    let found = manager.scan().await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].storages.is_empty());
}

#[tokio::test]
async fn test_calls_reuse_the_pooled_handle() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    manager.scan().await.unwrap();
    manager.storages().await.unwrap();
    manager.device_info().await.unwrap();

    let stats = device.stats();
    assert_eq!(stats.opens, 1);
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(manager.pool().len(), 1);
}

#[tokio::test]
async fn test_check_connection() {
    let device = VirtualDevice::new();
    let manager = manager(&device);
    manager.check_connection().await.unwrap();
}

// ============================================================================
// Directory operations
// ============================================================================

#[tokio::test]
async fn test_list_files_at_root_and_in_folder() {
    let device = VirtualDevice::new();
    let dcim = device.add_folder(STORAGE, ROOT, "DCIM");
    device.add_file(STORAGE, ROOT, "notes.txt", b"hello".to_vec());
    let photo = device.add_file(STORAGE, dcim, "IMG_0001.jpg", vec![0xAB; 2048]);
    let manager = manager(&device);

    let root = manager.list_files(STORAGE, ROOT).await.unwrap();
    assert_eq!(root.len(), 2);
    let folder = root.iter().find(|e| e.name == "DCIM").unwrap();
    assert!(folder.is_folder);
    let notes = root.iter().find(|e| e.name == "notes.txt").unwrap();
    assert!(!notes.is_folder);
    assert_eq!(notes.size, 5);

    let inside = manager.list_files(STORAGE, dcim).await.unwrap();
    assert_eq!(inside.len(), 1);
    assert_eq!(inside[0].id, photo);
    assert_eq!(inside[0].parent_id, dcim);
    assert_eq!(inside[0].size, 2048);
}

#[tokio::test]
async fn test_list_files_skips_unreadable_objects() {
    let device = VirtualDevice::new();
    device.add_file(STORAGE, ROOT, "a.txt", b"a".to_vec());
    device.add_file(STORAGE, ROOT, "b.txt", b"b".to_vec());
    device.inject(
        Some(OperationCode::GET_OBJECT_INFO),
        Fault::Respond(ResponseCode::INVALID_OBJECT_HANDLE),
    );
    let manager = manager(&device);

    let entries = manager.list_files(STORAGE, ROOT).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "b.txt");
}

#[tokio::test]
async fn test_invalid_ids_are_rejected_before_any_io() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    assert!(matches!(
        manager.list_files(0, ROOT).await,
        Err(MtpError::InvalidArgument { .. })
    ));
    assert!(matches!(
        manager.list_files(STORAGE, 0).await,
        Err(MtpError::InvalidArgument { .. })
    ));
    assert!(matches!(manager.object_info(0).await, Err(MtpError::InvalidArgument { .. })));
    assert!(matches!(manager.delete_object(0).await, Err(MtpError::InvalidArgument { .. })));
    assert_eq!(device.stats().opens, 0);
}

#[tokio::test]
async fn test_object_info() {
    let device = VirtualDevice::new();
    let handle = device.add_file(STORAGE, ROOT, "song.mp3", vec![1; 300]);
    let manager = manager(&device);

    let entry = manager.object_info(handle).await.unwrap();
    assert_eq!(entry.name, "song.mp3");
    assert_eq!(entry.size, 300);
    assert_eq!(entry.storage_id, STORAGE);
}

// ============================================================================
// Transfers
// ============================================================================

#[tokio::test]
async fn test_download_into_memory_with_progress() {
    let device = VirtualDevice::new();
    let data = pattern(100_000, 251);
    let handle = device.add_file(STORAGE, ROOT, "video.mp4", data.clone());
    let manager = manager(&device);

    let calls = Arc::new(AtomicUsize::new(0));
    let last_done = Arc::new(AtomicU64::new(0));
    let total = Arc::new(AtomicU64::new(0));
    let progress: ProgressCallback = {
        let (calls, last_done, total) = (Arc::clone(&calls), Arc::clone(&last_done), Arc::clone(&total));
        Arc::new(move |p: &MtpTransferProgress| {
            calls.fetch_add(1, Ordering::SeqCst);
            last_done.store(p.bytes_done, Ordering::SeqCst);
            total.store(p.bytes_total, Ordering::SeqCst);
        })
    };

    let download = manager
        .download(handle, "t1", || Ok(Vec::<u8>::new()), Some(progress))
        .await
        .unwrap();
    assert_eq!(download.sink, data);
    assert_eq!(download.result.object_id, handle);
    assert_eq!(download.result.bytes_transferred, 100_000);
    assert_eq!(download.result.task_id, "t1");
    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(last_done.load(Ordering::SeqCst), 100_000);
    assert_eq!(total.load(Ordering::SeqCst), 100_000);
}

#[tokio::test]
async fn test_download_into_file() {
    let device = VirtualDevice::new();
    let data = pattern(40_000, 97);
    let handle = device.add_file(STORAGE, ROOT, "photo.jpg", data.clone());
    let manager = manager(&device);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("photo.jpg");
    let sink_path = path.clone();
    let download = manager
        .download(handle, "t1", move || std::fs::File::create(&sink_path), None)
        .await
        .unwrap();
    drop(download.sink);

    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test]
async fn test_download_empty_file() {
    let device = VirtualDevice::new();
    let handle = device.add_file(STORAGE, ROOT, "empty.txt", Vec::new());
    let manager = manager(&device);

    let download = manager.download(handle, "t1", || Ok(Vec::<u8>::new()), None).await.unwrap();
    assert!(download.sink.is_empty());
    assert_eq!(download.result.bytes_transferred, 0);
}

#[tokio::test]
async fn test_download_of_folder_is_rejected() {
    let device = VirtualDevice::new();
    let folder = device.add_folder(STORAGE, ROOT, "Music");
    let manager = manager(&device);

    let result = manager.download(folder, "t1", || Ok(Vec::<u8>::new()), None).await;
    assert!(matches!(result, Err(MtpError::InvalidArgument { .. })));
    assert_eq!(device.command_count(OperationCode::GET_OBJECT), 0);
}

#[tokio::test]
async fn test_download_with_split_header_device() {
    let device = VirtualDevice::new().with_quirks(Quirks {
        split_header: true,
        ..Quirks::default()
    });
    let first = pattern(70_000, 199);
    let second = pattern(1_000, 7);
    let a = device.add_file(STORAGE, ROOT, "a.bin", first.clone());
    let b = device.add_file(STORAGE, ROOT, "b.bin", second.clone());
    let manager = manager(&device);

    let download = manager.download(a, "t1", || Ok(Vec::<u8>::new()), None).await.unwrap();
    assert_eq!(download.sink, first);
    let download = manager.download(b, "t2", || Ok(Vec::<u8>::new()), None).await.unwrap();
    assert_eq!(download.sink, second);
}

#[tokio::test]
async fn test_cancel_before_transfer_touches_no_device() {
    let device = VirtualDevice::new();
    let handle = device.add_file(STORAGE, ROOT, "a.bin", vec![1; 10]);
    let manager = manager(&device);

    manager.cancel_task("t1");
    assert!(manager.is_task_cancelled("t1"));
    assert!(!manager.is_task_cancelled("t2"));

    let result = manager.download(handle, "t1", || Ok(Vec::<u8>::new()), None).await;
    assert!(matches!(result, Err(MtpError::Cancelled { ref task_id }) if task_id == "t1"));
    assert_eq!(device.stats().opens, 0);
}

#[tokio::test]
async fn test_cancel_during_download_stops_at_next_chunk() {
    let device = VirtualDevice::new();
    let handle = device.add_file(STORAGE, ROOT, "big.bin", pattern(100_000, 251));
    let manager = Arc::new(manager(&device));

    let calls = Arc::new(AtomicUsize::new(0));
    let progress: ProgressCallback = {
        let (calls, canceller) = (Arc::clone(&calls), Arc::clone(&manager));
        Arc::new(move |p: &MtpTransferProgress| {
            calls.fetch_add(1, Ordering::SeqCst);
            canceller.cancel_task(&p.task_id);
        })
    };

    let result = manager.download(handle, "t3", || Ok(Vec::<u8>::new()), Some(progress)).await;
    assert!(matches!(result, Err(MtpError::Cancelled { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(device.command_count(OperationCode::GET_OBJECT), 1, "cancellation is not retried");
    assert!(manager.pool().is_empty(), "interrupted handle is discarded");

    manager.forget_task("t3");
    assert!(!manager.is_task_cancelled("t3"));
    assert_eq!(manager.storages().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_round_trip() {
    let device = VirtualDevice::new();
    let folder = device.add_folder(STORAGE, ROOT, "Documents");
    let manager = manager(&device);
    let payload = pattern(40_000, 13);

    let calls = Arc::new(AtomicUsize::new(0));
    let progress: ProgressCallback = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_: &MtpTransferProgress| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    let source = payload.clone();
    let result = manager
        .upload(
            STORAGE,
            folder,
            "report.pdf",
            payload.len() as u64,
            "up1",
            move || Ok(io::Cursor::new(source.clone())),
            Some(progress),
        )
        .await
        .unwrap();

    assert_eq!(result.bytes_transferred, 40_000);
    assert_eq!(device.file_data(result.object_id), Some(payload));
    assert_eq!(device.object_name(result.object_id).as_deref(), Some("report.pdf"));
    assert!(calls.load(Ordering::SeqCst) >= 2);

    let listed = manager.list_files(STORAGE, folder).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].size, 40_000);
}

#[tokio::test]
async fn test_upload_updates_free_space() {
    let device = VirtualDevice::new();
    let manager = manager(&device);
    let before = manager.storage_info(STORAGE).await.unwrap();

    let result = manager
        .upload(STORAGE, ROOT, "a.bin", 5_000, "up1", || Ok(io::Cursor::new(vec![7u8; 5_000])), None)
        .await
        .unwrap();
    assert!(device.object_exists(result.object_id));

    let after = manager.refresh_storage(STORAGE).await.unwrap();
    assert_eq!(before.free_space - after.free_space, 5_000);
}

#[tokio::test]
async fn test_upload_rejects_oversized_file_before_any_io() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    let result = manager
        .upload(STORAGE, ROOT, "huge.iso", 11 * 1024 * 1024 * 1024, "up1", || Ok(io::empty()), None)
        .await;
    assert!(matches!(result, Err(MtpError::InvalidArgument { .. })));
    assert_eq!(device.stats().opens, 0);
}

#[tokio::test]
async fn test_upload_with_failing_source_leaves_no_object() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    let result = manager
        .upload(
            STORAGE,
            ROOT,
            "a.bin",
            10,
            "up1",
            || Err::<io::Cursor<Vec<u8>>, _>(io::Error::other("source vanished")),
            None,
        )
        .await;
    assert!(matches!(result, Err(MtpError::LocalIo { .. })));
    assert_eq!(device.command_count(OperationCode::SEND_OBJECT_INFO), 1);
    assert!(manager.list_files(STORAGE, ROOT).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_to_read_only_storage_is_not_retried() {
    let device = VirtualDevice::new();
    device.add_storage(0x20001, "SD card", 1 << 30, true);
    let manager = manager(&device);

    let result = manager
        .upload(0x20001, ROOT, "a.bin", 3, "up1", || Ok(io::Cursor::new(vec![1u8, 2, 3])), None)
        .await;
    let err = result.unwrap_err();
    assert_eq!(err.response_code(), Some(ResponseCode::STORE_READ_ONLY));
    assert_eq!(device.command_count(OperationCode::SEND_OBJECT_INFO), 1);
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_create_folder_and_list_it() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    let id = manager.create_folder(STORAGE, ROOT, "Backups").await.unwrap();
    assert_eq!(device.object_name(id).as_deref(), Some("Backups"));

    let root = manager.list_files(STORAGE, ROOT).await.unwrap();
    assert_eq!(root.len(), 1);
    assert!(root[0].is_folder);
    assert!(manager.list_files(STORAGE, id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_folder_validates_name() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    assert!(matches!(
        manager.create_folder(STORAGE, ROOT, "").await,
        Err(MtpError::InvalidArgument { .. })
    ));
    assert!(matches!(
        manager.create_folder(STORAGE, ROOT, &"x".repeat(256)).await,
        Err(MtpError::InvalidArgument { .. })
    ));
    assert_eq!(device.stats().opens, 0);
}

#[tokio::test]
async fn test_delete_folder_with_contents() {
    let device = VirtualDevice::new();
    let folder = device.add_folder(STORAGE, ROOT, "Old");
    let file = device.add_file(STORAGE, folder, "a.txt", b"a".to_vec());
    let manager = manager(&device);

    manager.delete_object(folder).await.unwrap();
    assert!(!device.object_exists(folder));
    assert!(!device.object_exists(file));
}

#[tokio::test]
async fn test_delete_missing_object_fails_without_retry() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    let err = manager.delete_object(999).await.unwrap_err();
    assert_eq!(err.response_code(), Some(ResponseCode::INVALID_OBJECT_HANDLE));
    assert_eq!(device.command_count(OperationCode::DELETE_OBJECT), 1);
}

// ============================================================================
// Retries and recovery
// ============================================================================

#[tokio::test]
async fn test_busy_transport_is_retried_on_a_new_handle() {
    let device = VirtualDevice::new();
    device.add_file(STORAGE, ROOT, "a.txt", b"a".to_vec());
    device.inject(Some(OperationCode::GET_OBJECT_HANDLES), Fault::Busy);
    let hints = Arc::new(AtomicUsize::new(0));
    let manager = MtpConnectionManager::new(device.clone(), test_config()).with_reclaim_hint({
        let hints = Arc::clone(&hints);
        move || {
            hints.fetch_add(1, Ordering::SeqCst);
        }
    });

    let entries = manager.list_files(STORAGE, ROOT).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(device.command_count(OperationCode::GET_OBJECT_HANDLES), 2);
    assert_eq!(device.stats().opens, 2);
    assert_eq!(hints.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_quick_calls_are_not_retried() {
    let device = VirtualDevice::new();
    device.inject(Some(OperationCode::GET_DEVICE_INFO), Fault::Busy);
    let manager = manager(&device);

    let err = manager.device_info().await.unwrap_err();
    assert!(matches!(
        err,
        MtpError::Transport {
            kind: TransportErrorKind::Busy,
            ..
        }
    ));
    assert_eq!(device.command_count(OperationCode::GET_DEVICE_INFO), 1);
}

#[tokio::test]
async fn test_device_busy_response_is_retried() {
    let device = VirtualDevice::new();
    device.inject(
        Some(OperationCode::GET_STORAGE_INFO),
        Fault::Respond(ResponseCode::DEVICE_BUSY),
    );
    let manager = manager(&device);

    let info = manager.storage_info(STORAGE).await.unwrap();
    assert_eq!(info.id, STORAGE);
    assert_eq!(device.command_count(OperationCode::GET_STORAGE_INFO), 2);
    assert_eq!(device.stats().opens, 1, "a protocol error doesn't cost the handle");
}

#[tokio::test]
async fn test_closed_pooled_handle_is_replaced_without_backoff() {
    let device = VirtualDevice::new();
    let mut config = test_config();
    config.retry.normal.backoff = Backoff::Fixed(Duration::from_secs(30));
    let manager = MtpConnectionManager::new(device.clone(), config);

    manager.storages().await.unwrap();
    device.inject(Some(OperationCode::GET_OBJECT_HANDLES), Fault::Disconnect);

    let entries = tokio::time::timeout(Duration::from_secs(5), manager.list_files(STORAGE, ROOT))
        .await
        .expect("retry should not wait for the backoff")
        .unwrap();
    assert!(entries.is_empty());
    assert_eq!(device.stats().opens, 2);
}

#[tokio::test]
async fn test_session_recovered_by_reset() {
    let device = VirtualDevice::new();
    device.inject(
        Some(OperationCode::OPEN_SESSION),
        Fault::Respond(ResponseCode::GENERAL_ERROR),
    );
    let manager = manager(&device);

    manager.device_info().await.unwrap();
    assert_eq!(device.stats().resets, 1);
    assert!(device.has_session());
}

#[tokio::test]
async fn test_unrecoverable_session_fails_quick_call() {
    let device = VirtualDevice::new();
    for _ in 0..2 {
        device.inject(
            Some(OperationCode::OPEN_SESSION),
            Fault::Respond(ResponseCode::GENERAL_ERROR),
        );
    }
    let manager = manager(&device);

    let err = manager.device_info().await.unwrap_err();
    assert!(matches!(err, MtpError::SessionUnrecoverable { .. }));
    assert!(manager.pool().is_empty());
}

#[tokio::test]
async fn test_unrecoverable_session_is_retried_on_normal_call() {
    let device = VirtualDevice::new();
    for _ in 0..2 {
        device.inject(
            Some(OperationCode::OPEN_SESSION),
            Fault::Respond(ResponseCode::GENERAL_ERROR),
        );
    }
    let manager = manager(&device);

    manager.list_files(STORAGE, ROOT).await.unwrap();
    assert_eq!(device.stats().resets, 1);
    assert_eq!(device.command_count(OperationCode::OPEN_SESSION), 3);
}

#[tokio::test]
async fn test_open_failure_is_surfaced() {
    let device = VirtualDevice::new();
    device.inject(None, Fault::FailOpen);
    let manager = manager(&device);

    let err = manager.storages().await.unwrap_err();
    assert!(matches!(
        err,
        MtpError::Transport {
            kind: TransportErrorKind::Access,
            ..
        }
    ));
    assert_eq!(device.pending_faults(), 0);
}

#[tokio::test]
async fn test_attempt_timeout_abandons_the_worker() {
    let device = VirtualDevice::new();
    device.inject(
        Some(OperationCode::GET_STORAGE_IDS),
        Fault::Stall(Duration::from_millis(400)),
    );
    let mut config = test_config();
    config.retry.quick.timeout = Duration::from_millis(100);
    let manager = MtpConnectionManager::new(device.clone(), config);

    let err = manager.storages().await.unwrap_err();
    assert!(matches!(err, MtpError::Timeout { .. }));

    // The abandoned worker has already discarded its handle when the call returns.
    assert!(manager.pool().is_empty());
    assert_eq!(device.stats().closes, 1);
}

#[tokio::test]
async fn test_timed_out_attempt_finishes_before_the_retry() {
    let device = VirtualDevice::new();
    device.add_folder(STORAGE, ROOT, "DCIM");
    device.inject(
        Some(OperationCode::GET_OBJECT_HANDLES),
        Fault::Stall(Duration::from_millis(600)),
    );
    let mut config = test_config();
    config.retry.normal.timeout = Duration::from_millis(150);
    let manager = MtpConnectionManager::new(device.clone(), config);

    let entries = manager.list_files(STORAGE, ROOT).await.unwrap();
    assert_eq!(entries.len(), 1);

    // First handle was closed by its own worker before the second attempt opened another.
    let stats = device.stats();
    assert_eq!(stats.opens, 2);
    assert_eq!(stats.closes, 1);
    assert_eq!(manager.pool().len(), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_shutdown_waits_for_call_in_flight() {
    let device = VirtualDevice::new();
    device.inject(
        Some(OperationCode::GET_STORAGE_IDS),
        Fault::Stall(Duration::from_millis(300)),
    );
    let manager = Arc::new(manager(&device));
    let finished = Arc::new(AtomicBool::new(false));

    let call = {
        let (manager, finished) = (Arc::clone(&manager), Arc::clone(&finished));
        tokio::spawn(async move {
            let result = manager.storages().await;
            finished.store(true, Ordering::SeqCst);
            result
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.shutdown().await.unwrap();
    assert!(finished.load(Ordering::SeqCst), "pool disposed while a call was running");
    assert_eq!(call.await.unwrap().unwrap().len(), 1);
    assert!(manager.pool().is_closed());
    assert_eq!(device.stats().closes, 1);
    assert!(!device.has_session());
}

#[tokio::test]
async fn test_calls_fail_fast_after_shutdown() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    manager.shutdown().await.unwrap();
    manager.shutdown().await.unwrap();
    assert!(manager.is_shutting_down());
    assert!(matches!(manager.scan().await, Err(MtpError::ShuttingDown)));
    assert!(matches!(
        manager.list_files(STORAGE, ROOT).await,
        Err(MtpError::ShuttingDown)
    ));
    assert!(!manager.start_sweeper());
    assert_eq!(device.stats().opens, 0);
}

#[tokio::test]
async fn test_clear_pool() {
    let device = VirtualDevice::new();
    let manager = manager(&device);

    manager.storages().await.unwrap();
    assert_eq!(manager.clear_pool().await, 1);
    assert!(manager.pool().is_empty());
    assert_eq!(device.stats().closes, 1);
}

#[tokio::test]
async fn test_sweeper_disposes_idle_handles() {
    let device = VirtualDevice::new();
    let mut config = test_config();
    config.pool.cleanup_tick = Duration::from_millis(50);
    config.pool.entry_ttl = Duration::from_millis(10);
    let manager = MtpConnectionManager::new(device.clone(), config);

    manager.storages().await.unwrap();
    assert_eq!(manager.pool().len(), 1);
    assert!(manager.start_sweeper());
    assert!(!manager.start_sweeper(), "only one sweeper runs at a time");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.pool().is_empty());
    assert_eq!(device.stats().closes, 1);
    manager.stop_sweeper();
}
