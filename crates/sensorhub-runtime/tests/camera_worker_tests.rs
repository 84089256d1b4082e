//! Camera worker manager against the mock launcher.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sensorhub_core::config::CameraConfig;
use sensorhub_core::{AdmissionScope, Error};
use sensorhub_hardware::mock::{MockLauncher, MockLauncherHandle, MockWorkerHandle};
use sensorhub_protocol::{WorkerFrame, WorkerFrameCodec};
use sensorhub_runtime::{CameraWorkerManager, FrameEvent};
use tokio_util::codec::Encoder;

fn encode_frame(device_id: &str, payload: &'static [u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    WorkerFrameCodec::new()
        .encode(
            WorkerFrame::new(device_id, "image/jpeg", Bytes::from_static(payload)),
            &mut buf,
        )
        .unwrap();
    buf.to_vec()
}

fn create_manager(config: CameraConfig) -> (Arc<CameraWorkerManager<MockLauncher>>, MockLauncherHandle) {
    let (launcher, handle) = MockLauncher::new();
    (
        Arc::new(CameraWorkerManager::new(Arc::new(launcher), config)),
        handle,
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_worker(handle: &mut MockLauncherHandle) -> MockWorkerHandle {
    tokio::time::timeout(Duration::from_secs(2), handle.next_worker())
        .await
        .expect("no worker launched")
        .expect("launcher dropped")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribers_share_one_worker() {
    let (manager, mut handle) = create_manager(CameraConfig::default());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.subscribe("cam-a") })
        })
        .collect();
    let mut subscriptions = Vec::new();
    for task in tasks {
        subscriptions.push(task.await.unwrap().unwrap());
    }

    assert_eq!(handle.spawn_count(), 1);
    let health = manager.health();
    assert_eq!(health.worker_count, 1);
    assert_eq!(health.subscriber_count, 8);

    let worker = next_worker(&mut handle).await;
    for subscription in subscriptions {
        manager.unsubscribe(subscription).await;
    }
    assert_eq!(manager.worker_count(), 0);
    assert!(worker.was_terminated());
    assert!(!worker.was_killed());
}

#[tokio::test]
async fn test_fanout_keeps_only_latest_frame() {
    let (manager, mut handle) = create_manager(CameraConfig::default());
    let fast = manager.subscribe("cam-a").unwrap();
    let slow = manager.subscribe("cam-a").unwrap();
    let mut worker = next_worker(&mut handle).await;

    worker.write_stdout(&encode_frame("cam-a", b"f1")).await.unwrap();
    assert_eq!(fast.recv().await, FrameEvent::Frame(Bytes::from_static(b"f1")));

    worker.write_stdout(&encode_frame("cam-a", b"f2")).await.unwrap();
    worker.write_stdout(&encode_frame("cam-a", b"f3")).await.unwrap();
    wait_until(|| {
        manager
            .health()
            .worker("cam-a")
            .is_some_and(|w| w.frames_sent == 3)
    })
    .await;

    assert_eq!(
        slow.try_recv(),
        Some(FrameEvent::Frame(Bytes::from_static(b"f3")))
    );
    assert_eq!(slow.try_recv(), None);
    assert_eq!(
        fast.try_recv(),
        Some(FrameEvent::Frame(Bytes::from_static(b"f3")))
    );
}

#[tokio::test]
async fn test_frames_for_other_devices_are_dropped() {
    let (manager, mut handle) = create_manager(CameraConfig::default());
    let subscription = manager.subscribe("cam-a").unwrap();
    let mut worker = next_worker(&mut handle).await;

    worker.write_stdout(&encode_frame("cam-b", b"foreign")).await.unwrap();
    worker.write_stdout(&encode_frame("cam-a", b"own")).await.unwrap();

    assert_eq!(
        subscription.recv().await,
        FrameEvent::Frame(Bytes::from_static(b"own"))
    );
    assert_eq!(manager.health().worker("cam-a").unwrap().frames_sent, 1);
}

#[tokio::test]
async fn test_bad_magic_ends_stream_and_next_subscribe_respawns() {
    let (manager, mut handle) = create_manager(CameraConfig::default());
    let subscription = manager.subscribe("cam-a").unwrap();
    let mut worker = next_worker(&mut handle).await;

    worker.write_stdout(&[b'X'; 40]).await.unwrap();
    assert_eq!(subscription.recv().await, FrameEvent::EndOfStream);

    let health = manager.health();
    let entry = health.worker("cam-a").unwrap();
    assert!(!entry.streaming);
    assert!(
        entry
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("frame unavailable"))
    );

    let again = manager.subscribe("cam-a").unwrap();
    assert_eq!(handle.spawn_count(), 2);
    let mut replacement = next_worker(&mut handle).await;
    wait_until(|| worker.was_terminated()).await;

    replacement
        .write_stdout(&encode_frame("cam-a", b"fresh"))
        .await
        .unwrap();
    assert_eq!(again.recv().await, FrameEvent::Frame(Bytes::from_static(b"fresh")));
}

#[tokio::test]
async fn test_worker_exit_ends_stream() {
    let (manager, mut handle) = create_manager(CameraConfig::default());
    let subscription = manager.subscribe("cam-a").unwrap();
    let mut worker = next_worker(&mut handle).await;

    worker.write_stderr("device busy").await.unwrap();
    worker.exit(1);

    assert_eq!(subscription.recv().await, FrameEvent::EndOfStream);
    assert_eq!(subscription.recv().await, FrameEvent::EndOfStream);
}

#[tokio::test]
async fn test_total_admission_limit() {
    let config = CameraConfig {
        max_total: 1,
        ..CameraConfig::default()
    };
    let (manager, handle) = create_manager(config);

    let _first = manager.subscribe("cam-a").unwrap();
    let refused = manager.subscribe("cam-b").unwrap_err();
    assert!(matches!(
        refused,
        Error::AdmissionLimit {
            scope: AdmissionScope::Total,
            limit: 1
        }
    ));

    let _second = manager.subscribe("cam-a").unwrap();
    assert_eq!(handle.spawn_count(), 1);
    assert_eq!(manager.health().subscriber_count, 2);
}

#[tokio::test]
async fn test_launch_failure_registers_nothing() {
    let (manager, handle) = create_manager(CameraConfig::default());
    handle.set_fail_launch(true);

    let error = manager.subscribe("cam-a").unwrap_err();
    assert!(matches!(error, Error::ResourceExhaustion(_)));
    assert_eq!(manager.worker_count(), 0);

    handle.set_fail_launch(false);
    assert!(manager.subscribe("cam-a").is_ok());
}

#[tokio::test]
async fn test_get_frame_returns_one_frame_and_stops_worker() {
    let (manager, mut handle) = create_manager(CameraConfig::default());

    let request = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.get_frame("cam-a", Duration::from_secs(2)).await })
    };
    let mut worker = next_worker(&mut handle).await;
    worker.write_stdout(&encode_frame("cam-a", b"jpeg")).await.unwrap();

    let frame = request.await.unwrap().unwrap();
    assert_eq!(frame, Some(Bytes::from_static(b"jpeg")));
    assert_eq!(manager.worker_count(), 0);
    assert!(worker.was_terminated());
}

#[tokio::test]
async fn test_get_frame_timeout_is_none() {
    let (manager, mut handle) = create_manager(CameraConfig::default());

    let frame = manager
        .get_frame("cam-a", Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(frame, None);
    assert_eq!(manager.worker_count(), 0);
    assert!(next_worker(&mut handle).await.was_terminated());
}

#[tokio::test]
async fn test_stubborn_worker_is_killed_after_grace() {
    let config = CameraConfig {
        stop_grace_ms: 50,
        ..CameraConfig::default()
    };
    let (manager, mut handle) = create_manager(config);
    handle.set_ignore_terminate(true);

    let subscription = manager.subscribe("cam-a").unwrap();
    let worker = next_worker(&mut handle).await;
    manager.unsubscribe(subscription).await;

    assert!(worker.was_terminated());
    assert!(worker.was_killed());
    assert!(worker.has_exited());
}

#[tokio::test]
async fn test_stream_frames_until_dropped() {
    let (manager, mut handle) = create_manager(CameraConfig::default());
    let mut stream = Box::pin(manager.stream_frames("cam-a").unwrap());
    let mut worker = next_worker(&mut handle).await;

    worker.write_stdout(&encode_frame("cam-a", b"a")).await.unwrap();
    assert_eq!(stream.next().await, Some(Bytes::from_static(b"a")));
    worker.write_stdout(&encode_frame("cam-a", b"b")).await.unwrap();
    assert_eq!(stream.next().await, Some(Bytes::from_static(b"b")));

    drop(stream);
    assert_eq!(manager.worker_count(), 0);
    wait_until(|| worker.was_terminated()).await;
}

#[tokio::test]
async fn test_stream_frames_ends_with_worker() {
    let (manager, mut handle) = create_manager(CameraConfig::default());
    let mut stream = Box::pin(manager.stream_frames("cam-a").unwrap());
    let mut worker = next_worker(&mut handle).await;

    worker.exit(0);
    assert_eq!(stream.next().await, None);
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn test_reset_stops_all_workers() {
    let (manager, mut handle) = create_manager(CameraConfig::default());
    let a = manager.subscribe("cam-a").unwrap();
    let _b = manager.subscribe("cam-b").unwrap();
    let worker_a = next_worker(&mut handle).await;
    let worker_b = next_worker(&mut handle).await;

    manager.reset().await;
    assert_eq!(manager.worker_count(), 0);
    assert!(worker_a.was_terminated());
    assert!(worker_b.was_terminated());
    assert_eq!(a.recv().await, FrameEvent::EndOfStream);
}
