//! End-to-end acquisition scenarios against the synthetic backend.
//!
//! Each test walks a client workflow through the public surface only:
//! parameter API, acquisition API and ring-buffer API.

use camdaq::camera::{props, Camera, TriggerSource};
use camdaq::instrument::MockCamera;
use camdaq::parameter::ParameterValue;
use camdaq::{AcquisitionConfig, AcquisitionDriver, CameraError, RingBuffer};
use serial_test::serial;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn driver_for(mock: MockCamera) -> AcquisitionDriver {
    init_tracing();
    let camera = Arc::new(Camera::new(Box::new(mock)).await.unwrap());
    AcquisitionDriver::new(camera, AcquisitionConfig::default())
}

fn software_trigger() -> ParameterValue {
    ParameterValue::EnumIndex(TriggerSource::Software.index())
}

/// Preview, record ten software-triggered frames into an eight-block ring,
/// then inspect the retained window as a save loop would.
#[tokio::test]
async fn preview_record_save() {
    let mock = MockCamera::builder()
        .sensor(1024, 1024)
        .roi(0, 0, 1024, 1024)
        .bitdepth(16)
        .build();
    let driver = driver_for(mock).await;
    let camera = driver.camera();

    camera.set(props::TRIGGER_SOURCE, software_trigger()).await.unwrap();
    assert_eq!(camera.frame_size().await.unwrap(), 2 * 1024 * 1024);

    let ring = Arc::new(RingBuffer::new(2 * 1024 * 1024, 8).unwrap());

    driver.start_recording().await.unwrap();
    for _ in 0..10 {
        camera.trigger().await.unwrap();
        assert!(driver.grab(ring.write_ptr()).await.unwrap());
        ring.write_advance();
    }
    driver.stop_recording().await.unwrap();

    assert_eq!(ring.num_blocks(), 8);
    // Two frames were overwritten: position 0 holds the 3rd trigger's
    // frame, position 7 the 10th's.
    assert_eq!(MockCamera::frame_number_of(ring.get_ptr(0)), 2);
    assert_eq!(MockCamera::frame_number_of(ring.get_ptr(7)), 9);

    // Drain in FIFO order, as the save path does.
    let mut expected = 2u64;
    while let Some(block) = ring.read_ptr() {
        assert_eq!(MockCamera::frame_number_of(block), expected);
        expected += 1;
    }
    assert_eq!(expected, 10);
}

/// Asynchronous push at a 10 ms exposure delivers frames at the sensor
/// cadence, one callback invocation per frame.
#[tokio::test]
#[serial]
async fn async_callback_cadence() {
    let mock = MockCamera::builder()
        .roi(0, 0, 64, 64)
        .bitdepth(8)
        .exposure_time(0.010)
        .build();
    let driver = driver_for(mock).await;
    let camera = driver.camera();

    let counter = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&counter);
    camera.set_grab_callback(move |_frame| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    camera.set(props::TRANSFER_ASYNCHRONOUSLY, true).await.unwrap();

    let started = std::time::Instant::now();
    driver.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    driver.stop_recording().await.unwrap();
    let elapsed = started.elapsed();

    let count = counter.load(Ordering::SeqCst);
    // ~100 frames per second; the deadline schedule catches up after
    // scheduler hiccups, so bound against the measured wall time.
    let ceiling = (elapsed.as_millis() / 10) as u32 + 2;
    assert!(count >= 90, "only {} callbacks in {:?}", count, elapsed);
    assert!(count <= ceiling, "{} callbacks exceed {:?}", count, elapsed);
    assert_eq!(driver.stats().frames as u32, count);
}

/// Record a hundred frames to camRAM, then drain them through readout.
#[tokio::test]
async fn camram_readout() {
    let mock = MockCamera::builder()
        .roi(0, 0, 64, 64)
        .bitdepth(16)
        .camram_capacity(128)
        .build();
    let driver = driver_for(mock).await;
    let camera = driver.camera();
    assert!(camera.has_camram_recording());

    camera.set(props::TRIGGER_SOURCE, software_trigger()).await.unwrap();

    driver.start_recording().await.unwrap();
    for _ in 0..100 {
        camera.trigger().await.unwrap();
    }
    driver.stop_recording().await.unwrap();

    assert_eq!(
        camera.get(props::RECORDED_FRAMES).await.unwrap(),
        ParameterValue::UInt(100)
    );

    let ring = driver.alloc_ring(Some(128)).await.unwrap();
    driver.start_readout(Arc::clone(&ring)).await.unwrap();
    driver.wait_for_completion().await.unwrap();

    assert_eq!(ring.num_blocks(), 100);
    for i in 0..100 {
        assert_eq!(MockCamera::frame_number_of(ring.get_ptr(i)), i);
    }

    // The stream is exhausted but the camera stays in readout.
    let mut frame = vec![0u8; camera.frame_size().await.unwrap()];
    assert!(!driver.grab(&mut frame).await.unwrap());
    assert!(camera.is_readout());

    // Random access per index keeps working until readout ends.
    assert!(driver.readout_at(&mut frame, 42).await.unwrap());
    assert_eq!(MockCamera::frame_number_of(&frame), 42);

    driver.stop_readout().await.unwrap();
    assert!(!camera.is_readout());
}

/// ROI writes honor the multiplier step and the sensor bounds.
#[tokio::test]
async fn geometry_validation() {
    let mock = MockCamera::builder()
        .sensor(2048, 2048)
        .roi(0, 0, 2048, 2048)
        .roi_multipliers(8, 8)
        .build();
    let driver = driver_for(mock).await;
    let camera = driver.camera();

    assert!(matches!(
        camera.set(props::ROI_WIDTH, 2047u64).await,
        Err(CameraError::OutOfRange { .. })
    ));
    camera.set(props::ROI_WIDTH, 2048u64).await.unwrap();
    assert!(matches!(
        camera.set(props::ROI_X, 4u64).await,
        Err(CameraError::OutOfRange { .. })
    ));

    // A narrower ROI frees room for the origin shift.
    camera.set(props::ROI_WIDTH, 1024u64).await.unwrap();
    camera.set(props::ROI_X, 4u64).await.unwrap();
}

/// Exposure is live-writable during a recording; geometry is not.
#[tokio::test]
async fn mid_acquisition_writability() {
    let driver = driver_for(MockCamera::builder().build()).await;
    let camera = driver.camera();

    assert!(camera
        .is_writable_during_acquisition(props::EXPOSURE_TIME)
        .unwrap());
    assert!(!camera.is_writable_during_acquisition(props::ROI_WIDTH).unwrap());

    driver.start_recording().await.unwrap();

    camera.set(props::EXPOSURE_TIME, 0.020).await.unwrap();
    assert_eq!(
        camera.get(props::EXPOSURE_TIME).await.unwrap(),
        ParameterValue::Float(0.020)
    );
    assert!(matches!(
        camera.set(props::ROI_WIDTH, 1024u64).await,
        Err(CameraError::BusyRecording(_))
    ));

    driver.stop_recording().await.unwrap();
}

/// A backend that never delivers surfaces a timeout; the camera stays in
/// recording state and a subsequent stop succeeds.
#[tokio::test]
async fn timeout_surfacing() {
    let mock = MockCamera::builder()
        .roi(0, 0, 64, 64)
        .bitdepth(8)
        .grab_timeout(Duration::from_millis(50))
        .build();
    let driver = driver_for(mock).await;
    let camera = driver.camera();

    camera
        .set(
            props::TRIGGER_SOURCE,
            ParameterValue::EnumIndex(TriggerSource::External.index()),
        )
        .await
        .unwrap();

    driver.start_recording().await.unwrap();

    let mut frame = vec![0u8; camera.frame_size().await.unwrap()];
    assert_eq!(driver.grab(&mut frame).await, Err(CameraError::Timeout));
    assert!(camera.is_recording());

    driver.stop_recording().await.unwrap();
    assert!(!camera.is_recording());
}

/// Software triggering under AUTO is accepted as a no-op, consistently.
#[tokio::test]
async fn trigger_in_auto_mode_is_consistent() {
    let driver = driver_for(
        MockCamera::builder()
            .roi(0, 0, 32, 32)
            .bitdepth(8)
            .exposure_time(0.001)
            .build(),
    )
    .await;
    let camera = driver.camera();

    driver.start_recording().await.unwrap();
    assert!(camera.trigger().await.is_ok());
    assert!(camera.trigger().await.is_ok());

    // Free-running frames are unaffected by the spurious triggers.
    let mut frame = vec![0u8; camera.frame_size().await.unwrap()];
    assert!(driver.grab(&mut frame).await.unwrap());
    assert_eq!(MockCamera::frame_number_of(&frame), 0);

    driver.stop_recording().await.unwrap();
}

/// Observers on `is_recording` see every genuine transition, including
/// error-driven stops.
#[tokio::test]
async fn recording_observers_see_error_driven_stop() {
    let mock = MockCamera::builder()
        .roi(0, 0, 32, 32)
        .bitdepth(8)
        .exposure_time(0.001)
        .fail_grab_after(3, CameraError::device(-2, "transport fault"))
        .build();
    let driver = driver_for(mock).await;
    let camera = driver.camera();

    let stops = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&stops);
    camera
        .subscribe(props::IS_RECORDING, move |value| {
            if value.as_bool() == Some(false) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let ring = driver.alloc_ring(Some(8)).await.unwrap();
    driver.record(Arc::clone(&ring), None).await.unwrap();
    driver.wait_for_completion().await.unwrap();

    // The producer hit the fault and performed the stop itself.
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(matches!(
        driver.stop_recording().await,
        Err(CameraError::Device { .. })
    ));
    assert_eq!(ring.num_blocks(), 3);
}
