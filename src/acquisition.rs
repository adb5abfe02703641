//! Acquisition driver: the control loops binding a camera to its consumers.
//!
//! The driver orchestrates the four acquisition modes on behalf of the
//! client:
//!
//! 1. **Synchronous grab**: the client pulls frames on its own task via
//!    [`AcquisitionDriver::grab`]; no buffering, caller-sequential order.
//! 2. **Asynchronous push**: with `transfer_asynchronously` set and a grab
//!    callback registered, [`start_recording`](AcquisitionDriver::start_recording)
//!    spawns one producer task that grabs in a loop and invokes the callback
//!    with each frame. The callback runs on the producer; at most one
//!    invocation is in flight per camera.
//! 3. **Record-to-ring**: [`record`](AcquisitionDriver::record) spawns a
//!    producer that writes successive frames into a [`RingBuffer`] until a
//!    configured count is reached or the client stops; overwrite-on-full.
//! 4. **Readout drain**: [`start_readout`](AcquisitionDriver::start_readout)
//!    spawns a producer that pulls frames out of on-camera memory into the
//!    ring until the backend signals end of stream, then emits a completion
//!    notification and leaves the camera in readout.
//!
//! # Cancellation and errors
//!
//! Producers poll a stop flag between frames. `stop_*` sets the flag, calls
//! the backend stop, then joins the producer; a producer blocked inside the
//! backend is unblocked by the device-level timeout. Transient errors
//! (timeouts, when retrying is configured) are logged and counted; any
//! other producer error stops production, performs the error-driven
//! transition to idle (so `is_recording` observers see the edge) and is
//! surfaced at the next `stop_*` or `grab` call. While the driver issues
//! software triggers itself, frames keep production order on every path.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::camera::{Camera, GrabCallback, TriggerSource};
use crate::config::AcquisitionConfig;
use crate::data::RingBuffer;
use crate::error::{CamResult, CameraError};

/// Counters of the current or most recent producer run.
#[derive(Clone, Debug)]
pub struct AcquisitionStats {
    /// When the producer was started.
    pub started_at: DateTime<Utc>,
    /// Frames delivered to the sink.
    pub frames: u64,
    /// Transient errors that did not abort the producer.
    pub transient_errors: u64,
}

/// What a producer does with each grabbed frame.
enum Sink {
    /// Invoke the client callback with a scratch frame.
    Callback {
        callback: GrabCallback,
        scratch: Vec<u8>,
    },
    /// Store into the ring, stopping after `limit` frames if set.
    Ring {
        ring: Arc<RingBuffer>,
        limit: Option<u64>,
    },
    /// Drain camRAM into the ring until end of stream.
    Drain { ring: Arc<RingBuffer> },
}

/// One spawned producer task.
struct Producer {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    done_rx: watch::Receiver<bool>,
}

/// State shared between the driver and its producer task.
struct Shared {
    camera: Arc<Camera>,
    stop: Arc<AtomicBool>,
    error: Arc<std::sync::Mutex<Option<CameraError>>>,
    frames: Arc<AtomicU64>,
    transient_errors: Arc<AtomicU64>,
    retry_on_timeout: bool,
    done_tx: watch::Sender<bool>,
}

/// Driver binding one [`Camera`] to the client's consumer path.
pub struct AcquisitionDriver {
    camera: Arc<Camera>,
    config: AcquisitionConfig,
    producer: tokio::sync::Mutex<Option<Producer>>,
    error: Arc<std::sync::Mutex<Option<CameraError>>>,
    frames: Arc<AtomicU64>,
    transient_errors: Arc<AtomicU64>,
    started_at: std::sync::Mutex<DateTime<Utc>>,
}

impl AcquisitionDriver {
    /// Create a driver for `camera`.
    pub fn new(camera: Arc<Camera>, config: AcquisitionConfig) -> Self {
        Self {
            camera,
            config,
            producer: tokio::sync::Mutex::new(None),
            error: Arc::new(std::sync::Mutex::new(None)),
            frames: Arc::new(AtomicU64::new(0)),
            transient_errors: Arc::new(AtomicU64::new(0)),
            started_at: std::sync::Mutex::new(Utc::now()),
        }
    }

    /// The driven camera.
    pub fn camera(&self) -> &Arc<Camera> {
        &self.camera
    }

    /// Allocate a ring buffer sized for the camera's current frame
    /// geometry. With `capacity: None` the configured default applies.
    pub async fn alloc_ring(&self, capacity: Option<u64>) -> CamResult<Arc<RingBuffer>> {
        let block_size = self.camera.frame_size().await?;
        let capacity = capacity.unwrap_or(self.config.default_ring_capacity);
        Ok(Arc::new(RingBuffer::new(block_size, capacity)?))
    }

    /// Counters of the current or most recent producer run.
    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            started_at: self
                .started_at
                .lock()
                .map(|t| *t)
                .unwrap_or_else(|_| Utc::now()),
            frames: self.frames.load(Ordering::Acquire),
            transient_errors: self.transient_errors.load(Ordering::Acquire),
        }
    }

    /// Take the error captured by a producer task, if any.
    pub fn take_error(&self) -> Option<CameraError> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }

    fn reset_counters(&self) {
        self.frames.store(0, Ordering::Release);
        self.transient_errors.store(0, Ordering::Release);
        if let Ok(mut slot) = self.started_at.lock() {
            *slot = Utc::now();
        }
    }

    async fn spawn_producer(&self, sink: Sink) {
        self.reset_counters();

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        let shared = Shared {
            camera: Arc::clone(&self.camera),
            stop: Arc::clone(&stop),
            error: Arc::clone(&self.error),
            frames: Arc::clone(&self.frames),
            transient_errors: Arc::clone(&self.transient_errors),
            retry_on_timeout: self.config.retry_on_timeout,
            done_tx,
        };

        let handle = tokio::spawn(run_producer(shared, sink));
        let mut slot = self.producer.lock().await;
        *slot = Some(Producer {
            handle,
            stop,
            done_rx,
        });
    }

    /// Set the stop flag, run the camera transition, join the producer.
    async fn stop_with(
        &self,
        transition: impl std::future::Future<Output = CamResult<()>>,
    ) -> CamResult<()> {
        let producer = self.producer.lock().await.take();
        if let Some(producer) = &producer {
            producer.stop.store(true, Ordering::Release);
        }

        let result = transition.await;

        if let Some(producer) = producer {
            if producer.handle.await.is_err() {
                warn!(camera = %self.camera.name(), "producer task panicked");
            }
        }

        // A captured producer error outranks the transition result: the
        // producer may already have stopped the camera, making the
        // transition report NotRecording.
        if let Some(error) = self.take_error() {
            return Err(error);
        }
        result
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Start recording. With `transfer_asynchronously` set this also
    /// spawns the push producer feeding the registered grab callback;
    /// otherwise the client pulls frames via [`grab`](Self::grab).
    pub async fn start_recording(&self) -> CamResult<()> {
        if self.camera.transfer_asynchronously() {
            let callback = self.camera.grab_callback().ok_or_else(|| {
                CameraError::Internal("transfer_asynchronously set but no grab callback".into())
            })?;
            let scratch = vec![0u8; self.camera.frame_size().await?];

            self.camera.start_recording().await?;
            self.spawn_producer(Sink::Callback { callback, scratch }).await;
            info!(camera = %self.camera.name(), "asynchronous push started");
        } else {
            self.camera.start_recording().await?;
        }
        Ok(())
    }

    /// Start recording into `ring`, stopping production after `limit`
    /// frames when given. The camera stays in recording state until
    /// [`stop_recording`](Self::stop_recording).
    pub async fn record(&self, ring: Arc<RingBuffer>, limit: Option<u64>) -> CamResult<()> {
        let frame_size = self.camera.frame_size().await?;
        if ring.block_size() != frame_size {
            return Err(CameraError::Internal(format!(
                "ring block size {} does not match the frame size {}",
                ring.block_size(),
                frame_size
            )));
        }

        ring.reset();
        self.camera.start_recording().await?;
        self.spawn_producer(Sink::Ring { ring, limit }).await;
        info!(camera = %self.camera.name(), ?limit, "recording into ring buffer");
        Ok(())
    }

    /// Stop recording: flag the producer, stop the backend, join, and
    /// surface any captured producer error.
    pub async fn stop_recording(&self) -> CamResult<()> {
        self.stop_with(self.camera.stop_recording()).await
    }

    // -------------------------------------------------------------------------
    // Readout
    // -------------------------------------------------------------------------

    /// Enter readout and drain on-camera memory into `ring`. When the
    /// backend signals end of stream the driver emits a completion
    /// notification (see [`wait_for_completion`](Self::wait_for_completion))
    /// and leaves the camera in readout until
    /// [`stop_readout`](Self::stop_readout).
    pub async fn start_readout(&self, ring: Arc<RingBuffer>) -> CamResult<()> {
        let frame_size = self.camera.frame_size().await?;
        if ring.block_size() != frame_size {
            return Err(CameraError::Internal(format!(
                "ring block size {} does not match the frame size {}",
                ring.block_size(),
                frame_size
            )));
        }

        ring.reset();
        self.camera.start_readout().await?;
        self.spawn_producer(Sink::Drain { ring }).await;
        info!(camera = %self.camera.name(), "readout drain started");
        Ok(())
    }

    /// Leave readout: flag the producer, stop the backend, join, surface
    /// captured errors.
    pub async fn stop_readout(&self) -> CamResult<()> {
        self.stop_with(self.camera.stop_readout()).await
    }

    // -------------------------------------------------------------------------
    // Client pulls
    // -------------------------------------------------------------------------

    /// Synchronously grab one frame into `dst`.
    ///
    /// Surfaces a pending producer error first, as the next driver entry
    /// point after the failure.
    pub async fn grab(&self, dst: &mut [u8]) -> CamResult<bool> {
        if let Some(error) = self.take_error() {
            return Err(error);
        }
        self.camera.grab(dst).await
    }

    /// Retrieve the recorded frame at `index` from on-camera memory.
    pub async fn readout_at(&self, dst: &mut [u8], index: u32) -> CamResult<bool> {
        if let Some(error) = self.take_error() {
            return Err(error);
        }
        self.camera.readout_at(dst, index).await
    }

    /// Wait until the active producer finishes (frame limit reached, end
    /// of stream drained, or stopped), bounded by the configured
    /// completion timeout.
    pub async fn wait_for_completion(&self) -> CamResult<()> {
        let mut done_rx = match self.producer.lock().await.as_ref() {
            Some(producer) => producer.done_rx.clone(),
            None => return Ok(()),
        };

        let waited = tokio::time::timeout(
            self.config.completion_timeout,
            done_rx.wait_for(|done| *done),
        )
        .await;

        match waited {
            Ok(Ok(_)) => Ok(()),
            // Sender dropped means the producer is gone either way.
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(CameraError::Timeout),
        }
    }
}

/// Producer loop for all three spawned modes.
async fn run_producer(shared: Shared, mut sink: Sink) {
    let camera = Arc::clone(&shared.camera);
    let software = matches!(
        camera.trigger_source().await,
        Ok(TriggerSource::Software)
    ) && !matches!(sink, Sink::Drain { .. });

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        if software {
            match camera.trigger().await {
                Ok(()) => {}
                Err(_) if shared.stop.load(Ordering::Acquire) => break,
                Err(CameraError::NotRecording) => break,
                Err(error) => {
                    fatal(&shared, error).await;
                    break;
                }
            }
        }

        let grabbed = match &mut sink {
            Sink::Callback { scratch, .. } => camera.grab(scratch).await,
            Sink::Ring { ring, .. } | Sink::Drain { ring } => {
                camera.grab(ring.write_ptr()).await
            }
        };

        match grabbed {
            Ok(true) => {
                match &sink {
                    Sink::Callback { callback, scratch } => callback(scratch.as_slice()),
                    Sink::Ring { ring, .. } | Sink::Drain { ring } => ring.write_advance(),
                }
                let frames = shared.frames.fetch_add(1, Ordering::AcqRel) + 1;

                if let Sink::Ring {
                    limit: Some(limit), ..
                } = &sink
                {
                    if frames >= *limit {
                        debug!(camera = %camera.name(), frames, "frame limit reached");
                        break;
                    }
                }
            }
            Ok(false) => {
                // End of stream: the normal completion of a drain.
                info!(
                    camera = %camera.name(),
                    frames = shared.frames.load(Ordering::Acquire),
                    "readout drained"
                );
                break;
            }
            Err(_) if shared.stop.load(Ordering::Acquire) => break,
            Err(error) if error.is_transient() && shared.retry_on_timeout => {
                shared.transient_errors.fetch_add(1, Ordering::AcqRel);
                warn!(camera = %camera.name(), error = %error, "transient grab error");
            }
            Err(error) => {
                fatal(&shared, error).await;
                break;
            }
        }
    }

    let _ = shared.done_tx.send(true);
}

/// Capture a fatal producer error and perform the error-driven stop so
/// `is_recording` observers see the true→false edge.
async fn fatal(shared: &Shared, error: CameraError) {
    warn!(camera = %shared.camera.name(), error = %error, "producer stopped on error");
    if let Ok(mut slot) = shared.error.lock() {
        *slot = Some(error);
    }
    if shared.camera.is_recording() {
        shared.camera.stop_recording_after_error().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::props;
    use crate::instrument::mock::MockCamera;
    use crate::parameter::ParameterValue;
    use std::time::Duration;

    async fn driver_for(mock: MockCamera) -> AcquisitionDriver {
        let camera = Arc::new(Camera::new(Box::new(mock)).await.unwrap());
        AcquisitionDriver::new(camera, AcquisitionConfig::default())
    }

    fn small_mock() -> MockCamera {
        MockCamera::builder()
            .roi(0, 0, 32, 32)
            .bitdepth(8)
            .exposure_time(0.001)
            .build()
    }

    #[tokio::test]
    async fn test_record_until_limit() {
        let driver = driver_for(small_mock()).await;
        let ring = driver.alloc_ring(Some(8)).await.unwrap();

        driver.record(Arc::clone(&ring), Some(5)).await.unwrap();
        driver.wait_for_completion().await.unwrap();

        // Limit reached but camera still recording until told otherwise.
        assert!(driver.camera().is_recording());
        driver.stop_recording().await.unwrap();

        assert_eq!(ring.num_blocks(), 5);
        assert_eq!(driver.stats().frames, 5);
        for i in 0..5 {
            assert_eq!(MockCamera::frame_number_of(ring.get_ptr(i)), i);
        }
    }

    #[tokio::test]
    async fn test_record_with_software_trigger_issued_by_driver() {
        let driver = driver_for(small_mock()).await;
        driver
            .camera()
            .set(
                props::TRIGGER_SOURCE,
                ParameterValue::EnumIndex(TriggerSource::Software.index()),
            )
            .await
            .unwrap();

        let ring = driver.alloc_ring(Some(8)).await.unwrap();
        driver.record(Arc::clone(&ring), Some(3)).await.unwrap();
        driver.wait_for_completion().await.unwrap();
        driver.stop_recording().await.unwrap();

        assert_eq!(ring.num_blocks(), 3);
    }

    #[tokio::test]
    async fn test_ring_size_mismatch_is_rejected_before_start() {
        let driver = driver_for(small_mock()).await;
        let wrong = Arc::new(RingBuffer::new(7, 4).unwrap());

        assert!(matches!(
            driver.record(wrong, None).await,
            Err(CameraError::Internal(_))
        ));
        // Atomic start: nothing was armed.
        assert!(!driver.camera().is_recording());
    }

    #[tokio::test]
    async fn test_push_requires_callback() {
        let driver = driver_for(small_mock()).await;
        driver
            .camera()
            .set(props::TRANSFER_ASYNCHRONOUSLY, true)
            .await
            .unwrap();

        assert!(matches!(
            driver.start_recording().await,
            Err(CameraError::Internal(_))
        ));
        assert!(!driver.camera().is_recording());
    }

    #[tokio::test]
    async fn test_fatal_error_stops_camera_and_surfaces_at_stop() {
        let mock = MockCamera::builder()
            .roi(0, 0, 32, 32)
            .bitdepth(8)
            .exposure_time(0.001)
            .fail_grab_after(2, CameraError::device(-5, "dma stall"))
            .build();
        let driver = driver_for(mock).await;

        let ring = driver.alloc_ring(Some(8)).await.unwrap();
        driver.record(Arc::clone(&ring), None).await.unwrap();
        driver.wait_for_completion().await.unwrap();

        // Error-driven stop already happened.
        assert!(!driver.camera().is_recording());
        assert_eq!(
            driver.stop_recording().await,
            Err(CameraError::device(-5, "dma stall"))
        );
        assert_eq!(ring.num_blocks(), 2);
    }

    #[tokio::test]
    async fn test_producer_error_surfaces_at_next_grab() {
        let mock = MockCamera::builder()
            .roi(0, 0, 32, 32)
            .bitdepth(8)
            .exposure_time(0.001)
            .fail_grab_after(1, CameraError::device(-7, "fifo overflow"))
            .build();
        let driver = driver_for(mock).await;

        let ring = driver.alloc_ring(Some(4)).await.unwrap();
        driver.record(Arc::clone(&ring), None).await.unwrap();
        driver.wait_for_completion().await.unwrap();

        let mut frame = vec![0u8; 32 * 32];
        assert_eq!(
            driver.grab(&mut frame).await,
            Err(CameraError::device(-7, "fifo overflow"))
        );
        // Consumed: the camera is simply idle afterwards.
        assert_eq!(
            driver.stop_recording().await,
            Err(CameraError::NotRecording)
        );
    }

    #[tokio::test]
    async fn test_readout_drain_completes_and_stays_in_readout() {
        let mock = MockCamera::builder()
            .roi(0, 0, 32, 32)
            .bitdepth(8)
            .camram_capacity(16)
            .build();
        let driver = driver_for(mock).await;
        driver
            .camera()
            .set(
                props::TRIGGER_SOURCE,
                ParameterValue::EnumIndex(TriggerSource::Software.index()),
            )
            .await
            .unwrap();

        // Record ten frames into camRAM.
        driver.camera().start_recording().await.unwrap();
        for _ in 0..10 {
            driver.camera().trigger().await.unwrap();
        }
        driver.stop_recording().await.unwrap();

        let ring = driver.alloc_ring(Some(16)).await.unwrap();
        driver.start_readout(Arc::clone(&ring)).await.unwrap();
        driver.wait_for_completion().await.unwrap();

        assert!(driver.camera().is_readout());
        assert_eq!(ring.num_blocks(), 10);
        for i in 0..10 {
            assert_eq!(MockCamera::frame_number_of(ring.get_ptr(i)), i);
        }

        driver.stop_readout().await.unwrap();
        assert!(!driver.camera().is_readout());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_timeouts_are_transient_when_retrying() {
        let mock = MockCamera::builder()
            .roi(0, 0, 32, 32)
            .bitdepth(8)
            .grab_timeout(Duration::from_millis(5))
            .build();
        let driver = driver_for(mock).await;
        driver
            .camera()
            .set(
                props::TRIGGER_SOURCE,
                ParameterValue::EnumIndex(TriggerSource::External.index()),
            )
            .await
            .unwrap();

        let ring = driver.alloc_ring(Some(4)).await.unwrap();
        driver.record(Arc::clone(&ring), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        driver.stop_recording().await.unwrap();

        assert!(driver.stats().transient_errors > 0);
        assert_eq!(ring.num_blocks(), 0);
        assert!(logs_contain("transient grab error"));
    }

    #[tokio::test]
    async fn test_timeout_is_fatal_without_retry() {
        let mock = MockCamera::builder()
            .roi(0, 0, 32, 32)
            .bitdepth(8)
            .grab_timeout(Duration::from_millis(5))
            .build();
        let camera = Arc::new(Camera::new(Box::new(mock)).await.unwrap());
        let driver = AcquisitionDriver::new(
            camera,
            AcquisitionConfig {
                retry_on_timeout: false,
                ..AcquisitionConfig::default()
            },
        );
        driver
            .camera()
            .set(
                props::TRIGGER_SOURCE,
                ParameterValue::EnumIndex(TriggerSource::External.index()),
            )
            .await
            .unwrap();

        let ring = driver.alloc_ring(Some(4)).await.unwrap();
        driver.record(Arc::clone(&ring), None).await.unwrap();
        driver.wait_for_completion().await.unwrap();

        assert_eq!(
            driver.stop_recording().await,
            Err(CameraError::Timeout)
        );
        assert!(!driver.camera().is_recording());
    }

    #[tokio::test]
    async fn test_wait_for_completion_without_producer_is_noop() {
        let driver = driver_for(small_mock()).await;
        driver.wait_for_completion().await.unwrap();
    }
}
