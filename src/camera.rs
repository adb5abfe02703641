//! Camera contract and runtime.
//!
//! Two halves live here:
//!
//! - [`CameraDevice`]: the hardware-agnostic contract every device backend
//!   implements (frame-grabber DMA, PCIe streams, UDP sockets, vendor SDKs).
//!   Backends publish their tunables as a [`ParameterRegistry`] and are by
//!   contract not re-entrant; the runtime guarantees serial entry.
//! - [`Camera`]: the runtime wrapper clients talk to. It owns the
//!   acquisition state machine, routes parameter access through validation,
//!   dispatches observers, and serializes every backend call.
//!
//! # State machine
//!
//! ```text
//!  IDLE ──start_recording──▶ RECORDING ──stop_recording──▶ IDLE
//!  IDLE ──start_readout───▶ READOUT ────stop_readout────▶ IDLE
//! ```
//!
//! READOUT is only reachable from IDLE and only on devices advertising
//! camRAM recording. Transitions are serialized by a per-camera mutex and
//! `is_recording` / `is_readout` observers fire after a transition
//! completes, for every genuine edge including error-driven stops.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CamResult, CameraError};
use crate::parameter::{
    ParameterDescriptor, ParameterRegistry, ParameterValue, Unit,
};

/// Standard parameter names shared by all backends.
///
/// These strings are the vocabulary of the acquisition core: the runtime
/// routes some of them internally and the driver derives frame geometry
/// from others, so backends must publish their tunables under exactly
/// these names.
pub mod props {
    /// Camera name (read-only string).
    pub const NAME: &str = "name";
    /// Sensor width in pixels.
    pub const SENSOR_WIDTH: &str = "sensor_width";
    /// Sensor height in pixels.
    pub const SENSOR_HEIGHT: &str = "sensor_height";
    /// Physical pixel width in meters.
    pub const SENSOR_PIXEL_WIDTH: &str = "sensor_pixel_width";
    /// Physical pixel height in meters.
    pub const SENSOR_PIXEL_HEIGHT: &str = "sensor_pixel_height";
    /// Sensor bit depth.
    pub const SENSOR_BITDEPTH: &str = "sensor_bitdepth";
    /// Sensor temperature in degree Celsius.
    pub const SENSOR_TEMPERATURE: &str = "sensor_temperature";
    /// Horizontal binning factor.
    pub const HORIZONTAL_BINNING: &str = "horizontal_binning";
    /// Vertical binning factor.
    pub const VERTICAL_BINNING: &str = "vertical_binning";
    /// Trigger source enumeration (auto / software / external).
    pub const TRIGGER_SOURCE: &str = "trigger_source";
    /// Trigger type enumeration (edge / level).
    pub const TRIGGER_TYPE: &str = "trigger_type";
    /// Exposure time in seconds.
    pub const EXPOSURE_TIME: &str = "exposure_time";
    /// Frame rate in frames per second.
    pub const FRAMES_PER_SECOND: &str = "frames_per_second";
    /// Delay between trigger and exposure in seconds.
    pub const DELAY_TIME: &str = "delay_time";
    /// ROI horizontal origin.
    pub const ROI_X: &str = "roi_x";
    /// ROI vertical origin.
    pub const ROI_Y: &str = "roi_y";
    /// ROI width in pixels.
    pub const ROI_WIDTH: &str = "roi_width";
    /// ROI height in pixels.
    pub const ROI_HEIGHT: &str = "roi_height";
    /// Minimum step of the ROI width.
    pub const ROI_WIDTH_MULTIPLIER: &str = "roi_width_multiplier";
    /// Minimum step of the ROI height.
    pub const ROI_HEIGHT_MULTIPLIER: &str = "roi_height_multiplier";
    /// Whether the camera can stream continuously.
    pub const HAS_STREAMING: &str = "has_streaming";
    /// Whether the camera records to on-board memory.
    pub const HAS_CAMRAM_RECORDING: &str = "has_camram_recording";
    /// Number of frames recorded into on-board memory.
    pub const RECORDED_FRAMES: &str = "recorded_frames";
    /// Whether frames are pushed through the grab callback.
    pub const TRANSFER_ASYNCHRONOUSLY: &str = "transfer_asynchronously";
    /// Whether the camera is currently recording.
    pub const IS_RECORDING: &str = "is_recording";
    /// Whether the camera is currently in readout mode.
    pub const IS_READOUT: &str = "is_readout";
    /// Whether transport-side buffering is enabled.
    pub const BUFFERED: &str = "buffered";
    /// Number of transport buffers.
    pub const NUM_BUFFERS: &str = "num_buffers";
}

// =============================================================================
// Trigger model
// =============================================================================

/// Producer of frame-start events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriggerSource {
    /// The sensor free-runs at its configured frame rate.
    #[default]
    Auto,
    /// Each frame requires a [`Camera::trigger`] call.
    Software,
    /// Frames are started by the hardware trigger input.
    External,
}

impl TriggerSource {
    /// Enumeration names, in index order.
    pub const NAMES: [&'static str; 3] = ["auto", "software", "external"];

    /// Enumeration index of this source.
    pub fn index(&self) -> u32 {
        match self {
            TriggerSource::Auto => 0,
            TriggerSource::Software => 1,
            TriggerSource::External => 2,
        }
    }

    /// Source for an enumeration index.
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(TriggerSource::Auto),
            1 => Some(TriggerSource::Software),
            2 => Some(TriggerSource::External),
            _ => None,
        }
    }
}

/// Signal semantics of the external trigger input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriggerType {
    /// Frame starts on a signal edge.
    #[default]
    Edge,
    /// Frame integrates while the signal is asserted.
    Level,
}

impl TriggerType {
    /// Enumeration names, in index order.
    pub const NAMES: [&'static str; 2] = ["edge", "level"];

    /// Enumeration index of this type.
    pub fn index(&self) -> u32 {
        match self {
            TriggerType::Edge => 0,
            TriggerType::Level => 1,
        }
    }

    /// Type for an enumeration index.
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(TriggerType::Edge),
            1 => Some(TriggerType::Level),
            _ => None,
        }
    }
}

// =============================================================================
// Backend contract
// =============================================================================

/// Contract every device backend must fulfill.
///
/// The runtime guarantees serial entry: no two methods run concurrently for
/// one camera. Backends therefore keep their transport state without any
/// internal locking. Parameter values arriving at [`write`](Self::write)
/// have already passed type, range and access validation; backends only
/// check cross-field constraints (e.g. ROI against sensor bounds).
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Stable device name.
    fn name(&self) -> &str;

    /// Parameter table in declaration order.
    fn registry(&self) -> &ParameterRegistry;

    /// Read the current value of a parameter.
    async fn read(&self, name: &str) -> CamResult<ParameterValue>;

    /// Write a validated value.
    ///
    /// # Errors
    ///
    /// `OutOfRange` for cross-field violations; `Device` for transport
    /// failures, which leave the parameter at its prior value.
    async fn write(&mut self, name: &str, value: &ParameterValue) -> CamResult<()>;

    /// Arm the sensor, apply pending geometry/timing, begin producing
    /// frames at the cadence of the current trigger source.
    async fn start_recording(&mut self) -> CamResult<()>;

    /// Halt production and flush in-flight transport buffers.
    async fn stop_recording(&mut self) -> CamResult<()>;

    /// Enter readout of on-board memory.
    ///
    /// Only called on devices advertising camRAM recording.
    async fn start_readout(&mut self) -> CamResult<()>;

    /// Leave readout mode.
    async fn stop_readout(&mut self) -> CamResult<()>;

    /// Cause exactly one frame when the source is software.
    ///
    /// Behavior under other trigger sources is backend-defined (rejected
    /// or ignored) but must be consistent per backend.
    async fn trigger(&mut self) -> CamResult<()>;

    /// Block until the next frame is available or the device timeout
    /// elapses, then copy one frame into `dst`.
    ///
    /// Returns `false` to signal end of stream (only valid in readout).
    ///
    /// # Errors
    ///
    /// `Timeout` when the device timeout elapses; `Device` for transport
    /// failures.
    async fn grab(&mut self, dst: &mut [u8]) -> CamResult<bool>;

    /// Copy the frame at `index` out of on-board memory.
    ///
    /// Returns `false` when `index` lies beyond the recorded range.
    async fn readout(&mut self, dst: &mut [u8], index: u32) -> CamResult<bool>;

    /// Device-defined bulk side channel (firmware, lookup tables).
    async fn write_blob(&mut self, name: &str, data: &[u8]) -> CamResult<()>;
}

/// Callback receiving each frame in asynchronous transfer mode.
///
/// Runs on the producer task; at most one invocation is in flight per
/// camera.
pub type GrabCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Observer notified after a successful parameter write.
pub type Observer = Arc<dyn Fn(&ParameterValue) + Send + Sync>;

// =============================================================================
// Camera runtime
// =============================================================================

/// Client-facing camera: state machine, parameter boundary, serialized
/// backend access.
pub struct Camera {
    backend: Mutex<Box<dyn CameraDevice>>,
    name: String,
    registry: ParameterRegistry,

    /// Serializes state-machine transitions.
    transition: Mutex<()>,

    is_recording: AtomicBool,
    is_readout: AtomicBool,
    transfer_async: AtomicBool,

    has_streaming: bool,
    has_camram: bool,

    observers: RwLock<HashMap<String, Vec<Observer>>>,
    grab_callback: RwLock<Option<GrabCallback>>,
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("name", &self.name)
            .field("is_recording", &self.is_recording())
            .field("is_readout", &self.is_readout())
            .field("parameters", &self.registry.len())
            .finish()
    }
}

impl Camera {
    /// Wrap a backend handed over by the plugin layer.
    ///
    /// Reads the capability flags once and injects the runtime-handled
    /// descriptors (`is_recording`, `is_readout`,
    /// `transfer_asynchronously`) into the published table.
    pub async fn new(backend: Box<dyn CameraDevice>) -> CamResult<Self> {
        let name = backend.name().to_string();
        let mut registry = backend.registry().clone();

        fn flag(registry: &ParameterRegistry, name: &str, fallback: bool) -> bool {
            match registry.descriptor(name) {
                Ok(descriptor) => descriptor.default.as_bool().unwrap_or(fallback),
                Err(_) => fallback,
            }
        }
        let has_streaming = flag(&registry, props::HAS_STREAMING, true);
        let has_camram = flag(&registry, props::HAS_CAMRAM_RECORDING, false);

        registry.register(
            ParameterDescriptor::new(props::TRANSFER_ASYNCHRONOUSLY, false),
        );
        registry.register(ParameterDescriptor::new(props::IS_RECORDING, false).read_only());
        registry.register(ParameterDescriptor::new(props::IS_READOUT, false).read_only());

        Ok(Self {
            backend: Mutex::new(backend),
            name,
            registry,
            transition: Mutex::new(()),
            is_recording: AtomicBool::new(false),
            is_readout: AtomicBool::new(false),
            transfer_async: AtomicBool::new(false),
            has_streaming,
            has_camram,
            observers: RwLock::new(HashMap::new()),
            grab_callback: RwLock::new(None),
        })
    }

    /// Camera name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the device supports continuous recording.
    pub fn has_streaming(&self) -> bool {
        self.has_streaming
    }

    /// Whether the device records to on-board memory.
    pub fn has_camram_recording(&self) -> bool {
        self.has_camram
    }

    /// Current recording state.
    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::Acquire)
    }

    /// Current readout state.
    pub fn is_readout(&self) -> bool {
        self.is_readout.load(Ordering::Acquire)
    }

    /// Whether frames are pushed through the grab callback.
    pub fn transfer_asynchronously(&self) -> bool {
        self.transfer_async.load(Ordering::Acquire)
    }

    /// Set the function called with each frame in asynchronous mode.
    pub fn set_grab_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.grab_callback.write() {
            *slot = Some(Arc::new(callback));
        }
    }

    /// Registered grab callback, if any.
    pub fn grab_callback(&self) -> Option<GrabCallback> {
        self.grab_callback.read().ok().and_then(|slot| slot.clone())
    }

    // -------------------------------------------------------------------------
    // Parameter boundary
    // -------------------------------------------------------------------------

    /// Descriptors in declaration order.
    pub fn list_parameters(&self) -> &[ParameterDescriptor] {
        self.registry.list()
    }

    /// Unit of a parameter.
    pub fn unit_of(&self, name: &str) -> CamResult<Unit> {
        Ok(self.registry.descriptor(name)?.unit)
    }

    /// Whether a parameter may be written while the camera records.
    pub fn is_writable_during_acquisition(&self, name: &str) -> CamResult<bool> {
        Ok(self.registry.descriptor(name)?.writable_during_acquisition)
    }

    fn is_runtime_parameter(name: &str) -> bool {
        matches!(
            name,
            props::IS_RECORDING | props::IS_READOUT | props::TRANSFER_ASYNCHRONOUSLY
        )
    }

    /// Read a parameter value.
    pub async fn get(&self, name: &str) -> CamResult<ParameterValue> {
        self.registry.validate_read(name)?;

        if Self::is_runtime_parameter(name) {
            let value = match name {
                props::IS_RECORDING => self.is_recording(),
                props::IS_READOUT => self.is_readout(),
                _ => self.transfer_asynchronously(),
            };
            return Ok(ParameterValue::Bool(value));
        }

        self.backend.lock().await.read(name).await
    }

    /// Write a parameter value.
    ///
    /// The value is validated against the descriptor before the backend
    /// sees it; while the camera records, only live-writable parameters
    /// pass. Observers fire after the write succeeds. A backend failure
    /// leaves the parameter at its prior value.
    pub async fn set(&self, name: &str, value: impl Into<ParameterValue>) -> CamResult<()> {
        let value = value.into();
        self.registry
            .validate_write(name, &value, self.is_recording())?;

        if Self::is_runtime_parameter(name) {
            // Only transfer_asynchronously is writable among these.
            let on = value.as_bool().unwrap_or(false);
            self.transfer_async.store(on, Ordering::Release);
        } else {
            self.backend.lock().await.write(name, &value).await?;
        }

        debug!(camera = %self.name, parameter = name, value = %value, "parameter written");
        self.notify(name, &value);
        Ok(())
    }

    /// Register an observer notified after each successful write of
    /// `name`, synchronously from the writer's context.
    pub fn subscribe(
        &self,
        name: &str,
        observer: impl Fn(&ParameterValue) + Send + Sync + 'static,
    ) -> CamResult<()> {
        self.registry.descriptor(name)?;
        if let Ok(mut observers) = self.observers.write() {
            observers
                .entry(name.to_string())
                .or_default()
                .push(Arc::new(observer));
        }
        Ok(())
    }

    fn notify(&self, name: &str, value: &ParameterValue) {
        let callbacks: Vec<Observer> = match self.observers.read() {
            Ok(observers) => observers.get(name).cloned().unwrap_or_default(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(value);
        }
    }

    /// Current trigger source, decoded from the enumeration parameter.
    pub async fn trigger_source(&self) -> CamResult<TriggerSource> {
        let value = self.get(props::TRIGGER_SOURCE).await?;
        let index = value.as_enum_index().ok_or_else(|| {
            CameraError::Internal(format!("trigger_source published as {}", value))
        })?;
        TriggerSource::from_index(index)
            .ok_or_else(|| CameraError::Internal(format!("trigger_source index {}", index)))
    }

    /// Bytes of one frame with the current geometry:
    /// `roi_width × roi_height × bytes_per_sample`, where a sample is one
    /// byte up to 8-bit sensors and two bytes beyond.
    pub async fn frame_size(&self) -> CamResult<usize> {
        let backend = self.backend.lock().await;
        let width = backend.read(props::ROI_WIDTH).await?.as_u64().unwrap_or(0);
        let height = backend.read(props::ROI_HEIGHT).await?.as_u64().unwrap_or(0);
        let bitdepth = backend
            .read(props::SENSOR_BITDEPTH)
            .await?
            .as_u64()
            .unwrap_or(8);
        let bytes_per_sample = if bitdepth <= 8 { 1 } else { 2 };
        Ok((width * height) as usize * bytes_per_sample)
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    /// Arm the sensor and enter RECORDING.
    ///
    /// # Errors
    ///
    /// `AlreadyRecording` in RECORDING state; `Internal` when asynchronous
    /// transfer is enabled without a grab callback, or from READOUT state
    /// (call [`stop_readout`](Self::stop_readout) first); backend errors
    /// leave the camera in IDLE.
    pub async fn start_recording(&self) -> CamResult<()> {
        let _transition = self.transition.lock().await;

        if self.is_recording() {
            return Err(CameraError::AlreadyRecording);
        }
        if self.is_readout() {
            return Err(CameraError::Internal(
                "camera is in readout mode; call stop_readout first".into(),
            ));
        }
        if self.transfer_asynchronously() && self.grab_callback().is_none() {
            return Err(CameraError::Internal(
                "transfer_asynchronously set but no grab callback".into(),
            ));
        }

        self.backend.lock().await.start_recording().await?;
        self.is_recording.store(true, Ordering::Release);
        debug!(camera = %self.name, "recording started");
        self.notify(props::IS_RECORDING, &ParameterValue::Bool(true));
        Ok(())
    }

    /// Halt production and return to IDLE.
    ///
    /// # Errors
    ///
    /// `NotRecording` in IDLE state; backend errors leave the camera in
    /// RECORDING.
    pub async fn stop_recording(&self) -> CamResult<()> {
        let _transition = self.transition.lock().await;

        if !self.is_recording() {
            return Err(CameraError::NotRecording);
        }

        self.backend.lock().await.stop_recording().await?;
        self.is_recording.store(false, Ordering::Release);
        debug!(camera = %self.name, "recording stopped");
        self.notify(props::IS_RECORDING, &ParameterValue::Bool(false));
        Ok(())
    }

    /// Enter READOUT of on-board memory.
    ///
    /// # Errors
    ///
    /// `Unsupported` on devices without camRAM recording;
    /// `AlreadyRecording` while RECORDING.
    pub async fn start_readout(&self) -> CamResult<()> {
        let _transition = self.transition.lock().await;

        if !self.has_camram {
            return Err(CameraError::Unsupported("camram recording".into()));
        }
        if self.is_recording() {
            return Err(CameraError::AlreadyRecording);
        }
        if self.is_readout() {
            return Ok(());
        }

        self.backend.lock().await.start_readout().await?;
        self.is_readout.store(true, Ordering::Release);
        debug!(camera = %self.name, "readout started");
        self.notify(props::IS_READOUT, &ParameterValue::Bool(true));
        Ok(())
    }

    /// Leave READOUT and return to IDLE.
    pub async fn stop_readout(&self) -> CamResult<()> {
        let _transition = self.transition.lock().await;

        if !self.is_readout() {
            return Err(CameraError::NotRecording);
        }

        self.backend.lock().await.stop_readout().await?;
        self.is_readout.store(false, Ordering::Release);
        debug!(camera = %self.name, "readout stopped");
        self.notify(props::IS_READOUT, &ParameterValue::Bool(false));
        Ok(())
    }

    /// Software-trigger exactly one frame.
    ///
    /// # Errors
    ///
    /// `NotRecording` outside RECORDING. With a non-software source the
    /// backend decides between rejection and a no-op.
    pub async fn trigger(&self) -> CamResult<()> {
        if !self.is_recording() {
            return Err(CameraError::NotRecording);
        }
        self.backend.lock().await.trigger().await
    }

    /// Copy the next frame into `dst`, blocking up to the device timeout.
    ///
    /// Returns `false` at end of stream (readout only).
    ///
    /// # Errors
    ///
    /// `NotRecording` when neither recording nor in readout; `Timeout` and
    /// `Device` from the backend.
    pub async fn grab(&self, dst: &mut [u8]) -> CamResult<bool> {
        if !self.is_recording() && !self.is_readout() {
            return Err(CameraError::NotRecording);
        }
        self.backend.lock().await.grab(dst).await
    }

    /// Copy the recorded frame at `index` out of on-board memory.
    ///
    /// Returns `false` when `index` lies beyond the recorded range.
    pub async fn readout_at(&self, dst: &mut [u8], index: u32) -> CamResult<bool> {
        if !self.is_readout() {
            return Err(CameraError::NotRecording);
        }
        self.backend.lock().await.readout(dst, index).await
    }

    /// Forward a bulk blob to the device side channel.
    pub async fn write_blob(&self, name: &str, data: &[u8]) -> CamResult<()> {
        self.backend.lock().await.write_blob(name, data).await
    }

    /// Error-driven stop used by the acquisition driver when a producer
    /// hits a fatal error: transitions to IDLE and fires observers, but
    /// never fails on an already-idle camera.
    pub(crate) async fn stop_recording_after_error(&self) {
        match self.stop_recording().await {
            Ok(()) | Err(CameraError::NotRecording) => {}
            Err(err) => warn!(camera = %self.name, error = %err, "backend stop failed"),
        }
    }
}
