//! A mock camera backend that generates synthetic frames.
//!
//! `MockCamera` implements the full [`CameraDevice`] contract without any
//! hardware: frames carry their frame number in the first eight bytes
//! (little endian) followed by a deterministic ramp, so tests can identify
//! exactly which trigger or grab produced a block.
//!
//! Behavior per trigger source:
//!
//! - **auto**: frames are paced on a deadline schedule derived from the
//!   exposure time (the frame rate is its reciprocal), so a grab loop sees
//!   the configured cadence regardless of consumer jitter.
//! - **software**: every `trigger()` materializes exactly one frame, which
//!   the next grab returns; the same frame is recorded into the simulated
//!   on-board memory. `trigger()` outside software mode is a no-op.
//! - **external**: no pulse source exists, so grabs time out.
//!
//! The camRAM simulation keeps the most recent `camram_capacity` frames;
//! readout mode drains them in order and then signals end of stream.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::camera::{props, CameraDevice, TriggerSource};
use crate::error::{CamResult, CameraError};
use crate::parameter::{
    ParameterDescriptor, ParameterRegistry, ParameterValue, Unit,
};

/// Binning factors the simulated sensor supports.
static BINNINGS: Lazy<Vec<ParameterValue>> = Lazy::new(|| {
    vec![
        ParameterValue::UInt(1),
        ParameterValue::UInt(2),
        ParameterValue::UInt(4),
    ]
});

/// Builder for a [`MockCamera`].
pub struct MockCameraBuilder {
    name: String,
    sensor_width: u64,
    sensor_height: u64,
    bitdepth: u64,
    roi: (u64, u64, u64, u64),
    roi_width_multiplier: u64,
    roi_height_multiplier: u64,
    exposure_time: f64,
    grab_timeout: Duration,
    camram_capacity: usize,
    noise: bool,
    grab_failure: Option<(u64, CameraError)>,
    write_failure: Option<String>,
}

impl Default for MockCameraBuilder {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            sensor_width: 2048,
            sensor_height: 2048,
            bitdepth: 12,
            roi: (0, 0, 512, 512),
            roi_width_multiplier: 1,
            roi_height_multiplier: 1,
            exposure_time: 0.01,
            grab_timeout: Duration::from_secs(1),
            camram_capacity: 128,
            noise: false,
            grab_failure: None,
            write_failure: None,
        }
    }
}

impl MockCameraBuilder {
    /// Device name reported to the runtime.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sensor dimensions in pixels.
    pub fn sensor(mut self, width: u64, height: u64) -> Self {
        self.sensor_width = width;
        self.sensor_height = height;
        self
    }

    /// Sensor bit depth (decides one or two bytes per sample).
    pub fn bitdepth(mut self, bits: u64) -> Self {
        self.bitdepth = bits;
        self
    }

    /// Initial region of interest.
    pub fn roi(mut self, x: u64, y: u64, width: u64, height: u64) -> Self {
        self.roi = (x, y, width, height);
        self
    }

    /// Step granularity of the ROI dimensions.
    pub fn roi_multipliers(mut self, width: u64, height: u64) -> Self {
        self.roi_width_multiplier = width.max(1);
        self.roi_height_multiplier = height.max(1);
        self
    }

    /// Initial exposure time in seconds (frame rate is its reciprocal).
    pub fn exposure_time(mut self, seconds: f64) -> Self {
        self.exposure_time = seconds;
        self
    }

    /// How long a grab waits for a frame before timing out.
    pub fn grab_timeout(mut self, timeout: Duration) -> Self {
        self.grab_timeout = timeout;
        self
    }

    /// Frames the simulated on-board memory retains; zero disables the
    /// camRAM capability.
    pub fn camram_capacity(mut self, frames: usize) -> Self {
        self.camram_capacity = frames;
        self
    }

    /// Overlay pseudo-random noise on generated frames.
    pub fn noise(mut self, on: bool) -> Self {
        self.noise = on;
        self
    }

    /// Fail every grab after `frames` successful ones with `error`.
    pub fn fail_grab_after(mut self, frames: u64, error: CameraError) -> Self {
        self.grab_failure = Some((frames, error));
        self
    }

    /// Simulate a transport failure on every write of `parameter`.
    pub fn fail_writes_to(mut self, parameter: impl Into<String>) -> Self {
        self.write_failure = Some(parameter.into());
        self
    }

    /// Build the camera.
    pub fn build(self) -> MockCamera {
        let registry = build_registry(&self);
        let mut values: HashMap<String, ParameterValue> = HashMap::new();
        for descriptor in registry.list() {
            values.insert(descriptor.name.clone(), descriptor.default.clone());
        }

        info!(
            name = %self.name,
            sensor_width = self.sensor_width,
            sensor_height = self.sensor_height,
            bitdepth = self.bitdepth,
            "mock camera created"
        );

        MockCamera {
            name: self.name,
            registry,
            values,
            grab_timeout: self.grab_timeout,
            camram_capacity: self.camram_capacity,
            noise: self.noise,
            grab_failure: self.grab_failure,
            write_failure: self.write_failure,
            recording: false,
            readout: false,
            frame_counter: 0,
            frames_grabbed: 0,
            next_deadline: None,
            pending_frames: VecDeque::new(),
            camram: VecDeque::new(),
            readout_cursor: 0,
            blobs: HashMap::new(),
        }
    }
}

/// Synthetic camera backend.
pub struct MockCamera {
    name: String,
    registry: ParameterRegistry,
    values: HashMap<String, ParameterValue>,

    grab_timeout: Duration,
    camram_capacity: usize,
    noise: bool,
    grab_failure: Option<(u64, CameraError)>,
    write_failure: Option<String>,

    recording: bool,
    readout: bool,
    frame_counter: u64,
    frames_grabbed: u64,
    next_deadline: Option<Instant>,
    pending_frames: VecDeque<Vec<u8>>,
    camram: VecDeque<Vec<u8>>,
    readout_cursor: usize,
    blobs: HashMap<String, Vec<u8>>,
}

fn build_registry(b: &MockCameraBuilder) -> ParameterRegistry {
    let mut reg = ParameterRegistry::new();

    reg.register(ParameterDescriptor::new(props::NAME, b.name.as_str()).read_only());
    reg.register(
        ParameterDescriptor::new(props::SENSOR_WIDTH, b.sensor_width)
            .with_unit(Unit::Pixel)
            .read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::SENSOR_HEIGHT, b.sensor_height)
            .with_unit(Unit::Pixel)
            .read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::SENSOR_PIXEL_WIDTH, 6.5e-6)
            .with_unit(Unit::Meter)
            .read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::SENSOR_PIXEL_HEIGHT, 6.5e-6)
            .with_unit(Unit::Meter)
            .read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::SENSOR_BITDEPTH, b.bitdepth)
            .with_unit(Unit::Count)
            .read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::SENSOR_TEMPERATURE, -10.0)
            .with_unit(Unit::DegreeCelsius)
            .read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::HORIZONTAL_BINNING, 1u64)
            .with_unit(Unit::Pixel)
            .with_choices(BINNINGS.clone()),
    );
    reg.register(
        ParameterDescriptor::new(props::VERTICAL_BINNING, 1u64)
            .with_unit(Unit::Pixel)
            .with_choices(BINNINGS.clone()),
    );
    reg.register(
        ParameterDescriptor::new(props::TRIGGER_SOURCE, ParameterValue::EnumIndex(0))
            .with_enumeration(TriggerSource::NAMES.iter().map(|s| s.to_string()).collect()),
    );
    reg.register(
        ParameterDescriptor::new(props::TRIGGER_TYPE, ParameterValue::EnumIndex(0))
            .with_enumeration(
                crate::camera::TriggerType::NAMES
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
    );
    reg.register(
        ParameterDescriptor::new(props::EXPOSURE_TIME, b.exposure_time)
            .with_unit(Unit::Second)
            .with_range(1e-6, 3600.0)
            .live_writable(),
    );
    reg.register(
        ParameterDescriptor::new(props::FRAMES_PER_SECOND, 1.0 / b.exposure_time)
            .with_unit(Unit::Count)
            .with_range(1.0 / 3600.0, 1e6)
            .live_writable(),
    );
    reg.register(
        ParameterDescriptor::new(props::DELAY_TIME, 0.0)
            .with_unit(Unit::Second)
            .with_range(0.0, 1.0),
    );
    reg.register(
        ParameterDescriptor::new(props::ROI_X, b.roi.0)
            .with_unit(Unit::Pixel)
            .with_range(0u64, b.sensor_width - 1),
    );
    reg.register(
        ParameterDescriptor::new(props::ROI_Y, b.roi.1)
            .with_unit(Unit::Pixel)
            .with_range(0u64, b.sensor_height - 1),
    );
    reg.register(
        ParameterDescriptor::new(props::ROI_WIDTH, b.roi.2)
            .with_unit(Unit::Pixel)
            .with_range(b.roi_width_multiplier, b.sensor_width)
            .with_step(b.roi_width_multiplier),
    );
    reg.register(
        ParameterDescriptor::new(props::ROI_HEIGHT, b.roi.3)
            .with_unit(Unit::Pixel)
            .with_range(b.roi_height_multiplier, b.sensor_height)
            .with_step(b.roi_height_multiplier),
    );
    reg.register(
        ParameterDescriptor::new(props::ROI_WIDTH_MULTIPLIER, b.roi_width_multiplier)
            .with_unit(Unit::Count)
            .read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::ROI_HEIGHT_MULTIPLIER, b.roi_height_multiplier)
            .with_unit(Unit::Count)
            .read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::HAS_STREAMING, true).read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::HAS_CAMRAM_RECORDING, b.camram_capacity > 0).read_only(),
    );
    reg.register(
        ParameterDescriptor::new(props::RECORDED_FRAMES, 0u64)
            .with_unit(Unit::Count)
            .read_only(),
    );
    reg.register(ParameterDescriptor::new(props::BUFFERED, b.camram_capacity > 0));
    reg.register(
        ParameterDescriptor::new(props::NUM_BUFFERS, b.camram_capacity as u64)
            .with_unit(Unit::Count)
            .with_range(0u64, 4096u64),
    );

    reg
}

impl MockCamera {
    /// Start building a mock camera with library defaults (2048×2048
    /// sensor, 12 bit, 512×512 ROI, 10 ms exposure).
    pub fn builder() -> MockCameraBuilder {
        MockCameraBuilder::default()
    }

    /// Frame number stamped into a generated block.
    pub fn frame_number_of(block: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        let n = block.len().min(8);
        bytes[..n].copy_from_slice(&block[..n]);
        u64::from_le_bytes(bytes)
    }

    fn u64_value(&self, name: &str) -> u64 {
        self.values.get(name).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    fn f64_value(&self, name: &str) -> f64 {
        self.values.get(name).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    fn trigger_source(&self) -> TriggerSource {
        self.values
            .get(props::TRIGGER_SOURCE)
            .and_then(|v| v.as_enum_index())
            .and_then(TriggerSource::from_index)
            .unwrap_or_default()
    }

    fn frame_size(&self) -> usize {
        let width = self.u64_value(props::ROI_WIDTH);
        let height = self.u64_value(props::ROI_HEIGHT);
        let bytes_per_sample = if self.u64_value(props::SENSOR_BITDEPTH) <= 8 {
            1
        } else {
            2
        };
        (width * height) as usize * bytes_per_sample
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(self.f64_value(props::EXPOSURE_TIME).max(1e-6))
    }

    /// Render the next frame: frame number stamp, then a ramp, optionally
    /// overlaid with seeded noise (deterministic per frame number).
    fn render_frame(&mut self) -> Vec<u8> {
        let number = self.frame_counter;
        self.frame_counter += 1;

        let mut frame = vec![0u8; self.frame_size()];
        for (i, byte) in frame.iter_mut().enumerate() {
            *byte = ((number + i as u64) % 251) as u8;
        }
        if self.noise {
            let mut rng = StdRng::seed_from_u64(number);
            for byte in frame.iter_mut().skip(8) {
                *byte = byte.wrapping_add(rng.gen_range(0..8));
            }
        }
        if frame.len() >= 8 {
            frame[..8].copy_from_slice(&number.to_le_bytes());
        }
        frame
    }

    fn record_to_camram(&mut self, frame: Vec<u8>) {
        if self.camram_capacity == 0 {
            return;
        }
        if self.camram.len() == self.camram_capacity {
            self.camram.pop_front();
        }
        self.camram.push_back(frame);
    }

    fn check_grab_failure(&self) -> CamResult<()> {
        if let Some((after, error)) = &self.grab_failure {
            if self.frames_grabbed >= *after {
                return Err(error.clone());
            }
        }
        Ok(())
    }

    fn copy_frame(dst: &mut [u8], frame: &[u8]) -> CamResult<()> {
        if dst.len() != frame.len() {
            return Err(CameraError::Internal(format!(
                "destination holds {} bytes, frame is {}",
                dst.len(),
                frame.len()
            )));
        }
        dst.copy_from_slice(frame);
        Ok(())
    }

    /// Cross-field geometry check: the ROI must fit the binned sensor.
    fn validate_geometry(
        &self,
        name: &str,
        value: &ParameterValue,
    ) -> CamResult<()> {
        let pick = |field: &str| -> u64 {
            if field == name {
                value.as_u64().unwrap_or(0)
            } else {
                self.u64_value(field)
            }
        };

        let h_binning = pick(props::HORIZONTAL_BINNING).max(1);
        let v_binning = pick(props::VERTICAL_BINNING).max(1);
        let sensor_width = self.u64_value(props::SENSOR_WIDTH) / h_binning;
        let sensor_height = self.u64_value(props::SENSOR_HEIGHT) / v_binning;

        if pick(props::ROI_X) + pick(props::ROI_WIDTH) > sensor_width {
            return Err(CameraError::OutOfRange {
                name: name.to_string(),
                message: format!(
                    "roi_x + roi_width exceeds the binned sensor width {}",
                    sensor_width
                ),
            });
        }
        if pick(props::ROI_Y) + pick(props::ROI_HEIGHT) > sensor_height {
            return Err(CameraError::OutOfRange {
                name: name.to_string(),
                message: format!(
                    "roi_y + roi_height exceeds the binned sensor height {}",
                    sensor_height
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    async fn read(&self, name: &str) -> CamResult<ParameterValue> {
        match name {
            props::FRAMES_PER_SECOND => {
                Ok(ParameterValue::Float(1.0 / self.f64_value(props::EXPOSURE_TIME)))
            }
            props::RECORDED_FRAMES => Ok(ParameterValue::UInt(self.camram.len() as u64)),
            _ => self
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| CameraError::NotFound(name.to_string())),
        }
    }

    async fn write(&mut self, name: &str, value: &ParameterValue) -> CamResult<()> {
        if self.write_failure.as_deref() == Some(name) {
            return Err(CameraError::device(-9, "simulated transport failure"));
        }
        if !self.values.contains_key(name) {
            return Err(CameraError::NotFound(name.to_string()));
        }

        match name {
            props::ROI_X
            | props::ROI_Y
            | props::ROI_WIDTH
            | props::ROI_HEIGHT
            | props::HORIZONTAL_BINNING
            | props::VERTICAL_BINNING => {
                self.validate_geometry(name, value)?;
                self.values.insert(name.to_string(), value.clone());
            }
            props::FRAMES_PER_SECOND => {
                // The sensor couples rate and exposure reciprocally.
                let fps = value.as_f64().unwrap_or(1.0);
                self.values.insert(
                    props::EXPOSURE_TIME.to_string(),
                    ParameterValue::Float(1.0 / fps),
                );
            }
            _ => {
                self.values.insert(name.to_string(), value.clone());
            }
        }
        Ok(())
    }

    async fn start_recording(&mut self) -> CamResult<()> {
        self.recording = true;
        self.frame_counter = 0;
        self.frames_grabbed = 0;
        self.next_deadline = None;
        self.pending_frames.clear();
        self.camram.clear();
        debug!(camera = %self.name, "mock recording armed");
        Ok(())
    }

    async fn stop_recording(&mut self) -> CamResult<()> {
        self.recording = false;
        self.next_deadline = None;
        self.pending_frames.clear();
        debug!(
            camera = %self.name,
            recorded = self.camram.len(),
            "mock recording stopped"
        );
        Ok(())
    }

    async fn start_readout(&mut self) -> CamResult<()> {
        self.readout = true;
        self.readout_cursor = 0;
        Ok(())
    }

    async fn stop_readout(&mut self) -> CamResult<()> {
        self.readout = false;
        Ok(())
    }

    async fn trigger(&mut self) -> CamResult<()> {
        // Ignored outside software triggering, consistently.
        if self.trigger_source() != TriggerSource::Software {
            return Ok(());
        }
        let frame = self.render_frame();
        self.record_to_camram(frame.clone());
        self.pending_frames.push_back(frame);
        Ok(())
    }

    async fn grab(&mut self, dst: &mut [u8]) -> CamResult<bool> {
        if self.readout {
            // Sequential drain of on-board memory.
            match self.camram.get(self.readout_cursor) {
                Some(frame) => {
                    Self::copy_frame(dst, frame)?;
                    self.readout_cursor += 1;
                    Ok(true)
                }
                None => Ok(false),
            }
        } else {
            if !self.recording {
                return Err(CameraError::NotRecording);
            }
            self.check_grab_failure()?;
            match self.trigger_source() {
                TriggerSource::Auto => {
                    let period = self.frame_period();
                    let now = Instant::now();
                    let deadline = self.next_deadline.unwrap_or(now + period);
                    if deadline.saturating_duration_since(now) > self.grab_timeout {
                        tokio::time::sleep(self.grab_timeout).await;
                        return Err(CameraError::Timeout);
                    }
                    tokio::time::sleep_until(deadline).await;
                    self.next_deadline = Some(deadline + period);

                    let frame = self.render_frame();
                    Self::copy_frame(dst, &frame)?;
                    self.frames_grabbed += 1;
                    Ok(true)
                }
                TriggerSource::Software => match self.pending_frames.pop_front() {
                    Some(frame) => {
                        Self::copy_frame(dst, &frame)?;
                        self.frames_grabbed += 1;
                        Ok(true)
                    }
                    None => {
                        // No trigger can arrive while the backend is
                        // entered, so waiting cannot succeed.
                        tokio::time::sleep(self.grab_timeout).await;
                        Err(CameraError::Timeout)
                    }
                },
                TriggerSource::External => {
                    // No pulse source attached to the simulation.
                    tokio::time::sleep(self.grab_timeout).await;
                    Err(CameraError::Timeout)
                }
            }
        }
    }

    async fn readout(&mut self, dst: &mut [u8], index: u32) -> CamResult<bool> {
        match self.camram.get(index as usize) {
            Some(frame) => {
                Self::copy_frame(dst, frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn write_blob(&mut self, name: &str, data: &[u8]) -> CamResult<()> {
        debug!(camera = %self.name, channel = name, bytes = data.len(), "blob written");
        self.blobs.insert(name.to_string(), data.to_vec());
        Ok(())
    }
}
