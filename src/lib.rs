//! Unified scientific-camera acquisition core.
//!
//! This library drives heterogeneous high-speed image sensors (industrial
//! CMOS, sCMOS, cooled CCDs, hybrid-pixel detectors) through one abstract
//! contract and moves their frames through an in-process pipeline:
//!
//! - [`camera`]: the [`CameraDevice`](camera::CameraDevice) backend contract
//!   and the [`Camera`](camera::Camera) runtime with its acquisition state
//!   machine.
//! - [`parameter`]: typed, introspectable parameters with ranges,
//!   enumerations, units and live-writability.
//! - [`data`]: the bounded block [`RingBuffer`](data::RingBuffer) between
//!   producers and consumers.
//! - [`acquisition`]: the driver loops for synchronous grabbing,
//!   asynchronous push, record-to-ring and camRAM readout.
//! - [`instrument`]: the synthetic [`MockCamera`](instrument::MockCamera)
//!   backend used by the test suite.
//!
//! Concrete hardware drivers, file writers, viewers and the plugin loader
//! live outside this crate; they meet the core at the
//! [`CameraDevice`](camera::CameraDevice) boundary.

pub mod acquisition;
pub mod camera;
pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod parameter;

pub use acquisition::{AcquisitionDriver, AcquisitionStats};
pub use camera::{Camera, CameraDevice, TriggerSource, TriggerType};
pub use config::AcquisitionConfig;
pub use data::RingBuffer;
pub use error::{CamResult, CameraError};
pub use parameter::{ParameterDescriptor, ParameterValue, Unit};
