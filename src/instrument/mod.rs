//! Device backends shipped with the library.
//!
//! Hardware drivers live out of tree and conform to
//! [`CameraDevice`](crate::camera::CameraDevice); the synthetic backend
//! here exists so the runtime, driver and client code can be exercised
//! without a sensor attached.

pub mod mock;

pub use mock::MockCamera;
