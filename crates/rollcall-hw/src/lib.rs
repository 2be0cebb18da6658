//! rollcall-hw — Frame acquisition for the attendance daemon.
//!
//! V4L2 webcam capture, still-image replay, and the grayscale frame type with
//! its low-light CLAHE enhancement.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::{Clahe, Frame, FrameError};
pub use source::{FrameSource, ImageSequence, SourceError};
