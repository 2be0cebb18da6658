//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{FrameSource, SourceError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot capture video")]
    StreamingNotSupported,
}

/// A V4L2 device that can capture video.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUYV 4:2:2; the Y bytes are the grayscale plane.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else {
            None
        }
    }
}

/// An open webcam streaming grayscale frames.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") and negotiate `width × height`.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("busy") || msg.contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {msg}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV or GREY)",
                negotiated.fourcc
            ))
        })?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            stream: None,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Dequeue the next frame, starting the stream on first use.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
            self.stream = Some(stream);
        }
        let (width, height, pixel_format) = (self.width, self.height, self.pixel_format);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::CaptureFailed("stream not started".into()))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let gray = match pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}")))?,
            PixelFormat::Grey => {
                let pixels = (width * height) as usize;
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                buf[..pixels].to_vec()
            }
        };

        Frame::from_luma(gray, width, height, sequence).map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// List V4L2 devices that support video capture.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.capture_frame().map(Some).map_err(SourceError::from)
    }

    fn describe(&self) -> String {
        format!("camera {} ({}x{})", self.device_path, self.width, self.height)
    }
}
