//! Frame sources: anything that yields grayscale frames in order.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no images found in {0}")]
    Empty(String),
}

/// A stream of frames. `Ok(None)` means the source is exhausted.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

/// Replays still images from a directory in file-name order, converted to luma.
pub struct ImageSequence {
    root: PathBuf,
    pending: VecDeque<PathBuf>,
    sequence: u32,
}

impl ImageSequence {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        if files.is_empty() {
            return Err(SourceError::Empty(dir.display().to_string()));
        }
        files.sort();
        tracing::info!(dir = %dir.display(), images = files.len(), "opened image sequence");
        Ok(Self {
            root: dir.to_path_buf(),
            pending: files.into(),
            sequence: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let img = image::open(&path)
            .map_err(|source| SourceError::Image {
                path: path.display().to_string(),
                source,
            })?
            .into_luma8();
        let (width, height) = img.dimensions();
        let frame = Frame::from_luma(img.into_raw(), width, height, self.sequence)
            .map_err(|e| SourceError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("image sequence {}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcall-hw-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_replays_in_name_order() {
        let dir = scratch_dir("order");
        GrayImage::from_pixel(4, 3, Luma([200])).save(dir.join("b.png")).unwrap();
        GrayImage::from_pixel(2, 2, Luma([10])).save(dir.join("a.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut source = ImageSequence::open(&dir).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!((first.width, first.height), (2, 2));
        assert!(first.is_dark);
        assert_eq!(first.sequence, 0);

        let second = source.next_frame().unwrap().unwrap();
        assert_eq!((second.width, second.height), (4, 3));
        assert_eq!(second.data.len(), 12);
        assert!(!second.is_dark);

        assert!(source.next_frame().unwrap().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_empty_directory_rejected() {
        let dir = scratch_dir("empty");
        assert!(matches!(ImageSequence::open(&dir), Err(SourceError::Empty(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
