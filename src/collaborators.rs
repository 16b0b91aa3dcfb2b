//! Pluggable outside services: subject isolation for the mask layers and the
//! animated encoder used by timelapse export.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::{Path, PathBuf};

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame};
use tracing::info;

use crate::capture::ExportSequence;
use crate::pixel_buffer::PixelBuffer;

#[derive(Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    Isolation(String),
    Encoding(String),
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

impl Display for CollaboratorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Isolation(reason) => write!(f, "subject isolation failed: {reason}"),
            Self::Encoding(reason) => write!(f, "timelapse encoding failed: {reason}"),
            Self::DimensionMismatch { expected, actual } => write!(
                f,
                "expected a {}x{} image, got {}x{}",
                expected.0, expected.1, actual.0, actual.1
            ),
        }
    }
}

impl Error for CollaboratorError {}

/// Produces an RGBA image whose alpha marks the foreground subject.
pub trait SubjectIsolator {
    fn isolate(&mut self, source: &PixelBuffer) -> Result<PixelBuffer, CollaboratorError>;
}

/// Serves a cutout prepared ahead of time, read from an image file.
#[derive(Debug, Clone)]
pub struct PrecomputedMaskIsolator {
    path: PathBuf,
}

impl PrecomputedMaskIsolator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SubjectIsolator for PrecomputedMaskIsolator {
    fn isolate(&mut self, source: &PixelBuffer) -> Result<PixelBuffer, CollaboratorError> {
        let decoded = image::open(&self.path).map_err(|error| {
            CollaboratorError::Isolation(format!(
                "failed to read cutout {}: {error}",
                self.path.display()
            ))
        })?;
        let cutout = PixelBuffer::from_image(&decoded.to_rgba8())
            .map_err(|error| CollaboratorError::Isolation(error.to_string()))?;
        if cutout.dimensions() != source.dimensions() {
            return Err(CollaboratorError::DimensionMismatch {
                expected: source.dimensions(),
                actual: cutout.dimensions(),
            });
        }
        Ok(cutout)
    }
}

/// Writes an export sequence as an animated image.
pub trait FrameEncoder {
    fn encode(
        &mut self,
        sequence: &ExportSequence,
        out: &mut dyn Write,
    ) -> Result<(), CollaboratorError>;
}

/// Looping GIF with per-frame delays.
#[derive(Debug, Clone, Copy, Default)]
pub struct GifFrameEncoder;

impl FrameEncoder for GifFrameEncoder {
    fn encode(
        &mut self,
        sequence: &ExportSequence,
        out: &mut dyn Write,
    ) -> Result<(), CollaboratorError> {
        let mut encoder = GifEncoder::new(out);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|error| CollaboratorError::Encoding(error.to_string()))?;

        for (index, frame) in sequence.frames.iter().enumerate() {
            if frame.image.dimensions() != (sequence.width, sequence.height) {
                return Err(CollaboratorError::DimensionMismatch {
                    expected: (sequence.width, sequence.height),
                    actual: frame.image.dimensions(),
                });
            }
            let delay = Delay::from_numer_denom_ms(frame.delay_ms, 1);
            encoder
                .encode_frame(Frame::from_parts(frame.image.to_image(), 0, 0, delay))
                .map_err(|error| {
                    CollaboratorError::Encoding(format!("frame {index}: {error}"))
                })?;
        }

        info!(
            frames = sequence.frames.len(),
            width = sequence.width,
            height = sequence.height,
            duration_ms = sequence.total_duration_ms(),
            "encoded timelapse gif"
        );
        Ok(())
    }
}
