use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::capture::ExportError;
use crate::collaborators::CollaboratorError;
use crate::pixel_buffer::PixelBufferError;
use crate::stroke_engine::RenderError;

/// Failures surfaced by [`crate::studio::Studio`]. Every variant leaves the
/// studio's masks, history and captured frames as they were before the call.
/// Wrapping variants name the stage; the cause is reachable through `source()`.
#[derive(Debug, Clone, PartialEq)]
pub enum StudioError {
    NoImage,
    RenderInProgress,
    NoActiveStroke,
    Buffer(PixelBufferError),
    Render(RenderError),
    Export(ExportError),
    Collaborator(CollaboratorError),
}

impl Display for StudioError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoImage => write!(f, "no source image loaded"),
            Self::RenderInProgress => write!(f, "a render is already in progress"),
            Self::NoActiveStroke => write!(f, "no brush stroke in progress"),
            Self::Buffer(_) => write!(f, "mask buffer operation failed"),
            Self::Render(_) => write!(f, "render failed"),
            Self::Export(_) => write!(f, "timelapse export failed"),
            Self::Collaborator(_) => write!(f, "external collaborator failed"),
        }
    }
}

impl Error for StudioError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Buffer(error) => Some(error),
            Self::Render(error) => Some(error),
            Self::Export(error) => Some(error),
            Self::Collaborator(error) => Some(error),
            Self::NoImage | Self::RenderInProgress | Self::NoActiveStroke => None,
        }
    }
}

impl From<PixelBufferError> for StudioError {
    fn from(error: PixelBufferError) -> Self {
        Self::Buffer(error)
    }
}

impl From<RenderError> for StudioError {
    fn from(error: RenderError) -> Self {
        Self::Render(error)
    }
}

impl From<ExportError> for StudioError {
    fn from(error: ExportError) -> Self {
        Self::Export(error)
    }
}

impl From<CollaboratorError> for StudioError {
    fn from(error: CollaboratorError) -> Self {
        Self::Collaborator(error)
    }
}
