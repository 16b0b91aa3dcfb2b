//! Soft-brush painting onto the four mask layers.
//!
//! A layer is an RGBA buffer the size of the source image whose alpha is the
//! influence strength at that pixel. Colour channels only carry the layer's
//! on-screen tint. Painting uses alpha max-blend, so repeating a stroke never
//! darkens a region past the strength of a single pass.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collaborators::CollaboratorError;
use crate::pixel_buffer::{blend_over, PixelBuffer, PixelBufferError};

/// Extra pixels searched around the stroke's bounding box.
const BRUSH_MARGIN: f32 = 2.0;
/// Strength of the tinted overlay in [`MaskLayers::overlay`].
const OVERLAY_OPACITY: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskLayerKind {
    Density,
    Detail,
    Color,
    Original,
}

impl MaskLayerKind {
    pub const ALL: [MaskLayerKind; 4] = [
        MaskLayerKind::Density,
        MaskLayerKind::Detail,
        MaskLayerKind::Color,
        MaskLayerKind::Original,
    ];

    pub fn tint(self) -> [u8; 3] {
        match self {
            Self::Density => [255, 0, 0],
            Self::Detail => [0, 150, 255],
            Self::Color => [255, 200, 0],
            Self::Original => [0, 255, 100],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Density => "density",
            Self::Detail => "detail",
            Self::Color => "color",
            Self::Original => "original",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "density" => Some(Self::Density),
            "detail" => Some(Self::Detail),
            "color" | "colour" => Some(Self::Color),
            "original" => Some(Self::Original),
            _ => None,
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Density => 0,
            Self::Detail => 1,
            Self::Color => 2,
            Self::Original => 3,
        }
    }
}

impl fmt::Display for MaskLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One brush segment, from the previous pointer position to the current one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrushStroke {
    pub from: Point,
    pub to: Point,
    pub radius: f32,
    /// Fraction of the radius painted at full strength, in `[0, 1]`.
    pub hardness: f32,
    /// Peak strength in `[0, 1]`.
    pub opacity: f32,
    pub erase: bool,
}

impl BrushStroke {
    pub fn dab(at: Point, radius: f32, hardness: f32, opacity: f32) -> Self {
        Self {
            from: at,
            to: at,
            radius,
            hardness,
            opacity,
            erase: false,
        }
    }

    /// Falloff at distance `dist` from the segment, in `[0, 1]`.
    pub fn falloff(&self, dist: f32) -> f32 {
        if dist > self.radius {
            return 0.0;
        }
        let hardness = self.hardness.clamp(0.0, 1.0);
        let inner = self.radius * hardness;
        if dist <= inner {
            return 1.0;
        }
        let ramp = self.radius - inner;
        if ramp <= f32::EPSILON {
            return 1.0;
        }
        ((self.radius - dist) / ramp).clamp(0.0, 1.0)
    }
}

/// Distance from `p` to the segment `a..b`, projecting with `t` clamped to `[0, 1]`.
pub fn distance_to_segment(p: Point, a: Point, b: Point) -> f32 {
    let abx = b.x - a.x;
    let aby = b.y - a.y;
    let len_sq = abx * abx + aby * aby;
    let t = if len_sq <= f32::EPSILON {
        0.0
    } else {
        (((p.x - a.x) * abx + (p.y - a.y) * aby) / len_sq).clamp(0.0, 1.0)
    };
    let cx = a.x + t * abx;
    let cy = a.y + t * aby;
    ((p.x - cx) * (p.x - cx) + (p.y - cy) * (p.y - cy)).sqrt()
}

/// Pixel region touched by a paint call, inclusive-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl DirtyRect {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskLayers {
    width: u32,
    height: u32,
    layers: [Option<PixelBuffer>; 4],
}

impl MaskLayers {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            layers: [None, None, None, None],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, kind: MaskLayerKind) -> Option<&PixelBuffer> {
        self.layers[kind.slot()].as_ref()
    }

    pub fn exists(&self, kind: MaskLayerKind) -> bool {
        self.layers[kind.slot()].is_some()
    }

    /// Replaces a layer wholesale. Used by history restore.
    pub fn set(&mut self, kind: MaskLayerKind, pixels: Option<PixelBuffer>) {
        self.layers[kind.slot()] = pixels;
    }

    fn ensure(&mut self, kind: MaskLayerKind) -> Result<&mut PixelBuffer, PixelBufferError> {
        let slot = &mut self.layers[kind.slot()];
        if slot.is_none() {
            debug!(layer = %kind, "creating mask layer");
            *slot = Some(PixelBuffer::new(self.width, self.height)?);
        }
        slot.as_mut().ok_or(PixelBufferError::DimensionsOverflow)
    }

    /// Normalized layer alpha at a source pixel; `None` when the layer does not exist.
    #[inline]
    pub fn alpha_at(&self, kind: MaskLayerKind, x: u32, y: u32) -> Option<f32> {
        self.get(kind)
            .map(|layer| f32::from(layer.alpha(x, y)) / 255.0)
    }

    /// Paints one segment. Only pixels inside the segment's bounding box
    /// (grown by the radius) are read or written.
    pub fn paint(
        &mut self,
        kind: MaskLayerKind,
        stroke: &BrushStroke,
    ) -> Result<Option<DirtyRect>, PixelBufferError> {
        let tint = kind.tint();
        let (width, height) = (self.width, self.height);
        let layer = self.ensure(kind)?;
        if stroke.radius <= 0.0 || stroke.opacity <= 0.0 {
            return Ok(None);
        }

        let reach = stroke.radius + BRUSH_MARGIN;
        let min_x = (stroke.from.x.min(stroke.to.x) - reach).floor().max(0.0);
        let min_y = (stroke.from.y.min(stroke.to.y) - reach).floor().max(0.0);
        let max_x = (stroke.from.x.max(stroke.to.x) + reach)
            .ceil()
            .min(width as f32 - 1.0);
        let max_y = (stroke.from.y.max(stroke.to.y) + reach)
            .ceil()
            .min(height as f32 - 1.0);
        if max_x < min_x || max_y < min_y {
            return Ok(None);
        }

        let rect = DirtyRect {
            left: min_x as u32,
            top: min_y as u32,
            right: max_x as u32 + 1,
            bottom: max_y as u32 + 1,
        };
        let opacity = stroke.opacity.clamp(0.0, 1.0);

        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                let dist =
                    distance_to_segment(Point::new(x as f32, y as f32), stroke.from, stroke.to);
                if dist > stroke.radius {
                    continue;
                }
                let strength = (stroke.falloff(dist) * opacity * 255.0).round() as u8;
                if strength == 0 {
                    continue;
                }

                let idx = layer.index(x, y);
                let px = &mut layer.data_mut()[idx..idx + 4];
                if stroke.erase {
                    px[3] = px[3].saturating_sub(strength);
                } else if strength > px[3] {
                    px[0] = tint[0];
                    px[1] = tint[1];
                    px[2] = tint[2];
                    px[3] = strength;
                }
            }
        }

        Ok(Some(rect))
    }

    /// Flips covered and uncovered pixels. A missing layer becomes fully covered.
    pub fn invert(&mut self, kind: MaskLayerKind) -> Result<(), PixelBufferError> {
        let tint = kind.tint();
        match self.layers[kind.slot()].as_mut() {
            Some(layer) => {
                for px in layer.data_mut().chunks_exact_mut(4) {
                    px[0] = tint[0];
                    px[1] = tint[1];
                    px[2] = tint[2];
                    px[3] = 255 - px[3];
                }
            }
            None => {
                self.layers[kind.slot()] = Some(PixelBuffer::filled(
                    self.width,
                    self.height,
                    [tint[0], tint[1], tint[2], 255],
                )?);
            }
        }
        Ok(())
    }

    pub fn clear(&mut self, kind: MaskLayerKind) {
        self.layers[kind.slot()] = None;
    }

    /// Replaces a layer with a subject-isolation result: the isolation's
    /// alpha channel tinted with the layer colour.
    pub fn apply_isolation(
        &mut self,
        kind: MaskLayerKind,
        isolation: &PixelBuffer,
    ) -> Result<(), CollaboratorError> {
        if isolation.dimensions() != (self.width, self.height) {
            return Err(CollaboratorError::DimensionMismatch {
                expected: (self.width, self.height),
                actual: isolation.dimensions(),
            });
        }
        let tint = kind.tint();
        let mut data = Vec::with_capacity(isolation.data().len());
        for px in isolation.data().chunks_exact(4) {
            data.extend_from_slice(&[tint[0], tint[1], tint[2], px[3]]);
        }
        let layer = PixelBuffer::from_rgba(self.width, self.height, data)
            .map_err(|error| CollaboratorError::Isolation(error.to_string()))?;
        self.layers[kind.slot()] = Some(layer);
        Ok(())
    }

    /// Preview of `source` with every existing layer's tint composited on top.
    pub fn overlay(&self, source: &PixelBuffer) -> PixelBuffer {
        let mut out = source.clone();
        for kind in MaskLayerKind::ALL {
            let Some(layer) = self.get(kind) else {
                continue;
            };
            let width = out.width().min(layer.width());
            let height = out.height().min(layer.height());
            for y in 0..height {
                for x in 0..width {
                    let src_idx = layer.index(x, y);
                    let src = &layer.data()[src_idx..src_idx + 4];
                    if src[3] == 0 {
                        continue;
                    }
                    let src = [src[0], src[1], src[2], src[3]];
                    let dst_idx = out.index(x, y);
                    blend_over(&mut out.data_mut()[dst_idx..dst_idx + 4], src, OVERLAY_OPACITY);
                }
            }
        }
        out
    }
}
