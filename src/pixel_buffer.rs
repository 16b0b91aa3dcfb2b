//! Owned row-major RGBA8 pixel buffers.
//!
//! Every raster in the crate (source photo, mask layers, glyph canvas,
//! captured frames) is a [`PixelBuffer`]. Channels are straight (not
//! premultiplied) alpha. Rescaling goes through `tiny-skia` so filtering is
//! shared with the frame capture path.

use std::error::Error;
use std::fmt::{Display, Formatter};

use image::RgbaImage;
use tiny_skia::{FilterQuality, IntSize, Pixmap, PixmapPaint, PremultipliedColorU8, Transform};

pub const WHITE: [u8; 4] = [255, 255, 255, 255];
pub const TRANSPARENT: [u8; 4] = [0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelBufferError {
    ZeroSize { width: u32, height: u32 },
    DimensionsOverflow,
    BufferLengthMismatch { expected: usize, actual: usize },
}

impl Display for PixelBufferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroSize { width, height } => {
                write!(f, "pixel buffer must be non-empty, got {width}x{height}")
            }
            Self::DimensionsOverflow => write!(f, "pixel buffer dimensions overflowed usize"),
            Self::BufferLengthMismatch { expected, actual } => write!(
                f,
                "RGBA buffer length mismatch: expected {expected} bytes, got {actual} bytes"
            ),
        }
    }
}

impl Error for PixelBufferError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

fn byte_len(width: u32, height: u32) -> Result<usize, PixelBufferError> {
    if width == 0 || height == 0 {
        return Err(PixelBufferError::ZeroSize { width, height });
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(4))
        .ok_or(PixelBufferError::DimensionsOverflow)
}

impl PixelBuffer {
    /// Fully transparent buffer.
    pub fn new(width: u32, height: u32) -> Result<Self, PixelBufferError> {
        Self::filled(width, height, TRANSPARENT)
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, PixelBufferError> {
        let len = byte_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len / 4 {
            data.extend_from_slice(&rgba);
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, PixelBufferError> {
        let expected = byte_len(width, height)?;
        if data.len() != expected {
            return Err(PixelBufferError::BufferLengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_image(image: &RgbaImage) -> Result<Self, PixelBufferError> {
        Self::from_rgba(image.width(), image.height(), image.as_raw().clone())
    }

    pub fn to_image(&self) -> RgbaImage {
        // Length is a buffer invariant.
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        ((y as usize) * (self.width as usize) + x as usize) * 4
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = self.index(x, y);
        Some([
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = self.index(x, y);
        self.data[idx..idx + 4].copy_from_slice(&rgba);
    }

    pub fn alpha(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        self.data[self.index(x, y) + 3]
    }

    /// Copies a sub-rectangle out of the buffer. The rectangle is clipped to
    /// the buffer bounds; `None` when nothing of it remains.
    pub fn read_rect(&self, x: u32, y: u32, width: u32, height: u32) -> Option<PixelBuffer> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);
        if width == 0 || height == 0 {
            return None;
        }

        let row_bytes = width as usize * 4;
        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in y..y + height {
            let start = self.index(x, row);
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Some(PixelBuffer {
            width,
            height,
            data,
        })
    }

    /// Writes `patch` with its top-left corner at `(x, y)`, clipped to bounds.
    pub fn write_rect(&mut self, x: u32, y: u32, patch: &PixelBuffer) {
        if x >= self.width || y >= self.height {
            return;
        }
        let width = patch.width.min(self.width - x);
        let height = patch.height.min(self.height - y);
        let row_bytes = width as usize * 4;
        for row in 0..height {
            let dst = self.index(x, y + row);
            let src = patch.index(0, row);
            self.data[dst..dst + row_bytes].copy_from_slice(&patch.data[src..src + row_bytes]);
        }
    }

    pub fn cropped(&self, x: u32, y: u32, width: u32, height: u32) -> Option<PixelBuffer> {
        self.read_rect(x, y, width, height)
    }

    /// Source-over composite of `top` onto `self`, both straight alpha and
    /// identically sized. Mismatched sizes composite the overlapping region.
    pub fn composite_over(&mut self, top: &PixelBuffer) {
        let width = self.width.min(top.width);
        let height = self.height.min(top.height);
        for y in 0..height {
            for x in 0..width {
                let src_idx = top.index(x, y);
                let src = [
                    top.data[src_idx],
                    top.data[src_idx + 1],
                    top.data[src_idx + 2],
                    top.data[src_idx + 3],
                ];
                let dst_idx = self.index(x, y);
                blend_over(&mut self.data[dst_idx..dst_idx + 4], src, 1.0);
            }
        }
    }

    /// Bilinear rescale to an exact size.
    pub fn resized(&self, width: u32, height: u32) -> Result<PixelBuffer, PixelBufferError> {
        byte_len(width, height)?;
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }

        let source = self.to_pixmap()?;
        let mut target = Pixmap::new(width, height).ok_or(PixelBufferError::DimensionsOverflow)?;
        let paint = PixmapPaint {
            quality: FilterQuality::Bilinear,
            ..PixmapPaint::default()
        };
        let transform = Transform::from_scale(
            width as f32 / self.width as f32,
            height as f32 / self.height as f32,
        );
        target.draw_pixmap(0, 0, source.as_ref(), &paint, transform, None);
        Ok(Self::from_pixmap(&target))
    }

    fn to_pixmap(&self) -> Result<Pixmap, PixelBufferError> {
        let size = IntSize::from_wh(self.width, self.height).ok_or(PixelBufferError::ZeroSize {
            width: self.width,
            height: self.height,
        })?;
        let mut premultiplied = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(4) {
            let alpha = u16::from(px[3]);
            for channel in &px[..3] {
                premultiplied.push(((u16::from(*channel) * alpha + 127) / 255) as u8);
            }
            premultiplied.push(px[3]);
        }
        Pixmap::from_vec(premultiplied, size).ok_or(PixelBufferError::DimensionsOverflow)
    }

    fn from_pixmap(pixmap: &Pixmap) -> Self {
        let mut data = Vec::with_capacity(pixmap.data().len());
        for pixel in pixmap.pixels() {
            let color = demultiply(*pixel);
            data.extend_from_slice(&color);
        }
        Self {
            width: pixmap.width(),
            height: pixmap.height(),
            data,
        }
    }
}

fn demultiply(pixel: PremultipliedColorU8) -> [u8; 4] {
    let color = pixel.demultiply();
    [color.red(), color.green(), color.blue(), color.alpha()]
}

/// Source-over blend of a straight-alpha `src` into `dst`, with an extra
/// opacity factor in `[0, 1]`.
#[inline]
pub fn blend_over(dst: &mut [u8], src: [u8; 4], opacity: f32) {
    let src_a = (f32::from(src[3]) / 255.0) * opacity.clamp(0.0, 1.0);
    if src_a <= 0.0 {
        return;
    }
    let dst_a = f32::from(dst[3]) / 255.0;
    let out_a = src_a + dst_a * (1.0 - src_a);
    if out_a <= 0.0 {
        dst.copy_from_slice(&TRANSPARENT);
        return;
    }
    for channel in 0..3 {
        let s = f32::from(src[channel]);
        let d = f32::from(dst[channel]);
        let out = (s * src_a + d * dst_a * (1.0 - src_a)) / out_a;
        dst[channel] = out.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> PixelBuffer {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 10) as u8, (y * 10) as u8, 7, 255]);
            }
        }
        PixelBuffer::from_rgba(width, height, data).expect("gradient should build")
    }

    #[test]
    fn from_rgba_rejects_length_mismatch() {
        let err = PixelBuffer::from_rgba(2, 2, vec![0; 15]).expect_err("length must be checked");
        assert!(matches!(err, PixelBufferError::BufferLengthMismatch { .. }));
    }

    #[test]
    fn zero_sized_buffers_are_rejected() {
        assert!(matches!(
            PixelBuffer::new(0, 4),
            Err(PixelBufferError::ZeroSize { .. })
        ));
    }

    #[test]
    fn read_then_write_rect_restores_region() {
        let source = gradient(8, 6);
        let patch = source.read_rect(2, 1, 3, 3).expect("rect inside bounds");
        assert_eq!(patch.dimensions(), (3, 3));
        assert_eq!(patch.pixel(0, 0), source.pixel(2, 1));

        let mut blank = PixelBuffer::new(8, 6).expect("blank");
        blank.write_rect(2, 1, &patch);
        assert_eq!(blank.pixel(4, 3), source.pixel(4, 3));
        assert_eq!(blank.pixel(5, 3), Some(TRANSPARENT));
    }

    #[test]
    fn read_rect_clips_to_bounds() {
        let source = gradient(4, 4);
        let patch = source.read_rect(3, 3, 10, 10).expect("one pixel remains");
        assert_eq!(patch.dimensions(), (1, 1));
        assert!(source.read_rect(4, 0, 1, 1).is_none());
    }

    #[test]
    fn opaque_composite_replaces_destination() {
        let mut base = PixelBuffer::filled(2, 2, WHITE).expect("base");
        let top = PixelBuffer::filled(2, 2, [10, 20, 30, 255]).expect("top");
        base.composite_over(&top);
        assert_eq!(base.pixel(1, 1), Some([10, 20, 30, 255]));
    }

    #[test]
    fn transparent_composite_is_noop() {
        let mut base = gradient(3, 3);
        let before = base.clone();
        base.composite_over(&PixelBuffer::new(3, 3).expect("top"));
        assert_eq!(base, before);
    }

    #[test]
    fn resize_changes_dimensions_and_keeps_opaque_color() {
        let source = PixelBuffer::filled(40, 20, [200, 100, 50, 255]).expect("source");
        let scaled = source.resized(10, 5).expect("resize");
        assert_eq!(scaled.dimensions(), (10, 5));
        let px = scaled.pixel(5, 2).expect("center pixel");
        assert!((i16::from(px[0]) - 200).abs() <= 2);
        assert_eq!(px[3], 255);
    }
}
