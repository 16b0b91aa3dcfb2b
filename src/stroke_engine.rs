//! Stochastic glyph-stroke renderer.
//!
//! A [`RenderSession`] is a lazy, blocking sequence of [`RenderEvent`]s. Each
//! call to `next` runs one bounded chunk of strokes and yields a progress
//! frame; cancellation is only observed between chunks. The sequence always
//! ends with exactly one [`RenderEvent::Finished`].
//!
//! Stroke model, per candidate stroke:
//!   1. pick a uniformly random source position;
//!   2. bias by the density layer (`mask_multiplier`);
//!   3. strike with probability `darkness^2.2 * multiplier`, clamped to 1;
//!   4. on a strike, the detail layer dithers between one full-size glyph and
//!      three jittered half-size glyphs;
//!   5. each glyph gets ramp jitter, ribbon wear, a small rotation and,
//!      sometimes, a faint smudged duplicate.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::glyphs::{DensityRamp, GlyphBitmap, GlyphFace};
use crate::mask::{MaskLayerKind, MaskLayers};
use crate::pixel_buffer::{blend_over, PixelBuffer, PixelBufferError, WHITE};
use crate::render_params::{ColorMode, RenderParams};
use crate::rng::XorShift64;

const STRIKE_EXPONENT: f32 = 2.2;
const DETAIL_SUB_STROKES: usize = 3;
const ROTATION_JITTER_DEGREES: f32 = 5.0;
const DIRTY_INK_SCALE: f32 = 0.2;
const DIRTY_INK_ALPHA: f32 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub enum RenderError {
    MaskSizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    Buffer(PixelBufferError),
    WorkerSpawn(String),
    WorkerPanicked,
}

impl Display for RenderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaskSizeMismatch { expected, actual } => write!(
                f,
                "mask layers are {}x{} but the source image is {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            Self::Buffer(error) => write!(f, "render buffer error: {error}"),
            Self::WorkerSpawn(reason) => write!(f, "failed to spawn render worker: {reason}"),
            Self::WorkerPanicked => write!(f, "render worker panicked"),
        }
    }
}

impl Error for RenderError {}

impl From<PixelBufferError> for RenderError {
    fn from(error: PixelBufferError) -> Self {
        Self::Buffer(error)
    }
}

/// Cooperative stop flag shared between a session and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle of a prepared session. Before `prepare` there is no session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// Prepared, no chunk run yet.
    Preparing,
    Running,
    Cancelling,
    Finished,
}

/// Everything a render reads. The source and masks are snapshots; painting
/// after `START` does not affect a running session.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub source: Arc<PixelBuffer>,
    pub masks: MaskLayers,
    pub params: RenderParams,
    pub face: GlyphFace,
}

impl RenderRequest {
    /// Masks must match the source pixel for pixel.
    pub fn check_dimensions(&self) -> Result<(), RenderError> {
        let expected = self.source.dimensions();
        let actual = (self.masks.width(), self.masks.height());
        if actual != expected {
            return Err(RenderError::MaskSizeMismatch { expected, actual });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RenderProgress {
    pub fraction: f64,
    pub strokes_done: u64,
    pub total_strokes: u64,
    pub glyphs_stamped: u64,
    pub frame: PixelBuffer,
}

#[derive(Debug, Clone)]
pub enum RenderEvent {
    Progress(RenderProgress),
    Finished(RenderProgress),
}

impl RenderEvent {
    pub fn progress(&self) -> &RenderProgress {
        match self {
            Self::Progress(progress) | Self::Finished(progress) => progress,
        }
    }

    pub fn fraction(&self) -> f64 {
        self.progress().fraction
    }

    pub fn frame(&self) -> &PixelBuffer {
        &self.progress().frame
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// `255 * (luma / 255)^(1 / gamma)` per pixel, row-major.
pub fn luminance_buffer(source: &PixelBuffer, gamma: f32) -> Vec<f32> {
    let exponent = 1.0 / gamma;
    source
        .data()
        .chunks_exact(4)
        .map(|px| {
            let luma =
                0.299 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.114 * f32::from(px[2]);
            255.0 * (luma / 255.0).powf(exponent)
        })
        .collect()
}

/// Continuous density bias: `1 / weight` at alpha 0 up to `weight` at alpha 1.
pub fn mask_multiplier(alpha: f32, density_weight: f32) -> f32 {
    let weight = density_weight.max(1.0);
    let low = 1.0 / weight;
    low + (weight - low) * alpha.clamp(0.0, 1.0)
}

pub fn strike_probability(darkness: f32, multiplier: f32) -> f32 {
    (darkness.clamp(0.0, 1.0).powf(STRIKE_EXPONENT) * multiplier).clamp(0.0, 1.0)
}

/// Stamps `glyph` centred at `(cx, cy)`, rotated by `angle` radians, with
/// nearest sampling and source-over blending.
pub fn stamp_glyph(
    canvas: &mut PixelBuffer,
    glyph: &GlyphBitmap,
    cx: f32,
    cy: f32,
    angle: f32,
    color: [u8; 3],
    alpha: f32,
) {
    if glyph.is_empty() || alpha <= 0.0 {
        return;
    }
    let half_w = glyph.width as f32 / 2.0;
    let half_h = glyph.height as f32 / 2.0;
    let reach = (half_w * half_w + half_h * half_h).sqrt().ceil() + 1.0;
    let (sin, cos) = angle.sin_cos();

    let x0 = (cx - reach).floor().max(0.0) as i64;
    let y0 = (cy - reach).floor().max(0.0) as i64;
    let x1 = ((cx + reach).ceil() as i64).min(i64::from(canvas.width()) - 1);
    let y1 = ((cy + reach).ceil() as i64).min(i64::from(canvas.height()) - 1);
    if x1 < x0 || y1 < y0 {
        return;
    }

    let src = [color[0], color[1], color[2], 255];
    for py in y0..=y1 {
        let dy = py as f32 + 0.5 - cy;
        for px in x0..=x1 {
            let dx = px as f32 + 0.5 - cx;
            let gx = cos * dx + sin * dy + half_w;
            let gy = -sin * dx + cos * dy + half_h;
            if gx < 0.0 || gy < 0.0 {
                continue;
            }
            let coverage = glyph.coverage_at(gx as usize, gy as usize);
            if coverage == 0 {
                continue;
            }
            let idx = canvas.index(px as u32, py as u32);
            blend_over(
                &mut canvas.data_mut()[idx..idx + 4],
                src,
                alpha * f32::from(coverage) / 255.0,
            );
        }
    }
}

/// Read-only state shared by every stroke of a session.
struct StrokeContext {
    source: Arc<PixelBuffer>,
    masks: MaskLayers,
    params: RenderParams,
    luminance: Vec<f32>,
    ramp: DensityRamp,
    detail_ramp: DensityRamp,
    scale: f32,
}

impl StrokeContext {
    #[inline]
    fn darkness_at(&self, x: u32, y: u32) -> f32 {
        let idx = (y as usize) * (self.source.width() as usize) + x as usize;
        (255.0 - self.luminance[idx]) / 255.0
    }

    fn ink_color(&self, x: u32, y: u32, rng: &mut XorShift64) -> [u8; 3] {
        let [r, g, b, _] = self.source.pixel(x, y).unwrap_or([0, 0, 0, 255]);
        let gray = || {
            let idx = (y as usize) * (self.source.width() as usize) + x as usize;
            let value = self.luminance[idx].round().clamp(0.0, 255.0) as u8;
            [value, value, value]
        };
        match self.params.color_mode {
            ColorMode::Color => [r, g, b],
            ColorMode::Mono => gray(),
            ColorMode::MaskedColor => {
                let colored = self
                    .masks
                    .alpha_at(MaskLayerKind::Color, x, y)
                    .is_some_and(|alpha| rng.chance(alpha));
                if colored {
                    [r, g, b]
                } else {
                    gray()
                }
            }
        }
    }

    /// One candidate stroke. Returns the number of glyphs stamped.
    fn strike(&self, canvas: &mut PixelBuffer, rng: &mut XorShift64) -> u64 {
        let width = self.source.width();
        let height = self.source.height();
        let rx = rng.next_f32() * (width - 1) as f32;
        let ry = rng.next_f32() * (height - 1) as f32;
        let ix = rx as u32;
        let iy = ry as u32;

        let multiplier = self
            .masks
            .alpha_at(MaskLayerKind::Density, ix, iy)
            .map_or(1.0, |alpha| mask_multiplier(alpha, self.params.density_weight));
        let probability = strike_probability(self.darkness_at(ix, iy), multiplier);
        if !rng.chance(probability) {
            return 0;
        }

        let detail = self
            .masks
            .alpha_at(MaskLayerKind::Detail, ix, iy)
            .is_some_and(|alpha| rng.chance(alpha));
        if !detail {
            self.emit_glyph(canvas, rng, &self.ramp, rx, ry);
            return 1;
        }

        let reach = self.detail_ramp.advance() / self.scale;
        let mut stamped = 0;
        for _ in 0..DETAIL_SUB_STROKES {
            let sx = rx + rng.range_f32(-reach, reach);
            let sy = ry + rng.range_f32(-reach, reach);
            if sx < 0.0 || sy < 0.0 || sx >= width as f32 || sy >= height as f32 {
                continue;
            }
            self.emit_glyph(canvas, rng, &self.detail_ramp, sx, sy);
            stamped += 1;
        }
        stamped
    }

    fn emit_glyph(
        &self,
        canvas: &mut PixelBuffer,
        rng: &mut XorShift64,
        ramp: &DensityRamp,
        sx: f32,
        sy: f32,
    ) {
        let ix = sx as u32;
        let iy = sy as u32;
        let darkness = self.darkness_at(ix, iy);
        let jitter = (rng.next_f32() * 3.0).floor() as i32 - 1;
        let Some(glyph) = ramp.glyph(ramp.index_for(darkness, jitter)) else {
            return;
        };

        let color = self.ink_color(ix, iy, rng);
        let alpha = (self.params.ink_opacity / 255.0)
            * (1.0 - rng.next_f32() * self.params.ribbon_wear);
        let angle = rng
            .range_f32(-ROTATION_JITTER_DEGREES, ROTATION_JITTER_DEGREES)
            .to_radians();
        let dest_x = sx * self.scale;
        let dest_y = sy * self.scale;
        stamp_glyph(canvas, &glyph.bitmap, dest_x, dest_y, angle, color, alpha);

        if self.params.dirty_ink > 0.0 && rng.chance(self.params.dirty_ink * DIRTY_INK_SCALE) {
            let ox = rng.range_f32(-1.0, 1.0);
            let oy = rng.range_f32(-1.0, 1.0);
            stamp_glyph(
                canvas,
                &glyph.bitmap,
                dest_x + ox,
                dest_y + oy,
                angle,
                color,
                alpha * DIRTY_INK_ALPHA,
            );
        }
    }
}

/// Source pixels gated by the original layer's alpha, at output size.
fn masked_original(
    source: &PixelBuffer,
    mask: &PixelBuffer,
    output: (u32, u32),
) -> Result<PixelBuffer, PixelBufferError> {
    let mut gated = source.clone();
    for (px, mask_px) in gated
        .data_mut()
        .chunks_exact_mut(4)
        .zip(mask.data().chunks_exact(4))
    {
        px[3] = ((u16::from(px[3]) * u16::from(mask_px[3]) + 127) / 255) as u8;
    }
    gated.resized(output.0, output.1)
}

pub struct RenderSession {
    context: StrokeContext,
    canvas: PixelBuffer,
    original_overlay: Option<PixelBuffer>,
    rng: XorShift64,
    cancel: CancelToken,
    state: RenderState,
    strokes_done: u64,
    glyphs_stamped: u64,
    chunk_size: u64,
    started: Instant,
}

impl RenderSession {
    /// Builds luminance, both density ramps and the masked original overlay.
    pub fn prepare(request: RenderRequest, cancel: CancelToken) -> Result<Self, RenderError> {
        request.check_dimensions()?;
        let RenderRequest {
            source,
            masks,
            params,
            face,
        } = request;
        let (width, height) = source.dimensions();
        let output = params.output_size(width, height);
        let canvas = PixelBuffer::filled(output.0, output.1, WHITE)?;
        let font_size = params.scaled_font_size();
        let detail_size = (font_size / 2.0).floor().max(1.0);
        let ramp = DensityRamp::build(&face, &params.character_set, font_size);
        let detail_ramp = DensityRamp::build(&face, &params.character_set, detail_size);
        let luminance = luminance_buffer(&source, params.gamma);
        let original_overlay = match masks.get(MaskLayerKind::Original) {
            Some(mask) => Some(masked_original(&source, mask, output)?),
            None => None,
        };

        info!(
            source_width = width,
            source_height = height,
            output_width = output.0,
            output_height = output.1,
            total_strokes = params.total_strokes,
            font_size,
            ramp = %ramp.characters(),
            "render session prepared"
        );

        Ok(Self {
            chunk_size: params.chunk_size(),
            context: StrokeContext {
                source,
                masks,
                scale: params.output_scale,
                params,
                luminance,
                ramp,
                detail_ramp,
            },
            canvas,
            original_overlay,
            rng: XorShift64::from_entropy(),
            cancel,
            state: RenderState::Preparing,
            strokes_done: 0,
            glyphs_stamped: 0,
            started: Instant::now(),
        })
    }

    /// `Cancelling` from the moment the token is set until the terminal event.
    pub fn state(&self) -> RenderState {
        match self.state {
            RenderState::Preparing | RenderState::Running if self.cancel.is_cancelled() => {
                RenderState::Cancelling
            }
            state => state,
        }
    }

    pub fn total_strokes(&self) -> u64 {
        self.context.params.total_strokes
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Density ramp used for full-size strokes, densest first.
    pub fn ramp(&self) -> &DensityRamp {
        &self.context.ramp
    }

    pub fn detail_ramp(&self) -> &DensityRamp {
        &self.context.detail_ramp
    }

    fn fraction(&self) -> f64 {
        let total = self.total_strokes();
        if total == 0 {
            return 1.0;
        }
        self.strokes_done as f64 / total as f64
    }

    /// Glyph canvas with the masked original composited on top.
    fn compose_frame(&self) -> PixelBuffer {
        let mut frame = self.canvas.clone();
        if let Some(overlay) = &self.original_overlay {
            frame.composite_over(overlay);
        }
        frame
    }

    fn snapshot(&self) -> RenderProgress {
        RenderProgress {
            fraction: self.fraction(),
            strokes_done: self.strokes_done,
            total_strokes: self.total_strokes(),
            glyphs_stamped: self.glyphs_stamped,
            frame: self.compose_frame(),
        }
    }

    fn run_chunk(&mut self) {
        let chunk_end = (self.strokes_done + self.chunk_size).min(self.total_strokes());
        while self.strokes_done < chunk_end {
            self.glyphs_stamped += self.context.strike(&mut self.canvas, &mut self.rng);
            self.strokes_done += 1;
        }
        debug!(
            strokes_done = self.strokes_done,
            glyphs_stamped = self.glyphs_stamped,
            "render chunk complete"
        );
    }

    fn finish(&mut self) -> RenderEvent {
        self.state = RenderState::Finished;
        let progress = self.snapshot();
        info!(
            strokes_done = self.strokes_done,
            glyphs_stamped = self.glyphs_stamped,
            fraction = progress.fraction,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "render session finished"
        );
        RenderEvent::Finished(progress)
    }
}

impl Iterator for RenderSession {
    type Item = RenderEvent;

    fn next(&mut self) -> Option<RenderEvent> {
        if self.state == RenderState::Finished {
            return None;
        }
        if self.strokes_done >= self.total_strokes() {
            return Some(self.finish());
        }
        if self.cancel.is_cancelled() {
            info!(strokes_done = self.strokes_done, "render cancelled");
            return Some(self.finish());
        }

        self.state = RenderState::Running;
        self.run_chunk();
        Some(RenderEvent::Progress(self.snapshot()))
    }
}
