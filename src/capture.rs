//! Timelapse capture of render progress and export-time frame selection.
//!
//! During a render the [`FrameRecorder`] keeps a downscaled frame every time
//! progress advances by at least one step (1% by default), plus the terminal
//! frame. At export time [`plan_export`] trims, thins, crops/rescales and
//! times the retained frames into an [`ExportSequence`] for an encoder.

use std::error::Error;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pixel_buffer::{PixelBuffer, PixelBufferError};
use crate::stroke_engine::RenderEvent;

/// Absorbs float error in `k / total` progress fractions.
const PROGRESS_EPSILON: f64 = 1e-9;
/// Bytes per output pixel per frame in the size estimate.
const ESTIMATED_BYTES_PER_PIXEL: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CaptureBudget {
    pub max_height: u32,
    pub max_pixels: u64,
    /// Minimum progress advance between retained frames.
    pub progress_step: f64,
}

impl Default for CaptureBudget {
    fn default() -> Self {
        Self {
            max_height: 1080,
            max_pixels: 2_000_000,
            progress_step: 0.01,
        }
    }
}

impl CaptureBudget {
    /// Size a `width` x `height` frame is stored at.
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        let mut scale = 1.0_f64;
        if height > self.max_height && self.max_height > 0 {
            scale = f64::from(self.max_height) / f64::from(height);
        }
        let scaled_pixels = (f64::from(width) * scale) * (f64::from(height) * scale);
        if scaled_pixels > self.max_pixels as f64 {
            scale = (self.max_pixels as f64 / (f64::from(width) * f64::from(height))).sqrt();
        }
        (
            ((f64::from(width) * scale).floor() as u32).max(1),
            ((f64::from(height) * scale).floor() as u32).max(1),
        )
    }
}

#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: PixelBuffer,
    pub fraction: f64,
}

#[derive(Debug, Clone, Default)]
pub struct FrameRecorder {
    budget: CaptureBudget,
    frames: Vec<CapturedFrame>,
}

impl FrameRecorder {
    pub fn new(budget: CaptureBudget) -> Self {
        Self {
            budget,
            frames: Vec::new(),
        }
    }

    pub fn frames(&self) -> &[CapturedFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Retains the event's frame if progress moved far enough or the event is
    /// terminal. Returns whether a frame was kept.
    pub fn observe(&mut self, event: &RenderEvent) -> Result<bool, PixelBufferError> {
        let fraction = event.fraction();
        let last = self.frames.last().map_or(-1.0, |frame| frame.fraction);
        let advanced = fraction - last + PROGRESS_EPSILON >= self.budget.progress_step;
        if !advanced && !event.is_terminal() {
            return Ok(false);
        }

        let source = event.frame();
        let (width, height) = self.budget.fit(source.width(), source.height());
        let frame = source.resized(width, height)?;
        debug!(
            fraction,
            width,
            height,
            retained = self.frames.len() + 1,
            "captured timelapse frame"
        );
        self.frames.push(CapturedFrame { frame, fraction });
        Ok(true)
    }
}

/// Crop rectangle in percent of the frame size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CropRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl CropRect {
    pub fn is_active(&self) -> bool {
        self.w > 0.0 && self.h > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExportSettings {
    pub trim_start: usize,
    /// Inclusive; `None` means the last captured frame.
    pub trim_end: Option<usize>,
    /// Percentage of frames kept, 1..=100.
    pub frame_density_pct: u32,
    pub crop: Option<CropRect>,
    pub target_height: u32,
    pub target_duration_ms: u32,
    pub min_delay_ms: u32,
    pub final_pause_ms: u32,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            trim_start: 0,
            trim_end: None,
            frame_density_pct: 100,
            crop: None,
            target_height: 1080,
            target_duration_ms: 10_000,
            min_delay_ms: 40,
            final_pause_ms: 3_000,
        }
    }
}

impl ExportSettings {
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.frame_density_pct == 0 || self.frame_density_pct > 100 {
            return Err(ExportError::InvalidSettings(format!(
                "frame_density_pct must be in 1..=100, got {}",
                self.frame_density_pct
            )));
        }
        if self.target_height == 0 {
            return Err(ExportError::InvalidSettings(
                "target_height must be > 0".to_owned(),
            ));
        }
        if let Some(end) = self.trim_end {
            if end < self.trim_start {
                return Err(ExportError::InvalidSettings(format!(
                    "trim_end {end} is before trim_start {}",
                    self.trim_start
                )));
            }
        }
        if let Some(crop) = &self.crop {
            let in_range = |value: f32| value.is_finite() && (0.0..=100.0).contains(&value);
            if !(in_range(crop.x) && in_range(crop.y) && in_range(crop.w) && in_range(crop.h))
                || crop.x + crop.w > 100.0
                || crop.y + crop.h > 100.0
            {
                return Err(ExportError::InvalidSettings(format!(
                    "crop must lie within 0..=100 percent, got {crop:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn stride(&self) -> usize {
        frame_stride(self.frame_density_pct)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportError {
    NoFrames,
    InvalidSettings(String),
    Buffer(PixelBufferError),
}

impl Display for ExportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoFrames => write!(f, "no captured frames in the selected range"),
            Self::InvalidSettings(reason) => write!(f, "invalid export settings: {reason}"),
            Self::Buffer(error) => write!(f, "export frame error: {error}"),
        }
    }
}

impl Error for ExportError {}

impl From<PixelBufferError> for ExportError {
    fn from(error: PixelBufferError) -> Self {
        Self::Buffer(error)
    }
}

/// `round(100 / pct)`, at least 1.
pub fn frame_stride(frame_density_pct: u32) -> usize {
    let pct = frame_density_pct.clamp(1, 100);
    ((100.0 / f64::from(pct)).round() as usize).max(1)
}

/// Indices kept from `[start, end]` (inclusive, clamped to `len`): every
/// `stride`-th frame from `start`, plus `end` itself.
pub fn select_frame_indices(
    len: usize,
    start: usize,
    end: Option<usize>,
    frame_density_pct: u32,
) -> Vec<usize> {
    if len == 0 || start >= len {
        return Vec::new();
    }
    let end = end.unwrap_or(len - 1).min(len - 1);
    if end < start {
        return Vec::new();
    }
    let stride = frame_stride(frame_density_pct);
    (start..=end)
        .filter(|index| (index - start) % stride == 0 || *index == end)
        .collect()
}

/// Per-frame delays: an even share of the target duration (floored at
/// `min_delay_ms`), with the final frame held for `final_pause_ms`.
pub fn frame_delays(count: usize, settings: &ExportSettings) -> Vec<u32> {
    if count == 0 {
        return Vec::new();
    }
    let intervals = count.saturating_sub(1).max(1);
    let share = (f64::from(settings.target_duration_ms) / intervals as f64).round() as u32;
    let delay = share.max(settings.min_delay_ms);
    let mut delays = vec![delay; count];
    delays[count - 1] = settings.final_pause_ms;
    delays
}

/// Source rectangle and output size applied identically to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportGeometry {
    pub src_x: u32,
    pub src_y: u32,
    pub src_w: u32,
    pub src_h: u32,
    pub out_w: u32,
    pub out_h: u32,
}

pub fn export_geometry(width: u32, height: u32, settings: &ExportSettings) -> ExportGeometry {
    match settings.crop.filter(CropRect::is_active) {
        Some(crop) => {
            let src_x = ((crop.x / 100.0) * width as f32).floor() as u32;
            let src_y = ((crop.y / 100.0) * height as f32).floor() as u32;
            let src_x = src_x.min(width - 1);
            let src_y = src_y.min(height - 1);
            let src_w = (((crop.w / 100.0) * width as f32).floor() as u32)
                .clamp(1, width - src_x);
            let src_h = (((crop.h / 100.0) * height as f32).floor() as u32)
                .clamp(1, height - src_y);
            ExportGeometry {
                src_x,
                src_y,
                src_w,
                src_h,
                out_w: src_w,
                out_h: src_h,
            }
        }
        None => {
            let scale = settings.target_height as f32 / height as f32;
            ExportGeometry {
                src_x: 0,
                src_y: 0,
                src_w: width,
                src_h: height,
                out_w: ((width as f32 * scale).floor() as u32).max(1),
                out_h: settings.target_height,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportFrame {
    pub image: PixelBuffer,
    pub delay_ms: u32,
    pub fraction: f64,
}

/// Fixed-size frames with delays, ready for an encoder.
#[derive(Debug, Clone)]
pub struct ExportSequence {
    pub width: u32,
    pub height: u32,
    pub frames: Vec<ExportFrame>,
}

impl ExportSequence {
    pub fn total_duration_ms(&self) -> u64 {
        self.frames.iter().map(|frame| u64::from(frame.delay_ms)).sum()
    }
}

pub fn plan_export(
    frames: &[CapturedFrame],
    settings: &ExportSettings,
) -> Result<ExportSequence, ExportError> {
    settings.validate()?;
    let indices = select_frame_indices(
        frames.len(),
        settings.trim_start,
        settings.trim_end,
        settings.frame_density_pct,
    );
    let Some(first) = indices.first().map(|index| &frames[*index]) else {
        return Err(ExportError::NoFrames);
    };

    let geometry = export_geometry(first.frame.width(), first.frame.height(), settings);
    let delays = frame_delays(indices.len(), settings);
    let mut out = Vec::with_capacity(indices.len());
    for (index, delay_ms) in indices.into_iter().zip(delays) {
        let captured = &frames[index];
        let region = captured
            .frame
            .cropped(geometry.src_x, geometry.src_y, geometry.src_w, geometry.src_h)
            .ok_or_else(|| {
                ExportError::InvalidSettings(format!("crop falls outside frame {index}"))
            })?;
        let image = region.resized(geometry.out_w, geometry.out_h)?;
        out.push(ExportFrame {
            image,
            delay_ms,
            fraction: captured.fraction,
        });
    }

    Ok(ExportSequence {
        width: geometry.out_w,
        height: geometry.out_h,
        frames: out,
    })
}

/// Rough encoded size in MiB for the given selection.
pub fn estimated_size_mb(frames: &[CapturedFrame], settings: &ExportSettings) -> f64 {
    let indices = select_frame_indices(
        frames.len(),
        settings.trim_start,
        settings.trim_end,
        settings.frame_density_pct,
    );
    let Some(first) = indices.first().map(|index| &frames[*index]) else {
        return 0.0;
    };
    let geometry = export_geometry(first.frame.width(), first.frame.height(), settings);
    let pixels = f64::from(geometry.out_w) * f64::from(geometry.out_h) * indices.len() as f64;
    pixels * ESTIMATED_BYTES_PER_PIXEL / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke_engine::RenderProgress;

    fn event(fraction: f64, terminal: bool, size: (u32, u32)) -> RenderEvent {
        let progress = RenderProgress {
            fraction,
            strokes_done: (fraction * 100.0) as u64,
            total_strokes: 100,
            glyphs_stamped: 0,
            frame: PixelBuffer::filled(size.0, size.1, [10, 10, 10, 255]).expect("frame"),
        };
        if terminal {
            RenderEvent::Finished(progress)
        } else {
            RenderEvent::Progress(progress)
        }
    }

    fn captured(count: usize) -> Vec<CapturedFrame> {
        (0..count)
            .map(|index| CapturedFrame {
                frame: PixelBuffer::filled(40, 20, [index as u8, 0, 0, 255]).expect("frame"),
                fraction: index as f64 / count as f64,
            })
            .collect()
    }

    #[test]
    fn recorder_keeps_one_frame_per_percent() {
        let mut recorder = FrameRecorder::new(CaptureBudget::default());
        for step in 1..=100 {
            let fraction = step as f64 / 200.0;
            recorder
                .observe(&event(fraction, false, (8, 8)))
                .expect("observe");
        }
        // Half-percent steps: every other event is kept.
        assert_eq!(recorder.len(), 50);
    }

    #[test]
    fn recorder_keeps_every_percent_despite_float_error() {
        let mut recorder = FrameRecorder::new(CaptureBudget::default());
        for step in 1..=100 {
            recorder
                .observe(&event(step as f64 / 100.0, false, (4, 4)))
                .expect("observe");
        }
        assert_eq!(recorder.len(), 100);
    }

    #[test]
    fn terminal_frame_is_always_kept() {
        let mut recorder = FrameRecorder::new(CaptureBudget::default());
        assert!(recorder.observe(&event(0.5, false, (4, 4))).expect("observe"));
        assert!(!recorder.observe(&event(0.501, false, (4, 4))).expect("observe"));
        assert!(recorder.observe(&event(0.502, true, (4, 4))).expect("observe"));
        assert_eq!(recorder.len(), 2);
        recorder.clear();
        assert!(recorder.is_empty());
    }

    #[test]
    fn budget_downscales_tall_and_huge_frames() {
        let budget = CaptureBudget::default();
        assert_eq!(budget.fit(800, 600), (800, 600));
        assert_eq!(budget.fit(1000, 2160), (500, 1080));
        let (w, h) = budget.fit(4000, 1000);
        assert!(u64::from(w) * u64::from(h) <= 2_000_000);
        assert_eq!(w / h, 4);
    }

    #[test]
    fn recorder_stores_downscaled_frames() {
        let budget = CaptureBudget {
            max_height: 10,
            ..CaptureBudget::default()
        };
        let mut recorder = FrameRecorder::new(budget);
        recorder
            .observe(&event(1.0, true, (40, 20)))
            .expect("observe");
        assert_eq!(recorder.frames()[0].frame.dimensions(), (20, 10));
    }

    #[test]
    fn full_density_keeps_every_frame_in_order() {
        let frames = captured(9);
        let settings = ExportSettings {
            target_height: 20,
            ..ExportSettings::default()
        };
        let sequence = plan_export(&frames, &settings).expect("export");
        assert_eq!(sequence.frames.len(), 9);
        for (index, frame) in sequence.frames.iter().enumerate() {
            assert_eq!(frame.image, frames[index].frame);
        }
    }

    #[test]
    fn quarter_density_keeps_every_fourth_plus_last() {
        assert_eq!(select_frame_indices(10, 0, None, 25), vec![0, 4, 8, 9]);
        assert_eq!(select_frame_indices(9, 0, None, 25), vec![0, 4, 8]);
        assert_eq!(select_frame_indices(20, 3, Some(11), 25), vec![3, 7, 11]);
        assert_eq!(select_frame_indices(20, 3, Some(12), 25), vec![3, 7, 11, 12]);
    }

    #[test]
    fn selection_handles_empty_and_out_of_range() {
        assert!(select_frame_indices(0, 0, None, 100).is_empty());
        assert!(select_frame_indices(5, 7, None, 100).is_empty());
        assert_eq!(select_frame_indices(5, 1, Some(99), 100), vec![1, 2, 3, 4]);
    }

    #[test]
    fn delays_share_duration_and_pause_on_last() {
        let settings = ExportSettings::default();
        let delays = frame_delays(11, &settings);
        assert_eq!(delays.len(), 11);
        assert!(delays[..10].iter().all(|delay| *delay == 1_000));
        assert_eq!(delays[10], 3_000);

        let many = frame_delays(1_001, &settings);
        assert_eq!(many[0], 40);
        assert_eq!(frame_delays(1, &settings), vec![3_000]);
    }

    #[test]
    fn crop_uses_native_resolution() {
        let frames = captured(3);
        let settings = ExportSettings {
            crop: Some(CropRect {
                x: 25.0,
                y: 50.0,
                w: 50.0,
                h: 50.0,
            }),
            ..ExportSettings::default()
        };
        let sequence = plan_export(&frames, &settings).expect("export");
        assert_eq!((sequence.width, sequence.height), (20, 10));
        assert!(sequence
            .frames
            .iter()
            .all(|frame| frame.image.dimensions() == (20, 10)));
    }

    #[test]
    fn uncropped_export_scales_to_target_height() {
        let frames = captured(2);
        let settings = ExportSettings {
            target_height: 60,
            ..ExportSettings::default()
        };
        let sequence = plan_export(&frames, &settings).expect("export");
        assert_eq!((sequence.width, sequence.height), (120, 60));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let frames = captured(2);
        let settings = ExportSettings {
            frame_density_pct: 0,
            ..ExportSettings::default()
        };
        assert!(matches!(
            plan_export(&frames, &settings),
            Err(ExportError::InvalidSettings(_))
        ));
        assert!(matches!(
            plan_export(&[], &ExportSettings::default()),
            Err(ExportError::NoFrames)
        ));
    }

    #[test]
    fn size_estimate_scales_with_selection() {
        let frames = captured(8);
        let full = estimated_size_mb(&frames, &ExportSettings::default());
        let quarter = estimated_size_mb(
            &frames,
            &ExportSettings {
                frame_density_pct: 25,
                ..ExportSettings::default()
            },
        );
        assert!(full > quarter && quarter > 0.0);
    }
}
