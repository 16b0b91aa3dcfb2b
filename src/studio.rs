//! The editing session: one source image, its mask layers and history, and at
//! most one render in flight.
//!
//! A `Studio` is owned by whatever hosts the interactive surface. Painting,
//! undo and export run synchronously on the caller's thread; rendering runs
//! on a worker and is drained with [`Studio::pump_render`] or
//! [`Studio::wait_render`].

use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::{estimated_size_mb, plan_export, CapturedFrame, ExportSettings, FrameRecorder};
use crate::collaborators::{CollaboratorError, FrameEncoder, SubjectIsolator};
use crate::config::{BrushSettings, StudioConfig};
use crate::error::StudioError;
use crate::glyphs::GlyphFace;
use crate::history::MaskHistory;
use crate::mask::{DirtyRect, MaskLayerKind, MaskLayers, Point};
use crate::pixel_buffer::PixelBuffer;
use crate::render_params::RenderParams;
use crate::render_worker::{spawn_render, RenderHandle};
use crate::stroke_engine::{RenderError, RenderEvent, RenderRequest};

#[derive(Debug, Clone, Copy)]
struct ActiveStroke {
    layer: MaskLayerKind,
    last: Point,
    erase: bool,
}

/// Summary of a finished render.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RenderOutcome {
    pub fraction: f64,
    pub strokes_done: u64,
    pub total_strokes: u64,
    pub glyphs_stamped: u64,
    pub cancelled: bool,
    pub captured_frames: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExportSummary {
    pub frames: usize,
    pub width: u32,
    pub height: u32,
    pub duration_ms: u64,
}

pub struct Studio {
    source: Option<Arc<PixelBuffer>>,
    masks: MaskLayers,
    history: MaskHistory,
    params: RenderParams,
    brush: BrushSettings,
    export: ExportSettings,
    face: GlyphFace,
    active_layer: MaskLayerKind,
    stroke: Option<ActiveStroke>,
    recorder: FrameRecorder,
    render: Option<RenderHandle>,
    rendered: Option<PixelBuffer>,
    progress: f64,
    last_outcome: Option<RenderOutcome>,
}

impl Default for Studio {
    fn default() -> Self {
        Self::new(&StudioConfig::default())
    }
}

impl Studio {
    pub fn new(config: &StudioConfig) -> Self {
        Self {
            source: None,
            masks: MaskLayers::new(0, 0),
            history: MaskHistory::new(),
            params: config.render.clone(),
            brush: config.brush,
            export: config.export.clone(),
            face: GlyphFace::default(),
            active_layer: MaskLayerKind::Density,
            stroke: None,
            recorder: FrameRecorder::new(config.capture),
            render: None,
            rendered: None,
            progress: 0.0,
            last_outcome: None,
        }
    }

    /// Replaces the source image. Masks, history, captured frames and any
    /// running render are discarded.
    pub fn load_image(&mut self, image: PixelBuffer) {
        self.abandon_render();
        let (width, height) = image.dimensions();
        info!(width, height, "source image loaded");
        self.masks = MaskLayers::new(width, height);
        self.history.clear();
        self.recorder.clear();
        self.stroke = None;
        self.rendered = None;
        self.progress = 0.0;
        self.last_outcome = None;
        self.source = Some(Arc::new(image));
    }

    pub fn source(&self) -> Option<&PixelBuffer> {
        self.source.as_deref()
    }

    pub fn masks(&self) -> &MaskLayers {
        &self.masks
    }

    pub fn history(&self) -> &MaskHistory {
        &self.history
    }

    pub fn params(&self) -> &RenderParams {
        &self.params
    }

    /// Takes effect on the next `start_render`.
    pub fn set_params(&mut self, params: RenderParams) {
        self.params = params;
    }

    pub fn brush(&self) -> &BrushSettings {
        &self.brush
    }

    pub fn set_brush(&mut self, brush: BrushSettings) {
        self.brush = brush;
    }

    pub fn export_settings(&self) -> &ExportSettings {
        &self.export
    }

    pub fn set_export_settings(&mut self, export: ExportSettings) {
        self.export = export;
    }

    pub fn set_face(&mut self, face: GlyphFace) {
        self.face = face;
    }

    pub fn active_layer(&self) -> MaskLayerKind {
        self.active_layer
    }

    pub fn set_active_layer(&mut self, layer: MaskLayerKind) {
        self.end_stroke();
        self.active_layer = layer;
    }

    fn require_image(&self) -> Result<(), StudioError> {
        if self.source.is_none() {
            return Err(StudioError::NoImage);
        }
        Ok(())
    }

    /// Starts a brush stroke on the active layer with a dab at `at`. The layer
    /// is snapshotted once here, not per segment.
    pub fn begin_stroke(&mut self, at: Point, erase: bool) -> Result<Option<DirtyRect>, StudioError> {
        self.require_image()?;
        self.end_stroke();
        let layer = self.active_layer;
        self.history.snapshot(&self.masks, layer);
        let dirty = self
            .masks
            .paint(layer, &self.brush.stroke(at, at, erase))?;
        self.stroke = Some(ActiveStroke {
            layer,
            last: at,
            erase,
        });
        Ok(dirty)
    }

    /// Paints the segment from the previous pointer position to `to`.
    pub fn extend_stroke(&mut self, to: Point) -> Result<Option<DirtyRect>, StudioError> {
        let Some(stroke) = self.stroke.as_mut() else {
            return Err(StudioError::NoActiveStroke);
        };
        let segment = self.brush.stroke(stroke.last, to, stroke.erase);
        stroke.last = to;
        let layer = stroke.layer;
        Ok(self.masks.paint(layer, &segment)?)
    }

    /// Returns whether a stroke was in progress.
    pub fn end_stroke(&mut self) -> bool {
        self.stroke.take().is_some()
    }

    /// Convenience for a whole pointer path: begin, extend through every
    /// point, end.
    pub fn paint_path(&mut self, path: &[Point], erase: bool) -> Result<(), StudioError> {
        let Some((first, rest)) = path.split_first() else {
            return Ok(());
        };
        self.begin_stroke(*first, erase)?;
        for point in rest {
            self.extend_stroke(*point)?;
        }
        self.end_stroke();
        Ok(())
    }

    pub fn invert_mask(&mut self, layer: MaskLayerKind) -> Result<(), StudioError> {
        self.require_image()?;
        self.end_stroke();
        self.history.snapshot(&self.masks, layer);
        self.masks.invert(layer)?;
        Ok(())
    }

    pub fn clear_mask(&mut self, layer: MaskLayerKind) -> Result<(), StudioError> {
        self.require_image()?;
        self.end_stroke();
        self.history.snapshot(&self.masks, layer);
        self.masks.clear(layer);
        Ok(())
    }

    /// Replaces `layer` with the alpha channel of `mask`. Sizes are checked
    /// before the snapshot so a rejected mask leaves history untouched.
    pub fn import_mask(&mut self, layer: MaskLayerKind, mask: &PixelBuffer) -> Result<(), StudioError> {
        self.require_image()?;
        let expected = (self.masks.width(), self.masks.height());
        if mask.dimensions() != expected {
            return Err(CollaboratorError::DimensionMismatch {
                expected,
                actual: mask.dimensions(),
            }
            .into());
        }
        self.end_stroke();
        self.history.snapshot(&self.masks, layer);
        self.masks.apply_isolation(layer, mask)?;
        Ok(())
    }

    /// Runs subject isolation on the source and fills `layer` with the result.
    /// A failing isolator leaves masks and history unchanged.
    pub fn isolate_subject(
        &mut self,
        isolator: &mut dyn SubjectIsolator,
        layer: MaskLayerKind,
    ) -> Result<(), StudioError> {
        let Some(source) = self.source.clone() else {
            return Err(StudioError::NoImage);
        };
        let cutout = isolator.isolate(&source).map_err(|error| {
            warn!(%error, layer = %layer, "subject isolation failed");
            error
        })?;
        self.import_mask(layer, &cutout)
    }

    pub fn undo(&mut self) -> bool {
        self.end_stroke();
        self.history.undo(&mut self.masks)
    }

    pub fn redo(&mut self) -> bool {
        self.end_stroke();
        self.history.redo(&mut self.masks)
    }

    /// On-screen preview of the source with every mask layer tinted on top.
    pub fn mask_overlay(&self) -> Option<PixelBuffer> {
        self.source
            .as_deref()
            .map(|source| self.masks.overlay(source))
    }

    /// Launches a render of the current source and masks. Captured frames
    /// from the previous render are discarded.
    pub fn start_render(&mut self) -> Result<(), StudioError> {
        let Some(source) = self.source.clone() else {
            return Err(StudioError::NoImage);
        };
        if self.render.is_some() {
            return Err(StudioError::RenderInProgress);
        }
        self.end_stroke();
        self.recorder.clear();
        self.progress = 0.0;
        self.last_outcome = None;

        let handle = spawn_render(RenderRequest {
            source,
            masks: self.masks.clone(),
            params: self.params.clone(),
            face: self.face.clone(),
        })?;
        self.render = Some(handle);
        Ok(())
    }

    /// Requests cancellation; the render still ends with a terminal event.
    pub fn stop_render(&mut self) -> bool {
        match &self.render {
            Some(handle) => {
                debug!("stop requested");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_rendering(&self) -> bool {
        self.render.is_some()
    }

    /// Latest reported progress in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Handles every event already queued without blocking. Returns the
    /// outcome once the terminal event has been seen.
    pub fn pump_render(&mut self) -> Result<Option<RenderOutcome>, StudioError> {
        loop {
            let Some(handle) = self.render.as_mut() else {
                return Ok(None);
            };
            let Some(event) = handle.try_recv() else {
                if handle.is_disconnected() {
                    return Err(self.reap_failed_render());
                }
                return Ok(None);
            };
            if let Some(outcome) = self.handle_event(event)? {
                return Ok(Some(outcome));
            }
        }
    }

    /// Blocks until the running render finishes. `None` when nothing is running.
    pub fn wait_render(&mut self) -> Result<Option<RenderOutcome>, StudioError> {
        loop {
            let Some(handle) = self.render.as_mut() else {
                return Ok(None);
            };
            let Some(event) = handle.recv() else {
                return Err(self.reap_failed_render());
            };
            if let Some(outcome) = self.handle_event(event)? {
                return Ok(Some(outcome));
            }
        }
    }

    fn handle_event(&mut self, event: RenderEvent) -> Result<Option<RenderOutcome>, StudioError> {
        self.progress = event.fraction();
        if !event.is_terminal() {
            self.recorder.observe(&event)?;
            return Ok(None);
        }

        // The worker is released before any capture or join error propagates.
        let joined = self.render.take().map_or(Ok(()), RenderHandle::join);
        self.recorder.observe(&event)?;
        joined?;
        let RenderEvent::Finished(progress) = event else {
            return Ok(None);
        };
        let outcome = RenderOutcome {
            fraction: progress.fraction,
            strokes_done: progress.strokes_done,
            total_strokes: progress.total_strokes,
            glyphs_stamped: progress.glyphs_stamped,
            cancelled: progress.strokes_done < progress.total_strokes,
            captured_frames: self.recorder.len(),
        };
        info!(
            fraction = outcome.fraction,
            cancelled = outcome.cancelled,
            captured_frames = outcome.captured_frames,
            "render complete"
        );
        self.rendered = Some(progress.frame);
        self.last_outcome = Some(outcome);
        Ok(Some(outcome))
    }

    pub fn last_outcome(&self) -> Option<&RenderOutcome> {
        self.last_outcome.as_ref()
    }

    /// Terminal frame of the most recent finished render.
    pub fn rendered_frame(&self) -> Option<&PixelBuffer> {
        self.rendered.as_ref()
    }

    pub fn captured_frames(&self) -> &[CapturedFrame] {
        self.recorder.frames()
    }

    pub fn estimated_export_size_mb(&self) -> f64 {
        estimated_size_mb(self.recorder.frames(), &self.export)
    }

    /// Selects, crops and times the captured frames and hands them to `encoder`.
    pub fn export_timelapse(
        &self,
        encoder: &mut dyn FrameEncoder,
        out: &mut dyn Write,
    ) -> Result<ExportSummary, StudioError> {
        let sequence = plan_export(self.recorder.frames(), &self.export)?;
        encoder.encode(&sequence, out).map_err(|error| {
            warn!(%error, "timelapse export failed");
            error
        })?;
        Ok(ExportSummary {
            frames: sequence.frames.len(),
            width: sequence.width,
            height: sequence.height,
            duration_ms: sequence.total_duration_ms(),
        })
    }

    /// Joins a worker whose queue closed without a terminal event.
    fn reap_failed_render(&mut self) -> StudioError {
        let joined = self.render.take().map(RenderHandle::join);
        match joined {
            Some(Err(error)) => {
                warn!(%error, "render failed");
                error.into()
            }
            _ => RenderError::WorkerPanicked.into(),
        }
    }

    fn abandon_render(&mut self) {
        if let Some(handle) = self.render.take() {
            handle.cancel();
            if let Err(error) = handle.join() {
                warn!(%error, "render worker did not shut down cleanly");
            }
        }
    }
}

impl Drop for Studio {
    fn drop(&mut self) {
        if let Some(handle) = &self.render {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::GifFrameEncoder;
    use crate::history::MAX_UNDO_DEPTH;

    struct FailingIsolator;

    impl SubjectIsolator for FailingIsolator {
        fn isolate(&mut self, _source: &PixelBuffer) -> Result<PixelBuffer, CollaboratorError> {
            Err(CollaboratorError::Isolation("model unavailable".to_owned()))
        }
    }

    struct HalfIsolator;

    impl SubjectIsolator for HalfIsolator {
        fn isolate(&mut self, source: &PixelBuffer) -> Result<PixelBuffer, CollaboratorError> {
            let (width, height) = source.dimensions();
            let mut mask = PixelBuffer::new(width, height).map_err(|error| {
                CollaboratorError::Isolation(error.to_string())
            })?;
            for y in 0..height {
                for x in 0..width / 2 {
                    mask.put_pixel(x, y, [0, 0, 0, 255]);
                }
            }
            Ok(mask)
        }
    }

    fn studio_with_image(total_strokes: u64) -> Studio {
        let mut config = StudioConfig::default();
        config.render.total_strokes = total_strokes;
        config.render.output_scale = 1.0;
        config.render.font_size = 6.0;
        config.brush.radius = 5.0;
        config.brush.hardness = 1.0;
        config.export = ExportSettings {
            target_height: 32,
            ..ExportSettings::default()
        };
        let mut studio = Studio::new(&config);
        studio.load_image(PixelBuffer::filled(32, 32, [40, 40, 40, 255]).expect("image"));
        studio
    }

    #[test]
    fn operations_require_an_image() {
        let mut studio = Studio::default();
        assert_eq!(
            studio.begin_stroke(Point::new(1.0, 1.0), false),
            Err(StudioError::NoImage)
        );
        assert_eq!(studio.start_render(), Err(StudioError::NoImage));
        assert!(!studio.undo());
    }

    #[test]
    fn a_whole_stroke_is_one_undo_step() {
        let mut studio = studio_with_image(10);
        studio
            .paint_path(
                &[
                    Point::new(4.0, 4.0),
                    Point::new(12.0, 8.0),
                    Point::new(20.0, 20.0),
                ],
                false,
            )
            .expect("paint");
        assert_eq!(studio.history().undo_depth(), 1);
        let painted = studio.masks().clone();

        assert!(studio.undo());
        assert!(!studio.masks().exists(MaskLayerKind::Density));
        assert!(studio.redo());
        assert_eq!(studio.masks(), &painted);
    }

    #[test]
    fn extend_without_begin_is_an_error() {
        let mut studio = studio_with_image(10);
        assert_eq!(
            studio.extend_stroke(Point::new(3.0, 3.0)),
            Err(StudioError::NoActiveStroke)
        );
    }

    #[test]
    fn history_depth_is_capped() {
        let mut studio = studio_with_image(10);
        for _ in 0..(MAX_UNDO_DEPTH + 5) {
            studio.invert_mask(MaskLayerKind::Detail).expect("invert");
        }
        assert_eq!(studio.history().undo_depth(), MAX_UNDO_DEPTH);
    }

    #[test]
    fn clear_and_invert_are_undoable() {
        let mut studio = studio_with_image(10);
        studio.set_active_layer(MaskLayerKind::Color);
        studio.paint_path(&[Point::new(8.0, 8.0)], false).expect("paint");
        let painted = studio.masks().clone();

        studio.clear_mask(MaskLayerKind::Color).expect("clear");
        assert!(!studio.masks().exists(MaskLayerKind::Color));
        studio.invert_mask(MaskLayerKind::Color).expect("invert");
        assert!(studio.undo());
        assert!(studio.undo());
        assert_eq!(studio.masks(), &painted);
    }

    #[test]
    fn failed_isolation_leaves_state_untouched() {
        let mut studio = studio_with_image(10);
        studio.paint_path(&[Point::new(8.0, 8.0)], false).expect("paint");
        let masks = studio.masks().clone();
        let depth = studio.history().undo_depth();

        let err = studio
            .isolate_subject(&mut FailingIsolator, MaskLayerKind::Original)
            .expect_err("isolation fails");
        assert!(matches!(err, StudioError::Collaborator(CollaboratorError::Isolation(_))));
        assert_eq!(studio.masks(), &masks);
        assert_eq!(studio.history().undo_depth(), depth);
    }

    #[test]
    fn isolation_fills_layer_and_is_undoable() {
        let mut studio = studio_with_image(10);
        studio
            .isolate_subject(&mut HalfIsolator, MaskLayerKind::Original)
            .expect("isolate");
        let layer = studio.masks().get(MaskLayerKind::Original).expect("layer");
        assert_eq!(layer.alpha(0, 0), 255);
        assert_eq!(layer.alpha(31, 0), 0);
        assert!(studio.undo());
        assert!(!studio.masks().exists(MaskLayerKind::Original));
    }

    #[test]
    fn mismatched_import_is_rejected_without_snapshot() {
        let mut studio = studio_with_image(10);
        let wrong = PixelBuffer::filled(8, 8, [0, 0, 0, 255]).expect("mask");
        assert!(studio.import_mask(MaskLayerKind::Detail, &wrong).is_err());
        assert_eq!(studio.history().undo_depth(), 0);
    }

    #[test]
    fn render_runs_to_completion_and_captures_frames() {
        let mut studio = studio_with_image(12_000);
        studio.start_render().expect("start");
        assert!(studio.is_rendering());
        assert_eq!(studio.start_render(), Err(StudioError::RenderInProgress));

        let outcome = studio.wait_render().expect("wait").expect("outcome");
        assert!(!studio.is_rendering());
        assert_eq!(outcome.fraction, 1.0);
        assert!(!outcome.cancelled);
        assert_eq!(studio.progress(), 1.0);
        assert!(studio.rendered_frame().is_some());
        let frames = studio.captured_frames();
        assert!(!frames.is_empty());
        assert_eq!(frames.last().expect("last").fraction, 1.0);
    }

    #[test]
    fn new_render_discards_previous_frames() {
        let mut studio = studio_with_image(5_000);
        studio.start_render().expect("start");
        studio.wait_render().expect("wait");
        let first = studio.captured_frames().len();
        assert!(first > 0);

        studio.start_render().expect("restart");
        assert!(studio.captured_frames().is_empty());
        studio.wait_render().expect("wait");
        assert_eq!(studio.captured_frames().len(), first);
    }

    #[test]
    fn stop_render_reports_partial_progress() {
        let mut studio = studio_with_image(3_000_000);
        studio.start_render().expect("start");
        assert!(studio.stop_render());
        let outcome = studio.wait_render().expect("wait").expect("outcome");
        assert!(outcome.cancelled);
        assert!(outcome.fraction < 1.0);
        assert!(!studio.stop_render());
    }

    #[test]
    fn failed_preparation_releases_the_render_slot() {
        let mut studio = studio_with_image(100);
        studio.set_params(RenderParams {
            output_scale: 1.0e12,
            ..studio.params().clone()
        });
        studio.start_render().expect("start returns before preparation");
        let err = studio.wait_render().expect_err("preparation fails");
        assert!(matches!(err, StudioError::Render(RenderError::Buffer(_))));
        assert!(!studio.is_rendering());

        studio.set_params(RenderParams {
            output_scale: 1.0,
            ..studio.params().clone()
        });
        studio.start_render().expect("slot is free again");
        assert!(studio.wait_render().expect("wait").is_some());
    }

    #[test]
    fn pump_reports_failed_preparation_once() {
        let mut studio = studio_with_image(100);
        studio.set_params(RenderParams {
            output_scale: 1.0e12,
            ..studio.params().clone()
        });
        studio.start_render().expect("start");
        let err = loop {
            match studio.pump_render() {
                Ok(None) => std::thread::yield_now(),
                Ok(Some(outcome)) => panic!("unexpected outcome {outcome:?}"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, StudioError::Render(_)));
        assert!(!studio.is_rendering());
        assert_eq!(studio.pump_render(), Ok(None));
    }

    #[test]
    fn terminal_event_releases_the_render() {
        let mut studio = studio_with_image(3_000_000);
        studio.start_render().expect("start");
        studio.stop_render();
        let terminal = loop {
            let event = studio
                .render
                .as_mut()
                .and_then(RenderHandle::recv)
                .expect("events until terminal");
            if event.is_terminal() {
                break event;
            }
            studio.handle_event(event).expect("progress event");
        };
        assert!(studio.is_rendering());
        studio.handle_event(terminal).expect("terminal event");
        assert!(!studio.is_rendering());
        assert!(studio.last_outcome().is_some_and(|outcome| outcome.cancelled));
    }

    #[test]
    fn export_writes_gif_for_captured_frames() {
        let mut studio = studio_with_image(12_000);
        studio.start_render().expect("start");
        studio.wait_render().expect("wait");

        let mut bytes = Vec::new();
        let summary = studio
            .export_timelapse(&mut GifFrameEncoder, &mut bytes)
            .expect("export");
        assert_eq!(summary.frames, studio.captured_frames().len());
        assert_eq!(summary.height, 32);
        assert!(bytes.starts_with(b"GIF89a"));
        assert!(studio.estimated_export_size_mb() > 0.0);
    }

    #[test]
    fn export_without_frames_fails() {
        let studio = studio_with_image(10);
        let mut bytes = Vec::new();
        assert!(matches!(
            studio.export_timelapse(&mut GifFrameEncoder, &mut bytes),
            Err(StudioError::Export(_))
        ));
    }

    #[test]
    fn settings_and_preview_accessors() {
        let mut studio = studio_with_image(10);
        assert_eq!(studio.source().map(PixelBuffer::dimensions), Some((32, 32)));
        assert_eq!(studio.active_layer(), MaskLayerKind::Density);

        let params = RenderParams {
            total_strokes: 77,
            ..studio.params().clone()
        };
        studio.set_params(params);
        assert_eq!(studio.params().total_strokes, 77);

        studio.set_brush(BrushSettings {
            radius: 3.0,
            ..*studio.brush()
        });
        assert_eq!(studio.brush().radius, 3.0);

        studio.set_export_settings(ExportSettings {
            frame_density_pct: 50,
            ..studio.export_settings().clone()
        });
        assert_eq!(studio.export_settings().frame_density_pct, 50);

        studio.set_active_layer(MaskLayerKind::Detail);
        studio.paint_path(&[Point::new(16.0, 16.0)], false).expect("paint");
        let preview = studio.mask_overlay().expect("preview");
        assert_ne!(preview.pixel(16, 16), studio.source().and_then(|s| s.pixel(16, 16)));
        assert_eq!(preview.pixel(0, 31), studio.source().and_then(|s| s.pixel(0, 31)));
        assert!(studio.last_outcome().is_none());
    }

    #[test]
    fn loading_an_image_resets_the_session() {
        let mut studio = studio_with_image(10);
        studio.paint_path(&[Point::new(8.0, 8.0)], false).expect("paint");
        studio.load_image(PixelBuffer::filled(16, 8, [0, 0, 0, 255]).expect("image"));
        assert_eq!(studio.history().undo_depth(), 0);
        assert_eq!((studio.masks().width(), studio.masks().height()), (16, 8));
        assert!(!studio.masks().exists(MaskLayerKind::Density));
    }
}
