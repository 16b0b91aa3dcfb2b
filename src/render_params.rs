use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::glyphs::DEFAULT_RAMP;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    /// Ink takes the source pixel's colour.
    #[default]
    Color,
    /// Ink takes the pixel's gamma-corrected grey value.
    #[serde(alias = "b&w", alias = "bw", alias = "monochrome")]
    Mono,
    /// Colour where the colour layer is painted, grey elsewhere (dithered).
    MaskedColor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RenderParams {
    pub total_strokes: u64,
    pub font_size: f32,
    pub gamma: f32,
    pub output_scale: f32,
    /// Peak ink alpha on a 0..=255 scale.
    pub ink_opacity: f32,
    pub ribbon_wear: f32,
    pub dirty_ink: f32,
    pub density_weight: f32,
    pub character_set: String,
    pub color_mode: ColorMode,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            total_strokes: 300_000,
            font_size: 14.0,
            gamma: 1.4,
            output_scale: 2.0,
            ink_opacity: 140.0,
            ribbon_wear: 0.2,
            dirty_ink: 0.1,
            density_weight: 2.0,
            character_set: DEFAULT_RAMP.to_owned(),
            color_mode: ColorMode::Color,
        }
    }
}

impl RenderParams {
    pub fn validate(&self) -> Result<()> {
        if !self.font_size.is_finite() || self.font_size < 1.0 {
            bail!("font_size must be >= 1, got {}", self.font_size);
        }
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            bail!("gamma must be > 0, got {}", self.gamma);
        }
        if !self.output_scale.is_finite() || self.output_scale <= 0.0 {
            bail!("output_scale must be > 0, got {}", self.output_scale);
        }
        if !self.ink_opacity.is_finite() || !(0.0..=255.0).contains(&self.ink_opacity) {
            bail!("ink_opacity must be in [0, 255], got {}", self.ink_opacity);
        }
        if !(0.0..=1.0).contains(&self.ribbon_wear) {
            bail!("ribbon_wear must be in [0, 1], got {}", self.ribbon_wear);
        }
        if !(0.0..=1.0).contains(&self.dirty_ink) {
            bail!("dirty_ink must be in [0, 1], got {}", self.dirty_ink);
        }
        if !self.density_weight.is_finite() || self.density_weight < 1.0 {
            bail!("density_weight must be >= 1, got {}", self.density_weight);
        }
        Ok(())
    }

    /// Output canvas size for a `width` x `height` source.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = self.output_scale;
        (
            ((width as f32 * scale).floor() as u32).max(1),
            ((height as f32 * scale).floor() as u32).max(1),
        )
    }

    /// Glyph pixel size on the output canvas.
    pub fn scaled_font_size(&self) -> f32 {
        (self.font_size * self.output_scale).floor().max(1.0)
    }

    /// Strokes per cancellable work unit.
    pub fn chunk_size(&self) -> u64 {
        (self.total_strokes / 100).max(5_000)
    }
}
