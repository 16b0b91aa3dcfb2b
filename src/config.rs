use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::capture::{CaptureBudget, ExportSettings};
use crate::mask::{BrushStroke, Point};
use crate::render_params::RenderParams;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BrushSettings {
    pub radius: f32,
    pub hardness: f32,
    pub opacity: f32,
}

impl Default for BrushSettings {
    fn default() -> Self {
        Self {
            radius: 40.0,
            hardness: 0.5,
            opacity: 1.0,
        }
    }
}

impl BrushSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            bail!("brush radius must be > 0, got {}", self.radius);
        }
        if !(0.0..=1.0).contains(&self.hardness) {
            bail!("brush hardness must be in [0, 1], got {}", self.hardness);
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            bail!("brush opacity must be in [0, 1], got {}", self.opacity);
        }
        Ok(())
    }

    pub fn stroke(&self, from: Point, to: Point, erase: bool) -> BrushStroke {
        BrushStroke {
            from,
            to,
            radius: self.radius,
            hardness: self.hardness,
            opacity: self.opacity,
            erase,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StudioConfig {
    pub render: RenderParams,
    pub brush: BrushSettings,
    pub capture: CaptureBudget,
    pub export: ExportSettings,
}

impl StudioConfig {
    pub fn validate(&self) -> Result<()> {
        self.render.validate().context("invalid render settings")?;
        self.brush.validate().context("invalid brush settings")?;
        if self.capture.max_height == 0 || self.capture.max_pixels == 0 {
            bail!("capture budget must allow at least one pixel");
        }
        if !(self.capture.progress_step > 0.0 && self.capture.progress_step <= 1.0) {
            bail!(
                "capture progress_step must be in (0, 1], got {}",
                self.capture.progress_step
            );
        }
        self.export
            .validate()
            .map_err(|error| anyhow!("invalid export settings: {error}"))?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<StudioConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<StudioConfig> {
    if contents.trim().is_empty() {
        return Ok(StudioConfig::default());
    }
    let config: StudioConfig = serde_yaml::from_str(contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!("failed to parse yaml at {}: {}", location, error)
    })?;
    config.validate()?;
    Ok(config)
}
