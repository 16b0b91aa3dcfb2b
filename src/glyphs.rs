use std::fmt::{self, Write as _};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use fontdue::{Font, FontSettings};

use crate::glyph_face_data::{ASCII_END, ASCII_START, BITMAP_FACE, GLYPH_COLUMNS, GLYPH_ROWS};

/// Used when the configured palette is empty. Already ordered densest first.
pub const DEFAULT_RAMP: &str =
    "$@B%8&WM#*oahkbdpqwmZO0QLCJUYXzcvunxrjft/\\|()1{}[]?-_+~<>i!lI;:,\"^`'. ";

/// Coverage at or above this counts as an inked pixel when ranking glyphs.
const INK_THRESHOLD: u8 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphBitmap {
    pub width: usize,
    pub height: usize,
    pub coverage: Vec<u8>,
}

impl GlyphBitmap {
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            coverage: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn coverage_at(&self, x: usize, y: usize) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        self.coverage[y * self.width + x]
    }

    pub fn ink_pixels(&self) -> u32 {
        self.coverage
            .iter()
            .filter(|value| **value >= INK_THRESHOLD)
            .count() as u32
    }
}

/// Source of glyph shapes: the built-in bitmap face or a loaded font.
#[derive(Clone)]
pub enum GlyphFace {
    Bitmap,
    Font(Arc<Font>),
}

impl fmt::Debug for GlyphFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bitmap => f.write_str("GlyphFace::Bitmap"),
            Self::Font(_) => f.write_str("GlyphFace::Font"),
        }
    }
}

impl Default for GlyphFace {
    fn default() -> Self {
        Self::Bitmap
    }
}

impl GlyphFace {
    pub fn from_path(font_path: &Path) -> Result<Self> {
        let font_bytes = std::fs::read(font_path)
            .with_context(|| format!("failed to read font file {}", font_path.display()))?;
        Self::from_bytes(font_bytes)
            .with_context(|| format!("failed to load font {}", font_path.display()))
    }

    pub fn from_bytes(font_bytes: Vec<u8>) -> Result<Self> {
        let font = Font::from_bytes(font_bytes, FontSettings::default())
            .map_err(|error| anyhow!("failed to parse font: {error}"))?;
        Ok(Self::Font(Arc::new(font)))
    }

    /// Horizontal advance of one glyph cell at `size` pixels.
    pub fn advance(&self, size: f32) -> f32 {
        match self {
            Self::Bitmap => (GLYPH_COLUMNS + 1) as f32 * size / GLYPH_ROWS as f32,
            Self::Font(font) => font.metrics('M', size).advance_width.max(1.0),
        }
    }

    pub fn rasterize(&self, character: char, size: f32) -> GlyphBitmap {
        match self {
            Self::Bitmap => rasterize_bitmap(character, size),
            Self::Font(font) => {
                let (metrics, coverage) = font.rasterize(character, size);
                if metrics.width == 0 || metrics.height == 0 {
                    return GlyphBitmap::empty();
                }
                GlyphBitmap {
                    width: metrics.width,
                    height: metrics.height,
                    coverage,
                }
            }
        }
    }
}

fn bitmap_bit(character: char, column: u32, row: u32) -> bool {
    let code = character as u32;
    if code < u32::from(ASCII_START) || code > u32::from(ASCII_END) {
        return false;
    }
    if column >= GLYPH_COLUMNS || row >= GLYPH_ROWS {
        return false;
    }
    let columns = &BITMAP_FACE[(code - u32::from(ASCII_START)) as usize];
    ((columns[column as usize] >> row) & 1) == 1
}

/// Nearest-neighbour upscale of the 5x8 cell to `size` pixels tall.
fn rasterize_bitmap(character: char, size: f32) -> GlyphBitmap {
    let scale = size.max(1.0) / GLYPH_ROWS as f32;
    let width = ((GLYPH_COLUMNS as f32 * scale).round() as usize).max(1);
    let height = ((GLYPH_ROWS as f32 * scale).round() as usize).max(1);

    let mut coverage = vec![0_u8; width * height];
    for y in 0..height {
        let row = ((y as u32 * GLYPH_ROWS) / height as u32).min(GLYPH_ROWS - 1);
        for x in 0..width {
            let column = ((x as u32 * GLYPH_COLUMNS) / width as u32).min(GLYPH_COLUMNS - 1);
            if bitmap_bit(character, column, row) {
                coverage[y * width + x] = 255;
            }
        }
    }

    GlyphBitmap {
        width,
        height,
        coverage,
    }
}

#[derive(Debug, Clone)]
pub struct RampGlyph {
    pub character: char,
    pub ink_pixels: u32,
    pub bitmap: GlyphBitmap,
}

/// Characters ordered from most to least ink coverage at one font size.
#[derive(Debug, Clone)]
pub struct DensityRamp {
    glyphs: Vec<RampGlyph>,
    font_size: f32,
    advance: f32,
}

impl DensityRamp {
    /// Ranks `palette` by rasterized ink coverage. Duplicate characters keep
    /// their first occurrence; ties keep palette order. An empty palette
    /// yields [`DEFAULT_RAMP`] in its fixed order.
    pub fn build(face: &GlyphFace, palette: &str, font_size: f32) -> Self {
        let rasterize = |character: char| {
            let bitmap = face.rasterize(character, font_size);
            RampGlyph {
                character,
                ink_pixels: bitmap.ink_pixels(),
                bitmap,
            }
        };

        let glyphs = if palette.is_empty() {
            DEFAULT_RAMP.chars().map(rasterize).collect()
        } else {
            let mut unique = Vec::new();
            for character in palette.chars() {
                if !unique.contains(&character) {
                    unique.push(character);
                }
            }
            let mut glyphs = unique.into_iter().map(rasterize).collect::<Vec<_>>();
            glyphs.sort_by_key(|glyph| std::cmp::Reverse(glyph.ink_pixels));
            glyphs
        };

        Self {
            glyphs,
            font_size,
            advance: face.advance(font_size),
        }
    }

    pub fn len(&self) -> usize {
        self.glyphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }

    pub fn font_size(&self) -> f32 {
        self.font_size
    }

    pub fn advance(&self) -> f32 {
        self.advance
    }

    pub fn glyph(&self, index: usize) -> Option<&RampGlyph> {
        self.glyphs.get(index)
    }

    pub fn glyphs(&self) -> &[RampGlyph] {
        &self.glyphs
    }

    pub fn characters(&self) -> String {
        self.glyphs.iter().map(|glyph| glyph.character).collect()
    }

    /// Ramp position for a darkness in `[0, 1]`, shifted by `jitter` and clamped.
    /// Darkness 1 maps to the densest glyph at index 0.
    pub fn index_for(&self, darkness: f32, jitter: i32) -> usize {
        if self.glyphs.is_empty() {
            return 0;
        }
        let last = self.glyphs.len() - 1;
        let base = ((1.0 - darkness.clamp(0.0, 1.0)) * last as f32).round() as i64;
        (base + i64::from(jitter)).clamp(0, last as i64) as usize
    }

    /// Tab-separated ranking table, densest first.
    pub fn density_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(&mut out, "rank\tglyph\tink_pixels");
        for (rank, glyph) in self.glyphs.iter().enumerate() {
            let display = match glyph.character {
                ' ' => "<space>".to_string(),
                other => other.to_string(),
            };
            let _ = writeln!(&mut out, "{rank}\t{display}\t{}", glyph.ink_pixels);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_face_has_visible_pixels_for_letter_a() {
        let bitmap = GlyphFace::Bitmap.rasterize('A', 16.0);
        assert_eq!((bitmap.width, bitmap.height), (10, 16));
        assert!(bitmap.ink_pixels() > 0);
    }

    #[test]
    fn space_and_unknown_glyphs_have_no_ink() {
        assert_eq!(GlyphFace::Bitmap.rasterize(' ', 14.0).ink_pixels(), 0);
        assert_eq!(GlyphFace::Bitmap.rasterize('\u{2603}', 14.0).ink_pixels(), 0);
    }

    #[test]
    fn ramp_is_sorted_by_descending_ink() {
        let ramp = DensityRamp::build(&GlyphFace::Bitmap, ". :@#-", 14.0);
        for pair in ramp.glyphs().windows(2) {
            assert!(pair[0].ink_pixels >= pair[1].ink_pixels);
        }
        assert_eq!(ramp.glyph(ramp.len() - 1).map(|g| g.character), Some(' '));
    }

    #[test]
    fn ramp_deduplicates_palette() {
        let ramp = DensityRamp::build(&GlyphFace::Bitmap, "aaab..", 12.0);
        assert_eq!(ramp.len(), 3);
    }

    #[test]
    fn empty_palette_falls_back_to_default_ramp() {
        let ramp = DensityRamp::build(&GlyphFace::Bitmap, "", 14.0);
        assert_eq!(ramp.characters(), DEFAULT_RAMP);
    }

    #[test]
    fn darkness_maps_to_ramp_ends_and_clamps_jitter() {
        let ramp = DensityRamp::build(&GlyphFace::Bitmap, "@#+:. ", 10.0);
        assert_eq!(ramp.index_for(1.0, 0), 0);
        assert_eq!(ramp.index_for(0.0, 0), ramp.len() - 1);
        assert_eq!(ramp.index_for(1.0, -1), 0);
        assert_eq!(ramp.index_for(0.0, 1), ramp.len() - 1);
        assert_eq!(ramp.index_for(0.5, 1), 4);
    }

    #[test]
    fn half_size_ramp_has_smaller_glyphs() {
        let full = DensityRamp::build(&GlyphFace::Bitmap, "@", 20.0);
        let half = DensityRamp::build(&GlyphFace::Bitmap, "@", 10.0);
        assert!(half.glyphs()[0].ink_pixels < full.glyphs()[0].ink_pixels);
        assert!(half.advance() < full.advance());
    }

    #[test]
    fn density_table_lists_every_glyph() {
        let ramp = DensityRamp::build(&GlyphFace::Bitmap, "@ ", 8.0);
        let table = ramp.density_table();
        assert_eq!(table.lines().count(), 3);
        assert!(table.contains("<space>"));
    }

    #[test]
    fn unreadable_font_path_is_an_error() {
        let err = GlyphFace::from_path(Path::new("/nonexistent/font.ttf"))
            .expect_err("missing font must fail");
        assert!(err.to_string().contains("failed to read font file"));
    }
}
