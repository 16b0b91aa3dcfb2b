use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::Level;

use typewriter_studio::collaborators::{GifFrameEncoder, PrecomputedMaskIsolator};
use typewriter_studio::config::{load_config, StudioConfig};
use typewriter_studio::glyphs::{DensityRamp, GlyphFace};
use typewriter_studio::mask::MaskLayerKind;
use typewriter_studio::pixel_buffer::PixelBuffer;
use typewriter_studio::studio::{ExportSummary, Studio};

const PROGRESS_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Parser)]
#[command(name = "typewriter-studio")]
#[command(about = "Renders photographs as stochastic typewriter art")]
struct Cli {
    /// Repeat for more detail (-v debug, -vv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render an image to a PNG, optionally with a GIF timelapse.
    Render {
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Mask image for a layer, as `layer=path`. Only the alpha channel is used.
        #[arg(long = "mask", value_name = "LAYER=PATH")]
        masks: Vec<String>,
        /// Precomputed subject cutout applied to the original layer.
        #[arg(long)]
        subject: Option<PathBuf>,
        #[arg(long)]
        strokes: Option<u64>,
        /// TrueType/OpenType font; defaults to the built-in bitmap face.
        #[arg(long)]
        font: Option<PathBuf>,
        #[arg(long)]
        gif: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the density ramp for a palette.
    Ramp {
        #[arg(long)]
        palette: Option<String>,
        #[arg(long, default_value_t = 14.0)]
        size: f32,
        #[arg(long)]
        font: Option<PathBuf>,
        #[arg(long)]
        write_table: Option<PathBuf>,
    },
    /// Validate a config file.
    Check { config: PathBuf },
}

/// `--mask layer=path`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MaskArg {
    layer: MaskLayerKind,
    path: PathBuf,
}

impl MaskArg {
    fn parse(raw: &str) -> Result<Self> {
        let (layer, path) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --mask '{raw}', expected layer=path"))?;
        let layer = MaskLayerKind::parse(layer).ok_or_else(|| {
            anyhow!(
                "unknown mask layer '{}' (expected density, detail, color or original)",
                layer.trim()
            )
        })?;
        if path.trim().is_empty() {
            bail!("invalid --mask '{raw}', path is empty");
        }
        Ok(Self {
            layer,
            path: PathBuf::from(path.trim()),
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Render {
            input,
            output,
            config,
            masks,
            subject,
            strokes,
            font,
            gif,
            json,
        } => {
            let masks = masks
                .iter()
                .map(|raw| MaskArg::parse(raw))
                .collect::<Result<Vec<_>>>()?;
            run_render(RenderArgs {
                input,
                output,
                config,
                masks,
                subject,
                strokes,
                font,
                gif,
                json,
            })
        }
        Commands::Ramp {
            palette,
            size,
            font,
            write_table,
        } => run_ramp(palette, size, font.as_deref(), write_table.as_deref()),
        Commands::Check { config } => run_check(&config),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

struct RenderArgs {
    input: PathBuf,
    output: PathBuf,
    config: Option<PathBuf>,
    masks: Vec<MaskArg>,
    subject: Option<PathBuf>,
    strokes: Option<u64>,
    font: Option<PathBuf>,
    gif: Option<PathBuf>,
    json: bool,
}

fn load_face(font: Option<&Path>) -> Result<GlyphFace> {
    match font {
        Some(path) => GlyphFace::from_path(path),
        None => Ok(GlyphFace::Bitmap),
    }
}

fn read_image(path: &Path) -> Result<PixelBuffer> {
    let decoded =
        image::open(path).with_context(|| format!("failed to read image {}", path.display()))?;
    PixelBuffer::from_image(&decoded.to_rgba8())
        .with_context(|| format!("image {} has no pixels", path.display()))
}

fn run_render(args: RenderArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => StudioConfig::default(),
    };
    if let Some(strokes) = args.strokes {
        config.render.total_strokes = strokes;
    }
    config.validate()?;

    let mut studio = Studio::new(&config);
    studio.set_face(load_face(args.font.as_deref())?);
    studio.load_image(read_image(&args.input)?);

    for mask in &args.masks {
        let pixels = read_image(&mask.path)?;
        studio
            .import_mask(mask.layer, &pixels)
            .with_context(|| format!("failed to apply {} mask {}", mask.layer, mask.path.display()))?;
    }
    if let Some(path) = &args.subject {
        let mut isolator = PrecomputedMaskIsolator::new(path);
        studio
            .isolate_subject(&mut isolator, MaskLayerKind::Original)
            .context("failed to isolate subject")?;
    }

    studio.start_render()?;
    let mut reported = 0_u32;
    let outcome = loop {
        if let Some(outcome) = studio.pump_render()? {
            break outcome;
        }
        let percent = (studio.progress() * 100.0) as u32;
        if percent >= reported + 10 {
            reported = percent - percent % 10;
            eprintln!("rendered {percent}%");
        }
        thread::sleep(PROGRESS_POLL);
    };

    let frame = studio
        .rendered_frame()
        .ok_or_else(|| anyhow!("render finished without a frame"))?;
    frame
        .to_image()
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    let timelapse = match &args.gif {
        Some(path) => Some(write_timelapse(&studio, path)?),
        None => None,
    };

    if args.json {
        let summary = json!({
            "output": args.output.display().to_string(),
            "width": frame.width(),
            "height": frame.height(),
            "render": outcome,
            "timelapse": timelapse,
            "estimated_gif_mb": studio.estimated_export_size_mb(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Wrote {} ({}x{}, {} strokes, {} glyphs)",
            args.output.display(),
            frame.width(),
            frame.height(),
            outcome.strokes_done,
            outcome.glyphs_stamped
        );
        if let (Some(path), Some(summary)) = (&args.gif, &timelapse) {
            println!(
                "Wrote {} ({} frames, {}x{}, {} ms)",
                path.display(),
                summary.frames,
                summary.width,
                summary.height,
                summary.duration_ms
            );
        }
    }
    Ok(())
}

fn write_timelapse(studio: &Studio, path: &Path) -> Result<ExportSummary> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let summary = studio
        .export_timelapse(&mut GifFrameEncoder, &mut writer)
        .with_context(|| format!("failed to export timelapse {}", path.display()))?;
    Ok(summary)
}

fn run_ramp(
    palette: Option<String>,
    size: f32,
    font: Option<&Path>,
    write_table: Option<&Path>,
) -> Result<()> {
    if !size.is_finite() || size < 1.0 {
        bail!("--size must be >= 1, got {size}");
    }
    let face = load_face(font)?;
    let palette = palette.unwrap_or_default();
    let ramp = DensityRamp::build(&face, &palette, size);
    let table = ramp.density_table();

    if let Some(path) = write_table {
        fs::write(path, table.as_bytes())
            .with_context(|| format!("failed writing table file {}", path.display()))?;
    }

    println!("glyphs={}", ramp.len());
    println!("ramp={}", ramp.characters());
    println!();
    print!("{table}");
    Ok(())
}

fn run_check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    println!(
        "OK: {} ({} strokes, font {}, scale {}, {:?})",
        config_path.display(),
        config.render.total_strokes,
        config.render.font_size,
        config.render.output_scale,
        config.render.color_mode
    );
    Ok(())
}
