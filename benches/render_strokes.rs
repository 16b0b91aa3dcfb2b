//! Stroke engine and brush benchmarks.
//! Run: cargo bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use typewriter_studio::glyphs::GlyphFace;
use typewriter_studio::mask::{BrushStroke, MaskLayerKind, MaskLayers, Point};
use typewriter_studio::pixel_buffer::PixelBuffer;
use typewriter_studio::render_params::RenderParams;
use typewriter_studio::stroke_engine::{CancelToken, RenderRequest, RenderSession};

fn gradient(width: u32, height: u32) -> PixelBuffer {
    let image = image::RgbaImage::from_fn(width, height, |x, y| {
        let value = ((x + y) * 255 / (width + height)) as u8;
        image::Rgba([value, value / 2, 255 - value, 255])
    });
    PixelBuffer::from_image(&image).expect("gradient")
}

fn bench_render_session(c: &mut Criterion) {
    let source = Arc::new(gradient(320, 240));
    let mut masks = MaskLayers::new(320, 240);
    masks
        .paint(
            MaskLayerKind::Detail,
            &BrushStroke::dab(Point::new(160.0, 120.0), 60.0, 0.5, 1.0),
        )
        .expect("paint");

    let mut group = c.benchmark_group("render_strokes");
    group.sample_size(20);

    group.bench_function("session_50k_strokes_320x240", |b| {
        b.iter(|| {
            let session = RenderSession::prepare(
                RenderRequest {
                    source: Arc::clone(&source),
                    masks: masks.clone(),
                    params: RenderParams {
                        total_strokes: 50_000,
                        output_scale: 1.0,
                        ..RenderParams::default()
                    },
                    face: GlyphFace::Bitmap,
                },
                CancelToken::new(),
            )
            .expect("prepare");
            black_box(session.last())
        });
    });

    group.finish();
}

fn bench_brush_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("brush");
    group.bench_function("segment_radius_40_1080p", |b| {
        let mut masks = MaskLayers::new(1920, 1080);
        let stroke = BrushStroke {
            from: Point::new(400.0, 500.0),
            to: Point::new(460.0, 540.0),
            radius: 40.0,
            hardness: 0.5,
            opacity: 1.0,
            erase: false,
        };
        b.iter(|| black_box(masks.paint(MaskLayerKind::Density, &stroke).expect("paint")));
    });
    group.finish();
}

criterion_group!(benches, bench_render_session, bench_brush_segment);
criterion_main!(benches);
