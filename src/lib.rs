pub mod capture;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod glyph_face_data;
pub mod glyphs;
pub mod history;
pub mod mask;
pub mod pixel_buffer;
pub mod render_params;
pub mod render_worker;
pub mod rng;
pub mod stroke_engine;
pub mod studio;

pub use error::StudioError;
pub use studio::Studio;
