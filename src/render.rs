//! Rendering: raster images, the rendered-partial cache, the viewport controller and the
//! cached rendering engine that ties them together.

pub mod engine;
pub mod image;
pub mod partial;
pub mod partial_store;
pub mod rasterize;
pub mod surface;
pub mod viewport;

pub use engine::{CachedRenderingEngine, PrepareOutcome, RedrawRequest, RenderState, RequestToken};
pub use image::RgbaImage;
pub use partial::{PartialId, PartialOutline, RenderedPartial};
pub use partial_store::RenderedPartialStore;
pub use surface::{NullSurface, Surface};
pub use viewport::MapViewport;
