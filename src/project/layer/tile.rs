use std::sync::Arc;

use crate::envelope::{Envelope, PixelSize};
use crate::errors::Result;
use crate::project::layer::{MapLayer, Renderable, RenderableHandle};
use crate::project::layer_index::LayerIndexEntry;
use crate::render::image::RgbaImage;
use crate::render::rasterize::{Canvas, WorldTransform};
use crate::storage::TileStorage;

/// Raster layer backed by one tile coverage. The coverage is named after the layer id.
#[derive(Debug, Clone)]
pub struct TileLayer {
    entry: LayerIndexEntry,
    tiles: TileStorage,
}

impl TileLayer {
    pub fn new(entry: LayerIndexEntry, tiles: TileStorage) -> Self {
        Self { entry, tiles }
    }

    pub fn coverage(&self) -> &str {
        self.entry.id.as_str()
    }
}

impl MapLayer for TileLayer {
    fn index_entry(&self) -> &LayerIndexEntry {
        &self.entry
    }

    fn index_entry_mut(&mut self) -> &mut LayerIndexEntry {
        &mut self.entry
    }

    fn bounds(&self) -> Result<Option<Envelope>> {
        self.tiles.coverage_bounds(self.coverage())
    }

    fn renderable(&self) -> RenderableHandle {
        Arc::new(TileRenderable {
            tiles: self.tiles.clone(),
            coverage: self.coverage().to_string(),
        })
    }
}

/// Draws the stored tiles of one coverage, scaled into the requested envelope.
#[derive(Debug, Clone)]
pub struct TileRenderable {
    tiles: TileStorage,
    coverage: String,
}

impl Renderable for TileRenderable {
    fn render(&self, envelope: &Envelope, size: PixelSize) -> Result<RgbaImage> {
        let tr = WorldTransform::new(envelope, size);
        if tr.scale_x <= 0.0 || tr.scale_y <= 0.0 {
            return Ok(RgbaImage::new(size.width, size.height));
        }

        let mut canvas = Canvas::new(size)?;
        for tile in self.tiles.tiles_intersecting(&self.coverage, envelope)? {
            tile.envelope.ensure_same_crs(&envelope.crs)?;
            let (x, y) = tr.to_pixel(geo::Coord { x: tile.envelope.min_x, y: tile.envelope.max_y });
            let w = tile.envelope.width() / tr.scale_x;
            let h = tile.envelope.height() / tr.scale_y;
            canvas.draw_image(&tile.image, x, y, w, h);
        }
        Ok(canvas.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::envelope::Crs;
    use crate::project::layer_index::LayerKind;
    use crate::project::style::Color;
    use crate::storage::ProjectDatabase;

    fn env(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope::new(min_x, min_y, max_x, max_y, Crs::generic_2d()).unwrap()
    }

    #[test]
    fn tiles_are_drawn_where_they_belong() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let tiles = TileStorage::new(db);
        let layer = TileLayer::new(LayerIndexEntry::new(LayerKind::Tile, "ortho", true, 0), tiles.clone());
        tiles.create_coverage(layer.coverage(), &Crs::generic_2d()).unwrap();
        assert_eq!(layer.bounds().unwrap(), None);

        // red tile on the right half of the world
        let red = RgbaImage::filled(2, 2, Color::rgb(255, 0, 0));
        tiles.add_tile(layer.coverage(), &red, &env(10.0, 0.0, 20.0, 10.0)).unwrap();
        assert_eq!(layer.bounds().unwrap(), Some(env(10.0, 0.0, 20.0, 10.0)));

        let img = layer
            .renderable()
            .render(&env(0.0, 0.0, 20.0, 10.0), PixelSize::new(20, 10))
            .unwrap();
        assert_eq!(img.pixel(15, 5), Some([255, 0, 0, 255]));
        assert_eq!(img.pixel(11, 1), Some([255, 0, 0, 255]));
        assert_eq!(img.pixel(4, 5), Some([0, 0, 0, 0]));
    }
}
