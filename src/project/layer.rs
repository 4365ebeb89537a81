//! Project layers.
//!
//! A layer is one of a closed set of kinds, see [`Layer`]. Every kind exposes the same
//! capabilities through [`MapLayer`]: its index entry, its bounds (computed from the
//! backing data on each call) and a [`RenderableHandle`] the rendering engine can use
//! without holding the project lock.

use std::sync::Arc;

use crate::envelope::{Envelope, PixelSize};
use crate::errors::Result;
use crate::project::layer_index::{LayerId, LayerIndexEntry, LayerKind};
use crate::render::image::RgbaImage;

pub mod feature;
pub mod feature_table;
pub mod shapefile;
pub mod tile;

pub use feature::FeatureLayer;
pub use feature_table::{Feature, FeatureId, FeatureTable};
pub use shapefile::{ShapeSource, ShapefileLayer};
pub use tile::{TileLayer, TileRenderable};

/// Draws the data of a layer for a world envelope.
pub trait Renderable: Send + Sync {
    /// Renders `envelope` into a transparent image of `size` pixels. Row 0 is the top
    /// (`max_y`) edge of the envelope.
    fn render(&self, envelope: &Envelope, size: PixelSize) -> Result<RgbaImage>;
}

pub type RenderableHandle = Arc<dyn Renderable>;

/// Capabilities shared by all layer kinds.
pub trait MapLayer {
    fn index_entry(&self) -> &LayerIndexEntry;

    fn index_entry_mut(&mut self) -> &mut LayerIndexEntry;

    /// Union of the data bounds, `None` when the layer holds no data.
    fn bounds(&self) -> Result<Option<Envelope>>;

    fn renderable(&self) -> RenderableHandle;
}

#[derive(Debug, Clone)]
pub enum Layer {
    Feature(FeatureLayer),
    Tile(TileLayer),
    Shapefile(ShapefileLayer),
}

impl Layer {
    fn inner(&self) -> &dyn MapLayer {
        match self {
            Layer::Feature(l) => l,
            Layer::Tile(l) => l,
            Layer::Shapefile(l) => l,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn MapLayer {
        match self {
            Layer::Feature(l) => l,
            Layer::Tile(l) => l,
            Layer::Shapefile(l) => l,
        }
    }

    pub fn id(&self) -> &LayerId {
        &self.index_entry().id
    }

    pub fn kind(&self) -> LayerKind {
        self.index_entry().kind
    }

    pub fn name(&self) -> &str {
        &self.index_entry().name
    }

    pub fn is_visible(&self) -> bool {
        self.index_entry().visible
    }

    pub fn zindex(&self) -> usize {
        self.index_entry().zindex
    }

    pub fn opacity(&self) -> f32 {
        self.index_entry().opacity()
    }

    /// Feature storage of feature and shapefile layers.
    pub fn feature_table(&self) -> Option<&FeatureTable> {
        match self {
            Layer::Feature(l) => Some(l.table()),
            Layer::Shapefile(l) => Some(l.table()),
            Layer::Tile(_) => None,
        }
    }
}

impl MapLayer for Layer {
    fn index_entry(&self) -> &LayerIndexEntry {
        self.inner().index_entry()
    }

    fn index_entry_mut(&mut self) -> &mut LayerIndexEntry {
        self.inner_mut().index_entry_mut()
    }

    fn bounds(&self) -> Result<Option<Envelope>> {
        self.inner().bounds()
    }

    fn renderable(&self) -> RenderableHandle {
        self.inner().renderable()
    }
}
