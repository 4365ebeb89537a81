//! Layers imported from a shape source.
//!
//! Parsing shapefiles is left to the host: it hands the project a [`ShapeSource`] and the
//! shapes are copied once into the feature table. The layer is read-only afterwards.

use std::sync::Arc;

use geo::Geometry;

use crate::envelope::{Crs, Envelope};
use crate::errors::Result;
use crate::project::layer::{FeatureTable, MapLayer, RenderableHandle};
use crate::project::layer_index::LayerIndexEntry;

/// Host-supplied reader of static vector data.
pub trait ShapeSource {
    /// Coordinate reference system of the shapes.
    fn crs(&self) -> Crs;

    /// All shapes of the source.
    fn shapes(&self) -> anyhow::Result<Vec<Geometry<f64>>>;
}

#[derive(Debug, Clone)]
pub struct ShapefileLayer {
    entry: LayerIndexEntry,
    table: FeatureTable,
}

impl ShapefileLayer {
    pub fn new(entry: LayerIndexEntry, table: FeatureTable) -> Self {
        Self { entry, table }
    }

    pub fn table(&self) -> &FeatureTable {
        &self.table
    }
}

impl MapLayer for ShapefileLayer {
    fn index_entry(&self) -> &LayerIndexEntry {
        &self.entry
    }

    fn index_entry_mut(&mut self) -> &mut LayerIndexEntry {
        &mut self.entry
    }

    fn bounds(&self) -> Result<Option<Envelope>> {
        self.table.bounds()
    }

    fn renderable(&self) -> RenderableHandle {
        Arc::new(self.table.clone())
    }
}
