use std::sync::Arc;

use crate::envelope::Envelope;
use crate::errors::Result;
use crate::project::layer::{FeatureTable, MapLayer, RenderableHandle};
use crate::project::layer_index::LayerIndexEntry;

/// Editable vector layer.
#[derive(Debug, Clone)]
pub struct FeatureLayer {
    entry: LayerIndexEntry,
    table: FeatureTable,
}

impl FeatureLayer {
    pub fn new(entry: LayerIndexEntry, table: FeatureTable) -> Self {
        Self { entry, table }
    }

    pub fn table(&self) -> &FeatureTable {
        &self.table
    }
}

impl MapLayer for FeatureLayer {
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
