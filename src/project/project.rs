use std::path::Path;
use std::sync::{Arc, RwLock};

use geo::Geometry;
use r2d2_sqlite::rusqlite::{params, Connection, OptionalExtension};

use crate::config::ProjectConfig;
use crate::envelope::{Crs, Envelope};
use crate::errors::{ProjectError, Result};
use crate::events::{EventBus, ProjectEvent, StructureChange, Subscription};
use crate::project::layer::{
    Feature, FeatureId, FeatureLayer, FeatureTable, Layer, MapLayer, ShapeSource, ShapefileLayer,
    TileLayer,
};
use crate::project::layer_index::{self, LayerId, LayerIndexEntry, LayerKind};
use crate::project::layout::{self, LayoutId, LayoutSheet};
use crate::project::style::{Color, Style, StyleLibrary};
use crate::render::image::RgbaImage;
use crate::render::partial::PartialId;
use crate::render::RenderedPartialStore;
use crate::storage::{ProjectDatabase, TileId, TileStorage};

const META_CRS: &str = "crs";
const META_ACTIVE_LAYER: &str = "active_layer";

/// Shared handle to a project. The rendering engine and the host UI hold clones.
pub type ProjectHandle = Arc<RwLock<Project>>;

/// A map project: layers, active layer, layout sheets, styles and caches, all backed by
/// one SQLite database.
///
/// Layers are kept sorted by zindex, so the index of a layer in [`Project::layers`] is
/// its paint order. Every structural mutation renumbers zindex values `0..n-1` and
/// rewrites `layer_index` in a single transaction. A project always has at least one
/// layer and exactly one active layer.
pub struct Project {
    config: ProjectConfig,
    db: ProjectDatabase,
    crs: Crs,
    layers: Vec<Layer>,
    active: Option<LayerId>,
    layouts: Vec<LayoutSheet>,
    styles: Arc<StyleLibrary>,
    tiles: TileStorage,
    partials: Arc<RenderedPartialStore>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("db", &self.db)
            .field("crs", &self.crs)
            .field("layers", &self.layers.len())
            .field("active", &self.active)
            .field("layouts", &self.layouts.len())
            .finish()
    }
}

impl Project {
    /// Creates a new project database at `path`. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, config: ProjectConfig) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ProjectError::Storage(format!("{} already exists", path.display())));
        }
        let db = ProjectDatabase::open(path, &config)?;
        Self::load(db, config)
    }

    /// Opens an existing project database, rebuilding layers, layouts and the partial cache.
    pub fn open(path: impl AsRef<Path>, config: ProjectConfig) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ProjectError::Storage(format!("{} does not exist", path.display())));
        }
        let db = ProjectDatabase::open(path, &config)?;
        Self::load(db, config)
    }

    /// Creates a project living in memory only.
    pub fn create_in_memory(config: ProjectConfig) -> Result<Self> {
        let db = ProjectDatabase::open_in_memory(&config)?;
        Self::load(db, config)
    }

    /// Wraps the project in a shareable handle.
    pub fn into_handle(self) -> ProjectHandle {
        Arc::new(RwLock::new(self))
    }

    fn load(db: ProjectDatabase, config: ProjectConfig) -> Result<Self> {
        let crs = match read_metadata(&db, META_CRS)? {
            Some(code) => Crs::new(code),
            None => {
                write_metadata(&db, META_CRS, config.crs.code())?;
                config.crs.clone()
            }
        };

        let events = Arc::new(EventBus::new(config.event_capacity));
        let styles = Arc::new(StyleLibrary::new());
        let tiles = TileStorage::new(db.clone());
        let partials = Arc::new(RenderedPartialStore::open(db.clone(), events.clone())?);

        let entries = db.with_connection(layer_index::load_all)?;
        let layouts = db.with_connection(layout::load_all)?;
        let active = read_metadata(&db, META_ACTIVE_LAYER)?.map(LayerId::from);

        let mut project = Self {
            config,
            db,
            crs,
            layers: vec![],
            active: None,
            layouts,
            styles,
            tiles,
            partials,
            events,
        };

        let layers = entries.into_iter().map(|e| project.build_layer(e)).collect::<Vec<_>>();
        // normalises zindex values of files written by older versions
        project.commit_layers(layers, None)?;

        if project.layers.is_empty() {
            project.add_default_layer()?;
        }

        let active = active.filter(|id| project.position(id).is_some());
        match active {
            Some(id) => project.active = Some(id),
            None => project.select_top_layer()?,
        }

        log::info!(
            "project loaded: {} layers, {} partials, {:?}",
            project.layers.len(),
            project.partials.loaded_count(),
            project.db.path()
        );
        Ok(project)
    }

    fn build_layer(&self, entry: LayerIndexEntry) -> Layer {
        match entry.kind {
            LayerKind::Feature => {
                let table = self.feature_table(&entry.id);
                Layer::Feature(FeatureLayer::new(entry, table))
            }
            LayerKind::Shapefile => {
                let table = self.feature_table(&entry.id);
                Layer::Shapefile(ShapefileLayer::new(entry, table))
            }
            LayerKind::Tile => Layer::Tile(TileLayer::new(entry, self.tiles.clone())),
        }
    }

    fn feature_table(&self, id: &LayerId) -> FeatureTable {
        FeatureTable::new(self.db.clone(), id.clone(), self.crs.clone(), self.styles.clone())
    }

    // ---------- Layers ----------

    /// Layers in paint order, bottom first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Same as [`layers`](Self::layers); the collection is always kept in zindex order.
    pub fn layers_by_zindex(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Layer at paint-order `index`.
    pub fn layer_at(&self, index: usize) -> Result<&Layer> {
        self.layers.get(index).ok_or(ProjectError::InvalidIndex {
            index,
            len: self.layers.len(),
        })
    }

    pub fn layer_by_id(&self, id: &LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id() == id)
    }

    fn position(&self, id: &LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id() == id)
    }

    fn require(&self, id: &LayerId) -> Result<usize> {
        self.position(id)
            .ok_or_else(|| ProjectError::InvalidLayerReference(format!("{id} is not a layer of this project")))
    }

    pub fn add_feature_layer(&mut self, name: &str, visible: bool, zindex: usize) -> Result<&Layer> {
        let id = self.add_layer(LayerKind::Feature, name, visible, zindex)?;
        self.layer_ref(&id)
    }

    /// Adds a tile layer and creates its tile coverage.
    pub fn add_tile_layer(&mut self, name: &str, visible: bool, zindex: usize) -> Result<&Layer> {
        let id = self.add_layer(LayerKind::Tile, name, visible, zindex)?;
        self.layer_ref(&id)
    }

    /// Adds a layer holding the shapes of `source`. The shapes must be expressed in the
    /// project CRS. Nothing is added if reading or storing the shapes fails.
    pub fn add_shapefile_layer(
        &mut self,
        name: &str,
        visible: bool,
        zindex: usize,
        source: &dyn ShapeSource,
    ) -> Result<&Layer> {
        if source.crs() != self.crs {
            return Err(ProjectError::InvalidEnvelope(format!(
                "shape source is in {}, project is in {}",
                source.crs(),
                self.crs
            )));
        }
        let shapes = source
            .shapes()
            .map_err(|e| ProjectError::Storage(format!("reading shape source: {e:#}")))?;

        let id = self.add_layer(LayerKind::Shapefile, name, visible, zindex)?;
        let style = Style::new(Color::BLACK, Color::TRANSPARENT, 1);
        let imported = match self.layer_ref(&id)?.feature_table() {
            Some(table) => table.insert_all(shapes.into_iter().map(|s| (s, style)).collect()),
            None => Err(ProjectError::InvalidLayerReference(id.to_string())),
        };

        match imported {
            Ok(ids) => {
                log::info!("imported {} shapes into layer {}", ids.len(), id);
                self.layer_ref(&id)
            }
            Err(e) => {
                if let Err(cleanup) = self.remove_layer(&id) {
                    log::error!("could not roll back layer {}: {}", id, cleanup);
                }
                Err(e)
            }
        }
    }

    fn layer_ref(&self, id: &LayerId) -> Result<&Layer> {
        self.layer_by_id(id)
            .ok_or_else(|| ProjectError::InvalidLayerReference(id.to_string()))
    }

    /// Creates the layer, inserts it at `zindex` (clamped to the top) and persists the new
    /// order.
    fn add_layer(&mut self, kind: LayerKind, name: &str, visible: bool, zindex: usize) -> Result<LayerId> {
        let entry = LayerIndexEntry::new(kind, name, visible, zindex);
        let id = entry.id.clone();
        let layer = self.build_layer(entry);

        if let Layer::Tile(tile) = &layer {
            self.tiles.create_coverage(tile.coverage(), &self.crs)?;
        }

        let mut layers = self.layers.clone();
        layers.insert(zindex.min(layers.len()), layer);
        if let Err(e) = self.commit_layers(layers, None) {
            if kind == LayerKind::Tile {
                if let Err(cleanup) = self.tiles.delete_coverage(id.as_str()) {
                    log::error!("could not roll back tile coverage {}: {}", id, cleanup);
                }
            }
            return Err(e);
        }

        log::debug!("added {} layer {} ({})", kind, id, name);
        self.events.publish(ProjectEvent::Structure(StructureChange::LayerAdded(id.clone())));

        if self.active.is_none() {
            self.set_active_layer(&id)?;
        }
        Ok(id)
    }

    fn add_default_layer(&mut self) -> Result<LayerId> {
        let name = self.config.default_layer_name.clone();
        self.add_layer(LayerKind::Feature, &name, true, 0)
    }

    /// Renumbers `layers` 0..n-1 in their current order, rewrites `layer_index` in one
    /// transaction and only then installs the new collection.
    ///
    /// A `removed` layer leaves in the same transaction as its index row, its backing data
    /// and its cached partials.
    fn commit_layers(&mut self, mut layers: Vec<Layer>, removed: Option<&Layer>) -> Result<()> {
        for (i, layer) in layers.iter_mut().enumerate() {
            layer.index_entry_mut().zindex = i;
        }

        let dropped_partials = self.db.with_transaction(|tx| {
            let mut dropped = 0;
            if let Some(gone) = removed {
                layer_index::delete(tx, gone.id())?;
                match gone {
                    Layer::Tile(tile) => {
                        TileStorage::delete_coverage_in(tx, tile.coverage())?;
                    }
                    other => {
                        if let Some(table) = other.feature_table() {
                            table.delete_all_in(tx)?;
                        }
                    }
                }
                dropped = RenderedPartialStore::delete_layer_rows(tx, gone.id())?;
            }
            for layer in &layers {
                layer_index::upsert(tx, layer.index_entry())?;
            }
            Ok(dropped)
        })?;

        self.layers = layers;
        if let Some(gone) = removed {
            self.partials.evict_layer(gone.id(), dropped_partials)?;
        }
        Ok(())
    }

    /// Removes a layer with its data and cached partials.
    ///
    /// Removing the last layer creates a default feature layer. Removing the active layer
    /// activates the top layer.
    pub fn remove_layer(&mut self, id: &LayerId) -> Result<()> {
        let pos = self.require(id)?;

        let mut layers = self.layers.clone();
        let removed = layers.remove(pos);
        self.commit_layers(layers, Some(&removed))?;

        self.detach_from_layouts(id);
        log::debug!("removed layer {}", id);
        self.events.publish(ProjectEvent::Structure(StructureChange::LayerRemoved(id.clone())));

        if self.layers.is_empty() {
            self.active = None;
            self.add_default_layer()?;
        }
        if self.active.as_ref() == Some(id) {
            self.select_top_layer()?;
        }
        Ok(())
    }

    /// Removes the layer at paint-order `index`.
    pub fn remove_layer_at(&mut self, index: usize) -> Result<()> {
        let id = self.layer_at(index)?.id().clone();
        self.remove_layer(&id)
    }

    fn detach_from_layouts(&mut self, id: &LayerId) {
        for sheet in self.layouts.iter_mut().filter(|s| s.layers.contains(id)) {
            sheet.layers.retain(|l| l != id);
            if let Err(e) = self.db.with_connection(|c| layout::save(c, sheet)) {
                log::error!("could not update layout {}: {}", sheet.id, e);
            }
        }
    }

    /// Moves a layer to paint-order `index` (`0` is the bottom). `index == len` moves it to
    /// the top. The active layer is unchanged.
    pub fn move_layer_to_index(&mut self, id: &LayerId, index: usize) -> Result<()> {
        let len = self.layers.len();
        if index > len {
            return Err(ProjectError::InvalidIndex { index, len });
        }
        let pos = self.require(id)?;

        let mut layers = self.layers.clone();
        let layer = layers.remove(pos);
        layers.insert(index.min(layers.len()), layer);
        self.commit_layers(layers, None)?;

        self.events.publish(ProjectEvent::Structure(StructureChange::LayersReordered));
        Ok(())
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.active.as_ref().and_then(|id| self.layer_by_id(id))
    }

    pub fn set_active_layer(&mut self, id: &LayerId) -> Result<()> {
        self.require(id)?;
        write_metadata(&self.db, META_ACTIVE_LAYER, id.as_str())?;
        self.active = Some(id.clone());
        self.events.publish(ProjectEvent::Structure(StructureChange::ActiveLayerChanged(id.clone())));
        Ok(())
    }

    pub fn set_active_layer_at(&mut self, index: usize) -> Result<()> {
        let id = self.layer_at(index)?.id().clone();
        self.set_active_layer(&id)
    }

    fn select_top_layer(&mut self) -> Result<()> {
        match self.layers.last().map(|l| l.id().clone()) {
            Some(id) => self.set_active_layer(&id),
            None => {
                self.active = None;
                Ok(())
            }
        }
    }

    /// Applies `f` to a copy of the layer entry, persists it, then keeps it.
    fn update_entry(&mut self, id: &LayerId, f: impl FnOnce(&mut LayerIndexEntry) -> Result<()>) -> Result<()> {
        let pos = self.require(id)?;
        let mut entry = self.layers[pos].index_entry().clone();
        f(&mut entry)?;
        self.db.with_connection(|c| layer_index::upsert(c, &entry))?;
        *self.layers[pos].index_entry_mut() = entry;

        self.events.publish(ProjectEvent::Structure(StructureChange::LayerUpdated(id.clone())));
        Ok(())
    }

    /// Fails with `InvalidOpacity` outside `0.0..=1.0`.
    pub fn set_layer_opacity(&mut self, id: &LayerId, opacity: f32) -> Result<()> {
        self.update_entry(id, |e| e.set_opacity(opacity))
    }

    pub fn set_layer_visible(&mut self, id: &LayerId, visible: bool) -> Result<()> {
        self.update_entry(id, |e| {
            e.visible = visible;
            Ok(())
        })
    }

    pub fn set_layer_name(&mut self, id: &LayerId, name: &str) -> Result<()> {
        self.update_entry(id, |e| {
            e.name = name.to_string();
            Ok(())
        })
    }

    /// Union of the bounds of all layers, `None` while no layer holds data.
    pub fn maximum_bounds(&self) -> Result<Option<Envelope>> {
        let mut bounds = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            if let Some(b) = layer.bounds()? {
                bounds.push(b);
            }
        }
        Ok(union_bounds(bounds))
    }

    // ---------- Layer data ----------

    fn editable_table(&self, id: &LayerId) -> Result<&FeatureTable> {
        match &self.layers[self.require(id)?] {
            Layer::Feature(l) => Ok(l.table()),
            other => Err(ProjectError::InvalidLayerReference(format!(
                "{} is a {} layer, features can only be edited on feature layers",
                id,
                other.kind()
            ))),
        }
    }

    /// Adds a feature to a feature layer and invalidates the cached partials it touches.
    ///
    /// The feature row and the invalidation share one transaction: either both land or the
    /// layer is left as it was.
    pub fn add_feature(&mut self, id: &LayerId, geometry: Geometry<f64>, style: Style) -> Result<Feature> {
        let table = self.editable_table(id)?;
        let bounds = table.geometry_bounds(&geometry)?;
        let (feature, stale) = self.db.with_transaction(|tx| {
            let feature = table.insert_in(tx, geometry, style)?;
            Ok((feature, self.partials.delete_rows_in(tx, id, &bounds)?))
        })?;
        self.data_changed(id, &stale)?;
        Ok(feature)
    }

    /// Removes a feature. Returns `false` if the layer had no such feature.
    pub fn remove_feature(&mut self, id: &LayerId, feature: FeatureId) -> Result<bool> {
        let table = self.editable_table(id)?;
        let stale = self.db.with_transaction(|tx| match table.remove_in(tx, feature)? {
            Some(bounds) => Ok(Some(self.partials.delete_rows_in(tx, id, &bounds)?)),
            None => Ok(None),
        })?;
        match stale {
            Some(stale) => {
                self.data_changed(id, &stale)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stores a tile in a tile layer and invalidates the cached partials under it.
    pub fn import_tile(&mut self, id: &LayerId, image: &RgbaImage, envelope: &Envelope) -> Result<TileId> {
        let coverage = match &self.layers[self.require(id)?] {
            Layer::Tile(l) => l.coverage().to_string(),
            other => {
                return Err(ProjectError::InvalidLayerReference(format!(
                    "{} is a {} layer, tiles can only be imported into tile layers",
                    id,
                    other.kind()
                )))
            }
        };
        let (tile, stale) = self.db.with_transaction(|tx| {
            let tile = TileStorage::add_tile_in(tx, &coverage, image, envelope)?;
            Ok((tile, self.partials.delete_rows_in(tx, id, envelope)?))
        })?;
        self.data_changed(id, &stale)?;
        Ok(tile)
    }

    /// Evicts the partials whose rows went with a committed data edit.
    fn data_changed(&self, id: &LayerId, stale: &[PartialId]) -> Result<()> {
        self.partials.evict(id, stale)?;
        self.events.publish(ProjectEvent::Structure(StructureChange::LayerDataChanged(id.clone())));
        Ok(())
    }

    // ---------- Styles & layouts ----------

    pub fn style_for(&self, foreground: Color, background: Color, thickness: u32) -> Arc<Style> {
        self.styles.style_for(foreground, background, thickness)
    }

    pub fn style_library(&self) -> &Arc<StyleLibrary> {
        &self.styles
    }

    pub fn layout_sheets(&self) -> &[LayoutSheet] {
        &self.layouts
    }

    /// Adds a layout sheet. Every referenced layer must belong to the project.
    pub fn add_layout_sheet(&mut self, sheet: LayoutSheet) -> Result<LayoutId> {
        for id in &sheet.layers {
            self.require(id)?;
        }
        self.db.with_connection(|c| layout::save(c, &sheet))?;

        let id = sheet.id;
        self.layouts.push(sheet);
        self.events.publish(ProjectEvent::Structure(StructureChange::LayoutAdded(id)));
        Ok(id)
    }

    pub fn remove_layout_sheet(&mut self, id: LayoutId) -> Result<()> {
        let pos = self
            .layouts
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| ProjectError::InvalidLayerReference(format!("unknown layout sheet {id}")))?;
        self.db.with_connection(|c| layout::delete(c, id))?;
        self.layouts.remove(pos);
        self.events.publish(ProjectEvent::Structure(StructureChange::LayoutRemoved(id)));
        Ok(())
    }

    // ---------- Metadata ----------

    pub fn metadata(&self, key: &str) -> Result<Option<String>> {
        read_metadata(&self.db, key)
    }

    /// Stores a free-form metadata value (title, comment, background colour...).
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        write_metadata(&self.db, key, value)
    }

    // ---------- Accessors & lifecycle ----------

    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.db.path()
    }

    pub fn tile_storage(&self) -> &TileStorage {
        &self.tiles
    }

    pub fn partial_store(&self) -> &Arc<RenderedPartialStore> {
        &self.partials
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Runs `f` with the project connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.db.with_connection(f)
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_closed()
    }

    /// Releases the database. Safe to call any number of times; also runs on drop.
    pub fn close(&self) {
        if self.db.close() {
            self.events.publish(ProjectEvent::Structure(StructureChange::ProjectClosed));
        }
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        self.close();
    }
}

/// Componentwise union of envelopes. The first envelope seeds the result and each
/// following one can only widen it. Envelopes in another CRS are still merged, with a
/// warning.
pub fn union_bounds(bounds: impl IntoIterator<Item = Envelope>) -> Option<Envelope> {
    let mut out: Option<Envelope> = None;
    for b in bounds {
        match out.as_mut() {
            None => out = Some(b),
            Some(acc) => {
                if acc.crs != b.crs {
                    log::warn!("merging bounds of different coordinate systems: {} / {}", acc.crs, b.crs);
                }
                acc.expand_to_include(&b);
            }
        }
    }
    out
}

fn read_metadata(db: &ProjectDatabase, key: &str) -> Result<Option<String>> {
    db.with_connection(|c| {
        Ok(c.query_row("SELECT value FROM project_metadata WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    })
}

fn write_metadata(db: &ProjectDatabase, key: &str, value: &str) -> Result<()> {
    db.with_connection(|c| {
        c.execute(
            "INSERT OR REPLACE INTO project_metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};

    use crate::render::partial::RenderedPartial;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn project() -> Project {
        init_logger();
        Project::create_in_memory(ProjectConfig::default()).unwrap()
    }

    fn env(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope::new(min_x, min_y, max_x, max_y, Crs::generic_2d()).unwrap()
    }

    fn zindexes(p: &Project) -> Vec<usize> {
        p.layers().iter().map(|l| l.zindex()).collect()
    }

    fn square(x: f64, y: f64, side: f64) -> Geometry<f64> {
        Geometry::Polygon(polygon![
            (x: x, y: y),
            (x: x + side, y: y),
            (x: x + side, y: y + side),
            (x: x, y: y + side)
        ])
    }

    struct StaticShapes(Crs, Vec<Geometry<f64>>);

    impl ShapeSource for StaticShapes {
        fn crs(&self) -> Crs {
            self.0.clone()
        }

        fn shapes(&self) -> anyhow::Result<Vec<Geometry<f64>>> {
            Ok(self.1.clone())
        }
    }

    struct BrokenShapes;

    impl ShapeSource for BrokenShapes {
        fn crs(&self) -> Crs {
            Crs::generic_2d()
        }

        fn shapes(&self) -> anyhow::Result<Vec<Geometry<f64>>> {
            anyhow::bail!("truncated file")
        }
    }

    #[test]
    fn new_project_has_one_active_default_layer() {
        let p = project();
        assert_eq!(p.layer_count(), 1);
        let layer = p.layer_at(0).unwrap();
        assert_eq!(layer.kind(), LayerKind::Feature);
        assert_eq!(layer.name(), "First layer");
        assert_eq!(p.active_layer().map(|l| l.id()), Some(layer.id()));
        assert_eq!(p.maximum_bounds().unwrap(), None);
    }

    #[test]
    fn added_layers_get_unique_ids_and_contiguous_zindex() {
        let mut p = project();
        let a = p.add_feature_layer("a", true, 5).unwrap().id().clone();
        let b = p.add_tile_layer("b", true, 0).unwrap().id().clone();

        assert_ne!(a, b);
        assert!(b.as_str().starts_with("LAYER_TILE_"));
        assert_eq!(zindexes(&p), vec![0, 1, 2]);
        // zindex 0 went to the bottom, zindex 5 was clamped to the top
        assert_eq!(p.layer_at(0).unwrap().id(), &b);
        assert_eq!(p.layer_at(2).unwrap().id(), &a);
        assert!(p.layer_by_id(&LayerId::from("nope")).is_none());
    }

    #[test]
    fn move_keeps_zindex_contiguous_and_active_layer() {
        let mut p = project();
        let ids: Vec<LayerId> = (0..4)
            .map(|i| p.add_feature_layer(&format!("l{i}"), true, 99).unwrap().id().clone())
            .collect();
        p.set_active_layer(&ids[1]).unwrap();

        p.move_layer_to_index(&ids[1], 0).unwrap();
        assert_eq!(zindexes(&p), vec![0, 1, 2, 3, 4]);
        assert_eq!(p.layer_at(0).unwrap().id(), &ids[1]);
        assert_eq!(p.active_layer().unwrap().id(), &ids[1]);

        let len = p.layer_count();
        p.move_layer_to_index(&ids[1], len).unwrap();
        assert_eq!(p.layer_at(len - 1).unwrap().id(), &ids[1]);
        assert_eq!(zindexes(&p), vec![0, 1, 2, 3, 4]);
        assert_eq!(p.active_layer().unwrap().id(), &ids[1]);

        assert!(matches!(
            p.move_layer_to_index(&ids[0], len + 1),
            Err(ProjectError::InvalidIndex { index: 6, len: 5 })
        ));
        assert!(matches!(
            p.move_layer_to_index(&LayerId::from("ghost"), 0),
            Err(ProjectError::InvalidLayerReference(_))
        ));

        // persisted order matches memory
        let on_disk: Vec<LayerId> = p
            .with_connection(|c| Ok(layer_index::load_all(c)?.into_iter().map(|e| e.id).collect()))
            .unwrap();
        let in_memory: Vec<LayerId> = p.layers().iter().map(|l| l.id().clone()).collect();
        assert_eq!(on_disk, in_memory);
    }

    #[test]
    fn removing_the_last_layer_creates_a_default_one() {
        let mut p = project();
        let only = p.layer_at(0).unwrap().id().clone();
        p.remove_layer(&only).unwrap();

        assert_eq!(p.layer_count(), 1);
        let fresh = p.layer_at(0).unwrap();
        assert_ne!(fresh.id(), &only);
        assert_eq!(fresh.kind(), LayerKind::Feature);
        assert!(p.layer_by_id(fresh.id()).is_some());
        assert_eq!(p.active_layer().unwrap().id(), fresh.id());
    }

    #[test]
    fn removing_the_active_layer_activates_the_top_layer() {
        let mut p = project();
        let a = p.add_feature_layer("a", true, 1).unwrap().id().clone();
        let top = p.add_feature_layer("top", true, 2).unwrap().id().clone();
        p.set_active_layer(&a).unwrap();

        p.remove_layer(&a).unwrap();
        assert_eq!(p.active_layer().unwrap().id(), &top);
        assert_eq!(zindexes(&p), vec![0, 1]);

        assert!(matches!(p.remove_layer_at(7), Err(ProjectError::InvalidIndex { index: 7, len: 2 })));
        assert!(matches!(p.set_active_layer_at(2), Err(ProjectError::InvalidIndex { .. })));
        assert!(matches!(
            p.set_active_layer(&LayerId::from("ghost")),
            Err(ProjectError::InvalidLayerReference(_))
        ));
    }

    #[test]
    fn opacity_is_validated_and_persisted() {
        let mut p = project();
        let id = p.layer_at(0).unwrap().id().clone();

        assert!(matches!(p.set_layer_opacity(&id, -0.1), Err(ProjectError::InvalidOpacity(_))));
        assert!(matches!(p.set_layer_opacity(&id, 1.1), Err(ProjectError::InvalidOpacity(_))));
        p.set_layer_opacity(&id, 0.0).unwrap();
        p.set_layer_opacity(&id, 1.0).unwrap();
        p.set_layer_opacity(&id, 0.25).unwrap();
        p.set_layer_visible(&id, false).unwrap();
        p.set_layer_name(&id, "renamed").unwrap();

        let stored = p.with_connection(layer_index::load_all).unwrap();
        assert_eq!(stored[0].opacity(), 0.25);
        assert!(!stored[0].visible);
        assert_eq!(stored[0].name, "renamed");
        assert_eq!(p.layer_at(0).unwrap().opacity(), 0.25);
    }

    #[test]
    fn maximum_bounds_is_the_union_of_layer_bounds() {
        let mut p = project();
        let first = p.layer_at(0).unwrap().id().clone();
        p.add_feature(&first, square(0.0, 0.0, 10.0), Style::default()).unwrap();
        assert_eq!(p.maximum_bounds().unwrap(), Some(env(0.0, 0.0, 10.0, 10.0)));

        let second = p.add_feature_layer("second", true, 1).unwrap().id().clone();
        p.add_feature(&second, square(5.0, -20.0, 3.0), Style::default()).unwrap();
        let tiles = p.add_tile_layer("tiles", true, 2).unwrap().id().clone();
        p.import_tile(&tiles, &RgbaImage::new(4, 4), &env(40.0, 2.0, 50.0, 4.0)).unwrap();

        assert_eq!(p.maximum_bounds().unwrap(), Some(env(0.0, -20.0, 50.0, 10.0)));
    }

    #[test]
    fn union_of_mixed_crs_still_widens() {
        init_logger();
        let a = env(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(-1.0, 0.5, 0.5, 3.0, Crs::new("EPSG:4326")).unwrap();
        let u = union_bounds(vec![a, b]).unwrap();
        assert_eq!((u.min_x, u.min_y, u.max_x, u.max_y), (-1.0, 0.0, 1.0, 3.0));
        assert_eq!(union_bounds(Vec::new()), None);
    }

    #[test]
    fn editing_features_invalidates_touched_partials() {
        let mut p = project();
        let id = p.layer_at(0).unwrap().id().clone();
        let img = RgbaImage::new(4, 4);
        for x in 0..3 {
            let e = env(x as f64 * 10.0, 0.0, x as f64 * 10.0 + 10.0, 10.0);
            p.partial_store()
                .add_partial(RenderedPartial::new(id.clone(), img.clone(), e))
                .unwrap();
        }

        p.add_feature(&id, Geometry::Point(point!(x: 25.0, y: 5.0)), Style::default()).unwrap();
        assert_eq!(p.partial_store().loaded_count(), 2);

        let f = p.add_feature(&id, square(1.0, 1.0, 2.0), Style::default()).unwrap();
        assert_eq!(p.partial_store().loaded_count(), 1);

        assert!(p.remove_feature(&id, f.id).unwrap());
        assert!(!p.remove_feature(&id, f.id).unwrap());
    }

    #[test]
    fn features_only_go_to_feature_layers() {
        let mut p = project();
        let tiles = p.add_tile_layer("tiles", true, 1).unwrap().id().clone();
        assert!(matches!(
            p.add_feature(&tiles, square(0.0, 0.0, 1.0), Style::default()),
            Err(ProjectError::InvalidLayerReference(_))
        ));
        let first = p.layer_at(0).unwrap().id().clone();
        assert!(matches!(
            p.import_tile(&first, &RgbaImage::new(1, 1), &env(0.0, 0.0, 1.0, 1.0)),
            Err(ProjectError::InvalidLayerReference(_))
        ));
    }

    #[test]
    fn shapefile_layers_import_once_and_are_read_only() {
        let mut p = project();
        let source = StaticShapes(Crs::generic_2d(), vec![square(0.0, 0.0, 5.0), square(10.0, 10.0, 5.0)]);
        let id = p.add_shapefile_layer("coast", true, 1, &source).unwrap().id().clone();

        let layer = p.layer_by_id(&id).unwrap();
        assert_eq!(layer.kind(), LayerKind::Shapefile);
        assert_eq!(layer.feature_table().unwrap().count().unwrap(), 2);
        assert_eq!(layer.bounds().unwrap(), Some(env(0.0, 0.0, 15.0, 15.0)));
        assert!(matches!(
            p.add_feature(&id, square(0.0, 0.0, 1.0), Style::default()),
            Err(ProjectError::InvalidLayerReference(_))
        ));

        let foreign = StaticShapes(Crs::new("EPSG:4326"), vec![]);
        assert!(matches!(
            p.add_shapefile_layer("x", true, 0, &foreign),
            Err(ProjectError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            p.add_shapefile_layer("y", true, 0, &BrokenShapes),
            Err(ProjectError::Storage(_))
        ));
        assert_eq!(p.layer_count(), 2);
    }

    #[test]
    fn removing_a_layer_drops_its_data_and_partials() {
        let mut p = project();
        let keep = p.layer_at(0).unwrap().id().clone();
        let gone = p.add_tile_layer("tiles", true, 1).unwrap().id().clone();
        p.import_tile(&gone, &RgbaImage::new(2, 2), &env(0.0, 0.0, 1.0, 1.0)).unwrap();
        for id in [&keep, &gone] {
            p.partial_store()
                .add_partial(RenderedPartial::new(id.clone(), RgbaImage::new(1, 1), env(5.0, 5.0, 6.0, 6.0)))
                .unwrap();
        }
        let sheet = p.add_layout_sheet(LayoutSheet::a4("print", vec![keep.clone(), gone.clone()])).unwrap();

        p.remove_layer(&gone).unwrap();
        assert_eq!(p.tile_storage().tile_count(gone.as_str()).unwrap(), 0);
        assert_eq!(p.partial_store().loaded_count(), 1);
        assert_eq!(p.partial_store().persisted_counts().unwrap(), (1, 1));
        let sheet = p.layout_sheets().iter().find(|s| s.id == sheet).unwrap();
        assert_eq!(sheet.layers, vec![keep]);
    }

    fn block_partial_deletes(p: &Project, blocked: bool) {
        let sql = if blocked {
            "CREATE TRIGGER keep_partials BEFORE DELETE ON partial BEGIN SELECT RAISE(ABORT, 'kept'); END;"
        } else {
            "DROP TRIGGER keep_partials;"
        };
        p.db.with_connection(|c| Ok(c.execute_batch(sql)?)).unwrap();
    }

    #[test]
    fn failed_invalidation_keeps_data_and_partials_in_step() {
        let mut p = project();
        let id = p.layer_at(0).unwrap().id().clone();
        let kept = p.add_feature(&id, square(20.0, 20.0, 2.0), Style::default()).unwrap();
        p.partial_store()
            .add_partial(RenderedPartial::new(id.clone(), RgbaImage::new(4, 4), env(0.0, 0.0, 30.0, 30.0)))
            .unwrap();

        block_partial_deletes(&p, true);
        assert!(p.add_feature(&id, square(1.0, 1.0, 2.0), Style::default()).is_err());
        assert!(p.remove_feature(&id, kept.id).is_err());

        // neither edit landed, so the cached partial still shows the layer as stored
        let table = p.layer_by_id(&id).unwrap().feature_table().unwrap();
        assert_eq!(table.count().unwrap(), 1);
        assert!(table.get(kept.id).unwrap().is_some());
        assert_eq!(p.partial_store().loaded_count(), 1);
        assert_eq!(p.partial_store().persisted_counts().unwrap(), (1, 1));

        let tiles = p.add_tile_layer("tiles", true, 1).unwrap().id().clone();
        p.partial_store()
            .add_partial(RenderedPartial::new(tiles.clone(), RgbaImage::new(4, 4), env(0.0, 0.0, 30.0, 30.0)))
            .unwrap();
        assert!(p.import_tile(&tiles, &RgbaImage::new(2, 2), &env(1.0, 1.0, 2.0, 2.0)).is_err());
        assert_eq!(p.tile_storage().tile_count(tiles.as_str()).unwrap(), 0);
        assert_eq!(p.partial_store().persisted_counts().unwrap(), (2, 2));

        block_partial_deletes(&p, false);
        p.add_feature(&id, square(1.0, 1.0, 2.0), Style::default()).unwrap();
        assert_eq!(p.partial_store().partials_for_layer_intersecting(&id, &env(0.0, 0.0, 30.0, 30.0)).len(), 0);
        assert_eq!(p.partial_store().persisted_counts().unwrap(), (1, 1));
    }

    #[test]
    fn failed_layer_removal_keeps_everything() {
        let mut p = project();
        let gone = p.add_tile_layer("tiles", true, 1).unwrap().id().clone();
        p.import_tile(&gone, &RgbaImage::new(2, 2), &env(0.0, 0.0, 1.0, 1.0)).unwrap();
        p.partial_store()
            .add_partial(RenderedPartial::new(gone.clone(), RgbaImage::new(1, 1), env(5.0, 5.0, 6.0, 6.0)))
            .unwrap();

        block_partial_deletes(&p, true);
        assert!(p.remove_layer(&gone).is_err());
        assert_eq!(p.layer_count(), 2);
        assert!(p.layer_by_id(&gone).is_some());
        assert_eq!(p.tile_storage().tile_count(gone.as_str()).unwrap(), 1);
        assert_eq!(p.partial_store().loaded_count(), 1);
        assert_eq!(p.partial_store().persisted_counts().unwrap(), (1, 1));

        block_partial_deletes(&p, false);
        p.remove_layer(&gone).unwrap();
        assert_eq!(p.tile_storage().tile_count(gone.as_str()).unwrap(), 0);
        assert_eq!(p.partial_store().loaded_count(), 0);
        assert_eq!(p.partial_store().persisted_counts().unwrap(), (0, 0));
    }

    #[test]
    fn failed_tile_layer_commit_drops_its_coverage() {
        let mut p = project();
        p.db.with_connection(|c| {
            Ok(c.execute_batch(
                "CREATE TRIGGER frozen_index BEFORE INSERT ON layer_index BEGIN SELECT RAISE(ABORT, 'frozen'); END;",
            )?)
        })
        .unwrap();

        assert!(p.add_tile_layer("tiles", true, 1).is_err());
        assert_eq!(p.layer_count(), 1);
        let coverages: i64 = p
            .db
            .with_connection(|c| Ok(c.query_row("SELECT COUNT(*) FROM tile_coverage", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(coverages, 0);
    }

    #[test]
    fn layouts_must_reference_members() {
        let mut p = project();
        let bad = LayoutSheet::a4("bad", vec![LayerId::from("ghost")]);
        assert!(matches!(p.add_layout_sheet(bad), Err(ProjectError::InvalidLayerReference(_))));

        let id = p.add_layout_sheet(LayoutSheet::a4("ok", vec![])).unwrap();
        p.remove_layout_sheet(id).unwrap();
        assert!(p.layout_sheets().is_empty());
        assert!(p.remove_layout_sheet(id).is_err());
    }

    #[test]
    fn project_reopens_with_layers_layouts_and_partials() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.abm");

        let (ids, active) = {
            let mut p = Project::create(&path, ProjectConfig::default()).unwrap();
            let a = p.add_feature_layer("a", true, 1).unwrap().id().clone();
            let t = p.add_tile_layer("t", false, 2).unwrap().id().clone();
            p.add_feature(&a, square(0.0, 0.0, 4.0), Style::default()).unwrap();
            p.set_layer_opacity(&t, 0.5).unwrap();
            p.set_active_layer(&a).unwrap();
            p.add_layout_sheet(LayoutSheet::a4("sheet", vec![a.clone()])).unwrap();
            p.partial_store()
                .add_partial(RenderedPartial::new(a.clone(), RgbaImage::new(2, 2), env(0.0, 0.0, 1.0, 1.0)))
                .unwrap();
            p.set_metadata("title", "Island").unwrap();
            let ids: Vec<LayerId> = p.layers().iter().map(|l| l.id().clone()).collect();
            p.close();
            p.close();
            (ids, a)
        };

        assert!(Project::create(&path, ProjectConfig::default()).is_err());

        let p = Project::open(&path, ProjectConfig::default()).unwrap();
        let reopened: Vec<LayerId> = p.layers().iter().map(|l| l.id().clone()).collect();
        assert_eq!(reopened, ids);
        assert_eq!(p.active_layer().unwrap().id(), &active);
        assert_eq!(p.layer_at(2).unwrap().opacity(), 0.5);
        assert!(!p.layer_at(2).unwrap().is_visible());
        assert_eq!(p.layout_sheets().len(), 1);
        assert_eq!(p.partial_store().loaded_count(), 1);
        assert_eq!(p.maximum_bounds().unwrap(), Some(env(0.0, 0.0, 4.0, 4.0)));
        assert_eq!(p.metadata("title").unwrap().as_deref(), Some("Island"));
    }

    #[test]
    fn closing_is_idempotent_and_announced() {
        let p = project();
        let mut rx = p.subscribe();
        p.close();
        p.close();
        assert!(p.is_closed());
        assert_eq!(
            rx.try_recv().unwrap(),
            ProjectEvent::Structure(StructureChange::ProjectClosed)
        );
        assert!(rx.try_recv().is_err());
        assert!(matches!(p.maximum_bounds(), Err(ProjectError::Storage(_))));
    }
}
