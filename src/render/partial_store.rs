//! Persistent cache of rendered partials.
//!
//! `RenderedPartialStore` is a write-through cache: the `loaded` list in memory mirrors the
//! `partial` table, and every partial row has exactly one `partial_outline` row carrying
//! its footprint. Both rows are written and deleted in the same transaction, and the
//! in-memory list is only touched after the transaction committed, so a failed write
//! leaves the cache exactly as it was.
//!
//! ## Spatial deletes
//! `delete_partials_for_layer_in` pre-filters outlines on their bounding box columns in
//! SQL, then runs an exact `geo` intersection test on each candidate footprint.
//!
//! ## Events
//! Every successful mutation publishes on the project [`EventBus`]: one
//! [`ProjectEvent::NewPartials`] per batch added, one [`ProjectEvent::PartialsDeleted`] per
//! delete that removed something.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use geo::{Intersects, Polygon};
use r2d2_sqlite::rusqlite::{params, Connection, Row};

use crate::envelope::{Crs, Envelope};
use crate::errors::{ProjectError, Result};
use crate::events::{EventBus, ProjectEvent};
use crate::project::layer_index::LayerId;
use crate::render::image::RgbaImage;
use crate::render::partial::{PartialId, RenderedPartial};
use crate::storage::ProjectDatabase;

pub struct RenderedPartialStore {
    db: ProjectDatabase,
    /// Mirror of the `partial` table
    loaded: RwLock<Vec<Arc<RenderedPartial>>>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for RenderedPartialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedPartialStore")
            .field("loaded", &self.loaded.read().map(|l| l.len()).unwrap_or(0))
            .finish()
    }
}

impl RenderedPartialStore {
    /// Opens the store and loads every persisted partial.
    pub fn open(db: ProjectDatabase, events: Arc<EventBus>) -> Result<Self> {
        let rows = db.with_connection(|c| {
            let mut stmt = c.prepare(
                "SELECT partial_id, layer_id, image, minx, miny, maxx, maxy, crs FROM partial ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([], partial_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut loaded = Vec::with_capacity(rows.len());
        for (id, layer, blob, min_x, min_y, max_x, max_y, crs) in rows {
            let image = RgbaImage::decode_png(&blob)?;
            loaded.push(Arc::new(RenderedPartial {
                id: id.parse()?,
                layer: LayerId::from(layer),
                width: image.width(),
                height: image.height(),
                image: Arc::new(image),
                envelope: Envelope::new(min_x, min_y, max_x, max_y, Crs::new(crs))?,
            }));
        }
        log::debug!("partial store opened with {} partials", loaded.len());

        Ok(Self {
            db,
            loaded: RwLock::new(loaded),
            events,
        })
    }

    /// Persists one partial and its outline, see [`add_partials`](Self::add_partials).
    pub fn add_partial(&self, partial: RenderedPartial) -> Result<Arc<RenderedPartial>> {
        let mut added = self.add_partials(vec![partial])?;
        added
            .pop()
            .ok_or_else(|| ProjectError::Storage("partial was not stored".into()))
    }

    /// Persists partials and their outlines in a single transaction, then appends them to
    /// the loaded list. The store does not de-duplicate: adding an equivalent partial twice
    /// stores it twice.
    pub fn add_partials(&self, partials: Vec<RenderedPartial>) -> Result<Vec<Arc<RenderedPartial>>> {
        if partials.is_empty() {
            return Ok(vec![]);
        }

        let mut encoded = Vec::with_capacity(partials.len());
        for partial in &partials {
            let footprint = serde_json::to_string(&partial.outline().footprint)?;
            encoded.push((partial.image.encode_png()?, footprint));
        }

        self.db.with_transaction(|tx| {
            let mut insert_partial = tx.prepare(
                "INSERT INTO partial (partial_id, layer_id, image, width, height, minx, miny, maxx, maxy, crs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let mut insert_outline = tx.prepare(
                "INSERT INTO partial_outline (partial_id, layer_id, minx, miny, maxx, maxy, footprint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for (partial, (blob, footprint)) in partials.iter().zip(&encoded) {
                let e = &partial.envelope;
                insert_partial.execute(params![
                    partial.id.to_string(),
                    partial.layer.as_str(),
                    blob,
                    partial.width,
                    partial.height,
                    e.min_x,
                    e.min_y,
                    e.max_x,
                    e.max_y,
                    e.crs.code()
                ])?;
                insert_outline.execute(params![
                    partial.id.to_string(),
                    partial.layer.as_str(),
                    e.min_x,
                    e.min_y,
                    e.max_x,
                    e.max_y,
                    footprint
                ])?;
            }
            Ok(())
        })?;

        let layers: BTreeSet<LayerId> = partials.iter().map(|p| p.layer.clone()).collect();
        let added: Vec<Arc<RenderedPartial>> = partials.into_iter().map(Arc::new).collect();
        self.loaded.write()?.extend(added.iter().cloned());

        self.events.publish(ProjectEvent::NewPartials {
            layers: layers.into_iter().collect(),
            count: added.len(),
        });
        Ok(added)
    }

    /// Removes every partial of `layer`. Returns how many were removed.
    pub fn delete_partials_for_layer(&self, layer: &LayerId) -> Result<usize> {
        let removed = self.db.with_transaction(|tx| Self::delete_layer_rows(tx, layer))?;
        self.evict_layer(layer, removed)?;
        Ok(removed)
    }

    /// Deletes the rows of every partial of `layer` on the caller's connection. The loaded
    /// list is untouched; call [`evict_layer`](Self::evict_layer) once the transaction
    /// committed.
    pub fn delete_layer_rows(c: &Connection, layer: &LayerId) -> Result<usize> {
        c.execute("DELETE FROM partial_outline WHERE layer_id = ?1", [layer.as_str()])?;
        Ok(c.execute("DELETE FROM partial WHERE layer_id = ?1", [layer.as_str()])?)
    }

    /// Drops the loaded partials of `layer` after their rows were deleted.
    pub fn evict_layer(&self, layer: &LayerId, removed: usize) -> Result<()> {
        self.loaded.write()?.retain(|p| &p.layer != layer);
        self.announce_deleted(layer, removed);
        Ok(())
    }

    /// Removes the partials of `layer` whose footprint intersects `envelope` (touching
    /// counts). Partials of other layers are never touched.
    pub fn delete_partials_for_layer_in(&self, layer: &LayerId, envelope: &Envelope) -> Result<usize> {
        let doomed = self.db.with_transaction(|tx| self.delete_rows_in(tx, layer, envelope))?;
        self.evict(layer, &doomed)?;
        Ok(doomed.len())
    }

    /// Deletes the rows of the partials of `layer` intersecting `envelope` on the caller's
    /// connection and returns their ids. The loaded list is untouched; call
    /// [`evict`](Self::evict) once the transaction committed.
    pub fn delete_rows_in(&self, c: &Connection, layer: &LayerId, envelope: &Envelope) -> Result<Vec<PartialId>> {
        if let Some(other) = self.loaded_partials().iter().find(|p| &p.layer == layer) {
            other.envelope.ensure_same_crs(&envelope.crs)?;
        }

        let mut stmt = c.prepare(
            "SELECT partial_id, footprint FROM partial_outline
             WHERE layer_id = ?1 AND minx <= ?4 AND maxx >= ?2 AND miny <= ?5 AND maxy >= ?3",
        )?;
        let candidates = stmt
            .query_map(
                params![layer.as_str(), envelope.min_x, envelope.min_y, envelope.max_x, envelope.max_y],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // a flat area (point or line bounds) has no polygon; the box pre-filter is exact then
        let area = (!envelope.is_degenerate()).then(|| envelope.to_polygon());
        let mut doomed = Vec::new();
        for (id, json) in candidates {
            let footprint: Polygon<f64> = serde_json::from_str(&json)?;
            if area.as_ref().map_or(true, |a| footprint.intersects(a)) {
                doomed.push(id.parse::<PartialId>()?);
            }
        }

        for id in &doomed {
            let id = id.to_string();
            c.execute("DELETE FROM partial_outline WHERE partial_id = ?1", [&id])?;
            c.execute("DELETE FROM partial WHERE partial_id = ?1", [&id])?;
        }
        Ok(doomed)
    }

    /// Drops loaded partials whose rows were deleted.
    pub fn evict(&self, layer: &LayerId, ids: &[PartialId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let doomed: HashSet<&PartialId> = ids.iter().collect();
        self.loaded.write()?.retain(|p| !doomed.contains(&p.id));
        self.announce_deleted(layer, ids.len());
        Ok(())
    }

    fn announce_deleted(&self, layer: &LayerId, count: usize) {
        if count > 0 {
            log::debug!("deleted {} partials of layer {}", count, layer);
            self.events.publish(ProjectEvent::PartialsDeleted { layer: layer.clone(), count });
        }
    }

    /// Snapshot of the loaded partials. Mutating the returned list does not affect the store.
    pub fn loaded_partials(&self) -> Vec<Arc<RenderedPartial>> {
        self.loaded.read().map(|l| l.clone()).unwrap_or_default()
    }

    /// Loaded partials of `layer` intersecting `envelope`.
    pub fn partials_for_layer_intersecting(&self, layer: &LayerId, envelope: &Envelope) -> Vec<Arc<RenderedPartial>> {
        self.loaded
            .read()
            .map(|l| {
                l.iter()
                    .filter(|p| &p.layer == layer && p.envelope.crs == envelope.crs && p.envelope.intersects(envelope))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Row counts of the `partial` and `partial_outline` tables.
    pub fn persisted_counts(&self) -> Result<(usize, usize)> {
        self.db.with_connection(|c| {
            let partials: i64 = c.query_row("SELECT COUNT(*) FROM partial", [], |r| r.get(0))?;
            let outlines: i64 = c.query_row("SELECT COUNT(*) FROM partial_outline", [], |r| r.get(0))?;
            Ok((partials as usize, outlines as usize))
        })
    }
}

type PartialRow = (String, String, Vec<u8>, f64, f64, f64, f64, String);

fn partial_row(row: &Row<'_>) -> r2d2_sqlite::rusqlite::Result<PartialRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::project::style::Color;

    const SIDE: f64 = 30.0;
    const PER_LAYER: usize = 4;

    fn env(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope::new(min_x, min_y, max_x, max_y, Crs::generic_2d()).unwrap()
    }

    fn layers() -> Vec<LayerId> {
        vec![LayerId::from("layer0"), LayerId::from("layer1"), LayerId::from("layer2")]
    }

    /// Three rows of four partials, one row per layer, starting at (-30, -30).
    fn filled_store(db: &ProjectDatabase) -> RenderedPartialStore {
        let store = RenderedPartialStore::open(db.clone(), Arc::new(EventBus::default())).unwrap();
        let img = RgbaImage::filled(30, 30, Color::rgb(0, 128, 0));

        let mut min_y = -SIDE;
        for layer in layers() {
            let mut min_x = -SIDE;
            for _ in 0..PER_LAYER {
                let e = env(min_x, min_y, min_x + SIDE, min_y + SIDE);
                store.add_partial(RenderedPartial::new(layer.clone(), img.clone(), e)).unwrap();
                min_x += SIDE;
            }
            min_y += SIDE;
        }
        store
    }

    fn rows_for(db: &ProjectDatabase, table: &str, layer: &LayerId) -> usize {
        db.with_connection(|c| {
            let n: i64 = c.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE layer_id = ?1"),
                [layer.as_str()],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
        .unwrap()
    }

    fn assert_consistent(store: &RenderedPartialStore) {
        let (partials, outlines) = store.persisted_counts().unwrap();
        assert_eq!(partials, outlines);
        assert_eq!(store.loaded_partials().len(), partials);
    }

    #[test]
    fn added_partials_are_loaded_and_persisted() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let store = filled_store(&db);

        assert_eq!(store.persisted_counts().unwrap(), (12, 12));
        assert_consistent(&store);

        // outlines mirror partial envelopes
        let mismatched: i64 = db
            .with_connection(|c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM partial p JOIN partial_outline o ON p.partial_id = o.partial_id
                     WHERE p.minx != o.minx OR p.miny != o.miny OR p.maxx != o.maxx OR p.maxy != o.maxy",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(mismatched, 0);
    }

    #[test]
    fn deleting_a_layer_leaves_other_layers_alone() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let store = filled_store(&db);
        let ids = layers();

        assert_eq!(store.delete_partials_for_layer(&ids[0]).unwrap(), 4);

        assert_eq!(rows_for(&db, "partial", &ids[0]), 0);
        assert_eq!(rows_for(&db, "partial_outline", &ids[0]), 0);
        assert_eq!(rows_for(&db, "partial", &ids[1]), 4);
        assert_eq!(rows_for(&db, "partial", &ids[2]), 4);
        assert_eq!(store.persisted_counts().unwrap(), (8, 8));
        assert_consistent(&store);
    }

    #[test]
    fn envelope_delete_removes_only_intersecting_partials() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let store = filled_store(&db);
        let ids = layers();

        // layer1 sits on y 0..30; this area is strictly inside its second partial (x 0..30)
        let removed = store.delete_partials_for_layer_in(&ids[1], &env(5.0, 5.0, 25.0, 25.0)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(rows_for(&db, "partial", &ids[1]), 3);
        assert_eq!(rows_for(&db, "partial_outline", &ids[1]), 3);
        assert_eq!(rows_for(&db, "partial", &ids[0]), 4);
        assert_eq!(rows_for(&db, "partial", &ids[2]), 4);
        assert!(store
            .loaded_partials()
            .iter()
            .all(|p| !(p.layer == ids[1] && p.envelope.min_x == 0.0)));
        assert_consistent(&store);
    }

    #[test]
    fn envelope_delete_across_partial_borders() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let store = filled_store(&db);
        let ids = layers();

        let area = env(SIDE + 5.0, SIDE - 5.0, SIDE * 2.0 + 5.0, SIDE + 10.0);
        assert_eq!(store.delete_partials_for_layer_in(&ids[1], &area).unwrap(), 2);
        assert_eq!(rows_for(&db, "partial", &ids[1]), 2);
        assert!(store
            .loaded_partials()
            .iter()
            .all(|p| p.layer != ids[1] || !p.envelope.intersects(&area)));
        assert_consistent(&store);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let store = filled_store(&db);

        let mut snapshot = store.loaded_partials();
        snapshot.clear();
        assert_eq!(store.loaded_count(), 12);
    }

    #[test]
    fn failed_transaction_keeps_cache_unchanged() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let store = RenderedPartialStore::open(db.clone(), Arc::new(EventBus::default())).unwrap();

        let p = RenderedPartial::new(LayerId::from("L"), RgbaImage::new(2, 2), env(0.0, 0.0, 1.0, 1.0));
        store.add_partial(p.clone()).unwrap();

        // same partial id twice in one batch violates the primary key
        let res = store.add_partials(vec![
            RenderedPartial::new(LayerId::from("L"), RgbaImage::new(2, 2), env(1.0, 0.0, 2.0, 1.0)),
            p,
        ]);
        assert!(matches!(res, Err(ProjectError::Storage(_))));
        assert_eq!(store.persisted_counts().unwrap(), (1, 1));
        assert_consistent(&store);
    }

    #[test]
    fn row_deletes_follow_the_callers_transaction() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let store = filled_store(&db);
        let ids = layers();

        let res: Result<()> = db.with_transaction(|tx| {
            assert_eq!(store.delete_rows_in(tx, &ids[1], &env(5.0, 5.0, 25.0, 25.0))?.len(), 1);
            assert_eq!(RenderedPartialStore::delete_layer_rows(tx, &ids[2])?, 4);
            Err(ProjectError::Storage("abort".into()))
        });
        assert!(res.is_err());
        assert_eq!(store.persisted_counts().unwrap(), (12, 12));
        assert_consistent(&store);

        let doomed = db
            .with_transaction(|tx| store.delete_rows_in(tx, &ids[1], &env(5.0, 5.0, 25.0, 25.0)))
            .unwrap();
        // committed but not evicted yet
        assert_eq!(store.loaded_count(), 12);
        store.evict(&ids[1], &doomed).unwrap();
        assert_eq!(store.persisted_counts().unwrap(), (11, 11));
        assert_consistent(&store);
    }

    #[test]
    fn unreadable_partial_ids_fail_the_open() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        filled_store(&db);
        db.with_connection(|c| {
            c.execute_batch(
                "PRAGMA foreign_keys = OFF;
                 UPDATE partial SET partial_id = 'garbage' WHERE rowid = 1;",
            )?;
            Ok(())
        })
        .unwrap();

        let res = RenderedPartialStore::open(db, Arc::new(EventBus::default()));
        assert!(matches!(res, Err(ProjectError::Storage(_))));
    }

    #[test]
    fn partials_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partials.db");
        let cfg = ProjectConfig::default();

        let db = ProjectDatabase::open(&path, &cfg).unwrap();
        let original = filled_store(&db).loaded_partials();
        db.close();

        let db = ProjectDatabase::open(&path, &cfg).unwrap();
        let store = RenderedPartialStore::open(db, Arc::new(EventBus::default())).unwrap();
        let reloaded = store.loaded_partials();
        assert_eq!(reloaded.len(), 12);
        assert_eq!(reloaded[0].id, original[0].id);
        assert_eq!(reloaded[0].envelope, original[0].envelope);
        assert_eq!(*reloaded[0].image, *original[0].image);
    }

    #[tokio::test]
    async fn mutations_are_announced() {
        let db = ProjectDatabase::open_in_memory(&ProjectConfig::default()).unwrap();
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let store = RenderedPartialStore::open(db, bus).unwrap();
        let layer = LayerId::from("L");

        store
            .add_partials(vec![
                RenderedPartial::new(layer.clone(), RgbaImage::new(1, 1), env(0.0, 0.0, 1.0, 1.0)),
                RenderedPartial::new(layer.clone(), RgbaImage::new(1, 1), env(1.0, 0.0, 2.0, 1.0)),
            ])
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ProjectEvent::NewPartials { layers: vec![layer.clone()], count: 2 }
        );

        // nothing removed, nothing announced
        store.delete_partials_for_layer(&LayerId::from("other")).unwrap();
        store.delete_partials_for_layer(&layer).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ProjectEvent::PartialsDeleted { layer, count: 2 }
        );
    }
}
