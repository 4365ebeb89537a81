//! Vector features stored in the `feature` table.
//!
//! Geometries are kept as `geo` JSON next to their bounding box columns; the box columns
//! serve as the SQL pre-filter when a renderable asks for the features of an envelope.

use std::sync::Arc;

use geo::{BoundingRect, Geometry};
use r2d2_sqlite::rusqlite::{params, Connection, Row};

use crate::envelope::{Crs, Envelope, PixelSize};
use crate::errors::{ProjectError, Result};
use crate::project::layer::Renderable;
use crate::project::layer_index::LayerId;
use crate::project::style::{Style, StyleLibrary};
use crate::render::image::RgbaImage;
use crate::render::rasterize::{Canvas, WorldTransform};
use crate::storage::ProjectDatabase;

pub type FeatureId = i64;

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: Geometry<f64>,
    pub style: Arc<Style>,
}

/// The features of one layer.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    db: ProjectDatabase,
    layer: LayerId,
    crs: Crs,
    styles: Arc<StyleLibrary>,
}

impl FeatureTable {
    pub fn new(db: ProjectDatabase, layer: LayerId, crs: Crs, styles: Arc<StyleLibrary>) -> Self {
        Self { db, layer, crs, styles }
    }

    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    /// Bounds of a geometry, `InvalidEnvelope` for empty geometries.
    pub fn geometry_bounds(&self, geometry: &Geometry<f64>) -> Result<Envelope> {
        geometry
            .bounding_rect()
            .map(|r| Envelope::from_rect(r, self.crs.clone()))
            .ok_or_else(|| ProjectError::InvalidEnvelope("empty geometry".into()))
    }

    /// Inserts one feature and returns it with its id.
    pub fn insert(&self, geometry: Geometry<f64>, style: Style) -> Result<Feature> {
        self.db.with_connection(|c| self.insert_in(c, geometry, style))
    }

    /// [`FeatureTable::insert`] on a caller's connection, typically inside a transaction.
    pub fn insert_in(&self, c: &Connection, geometry: Geometry<f64>, style: Style) -> Result<Feature> {
        let rows = self.feature_rows(&[(geometry.clone(), style)])?;
        let id = insert_rows(c, &self.layer, &rows)?
            .pop()
            .ok_or_else(|| ProjectError::Storage("feature insert returned no id".into()))?;
        let style = self.styles.style_for(style.foreground, style.background, style.thickness);
        Ok(Feature { id, geometry, style })
    }

    /// Inserts features in one transaction, returning their ids in order.
    pub fn insert_all(&self, features: Vec<(Geometry<f64>, Style)>) -> Result<Vec<FeatureId>> {
        let rows = self.feature_rows(&features)?;
        self.db.with_transaction(|tx| insert_rows(tx, &self.layer, &rows))
    }

    fn feature_rows(&self, features: &[(Geometry<f64>, Style)]) -> Result<Vec<(String, Style, Envelope)>> {
        let mut rows = Vec::with_capacity(features.len());
        for (geometry, style) in features {
            let bounds = self.geometry_bounds(geometry)?;
            rows.push((serde_json::to_string(geometry)?, *style, bounds));
        }
        Ok(rows)
    }

    /// Removes a feature. Returns its former bounds, `None` if it was not in this layer.
    pub fn remove(&self, id: FeatureId) -> Result<Option<Envelope>> {
        self.db.with_connection(|c| self.remove_in(c, id))
    }

    pub fn remove_in(&self, c: &Connection, id: FeatureId) -> Result<Option<Envelope>> {
        let rows = query_rows(
            c,
            "SELECT feature_id, geometry, foreground, background, thickness FROM feature
             WHERE layer_id = ?1 AND feature_id = ?2",
            params![self.layer.as_str(), id],
        )?;
        let Some((_, json, ..)) = rows.into_iter().next() else {
            return Ok(None);
        };
        let geometry: Geometry<f64> = serde_json::from_str(&json)?;

        c.execute(
            "DELETE FROM feature WHERE feature_id = ?1 AND layer_id = ?2",
            params![id, self.layer.as_str()],
        )?;
        Ok(Some(self.geometry_bounds(&geometry)?))
    }

    pub fn get(&self, id: FeatureId) -> Result<Option<Feature>> {
        let rows = self.query(
            "SELECT feature_id, geometry, foreground, background, thickness FROM feature
             WHERE layer_id = ?1 AND feature_id = ?2",
            params![self.layer.as_str(), id],
        )?;
        Ok(rows.into_iter().next())
    }

    /// Features whose bounding box intersects `envelope`, in insertion order.
    pub fn within(&self, envelope: &Envelope) -> Result<Vec<Feature>> {
        self.query(
            "SELECT feature_id, geometry, foreground, background, thickness FROM feature
             WHERE layer_id = ?1 AND minx <= ?4 AND maxx >= ?2 AND miny <= ?5 AND maxy >= ?3
             ORDER BY feature_id",
            params![
                self.layer.as_str(),
                envelope.min_x,
                envelope.min_y,
                envelope.max_x,
                envelope.max_y
            ],
        )
    }

    pub fn bounds(&self) -> Result<Option<Envelope>> {
        let row = self.db.with_connection(|c| {
            Ok(c.query_row(
                "SELECT MIN(minx), MIN(miny), MAX(maxx), MAX(maxy) FROM feature WHERE layer_id = ?1",
                [self.layer.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<f64>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ))
                },
            )?)
        })?;

        match row {
            (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) => {
                Ok(Some(Envelope::new(min_x, min_y, max_x, max_y, self.crs.clone())?))
            }
            _ => Ok(None),
        }
    }

    pub fn count(&self) -> Result<usize> {
        self.db.with_connection(|c| {
            let n: i64 = c.query_row(
                "SELECT COUNT(*) FROM feature WHERE layer_id = ?1",
                [self.layer.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    pub fn delete_all(&self) -> Result<usize> {
        self.db.with_connection(|c| self.delete_all_in(c))
    }

    pub fn delete_all_in(&self, c: &Connection) -> Result<usize> {
        Ok(c.execute("DELETE FROM feature WHERE layer_id = ?1", [self.layer.as_str()])?)
    }

    fn query(&self, sql: &str, args: impl r2d2_sqlite::rusqlite::Params) -> Result<Vec<Feature>> {
        let rows = self.db.with_connection(|c| query_rows(c, sql, args))?;
        rows.into_iter()
            .map(|(id, json, fg, bg, thickness)| {
                Ok(Feature {
                    id,
                    geometry: serde_json::from_str(&json)?,
                    style: self.styles.style_for(fg.parse()?, bg.parse()?, thickness),
                })
            })
            .collect()
    }
}

impl Renderable for FeatureTable {
    fn render(&self, envelope: &Envelope, size: PixelSize) -> Result<RgbaImage> {
        envelope.ensure_same_crs(&self.crs)?;
        if size.is_degenerate() {
            return Ok(RgbaImage::new(size.width, size.height));
        }
        let mut canvas = Canvas::new(size)?;
        let tr = WorldTransform::new(envelope, size);
        for feature in self.within(envelope)? {
            canvas.draw_geometry(&tr, &feature.geometry, &feature.style);
        }
        Ok(canvas.finish())
    }
}

type FeatureRow = (FeatureId, String, String, String, u32);

fn insert_rows(c: &Connection, layer: &LayerId, rows: &[(String, Style, Envelope)]) -> Result<Vec<FeatureId>> {
    let mut stmt = c.prepare(
        "INSERT INTO feature (layer_id, geometry, foreground, background, thickness, minx, miny, maxx, maxy)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    let mut ids = Vec::with_capacity(rows.len());
    for (json, style, b) in rows {
        stmt.execute(params![
            layer.as_str(),
            json,
            style.foreground.to_string(),
            style.background.to_string(),
            style.thickness,
            b.min_x,
            b.min_y,
            b.max_x,
            b.max_y
        ])?;
        ids.push(c.last_insert_rowid());
    }
    Ok(ids)
}

fn query_rows(c: &Connection, sql: &str, args: impl r2d2_sqlite::rusqlite::Params) -> Result<Vec<FeatureRow>> {
    let mut stmt = c.prepare(sql)?;
    let rows = stmt
        .query_map(args, feature_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn feature_row(row: &Row<'_>) -> r2d2_sqlite::rusqlite::Result<FeatureRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}
