//! Raw raster tiles backing tile layers.
//!
//! `TileStorage` holds *source* imagery: every tile layer owns one coverage, and each
//! imported tile is a PNG blob with the world envelope it covers. It is unrelated to the
//! rendered-partial cache; only tile layer renderables read from it.

use r2d2_sqlite::rusqlite::{params, Connection, OptionalExtension, Row};

use crate::envelope::{Crs, Envelope};
use crate::errors::{ProjectError, Result};
use crate::render::image::RgbaImage;
use crate::storage::database::ProjectDatabase;

pub type TileId = i64;

/// A tile read back from storage.
#[derive(Debug, Clone)]
pub struct StoredTile {
    pub id: TileId,
    pub coverage: String,
    pub image: RgbaImage,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
pub struct TileStorage {
    db: ProjectDatabase,
}

impl TileStorage {
    pub fn new(db: ProjectDatabase) -> Self {
        Self { db }
    }

    /// Registers a coverage. Creating an existing coverage is a no-op.
    pub fn create_coverage(&self, coverage: &str, crs: &Crs) -> Result<()> {
        self.db.with_connection(|c| {
            c.execute(
                "INSERT OR IGNORE INTO tile_coverage (coverage_id, crs) VALUES (?1, ?2)",
                params![coverage, crs.code()],
            )?;
            Ok(())
        })
    }

    fn coverage_crs(&self, coverage: &str) -> Result<Option<Crs>> {
        self.db.with_connection(|c| coverage_crs(c, coverage))
    }

    /// Stores one tile. The envelope must be expressed in the coverage CRS.
    pub fn add_tile(&self, coverage: &str, image: &RgbaImage, envelope: &Envelope) -> Result<TileId> {
        self.db.with_connection(|c| Self::add_tile_in(c, coverage, image, envelope))
    }

    /// [`TileStorage::add_tile`] on a caller's connection, typically inside a transaction.
    pub fn add_tile_in(c: &Connection, coverage: &str, image: &RgbaImage, envelope: &Envelope) -> Result<TileId> {
        let crs = coverage_crs(c, coverage)?
            .ok_or_else(|| ProjectError::InvalidLayerReference(format!("unknown tile coverage {coverage}")))?;
        envelope.ensure_same_crs(&crs)?;
        if envelope.is_degenerate() {
            return Err(ProjectError::InvalidEnvelope(format!("tile envelope has no area: {envelope}")));
        }

        let blob = image.encode_png()?;
        c.execute(
            "INSERT INTO tile (coverage_id, image, width, height, minx, miny, maxx, maxy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                coverage,
                blob,
                image.width(),
                image.height(),
                envelope.min_x,
                envelope.min_y,
                envelope.max_x,
                envelope.max_y
            ],
        )?;
        Ok(c.last_insert_rowid())
    }

    /// Tiles of `coverage` whose envelope intersects `envelope`, oldest first.
    pub fn tiles_intersecting(&self, coverage: &str, envelope: &Envelope) -> Result<Vec<StoredTile>> {
        let crs = match self.coverage_crs(coverage)? {
            Some(crs) => crs,
            None => return Ok(vec![]),
        };

        let rows = self.db.with_connection(|c| {
            let mut stmt = c.prepare(
                "SELECT tile_id, image, minx, miny, maxx, maxy FROM tile
                 WHERE coverage_id = ?1 AND minx <= ?4 AND maxx >= ?2 AND miny <= ?5 AND maxy >= ?3
                 ORDER BY tile_id",
            )?;
            let rows = stmt
                .query_map(
                    params![coverage, envelope.min_x, envelope.min_y, envelope.max_x, envelope.max_y],
                    tile_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(id, blob, min_x, min_y, max_x, max_y)| {
                Ok(StoredTile {
                    id,
                    coverage: coverage.to_string(),
                    image: RgbaImage::decode_png(&blob)?,
                    envelope: Envelope::new(min_x, min_y, max_x, max_y, crs.clone())?,
                })
            })
            .collect()
    }

    /// Union of all tile envelopes of the coverage, `None` when it has no tile.
    pub fn coverage_bounds(&self, coverage: &str) -> Result<Option<Envelope>> {
        let crs = match self.coverage_crs(coverage)? {
            Some(crs) => crs,
            None => return Ok(None),
        };

        let bounds = self.db.with_connection(|c| {
            Ok(c.query_row(
                "SELECT MIN(minx), MIN(miny), MAX(maxx), MAX(maxy) FROM tile WHERE coverage_id = ?1",
                [coverage],
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

        match bounds {
            (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) => {
                Ok(Some(Envelope::new(min_x, min_y, max_x, max_y, crs)?))
            }
            _ => Ok(None),
        }
    }

    pub fn tile_count(&self, coverage: &str) -> Result<usize> {
        self.db.with_connection(|c| {
            let n: i64 = c.query_row(
                "SELECT COUNT(*) FROM tile WHERE coverage_id = ?1",
                [coverage],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Removes a coverage and all its tiles. Returns the number of tiles removed.
    pub fn delete_coverage(&self, coverage: &str) -> Result<usize> {
        self.db.with_transaction(|tx| Self::delete_coverage_in(tx, coverage))
    }

    pub fn delete_coverage_in(c: &Connection, coverage: &str) -> Result<usize> {
        let removed = c.execute("DELETE FROM tile WHERE coverage_id = ?1", [coverage])?;
        c.execute("DELETE FROM tile_coverage WHERE coverage_id = ?1", [coverage])?;
        Ok(removed)
    }
}

fn coverage_crs(c: &Connection, coverage: &str) -> Result<Option<Crs>> {
    Ok(c
        .query_row(
            "SELECT crs FROM tile_coverage WHERE coverage_id = ?1",
            [coverage],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(Crs::new))
}

type TileRow = (TileId, Vec<u8>, f64, f64, f64, f64);

fn tile_row(row: &Row<'_>) -> r2d2_sqlite::rusqlite::Result<TileRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}
