//! Persisted layer metadata: identity, kind, name, visibility, paint order and opacity.

use std::fmt::Display;
use std::str::FromStr;

use r2d2_sqlite::rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ProjectError, Result};

/// Stable, unique identifier of a layer (ie: `LAYER_FEATURE_3f0c...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(String);

impl LayerId {
    /// Generates a fresh id for a layer of `kind`.
    pub fn generate(kind: LayerKind) -> Self {
        Self(format!("LAYER_{}_{}", kind.as_str(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// Editable vector data
    Feature,
    /// Raster imagery from the tile storage
    Tile,
    /// Vector data imported once from a shape source, read-only afterwards
    Shapefile,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Feature => "FEATURE",
            LayerKind::Tile => "TILE",
            LayerKind::Shapefile => "SHAPEFILE",
        }
    }
}

impl Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = ProjectError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FEATURE" => Ok(LayerKind::Feature),
            "TILE" => Ok(LayerKind::Tile),
            "SHAPEFILE" => Ok(LayerKind::Shapefile),
            other => Err(ProjectError::Storage(format!("unknown layer kind {other:?}"))),
        }
    }
}

/// One row of `layer_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerIndexEntry {
    pub id: LayerId,
    pub kind: LayerKind,
    pub name: String,
    pub visible: bool,
    /// Paint order, 0 is the bottom layer
    pub zindex: usize,
    opacity: f32,
}

impl LayerIndexEntry {
    pub fn new(kind: LayerKind, name: impl Into<String>, visible: bool, zindex: usize) -> Self {
        Self {
            id: LayerId::generate(kind),
            kind,
            name: name.into(),
            visible,
            zindex,
            opacity: 1.0,
        }
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    /// Sets the opacity. Values outside `0.0..=1.0` (and NaN) are rejected and leave the
    /// entry untouched.
    pub fn set_opacity(&mut self, opacity: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&opacity) {
            return Err(ProjectError::InvalidOpacity(opacity));
        }
        self.opacity = opacity;
        Ok(())
    }
}

type LayerRow = (String, String, String, bool, i64, f64);

fn layer_row(row: &Row<'_>) -> r2d2_sqlite::rusqlite::Result<LayerRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get::<_, i64>(3)? != 0,
        row.get(4)?,
        row.get(5)?,
    ))
}

/// Reads every entry, ordered by zindex.
pub(crate) fn load_all(conn: &Connection) -> Result<Vec<LayerIndexEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, name, visible, zindex, opacity FROM layer_index ORDER BY zindex, id",
    )?;
    let rows = stmt
        .query_map([], layer_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, kind, name, visible, zindex, opacity)| {
            let id = LayerId::from(id);
            let mut opacity = opacity as f32;
            if !(0.0..=1.0).contains(&opacity) {
                log::warn!("layer {} has opacity {} on disk, clamping", id, opacity);
                opacity = opacity.clamp(0.0, 1.0);
            }
            Ok(LayerIndexEntry {
                id,
                kind: kind.parse()?,
                name,
                visible,
                zindex: zindex.max(0) as usize,
                opacity,
            })
        })
        .collect()
}

/// Inserts or replaces one entry.
pub(crate) fn upsert(conn: &Connection, entry: &LayerIndexEntry) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO layer_index (id, kind, name, visible, zindex, opacity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.id.as_str(),
            entry.kind.as_str(),
            entry.name,
            entry.visible as i64,
            entry.zindex as i64,
            entry.opacity as f64
        ],
    )?;
    Ok(())
}

pub(crate) fn delete(conn: &Connection, id: &LayerId) -> Result<()> {
    conn.execute("DELETE FROM layer_index WHERE id = ?1", [id.as_str()])?;
    Ok(())
}
