//! Layout sheets: printable compositions of a subset of the project layers.

use std::fmt::Display;

use r2d2_sqlite::rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::project::layer_index::LayerId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutId(Uuid);

impl LayoutId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LayoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for LayoutId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for LayoutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A printable page referencing project layers, bottom layer first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSheet {
    pub id: LayoutId,
    pub name: String,
    /// Page size in millimetres
    pub width_mm: f64,
    pub height_mm: f64,
    pub layers: Vec<LayerId>,
}

impl LayoutSheet {
    pub fn new(name: impl Into<String>, width_mm: f64, height_mm: f64, layers: Vec<LayerId>) -> Self {
        Self {
            id: LayoutId::new(),
            name: name.into(),
            width_mm,
            height_mm,
            layers,
        }
    }

    /// A4 portrait.
    pub fn a4(name: impl Into<String>, layers: Vec<LayerId>) -> Self {
        Self::new(name, 210.0, 297.0, layers)
    }
}

pub(crate) fn load_all(conn: &Connection) -> Result<Vec<LayoutSheet>> {
    let mut stmt = conn.prepare("SELECT body FROM layout_sheet ORDER BY rowid")?;
    let bodies = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    bodies
        .iter()
        .map(|body| Ok(serde_json::from_str(body)?))
        .collect()
}

pub(crate) fn save(conn: &Connection, sheet: &LayoutSheet) -> Result<()> {
    let body = serde_json::to_string(sheet)?;
    conn.execute(
        "INSERT OR REPLACE INTO layout_sheet (id, body) VALUES (?1, ?2)",
        params![sheet.id.to_string(), body],
    )?;
    Ok(())
}

pub(crate) fn delete(conn: &Connection, id: LayoutId) -> Result<()> {
    conn.execute("DELETE FROM layout_sheet WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheets_persist_as_json() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE layout_sheet (id TEXT PRIMARY KEY, body TEXT NOT NULL);")
            .unwrap();

        let mut sheet = LayoutSheet::a4("overview", vec![LayerId::from("LAYER_FEATURE_a")]);
        save(&conn, &sheet).unwrap();

        sheet.layers.clear();
        save(&conn, &sheet).unwrap();

        let loaded = load_all(&conn).unwrap();
        assert_eq!(loaded, vec![sheet.clone()]);

        delete(&conn, sheet.id).unwrap();
        assert!(load_all(&conn).unwrap().is_empty());
    }
}
