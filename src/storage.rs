//! Persistence for a project.
//!
//! A project lives in one SQLite database, opened through a [`ProjectDatabase`] handle.
//! The handle owns a pool with a single connection so every reader and writer of the
//! project is serialized, and multi-row mutations go through
//! [`ProjectDatabase::with_transaction`].
//!
//! # Tables
//!
//! - `layer_index`: one row per layer (identity, kind, name, visibility, zindex, opacity).
//! - `feature`: vector features of feature and shapefile layers.
//! - `tile_coverage`, `tile`: raw imagery of tile layers, see [`TileStorage`].
//! - `partial`, `partial_outline`: the rendered-partial cache, see
//!   [`RenderedPartialStore`](crate::render::RenderedPartialStore).
//! - `layout_sheet`: printable compositions.
//! - `project_metadata`: key/value pairs such as the project CRS.

/// SQLite database handle and schema.
pub mod database;
/// Raw tile storage backing tile layers.
pub mod tiles;

pub use database::ProjectDatabase;
pub use tiles::{StoredTile, TileId, TileStorage};
