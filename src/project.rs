//! Project and layer model.
//!
//! A [`Project`] owns the layer collection and its paint order, the active layer, layout
//! sheets, the style library, the tile storage and the rendered-partial cache. Every
//! structural change is persisted immediately and announced on the project
//! [`EventBus`](crate::events::EventBus).
//!
//! # Example
//!
//! ```rust
//! use abcmap_engine::config::ProjectConfig;
//! use abcmap_engine::project::Project;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut project = Project::create_in_memory(ProjectConfig::default())?;
//! let roads = project.add_feature_layer("Roads", true, 1)?.id().clone();
//! project.move_layer_to_index(&roads, 0)?;
//! assert_eq!(project.layer_at(0)?.id(), &roads);
//! project.close();
//! # Ok(()) }
//! ```

pub mod layer;
pub mod layer_index;
pub mod layout;
mod project;
pub mod style;

pub use layer::{Layer, MapLayer, Renderable, RenderableHandle, ShapeSource};
pub use layer_index::{LayerId, LayerIndexEntry, LayerKind};
pub use layout::{LayoutId, LayoutSheet};
pub use project::{union_bounds, Project, ProjectHandle};
pub use style::{Color, Style, StyleLibrary};
