//! Cached spatial rendering for map projects.
//!
//! A [`Project`] holds layers backed by a SQLite project file. The
//! [`CachedRenderingEngine`] renders them through a persistent cache of rendered partials
//! so that panning and zooming back over known areas reuses earlier work.

pub mod config;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod project;
pub mod render;
pub mod storage;

pub use config::{ProjectConfig, ViewConfig};
pub use envelope::{Crs, Envelope, PixelSize};
pub use errors::{ProjectError, Result};
pub use events::{EventBus, ProjectEvent, StructureChange, Subscription};
pub use project::{LayerId, LayerKind, Project, ProjectHandle};
pub use render::{CachedRenderingEngine, PrepareOutcome, RedrawRequest, RenderState, RenderedPartialStore};
