//! Project and view configuration.
//!
//! [`ProjectConfig`] controls how a project opens its database and what it creates by
//! default. [`ViewConfig`] controls the rendering engine and the viewport controller:
//! partial tile size, zoom steps and tolerances. `ViewConfig` comes with a fluent
//! [`ViewConfig::builder()`] that validates values before handing out a config.
//!
//! # Examples
//!
//! ```rust
//! use abcmap_engine::config::ViewConfig;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = ViewConfig::builder()
//!     .partial_size(512)
//!     .zoom_in_divisor(10.0)
//!     .max_zoom_out_factor(4.0)
//!     .build()?;
//! assert_eq!(cfg.zoom_out_divisor(), 8.0);
//! # Ok(()) }
//! ```

use std::fmt;
use std::time::Duration;

use crate::envelope::Crs;
use crate::project::style::Color;

const DEFAULT_LAYER_NAME: &str = "First layer";

/// Capacity of the per-project event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// Name of the feature layer created when a project would otherwise have no layer
    pub default_layer_name: String,
    /// Coordinate reference system shared by all layers of a new project
    pub crs: Crs,
    /// How long SQLite waits on a locked database before failing
    pub busy_timeout: Duration,
    /// How long to wait for the (single) pooled connection
    pub connection_timeout: Duration,
    /// Capacity of the project event bus
    pub event_capacity: usize,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            default_layer_name: DEFAULT_LAYER_NAME.to_string(),
            crs: Crs::generic_2d(),
            busy_timeout: Duration::from_millis(500),
            connection_timeout: Duration::from_secs(5),
            event_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewConfig {
    /// Side of a rendered partial, in pixels
    pub partial_size: u32,
    /// A zoom-in step removes `width / zoom_in_divisor` on each side
    pub zoom_in_divisor: f64,
    /// Zooming out stops once the envelope is this many times wider than the project
    pub max_zoom_out_factor: f64,
    /// Maximum accepted difference between envelope and pixel aspect ratios
    pub aspect_tolerance: f64,
    /// Partial envelopes match when corners differ less than this fraction of a partial side
    pub match_tolerance: f64,
    /// Colour painted under all layers
    pub background: Color,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            partial_size: 256,
            zoom_in_divisor: 10.0,
            max_zoom_out_factor: 3.0,
            aspect_tolerance: 0.001,
            match_tolerance: 1e-6,
            background: Color::TRANSPARENT,
        }
    }
}

impl ViewConfig {
    pub fn builder() -> ViewConfigBuilder {
        ViewConfigBuilder::default()
    }

    /// Divisor of a zoom-out step.
    ///
    /// A zoom-in shrinks the width to `w * (1 - 2/a)`; zooming out with `b = a - 2` grows it
    /// back by `2/b`, landing on the exact same envelope and therefore on cached partials.
    pub fn zoom_out_divisor(&self) -> f64 {
        self.zoom_in_divisor - 2.0
    }
}

/// Builder for [`ViewConfig`].
#[derive(Debug, Clone, Default)]
pub struct ViewConfigBuilder {
    inner: ViewConfig,
}

impl ViewConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut ViewConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn partial_size(self, px: u32) -> Self { self.map(|c| c.partial_size = px) }
    pub fn zoom_in_divisor(self, d: f64) -> Self { self.map(|c| c.zoom_in_divisor = d) }
    pub fn max_zoom_out_factor(self, f: f64) -> Self { self.map(|c| c.max_zoom_out_factor = f) }
    pub fn aspect_tolerance(self, t: f64) -> Self { self.map(|c| c.aspect_tolerance = t) }
    pub fn match_tolerance(self, t: f64) -> Self { self.map(|c| c.match_tolerance = t) }
    pub fn background(self, color: Color) -> Self { self.map(|c| c.background = color) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut ViewConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<ViewConfig, ViewConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq)]
pub enum ViewConfigError {
    ZeroPartialSize,
    InvalidZoomDivisor(f64),
    InvalidZoomOutFactor(f64),
    InvalidTolerance(f64),
}

impl fmt::Display for ViewConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewConfigError::ZeroPartialSize =>
                write!(f, "partial_size must be at least 1 pixel"),
            ViewConfigError::InvalidZoomDivisor(d) =>
                write!(f, "zoom_in_divisor {d} must be greater than 2"),
            ViewConfigError::InvalidZoomOutFactor(z) =>
                write!(f, "max_zoom_out_factor {z} must be at least 1"),
            ViewConfigError::InvalidTolerance(t) =>
                write!(f, "tolerance {t} must be a finite positive number"),
        }
    }
}
impl std::error::Error for ViewConfigError {}

fn validate(c: &ViewConfig) -> Result<(), ViewConfigError> {
    if c.partial_size == 0 {
        return Err(ViewConfigError::ZeroPartialSize);
    }
    // the zoom-out divisor (a - 2) must stay positive
    if !(c.zoom_in_divisor.is_finite() && c.zoom_in_divisor > 2.0) {
        return Err(ViewConfigError::InvalidZoomDivisor(c.zoom_in_divisor));
    }
    if !(c.max_zoom_out_factor.is_finite() && c.max_zoom_out_factor >= 1.0) {
        return Err(ViewConfigError::InvalidZoomOutFactor(c.max_zoom_out_factor));
    }
    for t in [c.aspect_tolerance, c.match_tolerance] {
        if !(t.is_finite() && t > 0.0) {
            return Err(ViewConfigError::InvalidTolerance(t));
        }
    }
    Ok(())
}
