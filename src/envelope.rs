//! World-space rectangles and pixel dimensions.
//!
//! An [`Envelope`] is an axis-aligned rectangle in world coordinates tagged with the
//! [`Crs`] its coordinates are expressed in. A [`PixelSize`] is the size of a raster
//! target. Together they define what the rendering engine is asked to draw and at which
//! scale.

use std::fmt::Display;

use geo::{coord, Polygon, Rect};
use serde::{Deserialize, Serialize};

use crate::errors::{ProjectError, Result};

/// Coordinate reference system, identified by its authority code (ie: `EPSG:4326`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Crs(String);

impl Crs {
    /// Generic cartesian 2D system used by new projects.
    pub const GENERIC_2D: &'static str = "EPSG:404000";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn generic_2d() -> Self {
        Self(Self::GENERIC_2D.to_string())
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl Default for Crs {
    fn default() -> Self {
        Self::generic_2d()
    }
}

impl Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned rectangle in world coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub crs: Crs,
}

impl Envelope {
    /// Creates an envelope, rejecting non-finite or inverted coordinates.
    ///
    /// Zero-width or zero-height envelopes are accepted here (a single point feature has
    /// such bounds); callers that need an area check [`Envelope::is_degenerate`].
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64, crs: Crs) -> Result<Self> {
        if ![min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite()) {
            return Err(ProjectError::InvalidEnvelope(format!(
                "non-finite coordinates ({min_x}, {min_y}, {max_x}, {max_y})"
            )));
        }
        if min_x > max_x || min_y > max_y {
            return Err(ProjectError::InvalidEnvelope(format!(
                "inverted coordinates ({min_x}, {min_y}, {max_x}, {max_y})"
            )));
        }

        Ok(Self { min_x, min_y, max_x, max_y, crs })
    }

    /// Builds the bounding envelope of a `geo` rectangle.
    pub fn from_rect(rect: Rect<f64>, crs: Crs) -> Self {
        let min = rect.min();
        let max = rect.max();
        Self { min_x: min.x, min_y: min.y, max_x: max.x, max_y: max.y, crs }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Width divided by height, `0.0` for a flat envelope.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height() <= 0.0 {
            0.0
        } else {
            self.width() / self.height()
        }
    }

    /// True when the envelope has no area.
    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    /// Closed rectangle overlap test: touching edges count as intersecting.
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains(&self, other: &Envelope) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    /// Widens this envelope so it also covers `other`. Never narrows.
    pub fn expand_to_include(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut out = self.clone();
        out.expand_to_include(other);
        out
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Envelope {
        Envelope {
            min_x: self.min_x + dx,
            min_y: self.min_y + dy,
            max_x: self.max_x + dx,
            max_y: self.max_y + dy,
            crs: self.crs.clone(),
        }
    }

    /// Compares corners with an absolute tolerance, CRS must be identical.
    pub fn approx_eq(&self, other: &Envelope, tolerance: f64) -> bool {
        self.crs == other.crs
            && (self.min_x - other.min_x).abs() <= tolerance
            && (self.min_y - other.min_y).abs() <= tolerance
            && (self.max_x - other.max_x).abs() <= tolerance
            && (self.max_y - other.max_y).abs() <= tolerance
    }

    /// Fails with `InvalidEnvelope` when `other` is expressed in another CRS.
    pub fn ensure_same_crs(&self, crs: &Crs) -> Result<()> {
        if &self.crs != crs {
            return Err(ProjectError::InvalidEnvelope(format!(
                "coordinate reference systems differ: {} / {}",
                self.crs, crs
            )));
        }
        Ok(())
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.min_x, y: self.min_y },
            coord! { x: self.max_x, y: self.max_y },
        )
    }

    /// Footprint polygon of the envelope, as stored in partial outlines.
    pub fn to_polygon(&self) -> Polygon<f64> {
        self.to_rect().to_polygon()
    }
}

impl Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Envelope[{}, {} : {}, {} ({})]",
            self.min_x, self.min_y, self.max_x, self.max_y, self.crs
        )
    }
}

/// Size of a raster target in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns `0.0` if `height` is `0` to avoid division by zero.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}
