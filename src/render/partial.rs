//! Rendered partials and their outlines.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use geo::Polygon;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{Envelope, PixelSize};
use crate::errors::{ProjectError, Result};
use crate::project::layer_index::LayerId;
use crate::render::image::RgbaImage;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialId(Uuid);

impl PartialId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PartialId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PartialId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for PartialId {
    type Err = ProjectError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProjectError::Storage(format!("invalid partial id {s:?}: {e}")))
    }
}

impl Display for PartialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raster rendering of one layer over one envelope at one scale.
///
/// Partials are immutable once created; the store and the engine share them as
/// `Arc<RenderedPartial>`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPartial {
    pub id: PartialId,
    pub layer: LayerId,
    pub image: Arc<RgbaImage>,
    pub envelope: Envelope,
    pub width: u32,
    pub height: u32,
}

impl RenderedPartial {
    pub fn new(layer: LayerId, image: RgbaImage, envelope: Envelope) -> Self {
        Self {
            id: PartialId::new(),
            layer,
            width: image.width(),
            height: image.height(),
            image: Arc::new(image),
            envelope,
        }
    }

    pub fn pixel_size(&self) -> PixelSize {
        PixelSize::new(self.width, self.height)
    }

    /// World units per pixel, horizontally.
    pub fn scale(&self) -> f64 {
        if self.width == 0 {
            0.0
        } else {
            self.envelope.width() / self.width as f64
        }
    }

    pub fn outline(&self) -> PartialOutline {
        PartialOutline {
            partial: self.id,
            layer: self.layer.clone(),
            footprint: self.envelope.to_polygon(),
        }
    }

    /// True when this partial covers `envelope` of `layer` at `size` pixels. Corners may
    /// differ by `tolerance` times the envelope width.
    pub fn matches(&self, layer: &LayerId, envelope: &Envelope, size: PixelSize, tolerance: f64) -> bool {
        &self.layer == layer
            && self.pixel_size() == size
            && self.envelope.approx_eq(envelope, tolerance * envelope.width().abs())
    }
}

/// Footprint of a partial, stored next to it so overlap queries never touch image data.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialOutline {
    pub partial: PartialId,
    pub layer: LayerId,
    pub footprint: Polygon<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Crs;

    #[test]
    fn matching_uses_layer_size_and_envelope() {
        let env = Envelope::new(0.0, 0.0, 30.0, 30.0, Crs::generic_2d()).unwrap();
        let p = RenderedPartial::new(LayerId::from("L"), RgbaImage::new(30, 30), env.clone());
        let size = PixelSize::new(30, 30);

        assert!(p.matches(&LayerId::from("L"), &env, size, 1e-6));
        assert!(p.matches(&LayerId::from("L"), &env.translated(1e-7, 0.0), size, 1e-6));
        assert!(!p.matches(&LayerId::from("M"), &env, size, 1e-6));
        assert!(!p.matches(&LayerId::from("L"), &env, PixelSize::new(60, 60), 1e-6));
        assert!(!p.matches(&LayerId::from("L"), &env.translated(1.0, 0.0), size, 1e-6));
        assert_eq!(p.scale(), 1.0);
    }

    #[test]
    fn ids_parse_strictly() {
        let id = PartialId::new();
        assert_eq!(id.to_string().parse::<PartialId>().unwrap(), id);
        assert!(matches!("not-a-uuid".parse::<PartialId>(), Err(ProjectError::Storage(_))));
        assert!("".parse::<PartialId>().is_err());
    }
}
