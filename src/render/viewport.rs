//! Viewport controller.
//!
//! A [`MapViewport`] pairs the world rectangle currently on screen with the pixel size of
//! the paint target. It implements the navigation rules of the map pane: zoom steps,
//! bounded zoom-out, panning by pixels, resetting to the project bounds and keeping the
//! world rectangle at the aspect ratio of the screen.
//!
//! # Examples
//!
//! ```
//! use abcmap_engine::config::ViewConfig;
//! use abcmap_engine::envelope::{Crs, Envelope, PixelSize};
//! use abcmap_engine::render::MapViewport;
//!
//! let mut vp = MapViewport::new(Crs::generic_2d(), PixelSize::new(800, 400), ViewConfig::default());
//! let bounds = Envelope::new(0.0, 0.0, 100.0, 100.0, Crs::generic_2d()).unwrap();
//! vp.reset_to(Some(&bounds)).unwrap();
//!
//! let before = vp.envelope().cloned().unwrap();
//! assert_eq!(before.height(), 50.0);
//!
//! vp.zoom_in();
//! vp.zoom_out(Some(bounds.width()));
//! assert!(vp.envelope().unwrap().approx_eq(&before, 1e-9));
//! ```

use geo::Coord;

use crate::config::ViewConfig;
use crate::envelope::{Crs, Envelope, PixelSize};
use crate::errors::{ProjectError, Result};
use crate::render::rasterize::WorldTransform;

#[derive(Clone, PartialEq)]
pub struct MapViewport {
    size: PixelSize,
    /// World rectangle on screen, unset until the first reset
    envelope: Option<Envelope>,
    crs: Crs,
    config: ViewConfig,
}

impl std::fmt::Debug for MapViewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.envelope {
            Some(e) => write!(
                f,
                "MapViewport {{ {}x{} px, [{}, {}, {}, {}] {} }}",
                self.size.width, self.size.height, e.min_x, e.min_y, e.max_x, e.max_y, self.crs
            ),
            None => write!(f, "MapViewport {{ {}x{} px, unset }}", self.size.width, self.size.height),
        }
    }
}

impl MapViewport {
    pub fn new(crs: Crs, size: PixelSize, config: ViewConfig) -> Self {
        Self { size, envelope: None, crs, config }
    }

    pub fn size(&self) -> PixelSize {
        self.size
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        self.envelope.as_ref()
    }

    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// Changes the pixel size. Degenerate sizes are rejected and leave the viewport as it
    /// was. Returns false when the size did not change.
    pub fn resize(&mut self, size: PixelSize) -> Result<bool> {
        if size.is_degenerate() {
            return Err(ProjectError::InvalidEnvelope(format!(
                "cannot resize viewport to {}x{}",
                size.width, size.height
            )));
        }
        if size == self.size {
            return Ok(false);
        }

        self.size = size;
        self.correct_aspect();
        Ok(true)
    }

    pub fn set_world_envelope(&mut self, envelope: Envelope) -> Result<()> {
        envelope.ensure_same_crs(&self.crs)?;
        if envelope.is_degenerate() {
            return Err(ProjectError::InvalidEnvelope(format!(
                "viewport envelope has no area: {}x{}",
                envelope.width(),
                envelope.height()
            )));
        }

        self.envelope = Some(envelope);
        self.correct_aspect();
        Ok(())
    }

    /// Shows the whole width of `bounds`, anchored at its top-left corner. Without bounds
    /// (an empty project) one world unit maps to one pixel from the origin.
    pub fn reset_to(&mut self, bounds: Option<&Envelope>) -> Result<()> {
        if self.size.is_degenerate() {
            return Err(ProjectError::InvalidEnvelope("viewport has no pixel size yet".into()));
        }

        let envelope = match bounds {
            Some(b) if b.width() > 0.0 => {
                b.ensure_same_crs(&self.crs)?;
                let width = b.width();
                let height = self.size.height as f64 * width / self.size.width as f64;
                Envelope::new(b.min_x, b.max_y - height, b.max_x, b.max_y, self.crs.clone())?
            }
            Some(b) => {
                // vertical line or single point, center a unit-scale view on it
                b.ensure_same_crs(&self.crs)?;
                let w = self.size.width as f64;
                let h = self.size.height as f64;
                Envelope::new(b.min_x - w / 2.0, b.max_y - h, b.min_x + w / 2.0, b.max_y, self.crs.clone())?
            }
            None => Envelope::new(
                0.0,
                0.0,
                self.size.width as f64,
                self.size.height as f64,
                self.crs.clone(),
            )?,
        };

        log::debug!("viewport reset to {:?}", envelope);
        self.envelope = Some(envelope);
        Ok(())
    }

    /// Shrinks the envelope by `width / zoom_in_divisor` on each side.
    pub fn zoom_in(&mut self) -> bool {
        let Some(env) = &self.envelope else {
            return false;
        };
        let step_w = env.width() / self.config.zoom_in_divisor;
        let step_h = env.height() * step_w / env.width();

        self.apply_zoom(-step_w, -step_h, None)
    }

    /// Grows the envelope by `width / zoom_out_divisor` on each side, which exactly undoes
    /// one zoom-in. Refused when the result would be at least `max_width` times the
    /// maximum zoom-out factor wide.
    pub fn zoom_out(&mut self, max_width: Option<f64>) -> bool {
        let Some(env) = &self.envelope else {
            return false;
        };
        let step_w = env.width() / self.config.zoom_out_divisor();
        let step_h = env.height() * step_w / env.width();

        self.apply_zoom(step_w, step_h, max_width)
    }

    fn apply_zoom(&mut self, step_w: f64, step_h: f64, max_width: Option<f64>) -> bool {
        let Some(env) = &self.envelope else {
            return false;
        };

        let zoomed = Envelope {
            min_x: env.min_x - step_w,
            min_y: env.min_y - step_h,
            max_x: env.max_x + step_w,
            max_y: env.max_y + step_h,
            crs: env.crs.clone(),
        };
        if zoomed.is_degenerate() {
            return false;
        }
        if let Some(max) = max_width {
            if zoomed.width() >= max * self.config.max_zoom_out_factor {
                log::debug!("zoom out refused, {} exceeds {} x {}", zoomed.width(), max, self.config.max_zoom_out_factor);
                return false;
            }
        }

        self.envelope = Some(zoomed);
        self.correct_aspect();
        true
    }

    /// Moves the view by a pixel offset. Positive `dy` moves towards the bottom of the screen.
    pub fn pan(&mut self, dx: f64, dy: f64) -> bool {
        let Some(scale) = self.scale() else {
            return false;
        };
        let Some(env) = &self.envelope else {
            return false;
        };
        if dx == 0.0 && dy == 0.0 {
            return false;
        }

        let scale_y = env.height() / self.size.height as f64;
        self.envelope = Some(env.translated(dx * scale, -dy * scale_y));
        true
    }

    /// Recomputes the envelope height from its width when its ratio drifted away from the
    /// pixel ratio. The minimum corner stays in place.
    pub fn correct_aspect(&mut self) -> bool {
        let ratio = self.size.aspect_ratio();
        let Some(env) = self.envelope.as_mut() else {
            return false;
        };
        if ratio <= 0.0 || (env.aspect_ratio() - ratio).abs() <= self.config.aspect_tolerance {
            return false;
        }

        env.max_y = env.min_y + env.width() / ratio;
        true
    }

    /// World units per pixel, horizontally.
    pub fn scale(&self) -> Option<f64> {
        match &self.envelope {
            Some(env) if !self.size.is_degenerate() => Some(env.width() / self.size.width as f64),
            _ => None,
        }
    }

    pub fn transform(&self) -> Option<WorldTransform> {
        match &self.envelope {
            Some(env) if !self.size.is_degenerate() => Some(WorldTransform::new(env, self.size)),
            _ => None,
        }
    }

    pub fn screen_to_world(&self, px: f64, py: f64) -> Option<Coord<f64>> {
        self.transform().map(|tr| tr.to_world(px, py))
    }

    pub fn world_to_screen(&self, c: Coord<f64>) -> Option<(f64, f64)> {
        self.transform().map(|tr| tr.to_pixel(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope::new(min_x, min_y, max_x, max_y, Crs::generic_2d()).unwrap()
    }

    fn viewport(w: u32, h: u32) -> MapViewport {
        MapViewport::new(Crs::generic_2d(), PixelSize::new(w, h), ViewConfig::default())
    }

    #[test]
    fn reset_anchors_top_left_of_bounds() {
        let mut vp = viewport(200, 100);
        vp.reset_to(Some(&env(10.0, 0.0, 110.0, 80.0))).unwrap();

        assert_eq!(vp.envelope().cloned(), Some(env(10.0, 30.0, 110.0, 80.0)));
        assert_eq!(vp.scale(), Some(0.5));
    }

    #[test]
    fn reset_without_bounds_uses_unit_scale() {
        let mut vp = viewport(40, 20);
        vp.reset_to(None).unwrap();
        assert_eq!(vp.envelope().cloned(), Some(env(0.0, 0.0, 40.0, 20.0)));
    }

    #[test]
    fn zoom_in_then_out_restores_envelope() {
        let mut vp = viewport(100, 100);
        vp.set_world_envelope(env(-50.0, -50.0, 50.0, 50.0)).unwrap();
        let before = vp.envelope().cloned().unwrap();

        assert!(vp.zoom_in());
        let zoomed = vp.envelope().cloned().unwrap();
        assert!(zoomed.approx_eq(&env(-40.0, -40.0, 40.0, 40.0), 1e-9));

        assert!(vp.zoom_out(Some(100.0)));
        assert!(vp.envelope().unwrap().approx_eq(&before, 1e-9));
    }

    #[test]
    fn zoom_out_is_bounded_by_project_width() {
        let mut vp = viewport(100, 100);
        vp.set_world_envelope(env(0.0, 0.0, 250.0, 250.0)).unwrap();

        // 250 + 2 * 250 / 8 = 312.5 >= 100 * 3
        assert!(!vp.zoom_out(Some(100.0)));
        assert_eq!(vp.envelope().cloned(), Some(env(0.0, 0.0, 250.0, 250.0)));

        assert!(vp.zoom_out(None));
    }

    #[test]
    fn degenerate_resize_is_rejected() {
        let mut vp = viewport(100, 50);
        vp.set_world_envelope(env(0.0, 0.0, 100.0, 50.0)).unwrap();
        let before = vp.clone();

        assert!(matches!(vp.resize(PixelSize::new(0, 50)), Err(ProjectError::InvalidEnvelope(_))));
        assert_eq!(vp, before);
        assert!(!vp.resize(PixelSize::new(100, 50)).unwrap());
    }

    #[test]
    fn resize_corrects_aspect_from_min_corner() {
        let mut vp = viewport(100, 100);
        vp.set_world_envelope(env(10.0, 20.0, 110.0, 120.0)).unwrap();

        assert!(vp.resize(PixelSize::new(200, 100)).unwrap());
        assert_eq!(vp.envelope().cloned(), Some(env(10.0, 20.0, 110.0, 70.0)));
    }

    #[test]
    fn set_world_envelope_checks_crs() {
        let mut vp = viewport(10, 10);
        let other = Envelope::new(0.0, 0.0, 1.0, 1.0, Crs::new("EPSG:4326")).unwrap();
        assert!(vp.set_world_envelope(other).is_err());
        assert!(vp.envelope().is_none());
    }

    #[test]
    fn pan_moves_by_pixels() {
        let mut vp = viewport(100, 100);
        vp.set_world_envelope(env(0.0, 0.0, 200.0, 200.0)).unwrap();

        assert!(vp.pan(10.0, 5.0));
        assert_eq!(vp.envelope().cloned(), Some(env(20.0, -10.0, 220.0, 190.0)));
        assert!(!vp.pan(0.0, 0.0));
    }

    #[test]
    fn screen_world_transforms() {
        let mut vp = viewport(100, 50);
        vp.set_world_envelope(env(0.0, 0.0, 10.0, 5.0)).unwrap();

        let c = vp.screen_to_world(0.0, 0.0).unwrap();
        assert_eq!((c.x, c.y), (0.0, 5.0));
        assert_eq!(vp.world_to_screen(Coord { x: 10.0, y: 0.0 }), Some((100.0, 50.0)));
    }
}
