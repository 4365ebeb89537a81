//! Cached rendering engine.
//!
//! The engine turns "show this world rectangle at this pixel size" into a composite
//! image, reusing rendered partials from the project cache wherever it can.
//!
//! Work is split in two phases:
//!
//! * [`CachedRenderingEngine::prepare`] resolves the request into a grid of partials per
//!   visible layer, renders only the cells missing from the cache, commits them in one
//!   transaction and composites the result.
//! * [`CachedRenderingEngine::paint`] hands the last composite to a [`Surface`]. It never
//!   renders and never touches storage.
//!
//! The engine listens to the project event bus. [`CachedRenderingEngine::pump_events`]
//! drains it and tells the host whether a repaint or a new preparation is needed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLockReadGuard};

use tokio::sync::broadcast::error::TryRecvError;

use crate::config::ViewConfig;
use crate::envelope::{Envelope, PixelSize};
use crate::errors::{ProjectError, Result};
use crate::events::Subscription;
use crate::project::layer::{MapLayer, RenderableHandle};
use crate::project::layer_index::LayerId;
use crate::project::{Project, ProjectHandle};
use crate::render::image::RgbaImage;
use crate::render::partial::RenderedPartial;
use crate::render::rasterize::Canvas;
use crate::render::surface::Surface;
use crate::render::viewport::MapViewport;

/// Slack applied before rounding grid indices, so envelopes that landed a few ulps away
/// from a grid line after zooming resolve to the same cells.
const GRID_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// Nothing was prepared yet
    NeedsReset,
    /// The composite is outdated and a preparation is pending or running
    Preparing,
    /// A composite is available for painting
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Everything came from the cache, nothing was written
    Reused,
    /// Some partials were rendered and committed
    Rendered { new_partials: usize },
    /// A newer request arrived, nothing was committed
    Superseded,
    /// Rendering or storage failed; the previous composite is kept
    Failed,
}

/// What the host should do after draining project events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RedrawRequest {
    None,
    Repaint,
    Prepare,
}

/// Generation counter shared between the engine and whoever drives it.
///
/// Every `prepare` takes a new generation. Calling [`RequestToken::supersede`] from any
/// thread bumps the counter; an in-flight `prepare` notices and drops its work before
/// committing anything.
#[derive(Debug, Clone, Default)]
pub struct RequestToken(Arc<AtomicU64>);

impl RequestToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation and returns it.
    pub fn supersede(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn generation(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }
}

/// The world-aligned grid of partials covering a request.
#[derive(Debug, Clone)]
struct PartialGrid {
    cell_size: PixelSize,
    side_x: f64,
    side_y: f64,
    cols: std::ops::Range<i64>,
    rows: std::ops::Range<i64>,
}

impl PartialGrid {
    fn new(envelope: &Envelope, size: PixelSize, partial_px: u32) -> Self {
        let scale_x = envelope.width() / size.width as f64;
        let scale_y = envelope.height() / size.height as f64;
        let side_x = partial_px as f64 * scale_x;
        let side_y = partial_px as f64 * scale_y;

        let first = |min: f64, side: f64| (min / side + GRID_EPSILON).floor() as i64;
        let last = |max: f64, side: f64| (max / side - GRID_EPSILON).ceil() as i64;

        Self {
            cell_size: PixelSize::new(partial_px, partial_px),
            side_x,
            side_y,
            cols: first(envelope.min_x, side_x)..last(envelope.max_x, side_x),
            rows: first(envelope.min_y, side_y)..last(envelope.max_y, side_y),
        }
    }

    fn cells<'a>(&'a self, template: &'a Envelope) -> impl Iterator<Item = Envelope> + 'a {
        self.rows.clone().flat_map(move |r| {
            self.cols.clone().map(move |c| Envelope {
                min_x: c as f64 * self.side_x,
                min_y: r as f64 * self.side_y,
                max_x: (c + 1) as f64 * self.side_x,
                max_y: (r + 1) as f64 * self.side_y,
                crs: template.crs.clone(),
            })
        })
    }

    fn len(&self) -> usize {
        (self.cols.end - self.cols.start).max(0) as usize * (self.rows.end - self.rows.start).max(0) as usize
    }
}

struct LayerJob {
    id: LayerId,
    opacity: f32,
    renderable: RenderableHandle,
}

struct Prepared {
    envelope: Envelope,
    size: PixelSize,
    image: RgbaImage,
}

/// Prepares and paints map composites for one view of a project.
pub struct CachedRenderingEngine {
    project: ProjectHandle,
    config: ViewConfig,
    viewport: MapViewport,
    state: RenderState,
    composite: Option<Prepared>,
    /// False once something invalidated the composite
    fresh: bool,
    subscription: Subscription,
    token: RequestToken,
}

impl std::fmt::Debug for CachedRenderingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRenderingEngine")
            .field("state", &self.state)
            .field("viewport", &self.viewport)
            .field("fresh", &self.fresh)
            .field("generation", &self.token.generation())
            .finish()
    }
}

impl CachedRenderingEngine {
    pub fn new(project: ProjectHandle, config: ViewConfig, size: PixelSize) -> Result<Self> {
        let (crs, subscription) = {
            let p = project.read()?;
            (p.crs().clone(), p.subscribe())
        };
        let viewport = MapViewport::new(crs, size, config.clone());

        Ok(Self {
            project,
            config,
            viewport,
            state: RenderState::NeedsReset,
            composite: None,
            fresh: false,
            subscription,
            token: RequestToken::new(),
        })
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn viewport(&self) -> &MapViewport {
        &self.viewport
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// A clone of the token; superseding it cancels the running `prepare`.
    pub fn request_token(&self) -> RequestToken {
        self.token.clone()
    }

    /// The last prepared composite, if any.
    pub fn composite(&self) -> Option<&RgbaImage> {
        self.composite.as_ref().map(|p| &p.image)
    }

    fn read_project(&self) -> Result<RwLockReadGuard<'_, Project>> {
        Ok(self.project.read()?)
    }

    /// Makes the composite for `envelope` at `size` ready for painting.
    ///
    /// Invalid requests (no area, wrong CRS) are errors. Rendering and storage failures
    /// are logged and reported as [`PrepareOutcome::Failed`]; the previous composite stays
    /// paintable.
    pub fn prepare(&mut self, envelope: &Envelope, size: PixelSize) -> Result<PrepareOutcome> {
        let generation = self.token.supersede();
        self.prepare_generation(envelope, size, generation)
    }

    fn prepare_generation(&mut self, envelope: &Envelope, size: PixelSize, generation: u64) -> Result<PrepareOutcome> {
        if size.is_degenerate() || envelope.is_degenerate() {
            return Err(ProjectError::InvalidEnvelope(format!(
                "cannot prepare {}x{} world units at {}x{} px",
                envelope.width(),
                envelope.height(),
                size.width,
                size.height
            )));
        }
        if size.width > u16::MAX as u32 || size.height > u16::MAX as u32 {
            return Err(ProjectError::InvalidEnvelope(format!(
                "{}x{} px exceeds the raster limit",
                size.width, size.height
            )));
        }
        envelope.ensure_same_crs(self.viewport.crs())?;

        self.pump_events();

        if self.state == RenderState::Ready && self.fresh && self.is_prepared(envelope, size) {
            log::trace!("prepare: composite for {:?} is current", envelope);
            return Ok(PrepareOutcome::Reused);
        }

        self.state = RenderState::Preparing;
        match self.build(envelope, size, generation) {
            Ok(Some((image, new_partials))) => {
                self.composite = Some(Prepared { envelope: envelope.clone(), size, image });
                self.fresh = true;
                self.state = RenderState::Ready;
                if new_partials == 0 {
                    Ok(PrepareOutcome::Reused)
                } else {
                    Ok(PrepareOutcome::Rendered { new_partials })
                }
            }
            Ok(None) => {
                log::debug!("prepare: generation {} superseded, discarding", generation);
                self.settle_after_abort();
                Ok(PrepareOutcome::Superseded)
            }
            Err(e) => {
                log::error!("prepare failed for {:?}: {}", envelope, e);
                self.settle_after_abort();
                Ok(PrepareOutcome::Failed)
            }
        }
    }

    fn is_prepared(&self, envelope: &Envelope, size: PixelSize) -> bool {
        self.composite.as_ref().is_some_and(|p| {
            p.size == size && p.envelope.approx_eq(envelope, self.config.match_tolerance * envelope.width())
        })
    }

    /// An aborted preparation leaves the old composite paintable but outdated.
    fn settle_after_abort(&mut self) {
        self.fresh = false;
        self.state = if self.composite.is_some() { RenderState::Ready } else { RenderState::NeedsReset };
    }

    /// Renders missing partials and composites. `None` when superseded.
    fn build(&self, envelope: &Envelope, size: PixelSize, generation: u64) -> Result<Option<(RgbaImage, usize)>> {
        let (jobs, store) = {
            let project = self.read_project()?;
            let jobs = project
                .layers_by_zindex()
                .iter()
                .filter(|l| l.is_visible())
                .map(|l| LayerJob { id: l.id().clone(), opacity: l.opacity(), renderable: l.renderable() })
                .collect::<Vec<_>>();
            (jobs, Arc::clone(project.partial_store()))
        };

        let grid = PartialGrid::new(envelope, size, self.config.partial_size);
        log::debug!(
            "prepare: {} layer(s), {} cell(s) each, generation {}",
            jobs.len(),
            grid.len(),
            generation
        );

        let mut rendered = Vec::new();
        let mut layers = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let cached = store.partials_for_layer_intersecting(&job.id, envelope);
            let mut pieces = Vec::with_capacity(grid.len());

            for cell in grid.cells(envelope) {
                let tolerance = self.config.match_tolerance;
                if let Some(hit) = cached.iter().find(|p| p.matches(&job.id, &cell, grid.cell_size, tolerance)) {
                    pieces.push((cell, Arc::clone(&hit.image)));
                    continue;
                }

                if !self.token.is_current(generation) {
                    return Ok(None);
                }
                let image = job.renderable.render(&cell, grid.cell_size)?;
                let partial = RenderedPartial::new(job.id.clone(), image, cell.clone());
                pieces.push((cell, Arc::clone(&partial.image)));
                rendered.push(partial);
            }
            layers.push((job.opacity, pieces));
        }

        if !self.token.is_current(generation) {
            return Ok(None);
        }
        let new_partials = rendered.len();
        if new_partials > 0 {
            store.add_partials(rendered)?;
        }

        let scale_x = envelope.width() / size.width as f64;
        let scale_y = envelope.height() / size.height as f64;
        let (cell_w, cell_h) = (grid.cell_size.width as f64, grid.cell_size.height as f64);
        let mut canvas = Canvas::new(size)?;
        canvas.fill_background(self.config.background);
        for (opacity, pieces) in &layers {
            let faded = *opacity < 1.0;
            if faded {
                canvas.push_opacity(*opacity);
            }
            for (cell, tile) in pieces {
                // cells are exactly one partial wide, snap them to whole pixels
                let x = ((cell.min_x - envelope.min_x) / scale_x).round();
                let y = ((envelope.max_y - cell.max_y) / scale_y).round();
                canvas.draw_image(tile, x, y, cell_w, cell_h);
            }
            if faded {
                canvas.pop_opacity();
            }
        }
        let image = canvas.finish();

        Ok(Some((image, new_partials)))
    }

    /// Presents the last composite. Returns false when nothing was prepared yet or the
    /// composite is being rebuilt.
    pub fn paint(&self, surface: &mut dyn Surface) -> bool {
        if self.state != RenderState::Ready {
            return false;
        }
        let Some(prepared) = &self.composite else {
            return false;
        };

        if surface.size() != prepared.size {
            log::debug!(
                "painting {}x{} composite on a {}x{} surface",
                prepared.size.width,
                prepared.size.height,
                surface.size().width,
                surface.size().height
            );
        }
        match surface.present(&prepared.image) {
            Ok(()) => true,
            Err(e) => {
                log::error!("paint failed: {:#}", e);
                false
            }
        }
    }

    /// Marks the composite as outdated.
    pub fn invalidate(&mut self) {
        self.fresh = false;
        if self.state == RenderState::Ready {
            self.state = RenderState::Preparing;
        }
    }

    /// Drains project events. New partials only need a repaint; deletions, structure
    /// changes and missed events need a new preparation and invalidate the composite.
    pub fn pump_events(&mut self) -> RedrawRequest {
        let mut request = RedrawRequest::None;
        loop {
            match self.subscription.try_recv() {
                Ok(ev) => {
                    let needed = if ev.needs_prepare() { RedrawRequest::Prepare } else { RedrawRequest::Repaint };
                    request = request.max(needed);
                }
                Err(TryRecvError::Lagged(missed)) => {
                    log::warn!("engine missed {} project events", missed);
                    request = RedrawRequest::Prepare;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        if request == RedrawRequest::Prepare {
            self.invalidate();
        }
        request
    }

    // ---------- Navigation ----------

    fn max_bounds(&self) -> Result<Option<Envelope>> {
        self.read_project()?.maximum_bounds()
    }

    /// Rejects degenerate sizes without touching the engine state.
    pub fn resize(&mut self, size: PixelSize) -> Result<bool> {
        let changed = self.viewport.resize(size)?;
        if changed {
            self.invalidate();
        }
        Ok(changed)
    }

    /// Shows the whole project width.
    pub fn reset_display(&mut self) -> Result<()> {
        let bounds = self.max_bounds()?;
        self.viewport.reset_to(bounds.as_ref())?;
        self.invalidate();
        Ok(())
    }

    pub fn set_world_envelope(&mut self, envelope: Envelope) -> Result<()> {
        self.viewport.set_world_envelope(envelope)?;
        self.invalidate();
        Ok(())
    }

    pub fn zoom_in(&mut self) -> bool {
        let changed = self.viewport.zoom_in();
        if changed {
            self.invalidate();
        }
        changed
    }

    /// Zooms out unless the view would grow past the configured multiple of the project
    /// width.
    pub fn zoom_out(&mut self) -> Result<bool> {
        let max_width = self.max_bounds()?.map(|b| b.width()).filter(|w| *w > 0.0);
        let changed = self.viewport.zoom_out(max_width);
        if changed {
            self.invalidate();
        }
        Ok(changed)
    }

    pub fn pan(&mut self, dx: f64, dy: f64) -> bool {
        let changed = self.viewport.pan(dx, dy);
        if changed {
            self.invalidate();
        }
        changed
    }

    /// Prepares the current viewport, resetting it to the project bounds first if it was
    /// never positioned.
    pub fn refresh(&mut self) -> Result<PrepareOutcome> {
        if self.viewport.envelope().is_none() {
            self.reset_display()?;
        }
        let envelope = match self.viewport.envelope() {
            Some(e) => e.clone(),
            None => return Err(ProjectError::InvalidEnvelope("viewport has no envelope".into())),
        };
        let size = self.viewport.size();
        self.prepare(&envelope, size)
    }
}
