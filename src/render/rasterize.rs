//! Vector and raster drawing on top of `vello_cpu`.
//!
//! Feature and shapefile layers draw their geometries through a [`WorldTransform`] that
//! maps world coordinates of the requested envelope onto the pixel grid of the output
//! image (y axis pointing down). Paths are built in pixel space so stroke widths stay in
//! pixels. Polygons are filled even-odd with the style background and stroked with the
//! foreground; lines and points use the foreground only.
//!
//! The engine also composites partials through a [`Canvas`], one opacity layer per map
//! layer.

use geo::{Coord, Geometry, LineString, Polygon};
use vello_cpu::kurbo::{Affine, BezPath, Circle, Point, Rect, Shape, Stroke};
use vello_cpu::peniko::{Fill, ImageQuality, ImageSampler};
use vello_cpu::{Pixmap, RenderContext};

use crate::envelope::{Envelope, PixelSize};
use crate::errors::{ProjectError, Result};
use crate::project::style::{Color, Style};
use crate::render::image::RgbaImage;

/// Maps world coordinates of an envelope onto a pixel grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldTransform {
    pub min_x: f64,
    pub max_y: f64,
    /// World units per pixel, horizontally
    pub scale_x: f64,
    /// World units per pixel, vertically
    pub scale_y: f64,
}

impl WorldTransform {
    pub fn new(envelope: &Envelope, size: PixelSize) -> Self {
        let scale_x = if size.width == 0 { 0.0 } else { envelope.width() / size.width as f64 };
        let scale_y = if size.height == 0 { 0.0 } else { envelope.height() / size.height as f64 };
        Self { min_x: envelope.min_x, max_y: envelope.max_y, scale_x, scale_y }
    }

    /// World coordinate to (fractional) pixel coordinate.
    pub fn to_pixel(&self, c: Coord<f64>) -> (f64, f64) {
        let px = if self.scale_x > 0.0 { (c.x - self.min_x) / self.scale_x } else { 0.0 };
        let py = if self.scale_y > 0.0 { (self.max_y - c.y) / self.scale_y } else { 0.0 };
        (px, py)
    }

    /// Pixel coordinate to world coordinate.
    pub fn to_world(&self, px: f64, py: f64) -> Coord<f64> {
        Coord { x: self.min_x + px * self.scale_x, y: self.max_y - py * self.scale_y }
    }

    fn point(&self, c: Coord<f64>) -> Point {
        let (x, y) = self.to_pixel(c);
        Point::new(x, y)
    }
}

/// A pixel buffer being drawn into.
pub struct Canvas {
    ctx: RenderContext,
    width: u16,
    height: u16,
}

impl Canvas {
    pub fn new(size: PixelSize) -> Result<Self> {
        let (width, height) = match (u16::try_from(size.width), u16::try_from(size.height)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(ProjectError::Renderer(format!(
                    "cannot draw into a {}x{} canvas",
                    size.width, size.height
                )))
            }
        };
        Ok(Self { ctx: RenderContext::new(width, height), width, height })
    }

    pub fn size(&self) -> PixelSize {
        PixelSize::new(self.width as u32, self.height as u32)
    }

    pub fn fill_background(&mut self, color: Color) {
        if color.a == 0 {
            return;
        }
        self.ctx.reset_transform();
        self.ctx.set_paint(paint_color(color));
        self.ctx
            .fill_rect(&Rect::new(0.0, 0.0, self.width as f64, self.height as f64));
    }

    /// Draws one geometry with `style`.
    pub fn draw_geometry(&mut self, tr: &WorldTransform, geom: &Geometry<f64>, style: &Style) {
        self.ctx.reset_transform();
        match geom {
            Geometry::Point(p) => self.draw_point(tr, p.0, style),
            Geometry::MultiPoint(mp) => {
                for p in mp.iter() {
                    self.draw_point(tr, p.0, style);
                }
            }
            Geometry::Line(l) => {
                self.draw_line_string(tr, &LineString::from(vec![l.start, l.end]), style)
            }
            Geometry::LineString(ls) => self.draw_line_string(tr, ls, style),
            Geometry::MultiLineString(mls) => {
                for ls in mls.iter() {
                    self.draw_line_string(tr, ls, style);
                }
            }
            Geometry::Polygon(p) => self.draw_polygon(tr, p, style),
            Geometry::MultiPolygon(mp) => {
                for p in mp.iter() {
                    self.draw_polygon(tr, p, style);
                }
            }
            Geometry::Rect(r) => self.draw_polygon(tr, &r.to_polygon(), style),
            Geometry::Triangle(t) => self.draw_polygon(tr, &t.to_polygon(), style),
            Geometry::GeometryCollection(gc) => {
                for g in gc.iter() {
                    self.draw_geometry(tr, g, style);
                }
            }
        }
    }

    fn draw_point(&mut self, tr: &WorldTransform, c: Coord<f64>, style: &Style) {
        let radius = style.thickness.max(2) as f64 / 2.0;
        let circle = Circle::new(tr.point(c), radius).to_path(0.1);
        self.ctx.set_paint(paint_color(style.foreground));
        self.ctx.set_fill_rule(Fill::NonZero);
        self.ctx.fill_path(&circle);
    }

    fn draw_line_string(&mut self, tr: &WorldTransform, ls: &LineString<f64>, style: &Style) {
        let path = ring_path(tr, ls, false);
        if path.elements().is_empty() {
            return;
        }
        self.ctx.set_paint(paint_color(style.foreground));
        self.ctx.set_stroke(Stroke::new(style.thickness.max(1) as f64));
        self.ctx.stroke_path(&path);
    }

    fn draw_polygon(&mut self, tr: &WorldTransform, poly: &Polygon<f64>, style: &Style) {
        let mut path = BezPath::new();
        for ring in std::iter::once(poly.exterior()).chain(poly.interiors()) {
            path.extend(ring_path(tr, ring, true).elements().iter().copied());
        }
        if path.elements().is_empty() {
            return;
        }

        if style.background.a > 0 {
            self.ctx.set_paint(paint_color(style.background));
            self.ctx.set_fill_rule(Fill::EvenOdd);
            self.ctx.fill_path(&path);
        }
        if style.thickness > 0 && style.foreground.a > 0 {
            self.ctx.set_paint(paint_color(style.foreground));
            self.ctx.set_stroke(Stroke::new(style.thickness as f64));
            self.ctx.stroke_path(&path);
        }
    }

    /// Draws `img` stretched over the pixel rectangle at `(x, y)` of size `w` x `h`.
    pub fn draw_image(&mut self, img: &RgbaImage, x: f64, y: f64, w: f64, h: f64) {
        if w <= 0.0 || h <= 0.0 || img.width() == 0 || img.height() == 0 {
            return;
        }
        let (iw, ih) = (img.width() as f64, img.height() as f64);
        let paint = vello_cpu::Image {
            image: vello_cpu::ImageSource::Pixmap(img.pixmap().clone()),
            sampler: ImageSampler { quality: ImageQuality::Low, ..ImageSampler::default() },
        };

        self.ctx
            .set_transform(Affine::translate((x, y)) * Affine::scale_non_uniform(w / iw, h / ih));
        self.ctx.set_paint_transform(Affine::IDENTITY);
        self.ctx.set_paint(paint);
        self.ctx.fill_rect(&Rect::new(0.0, 0.0, iw, ih));
        self.ctx.reset_transform();
    }

    /// Everything drawn until the matching [`Canvas::pop_opacity`] is blended with `opacity`.
    pub fn push_opacity(&mut self, opacity: f32) {
        self.ctx.push_opacity_layer(opacity.clamp(0.0, 1.0));
    }

    pub fn pop_opacity(&mut self) {
        self.ctx.pop_layer();
    }

    pub fn finish(mut self) -> RgbaImage {
        self.ctx.flush();
        let mut pixmap = Pixmap::new(self.width, self.height);
        self.ctx.render_to_pixmap(&mut pixmap);
        RgbaImage::from_pixmap(pixmap)
    }
}

fn paint_color(color: Color) -> vello_cpu::peniko::Color {
    let [r, g, b, a] = color.to_rgba();
    vello_cpu::peniko::Color::from_rgba8(r, g, b, a)
}

fn ring_path(tr: &WorldTransform, ls: &LineString<f64>, close: bool) -> BezPath {
    let mut path = BezPath::new();
    let mut coords = ls.coords();
    let Some(first) = coords.next() else {
        return path;
    };
    path.move_to(tr.point(*first));
    for c in coords {
        path.line_to(tr.point(*c));
    }
    if close {
        path.close_path();
    }
    path
}
