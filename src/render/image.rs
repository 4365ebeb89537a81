//! RGBA8 raster images.
//!
//! [`RgbaImage`] is the payload of rendered partials and stored tiles, and the composite
//! the engine paints. It wraps a shared [`vello_cpu::Pixmap`], which keeps premultiplied
//! pixels so it can be drawn directly as an image paint. Accessors and PNG blobs use
//! straight alpha.

use std::io::Cursor;
use std::sync::Arc;

use vello_cpu::Pixmap;

use crate::errors::{ProjectError, Result};
use crate::project::style::Color;

const BYTES_PER_PIXEL: usize = 4;

#[derive(Clone)]
pub struct RgbaImage {
    pixmap: Arc<Pixmap>,
}

impl RgbaImage {
    /// Fully transparent image. Dimensions are clamped to `u16::MAX`, the raster limit.
    pub fn new(width: u32, height: u32) -> Self {
        Self::from_pixmap(Pixmap::new(clamp_dim(width), clamp_dim(height)))
    }

    pub fn filled(width: u32, height: u32, color: Color) -> Self {
        let mut img = Self::new(width, height);
        img.fill(color);
        img
    }

    pub fn from_pixmap(pixmap: Pixmap) -> Self {
        Self { pixmap: Arc::new(pixmap) }
    }

    /// Builds an image from straight-alpha RGBA bytes, row-major without padding.
    pub fn from_raw(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(ProjectError::Renderer(format!(
                "pixel buffer of {} bytes does not match {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        let (w, h) = match (u16::try_from(width), u16::try_from(height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => {
                return Err(ProjectError::Renderer(format!(
                    "image of {width}x{height} exceeds the raster limit"
                )))
            }
        };

        let mut pixmap = Pixmap::new(w, h);
        for (dst, src) in pixmap
            .data_as_u8_slice_mut()
            .chunks_exact_mut(BYTES_PER_PIXEL)
            .zip(pixels.chunks_exact(BYTES_PER_PIXEL))
        {
            dst.copy_from_slice(&premultiply([src[0], src[1], src[2], src[3]]));
        }
        Ok(Self::from_pixmap(pixmap))
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width() as u32
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height() as u32
    }

    pub fn pixmap(&self) -> &Arc<Pixmap> {
        &self.pixmap
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width() || y >= self.height() {
            return None;
        }
        Some((y as usize * self.width() as usize + x as usize) * BYTES_PER_PIXEL)
    }

    /// Straight-alpha value of one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let o = self.offset(x, y)?;
        let px = &self.pixmap.data_as_u8_slice()[o..o + BYTES_PER_PIXEL];
        Some(unpremultiply([px[0], px[1], px[2], px[3]]))
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let Some(o) = self.offset(x, y) else {
            return;
        };
        let data = Arc::make_mut(&mut self.pixmap).data_as_u8_slice_mut();
        data[o..o + BYTES_PER_PIXEL].copy_from_slice(&premultiply(rgba));
    }

    pub fn fill(&mut self, color: Color) {
        let rgba = premultiply(color.to_rgba());
        for px in Arc::make_mut(&mut self.pixmap)
            .data_as_u8_slice_mut()
            .chunks_exact_mut(BYTES_PER_PIXEL)
        {
            px.copy_from_slice(&rgba);
        }
    }

    /// True when every pixel is fully transparent.
    pub fn is_transparent(&self) -> bool {
        self.pixmap
            .data_as_u8_slice()
            .chunks_exact(BYTES_PER_PIXEL)
            .all(|px| px[3] == 0)
    }

    /// Straight-alpha bytes of the whole image.
    pub fn to_straight_rgba(&self) -> Vec<u8> {
        self.pixmap
            .data_as_u8_slice()
            .chunks_exact(BYTES_PER_PIXEL)
            .flat_map(|px| unpremultiply([px[0], px[1], px[2], px[3]]))
            .collect()
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut buf, self.width(), self.height());
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header()?;
            writer.write_image_data(&self.to_straight_rgba())?;
            writer.finish()?;
        }
        Ok(buf)
    }

    pub fn decode_png(bytes: &[u8]) -> Result<Self> {
        let mut decoder = png::Decoder::new(Cursor::new(bytes));
        decoder.set_transformations(png::Transformations::normalize_to_color8());
        let mut reader = decoder.read_info()?;
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf)?;
        buf.truncate(info.buffer_size());

        let pixels = match info.color_type {
            png::ColorType::Rgba => buf,
            png::ColorType::Rgb => buf
                .chunks_exact(3)
                .flat_map(|c| [c[0], c[1], c[2], 0xff])
                .collect(),
            png::ColorType::GrayscaleAlpha => buf
                .chunks_exact(2)
                .flat_map(|c| [c[0], c[0], c[0], c[1]])
                .collect(),
            png::ColorType::Grayscale => buf.iter().flat_map(|&g| [g, g, g, 0xff]).collect(),
            other => {
                return Err(ProjectError::Storage(format!(
                    "unsupported png color type {other:?}"
                )))
            }
        };

        Self::from_raw(pixels, info.width, info.height)
    }
}

impl PartialEq for RgbaImage {
    fn eq(&self, other: &Self) -> bool {
        self.width() == other.width()
            && self.height() == other.height()
            && self.pixmap.data_as_u8_slice() == other.pixmap.data_as_u8_slice()
    }
}

impl std::fmt::Debug for RgbaImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbaImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

fn clamp_dim(v: u32) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

pub(crate) fn premultiply(rgba: [u8; 4]) -> [u8; 4] {
    let [r, g, b, a] = rgba;
    let a16 = u16::from(a);
    let premul = |c: u8| -> u8 { ((u16::from(c) * a16 + 127) / 255) as u8 };
    [premul(r), premul(g), premul(b), a]
}

fn unpremultiply(rgba: [u8; 4]) -> [u8; 4] {
    let [r, g, b, a] = rgba;
    if a == 0 {
        return [0, 0, 0, 0];
    }
    let a16 = u16::from(a);
    let straight = |c: u8| -> u8 { ((u16::from(c) * 255 + a16 / 2) / a16).min(255) as u8 };
    [straight(r), straight(g), straight(b), a]
}
