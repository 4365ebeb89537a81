//! Paint targets.
//!
//! The engine paints its prepared composite onto anything implementing [`Surface`]. An
//! [`RgbaImage`] is a surface (the composite is copied, or scaled when sizes differ), and
//! [`NullSurface`] only counts the frames it receives.

use crate::envelope::PixelSize;
use crate::render::image::RgbaImage;
use crate::render::rasterize::Canvas;

pub trait Surface {
    fn size(&self) -> PixelSize;

    /// Shows `frame`, which covers the whole surface.
    fn present(&mut self, frame: &RgbaImage) -> anyhow::Result<()>;
}

impl Surface for RgbaImage {
    fn size(&self) -> PixelSize {
        PixelSize::new(self.width(), self.height())
    }

    fn present(&mut self, frame: &RgbaImage) -> anyhow::Result<()> {
        let size = Surface::size(self);
        if frame.width() == size.width && frame.height() == size.height {
            *self = frame.clone();
        } else if !size.is_degenerate() {
            let mut canvas = Canvas::new(size)?;
            canvas.draw_image(frame, 0.0, 0.0, size.width as f64, size.height as f64);
            *self = canvas.finish();
        }
        Ok(())
    }
}

/// Surface that draws nothing.
#[derive(Debug, Clone, Copy)]
pub struct NullSurface {
    pub size: PixelSize,
    /// Number of frames presented so far
    frame_id: u64,
}

impl NullSurface {
    pub fn new(size: PixelSize) -> Self {
        Self { size, frame_id: 0 }
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
}

impl Surface for NullSurface {
    fn size(&self) -> PixelSize {
        self.size
    }

    fn present(&mut self, _frame: &RgbaImage) -> anyhow::Result<()> {
        self.frame_id = self.frame_id.wrapping_add(1);
        Ok(())
    }
}
