//! Display texture shared between the node and the renderer.

use std::cell::RefCell;
use std::rc::Rc;

use image::imageops::{self, FilterType};
use image::RgbImage;

/// Texture handle as held by the node and the editor's texture registry.
///
/// Both live on the editor thread; the node is the only writer.
pub type SharedTexture = Rc<RefCell<DisplayTexture>>;

/// Fixed-size float RGB texture (`width * height * 3` values in `0.0..=1.0`).
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayTexture {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DisplayTexture {
    /// Black texture of the given size.
    pub fn zeroed(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize * 3],
        }
    }

    pub fn shared(width: u32, height: u32) -> SharedTexture {
        Rc::new(RefCell::new(Self::zeroed(width, height)))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Overwrites the texture with `frame`, rescaled to the texture size.
    pub fn write_rgb(&mut self, frame: &RgbImage) {
        if frame.dimensions() == (self.width, self.height) {
            fill_normalized(&mut self.data, frame);
        } else {
            let resized = imageops::resize(frame, self.width, self.height, FilterType::Triangle);
            fill_normalized(&mut self.data, &resized);
        }
    }
}

fn fill_normalized(data: &mut [f32], frame: &RgbImage) {
    for (dst, &src) in data.iter_mut().zip(frame.as_raw().iter()) {
        *dst = src as f32 / 255.0;
    }
}
