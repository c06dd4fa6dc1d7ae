//! Raw sensor readout.
//!
//! A `RawFrame` is what one acquisition cycle produces: the bytes of the first
//! image component of a delivered buffer, with the geometry and PFNC pixel
//! format reported by the producer. Frames are transient; the node converts
//! them to RGB immediately and never keeps more than one alive.

use anyhow::{anyhow, Result};
use std::time::Instant;

/// One raw buffer as delivered by a camera.
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// PFNC pixel format code (e.g. `0x01080009` for BayerRG8).
    pub pixel_format: u32,
    /// Producer-assigned frame id, or a local counter for synthetic cameras.
    pub frame_id: u64,
    captured_at: Instant,
}

impl RawFrame {
    /// Wraps a delivered buffer. The payload must hold at least
    /// `width * height * bytes_per_pixel` bytes; extra trailing bytes are
    /// dropped so the frame always describes exactly one image.
    pub fn new(
        mut data: Vec<u8>,
        width: u32,
        height: u32,
        pixel_format: u32,
        frame_id: u64,
    ) -> Result<Self> {
        let bytes_per_pixel = bytes_per_pixel(pixel_format);
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(bytes_per_pixel))
            .ok_or_else(|| anyhow!("frame dimensions overflow ({}x{})", width, height))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame has zero size ({}x{})", width, height));
        }
        if data.len() < expected {
            return Err(anyhow!(
                "frame payload too short: expected {} bytes, got {}",
                expected,
                data.len()
            ));
        }
        data.truncate(expected);
        Ok(Self {
            data,
            width,
            height,
            pixel_format,
            frame_id,
            captured_at: Instant::now(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Milliseconds since the buffer was handed over by the camera.
    pub fn age_ms(&self) -> u128 {
        self.captured_at.elapsed().as_millis()
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel data is left out; frames are large.
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &format_args!("0x{:08x}", self.pixel_format))
            .field("frame_id", &self.frame_id)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Bytes per pixel encoded in a PFNC code (bits 16..24 hold the bit depth).
///
/// Packed formats with a non-byte-aligned depth round up.
pub fn bytes_per_pixel(pixel_format: u32) -> usize {
    let bits = ((pixel_format >> 16) & 0xff) as usize;
    bits.div_ceil(8).max(1)
}
