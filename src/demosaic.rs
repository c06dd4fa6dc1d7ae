use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::frame::RawFrame;
use crate::NodeError;

/// PFNC pixel format codes understood by the node.
pub mod pfnc {
    pub const MONO8: u32 = 0x0108_0001;
    pub const BAYER_GR8: u32 = 0x0108_0008;
    pub const BAYER_RG8: u32 = 0x0108_0009;
    pub const BAYER_GB8: u32 = 0x0108_000A;
    pub const BAYER_BG8: u32 = 0x0108_000B;
    pub const RGB8: u32 = 0x0218_0014;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Mono8,
    Bayer(BayerPattern),
    Rgb8,
}

/// Colour of the top-left 2x2 cell, read row by row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Channel {
    Red = 0,
    Green = 1,
    Blue = 2,
}

impl PixelFormat {
    pub fn from_pfnc(code: u32) -> Result<Self, NodeError> {
        match code {
            pfnc::MONO8 => Ok(PixelFormat::Mono8),
            pfnc::BAYER_GR8 => Ok(PixelFormat::Bayer(BayerPattern::Grbg)),
            pfnc::BAYER_RG8 => Ok(PixelFormat::Bayer(BayerPattern::Rggb)),
            pfnc::BAYER_GB8 => Ok(PixelFormat::Bayer(BayerPattern::Gbrg)),
            pfnc::BAYER_BG8 => Ok(PixelFormat::Bayer(BayerPattern::Bggr)),
            pfnc::RGB8 => Ok(PixelFormat::Rgb8),
            other => Err(NodeError::UnsupportedPixelFormat(other)),
        }
    }
}

impl BayerPattern {
    fn channel_at(self, x: usize, y: usize) -> Channel {
        let cell = [
            [Channel::Red, Channel::Green, Channel::Green, Channel::Blue],
            [Channel::Blue, Channel::Green, Channel::Green, Channel::Red],
            [Channel::Green, Channel::Red, Channel::Blue, Channel::Green],
            [Channel::Green, Channel::Blue, Channel::Red, Channel::Green],
        ];
        let row = match self {
            BayerPattern::Rggb => 0,
            BayerPattern::Bggr => 1,
            BayerPattern::Grbg => 2,
            BayerPattern::Gbrg => 3,
        };
        cell[row][(y % 2) * 2 + (x % 2)]
    }
}

/// Converts a raw frame to an 8-bit RGB image of the same size.
pub fn to_rgb(frame: &RawFrame) -> Result<RgbImage, NodeError> {
    let format = PixelFormat::from_pfnc(frame.pixel_format)?;
    let rgb = match format {
        PixelFormat::Mono8 => mono_to_rgb(frame.data(), frame.width, frame.height)?,
        PixelFormat::Bayer(pattern) => {
            bayer_to_rgb(frame.data(), frame.width, frame.height, pattern)?
        }
        PixelFormat::Rgb8 => {
            check_len(frame.data(), frame.width, frame.height, 3)?;
            frame.data().to_vec()
        }
    };
    RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", frame.width, frame.height).into())
}

/// Bilinear demosaic: every output channel is the mean of the same-colour
/// samples in the 3x3 neighbourhood, or the sample itself when the pixel
/// already carries that colour. Border pixels only use in-bounds neighbours.
pub fn bayer_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    pattern: BayerPattern,
) -> Result<Vec<u8>> {
    check_len(pixels, width, height, 1)?;
    let w = width as usize;
    let h = height as usize;
    let mut rgb = vec![0u8; w * h * 3];

    for y in 0..h {
        for x in 0..w {
            let own = pattern.channel_at(x, y);
            let mut sums = [0u32; 3];
            let mut counts = [0u32; 3];
            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let channel = pattern.channel_at(nx, ny) as usize;
                    sums[channel] += pixels[ny * w + nx] as u32;
                    counts[channel] += 1;
                }
            }
            let offset = (y * w + x) * 3;
            for channel in [Channel::Red, Channel::Green, Channel::Blue] {
                let c = channel as usize;
                rgb[offset + c] = if channel == own {
                    pixels[y * w + x]
                } else if counts[c] > 0 {
                    ((sums[c] + counts[c] / 2) / counts[c]) as u8
                } else {
                    // 1-pixel-wide sensors have no neighbour of this colour.
                    pixels[y * w + x]
                };
            }
        }
    }

    Ok(rgb)
}

fn mono_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    check_len(pixels, width, height, 1)?;
    Ok(pixels.iter().flat_map(|&p| [p, p, p]).collect())
}

fn check_len(pixels: &[u8], width: u32, height: u32, channels: usize) -> Result<()> {
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(channels))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }
    Ok(())
}
