// ----------------------------------------------------------------------------
// Synthetic cameras (stub://) for tests and headless runs
// ----------------------------------------------------------------------------

use std::time::Duration;

use super::DeviceInfo;
use crate::demosaic::pfnc;
use crate::frame::RawFrame;
use crate::NodeError;

const SYNTHETIC_WIDTH: u32 = 64;
const SYNTHETIC_HEIGHT: u32 = 48;

/// `stub://` registry: `stub://N` exposes N cameras (default 1),
/// `stub://stalled` exposes one camera that never delivers a buffer.
pub(crate) struct SyntheticRegistry {
    uri: String,
    device_count: usize,
    stalled: bool,
}

impl SyntheticRegistry {
    pub(crate) fn new(uri: &str) -> Result<Self, NodeError> {
        let rest = uri.trim_start_matches(crate::config::STUB_SCHEME).trim_matches('/');
        let (device_count, stalled) = match rest {
            "" => (1, false),
            "stalled" => (1, true),
            count => {
                let count = count.parse::<usize>().map_err(|_| {
                    NodeError::Configuration(format!("invalid synthetic camera uri '{}'", uri))
                })?;
                (count, false)
            }
        };
        Ok(Self {
            uri: uri.to_string(),
            device_count,
            stalled,
        })
    }

    pub(crate) fn discover(&self) -> Vec<DeviceInfo> {
        (0..self.device_count)
            .map(|index| DeviceInfo {
                index,
                id: format!("stub-{index}"),
                vendor: "Synthetic".to_string(),
                model: "BayerRG8 gradient".to_string(),
                serial_number: format!("SIM{index:04}"),
                display_name: format!("Synthetic camera {index}"),
                source: self.uri.clone(),
            })
            .collect()
    }

    pub(crate) fn open(&self, index: usize) -> SyntheticCamera {
        log::info!("SyntheticCamera: opened stub-{} ({})", index, self.uri);
        SyntheticCamera {
            index,
            frame_count: 0,
            acquiring: false,
            stalled: self.stalled,
        }
    }
}

pub(crate) struct SyntheticCamera {
    index: usize,
    frame_count: u64,
    acquiring: bool,
    stalled: bool,
}

impl SyntheticCamera {
    pub(crate) fn start(&mut self) -> Result<(), NodeError> {
        self.acquiring = true;
        Ok(())
    }

    pub(crate) fn fetch(&mut self, timeout: Duration) -> Result<RawFrame, NodeError> {
        if !self.acquiring {
            return Err(NodeError::Acquisition(
                "fetch called before start".to_string(),
            ));
        }
        if self.stalled {
            // A stalled device blocks for the whole timeout, like a real one.
            std::thread::sleep(timeout);
            return Err(NodeError::Timeout(timeout));
        }
        self.frame_count += 1;
        let pixels = self.generate_mosaic();
        RawFrame::new(
            pixels,
            SYNTHETIC_WIDTH,
            SYNTHETIC_HEIGHT,
            pfnc::BAYER_RG8,
            self.frame_count,
        )
        .map_err(|err| NodeError::Acquisition(format!("{err:#}")))
    }

    pub(crate) fn stop(&mut self) -> Result<(), NodeError> {
        self.acquiring = false;
        Ok(())
    }

    /// Diagonal gradient that drifts one step per frame; the camera index
    /// offsets it so different cameras produce different images.
    fn generate_mosaic(&self) -> Vec<u8> {
        let w = SYNTHETIC_WIDTH as usize;
        let h = SYNTHETIC_HEIGHT as usize;
        let shift = self.frame_count as usize + self.index * 64;
        let mut pixels = vec![0u8; w * h];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            let (x, y) = (i % w, i / w);
            *pixel = ((x + y + shift) % 256) as u8;
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_count_follows_uri() -> Result<(), NodeError> {
        assert_eq!(SyntheticRegistry::new("stub://")?.discover().len(), 1);
        assert_eq!(SyntheticRegistry::new("stub://3")?.discover().len(), 3);
        assert!(SyntheticRegistry::new("stub://many").is_err());
        Ok(())
    }

    #[test]
    fn frames_are_bayer_and_numbered() -> Result<(), NodeError> {
        let registry = SyntheticRegistry::new("stub://")?;
        let mut camera = registry.open(0);
        camera.start()?;
        let first = camera.fetch(Duration::from_millis(10))?;
        let second = camera.fetch(Duration::from_millis(10))?;
        camera.stop()?;

        assert_eq!(first.pixel_format, pfnc::BAYER_RG8);
        assert_eq!((first.width, first.height), (SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT));
        assert_eq!(second.frame_id, first.frame_id + 1);
        assert_ne!(first.data(), second.data());
        Ok(())
    }

    #[test]
    fn fetch_without_start_fails() -> Result<(), NodeError> {
        let mut camera = SyntheticRegistry::new("stub://")?.open(0);
        let err = camera.fetch(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, NodeError::Acquisition(_)));
        Ok(())
    }

    #[test]
    fn stalled_camera_times_out() -> Result<(), NodeError> {
        let mut camera = SyntheticRegistry::new("stub://stalled")?.open(0);
        camera.start()?;
        let err = camera.fetch(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, NodeError::Timeout(d) if d == Duration::from_millis(5)));
        Ok(())
    }
}
