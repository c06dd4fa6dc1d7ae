//! Camera discovery and acquisition over GenTL.
//!
//! This module provides:
//! - `DeviceRegistry`: loads GenTL producers (`.cti` files) and enumerates the
//!   devices they expose
//! - `Camera`: one opened device, driven through start / fetch / stop
//! - A synthetic backend selected with `stub://` paths (testing, headless runs)
//!
//! The registry owns every loaded producer. Dropping or resetting it releases
//! the producers; cameras keep their own producer alive until they are dropped,
//! so a camera handle is never left pointing into an unloaded library.

pub(crate) mod ffi;
mod genapi;
mod producer;
mod synthetic;

use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;

use crate::config::GenTlPath;
use crate::frame::RawFrame;
use crate::NodeError;

use producer::{Producer, ProducerStream};
use synthetic::{SyntheticCamera, SyntheticRegistry};

/// A device seen during discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Position in the registry's device list; this is what the selector picks.
    pub index: usize,
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub display_name: String,
    /// Producer file (or stub URI) the device was found through.
    pub source: String,
}

/// Device registry over every loaded producer.
pub struct DeviceRegistry {
    backend: RegistryBackend,
    entries: Vec<DeviceEntry>,
}

enum RegistryBackend {
    Synthetic(SyntheticRegistry),
    Producers(Vec<Rc<Producer>>),
}

struct DeviceEntry {
    info: DeviceInfo,
    locator: DeviceLocator,
}

enum DeviceLocator {
    Synthetic,
    Producer {
        producer: Rc<Producer>,
        interface_id: String,
    },
}

impl DeviceRegistry {
    /// Registry with no producers loaded.
    pub fn empty() -> Self {
        Self {
            backend: RegistryBackend::Producers(Vec::new()),
            entries: Vec::new(),
        }
    }

    /// Loads every producer found on `path` and runs a first discovery.
    ///
    /// Fails with `DriverLoad` when no producer loads or discovery fails, and
    /// with `Configuration` when the path cannot be read at all.
    pub fn open(path: &GenTlPath) -> Result<Self, NodeError> {
        let mut registry = match path {
            GenTlPath::Stub(uri) => Self {
                backend: RegistryBackend::Synthetic(SyntheticRegistry::new(uri)?),
                entries: Vec::new(),
            },
            GenTlPath::Directories(_) => {
                let files = path.producer_files()?;
                if files.is_empty() {
                    return Err(NodeError::DriverLoad(
                        "no .cti producer files found on the GenTL path".to_string(),
                    ));
                }
                let mut registry = Self::empty();
                for file in &files {
                    if let Err(err) = registry.add_file(file) {
                        log::warn!("GenTL producer {} skipped: {:#}", file.display(), err);
                    }
                }
                if registry.producer_count() == 0 {
                    return Err(NodeError::DriverLoad(format!(
                        "none of the {} producer file(s) could be loaded",
                        files.len()
                    )));
                }
                registry
            }
        };
        registry.update()?;
        Ok(registry)
    }

    /// Loads one producer file. Loading the same file twice is a no-op.
    pub fn add_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let producers = match &mut self.backend {
            RegistryBackend::Producers(producers) => producers,
            RegistryBackend::Synthetic(_) => {
                return Err(anyhow!("synthetic registry does not load producer files"))
            }
        };
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if producers.iter().any(|producer| producer.path() == canonical) {
            log::debug!("GenTL producer {} already loaded", canonical.display());
            return Ok(());
        }
        producers.push(Rc::new(Producer::load(&canonical)?));
        Ok(())
    }

    /// Re-enumerates devices across all producers.
    ///
    /// A producer whose discovery fails is skipped; if every producer fails
    /// the registry reports `DriverLoad`.
    pub fn update(&mut self) -> Result<(), NodeError> {
        let mut entries = Vec::new();
        match &self.backend {
            RegistryBackend::Synthetic(registry) => {
                entries.extend(registry.discover().into_iter().map(|info| DeviceEntry {
                    info,
                    locator: DeviceLocator::Synthetic,
                }));
            }
            RegistryBackend::Producers(producers) => {
                let mut failures = 0usize;
                for producer in producers {
                    match producer.discover() {
                        Ok(found) => {
                            entries.extend(found.into_iter().map(|device| DeviceEntry {
                                info: device.info,
                                locator: DeviceLocator::Producer {
                                    producer: Rc::clone(producer),
                                    interface_id: device.interface_id,
                                },
                            }))
                        }
                        Err(err) => {
                            failures += 1;
                            log::warn!(
                                "device discovery failed on {}: {:#}",
                                producer.path().display(),
                                err
                            );
                        }
                    }
                }
                if !producers.is_empty() && failures == producers.len() {
                    return Err(NodeError::DriverLoad(
                        "device discovery failed on every producer".to_string(),
                    ));
                }
            }
        }
        for (index, entry) in entries.iter_mut().enumerate() {
            entry.info.index = index;
        }
        log::info!("device registry: {} device(s) available", entries.len());
        self.entries = entries;
        Ok(())
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.entries.iter().map(|entry| &entry.info)
    }

    pub fn device_count(&self) -> usize {
        self.entries.len()
    }

    pub fn producer_count(&self) -> usize {
        match &self.backend {
            RegistryBackend::Synthetic(_) => 0,
            RegistryBackend::Producers(producers) => producers.len(),
        }
    }

    /// Opens the device at `index`.
    pub fn create(&self, index: usize) -> Result<Camera, NodeError> {
        let entry = self.entries.get(index).ok_or(NodeError::DeviceNotFound {
            index,
            available: self.entries.len(),
        })?;
        let backend = match (&entry.locator, &self.backend) {
            (DeviceLocator::Synthetic, RegistryBackend::Synthetic(registry)) => {
                CameraBackend::Synthetic(registry.open(index))
            }
            (
                DeviceLocator::Producer {
                    producer,
                    interface_id,
                },
                _,
            ) => CameraBackend::Producer(
                producer
                    .open_stream(interface_id, &entry.info.id)
                    .map_err(|err| NodeError::Acquisition(format!("{err:#}")))?,
            ),
            (DeviceLocator::Synthetic, RegistryBackend::Producers(_)) => {
                return Err(NodeError::DeviceNotFound {
                    index,
                    available: 0,
                })
            }
        };
        Ok(Camera {
            info: entry.info.clone(),
            backend,
            frames_acquired: 0,
            last_error: None,
        })
    }

    /// Forgets every device and releases the producers this registry holds.
    pub fn reset(&mut self) {
        self.entries.clear();
        if let RegistryBackend::Producers(producers) = &mut self.backend {
            producers.clear();
        }
        log::debug!("device registry reset");
    }
}

/// Statistics for an opened camera.
#[derive(Clone, Debug)]
pub struct CameraStats {
    pub frames_acquired: u64,
    pub device: String,
    pub last_error: Option<String>,
}

/// One opened device.
pub struct Camera {
    info: DeviceInfo,
    backend: CameraBackend,
    frames_acquired: u64,
    last_error: Option<String>,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    Producer(ProducerStream),
}

impl Camera {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn index(&self) -> usize {
        self.info.index
    }

    pub fn start(&mut self) -> Result<(), NodeError> {
        let result = match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.start(),
            CameraBackend::Producer(stream) => stream.start(),
        };
        self.record(result)
    }

    /// Waits at most `timeout` for the next delivered buffer.
    pub fn fetch(&mut self, timeout: Duration) -> Result<RawFrame, NodeError> {
        let result = match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.fetch(timeout),
            CameraBackend::Producer(stream) => stream.fetch(timeout),
        };
        let frame = self.record(result)?;
        self.frames_acquired += 1;
        Ok(frame)
    }

    pub fn stop(&mut self) -> Result<(), NodeError> {
        let result = match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.stop(),
            CameraBackend::Producer(stream) => stream.stop(),
        };
        self.record(result)
    }

    /// One acquisition cycle: start, fetch a single frame, stop.
    ///
    /// `stop` runs even when the fetch fails; the fetch error wins.
    pub fn acquire_one(&mut self, timeout: Duration) -> Result<RawFrame, NodeError> {
        self.start()?;
        let fetched = self.fetch(timeout);
        let stopped = self.stop();
        match (fetched, stopped) {
            (Ok(frame), Ok(())) => Ok(frame),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), stopped) => {
                if let Err(stop_err) = stopped {
                    log::warn!("camera {}: stop after failed fetch: {}", self.info.id, stop_err);
                }
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> CameraStats {
        CameraStats {
            frames_acquired: self.frames_acquired,
            device: self.info.id.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn record<T>(&mut self, result: Result<T, NodeError>) -> Result<T, NodeError> {
        if let Err(err) = &result {
            self.last_error = Some(err.to_string());
        }
        result
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        log::info!(
            "camera {} closed after {} frame(s)",
            self.info.id,
            self.frames_acquired
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_registry(uri: &str) -> Result<DeviceRegistry, NodeError> {
        DeviceRegistry::open(&GenTlPath::Stub(uri.to_string()))
    }

    #[test]
    fn stub_registry_enumerates_indexed_devices() -> Result<(), NodeError> {
        let registry = stub_registry("stub://2")?;
        let indices: Vec<usize> = registry.devices().map(|info| info.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(registry.producer_count(), 0);
        Ok(())
    }

    #[test]
    fn acquire_one_leaves_camera_stopped() -> Result<(), NodeError> {
        let registry = stub_registry("stub://")?;
        let mut camera = registry.create(0)?;
        let frame = camera.acquire_one(Duration::from_millis(10))?;
        assert_eq!(frame.frame_id, 1);
        // A fetch outside a cycle must fail: the camera was stopped.
        assert!(camera.fetch(Duration::from_millis(1)).is_err());
        assert_eq!(camera.stats().frames_acquired, 1);
        Ok(())
    }

    #[test]
    fn creating_unknown_index_fails() -> Result<(), NodeError> {
        let registry = stub_registry("stub://")?;
        let err = registry.create(3).err();
        assert!(matches!(
            err,
            Some(NodeError::DeviceNotFound {
                index: 3,
                available: 1
            })
        ));
        Ok(())
    }

    #[test]
    fn timeouts_are_recorded_in_stats() -> Result<(), NodeError> {
        let registry = stub_registry("stub://stalled")?;
        let mut camera = registry.create(0)?;
        let err = camera.acquire_one(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, NodeError::Timeout(_)));
        assert!(camera.stats().last_error.is_some());
        Ok(())
    }

    #[test]
    fn empty_producer_directory_is_a_driver_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = DeviceRegistry::open(&GenTlPath::Directories(vec![dir.path().to_path_buf()]))
            .err();
        assert!(matches!(err, Some(NodeError::DriverLoad(_))));
    }

    #[test]
    fn invalid_producer_files_are_a_driver_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("broken.cti"), b"not a shared library").expect("write");
        let err = DeviceRegistry::open(&GenTlPath::Directories(vec![dir.path().to_path_buf()]))
            .err();
        assert!(matches!(err, Some(NodeError::DriverLoad(_))));
    }

    #[test]
    fn reset_forgets_devices() -> Result<(), NodeError> {
        let mut registry = stub_registry("stub://2")?;
        registry.reset();
        assert_eq!(registry.device_count(), 0);
        assert!(registry.create(0).is_err());
        Ok(())
    }
}
