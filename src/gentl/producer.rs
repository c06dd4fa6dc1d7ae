//! GenTL producer (`.cti`) backend.
//!
//! A `Producer` owns one loaded library together with its transport layer
//! handle and the interfaces opened during discovery. A `ProducerStream` owns
//! one opened device and its first data stream; it keeps the producer alive
//! through an `Rc`, so a camera never outlives the library it came from.
//!
//! Acquisition is bracketed on both ends: the data stream is started before
//! the remote device's `AcquisitionStart` is written and stopped after its
//! `AcquisitionStop`.

use anyhow::{anyhow, Context, Result};
use libloading::Library;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::os::raw::{c_char, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use super::ffi;
use super::genapi::{description_text, AcquisitionCommands, DescriptionUrl, Register};
use super::DeviceInfo;
use crate::frame::RawFrame;
use crate::NodeError;

const MIN_ANNOUNCED_BUFFERS: usize = 3;
const DISCOVERY_TIMEOUT_MS: u64 = 1_000;

macro_rules! resolve {
    ($library:expr, $name:ident) => {{
        // SAFETY: the symbol type matches the GenTL prototype declared in `ffi`.
        let symbol = unsafe { $library.get::<ffi::$name>(concat!(stringify!($name), "\0").as_bytes()) }
            .with_context(|| format!("resolve {}", stringify!($name)))?;
        *symbol
    }};
}

/// Resolved GenTL entry points. The library is kept alongside so the function
/// pointers stay valid.
struct GenTlApi {
    gc_init_lib: ffi::GCInitLib,
    gc_close_lib: ffi::GCCloseLib,
    gc_get_last_error: ffi::GCGetLastError,
    tl_open: ffi::TLOpen,
    tl_close: ffi::TLClose,
    tl_update_interface_list: ffi::TLUpdateInterfaceList,
    tl_get_num_interfaces: ffi::TLGetNumInterfaces,
    tl_get_interface_id: ffi::TLGetInterfaceID,
    tl_open_interface: ffi::TLOpenInterface,
    if_close: ffi::IFClose,
    if_update_device_list: ffi::IFUpdateDeviceList,
    if_get_num_devices: ffi::IFGetNumDevices,
    if_get_device_id: ffi::IFGetDeviceID,
    if_get_device_info: ffi::IFGetDeviceInfo,
    if_open_device: ffi::IFOpenDevice,
    dev_close: ffi::DevClose,
    dev_get_num_data_streams: ffi::DevGetNumDataStreams,
    dev_get_data_stream_id: ffi::DevGetDataStreamID,
    dev_open_data_stream: ffi::DevOpenDataStream,
    ds_close: ffi::DSClose,
    ds_get_info: ffi::DSGetInfo,
    ds_alloc_and_announce_buffer: ffi::DSAllocAndAnnounceBuffer,
    ds_revoke_buffer: ffi::DSRevokeBuffer,
    ds_queue_buffer: ffi::DSQueueBuffer,
    ds_flush_queue: ffi::DSFlushQueue,
    ds_start_acquisition: ffi::DSStartAcquisition,
    ds_stop_acquisition: ffi::DSStopAcquisition,
    ds_get_buffer_info: ffi::DSGetBufferInfo,
    gc_register_event: ffi::GCRegisterEvent,
    gc_unregister_event: ffi::GCUnregisterEvent,
    event_get_data: ffi::EventGetData,
    event_flush: ffi::EventFlush,
    port: Option<PortApi>,
    _library: Option<Library>,
}

/// Remote-device port access. Optional: a producer without it can still
/// stream from devices that start on their own.
struct PortApi {
    dev_get_port: ffi::DevGetPort,
    gc_get_num_port_urls: ffi::GCGetNumPortURLs,
    gc_get_port_url_info: ffi::GCGetPortURLInfo,
    gc_read_port: ffi::GCReadPort,
    gc_write_port: ffi::GCWritePort,
}

impl GenTlApi {
    fn resolve(library: Library) -> Result<Self> {
        Ok(Self {
            gc_init_lib: resolve!(library, GCInitLib),
            gc_close_lib: resolve!(library, GCCloseLib),
            gc_get_last_error: resolve!(library, GCGetLastError),
            tl_open: resolve!(library, TLOpen),
            tl_close: resolve!(library, TLClose),
            tl_update_interface_list: resolve!(library, TLUpdateInterfaceList),
            tl_get_num_interfaces: resolve!(library, TLGetNumInterfaces),
            tl_get_interface_id: resolve!(library, TLGetInterfaceID),
            tl_open_interface: resolve!(library, TLOpenInterface),
            if_close: resolve!(library, IFClose),
            if_update_device_list: resolve!(library, IFUpdateDeviceList),
            if_get_num_devices: resolve!(library, IFGetNumDevices),
            if_get_device_id: resolve!(library, IFGetDeviceID),
            if_get_device_info: resolve!(library, IFGetDeviceInfo),
            if_open_device: resolve!(library, IFOpenDevice),
            dev_close: resolve!(library, DevClose),
            dev_get_num_data_streams: resolve!(library, DevGetNumDataStreams),
            dev_get_data_stream_id: resolve!(library, DevGetDataStreamID),
            dev_open_data_stream: resolve!(library, DevOpenDataStream),
            ds_close: resolve!(library, DSClose),
            ds_get_info: resolve!(library, DSGetInfo),
            ds_alloc_and_announce_buffer: resolve!(library, DSAllocAndAnnounceBuffer),
            ds_revoke_buffer: resolve!(library, DSRevokeBuffer),
            ds_queue_buffer: resolve!(library, DSQueueBuffer),
            ds_flush_queue: resolve!(library, DSFlushQueue),
            ds_start_acquisition: resolve!(library, DSStartAcquisition),
            ds_stop_acquisition: resolve!(library, DSStopAcquisition),
            ds_get_buffer_info: resolve!(library, DSGetBufferInfo),
            gc_register_event: resolve!(library, GCRegisterEvent),
            gc_unregister_event: resolve!(library, GCUnregisterEvent),
            event_get_data: resolve!(library, EventGetData),
            event_flush: resolve!(library, EventFlush),
            port: Self::resolve_port(&library),
            _library: Some(library),
        })
    }

    fn resolve_port(library: &Library) -> Option<PortApi> {
        let lookup = || -> Result<PortApi> {
            Ok(PortApi {
                dev_get_port: resolve!(library, DevGetPort),
                gc_get_num_port_urls: resolve!(library, GCGetNumPortURLs),
                gc_get_port_url_info: resolve!(library, GCGetPortURLInfo),
                gc_read_port: resolve!(library, GCReadPort),
                gc_write_port: resolve!(library, GCWritePort),
            })
        };
        match lookup() {
            Ok(port) => Some(port),
            Err(err) => {
                log::warn!("GenTL producer has no port access: {:#}", err);
                None
            }
        }
    }
}

/// The remote device behind an opened device handle.
struct RemoteDevice {
    port: ffi::PORT_HANDLE,
    commands: AcquisitionCommands,
}

struct Interface {
    id: String,
    handle: ffi::IF_HANDLE,
}

/// A device found on one of the producer's interfaces.
pub(crate) struct DiscoveredDevice {
    pub info: DeviceInfo,
    pub interface_id: String,
}

/// One loaded GenTL producer library.
pub(crate) struct Producer {
    path: PathBuf,
    api: GenTlApi,
    tl: ffi::TL_HANDLE,
    interfaces: RefCell<Vec<Interface>>,
}

impl Producer {
    /// Loads the library, initializes it and opens its transport layer.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        // SAFETY: loading a producer runs its initializers; producers are
        // vendor drivers the operator placed on the GenTL path.
        let library = unsafe { Library::new(path) }
            .with_context(|| format!("load GenTL producer {}", path.display()))?;
        let api = GenTlApi::resolve(library)
            .with_context(|| format!("{} is not a GenTL producer", path.display()))?;
        Self::init(path, api)
    }

    fn init(path: &Path, api: GenTlApi) -> Result<Self> {
        let code = unsafe { (api.gc_init_lib)() };
        if code != ffi::GC_ERR_SUCCESS {
            return Err(anyhow!(
                "GCInitLib failed for {} with GenTL error {}",
                path.display(),
                code
            ));
        }

        let mut tl = ptr::null_mut();
        let code = unsafe { (api.tl_open)(&mut tl) };
        if code != ffi::GC_ERR_SUCCESS {
            unsafe { (api.gc_close_lib)() };
            return Err(anyhow!(
                "TLOpen failed for {} with GenTL error {}",
                path.display(),
                code
            ));
        }

        log::info!("GenTL producer loaded: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            api,
            tl,
            interfaces: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Refreshes the interface and device lists and returns every device seen.
    ///
    /// Interfaces already opened stay open (cameras may hold devices on them);
    /// new interfaces are opened and kept until the producer is dropped.
    pub(crate) fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let mut changed: ffi::bool8_t = 0;
        self.check(
            unsafe { (self.api.tl_update_interface_list)(self.tl, &mut changed, DISCOVERY_TIMEOUT_MS) },
            "TLUpdateInterfaceList",
        )?;
        let mut count = 0u32;
        self.check(
            unsafe { (self.api.tl_get_num_interfaces)(self.tl, &mut count) },
            "TLGetNumInterfaces",
        )?;

        let mut devices = Vec::new();
        for index in 0..count {
            let interface_id = self.read_string("TLGetInterfaceID", |buf, size| unsafe {
                (self.api.tl_get_interface_id)(self.tl, index, buf, size)
            })?;
            let handle = match self.interface_handle(&interface_id) {
                Ok(handle) => handle,
                Err(err) => {
                    log::warn!("GenTL interface {} skipped: {:#}", interface_id, err);
                    continue;
                }
            };
            match self.discover_on_interface(handle, &interface_id) {
                Ok(found) => devices.extend(found),
                Err(err) => log::warn!("GenTL interface {} skipped: {:#}", interface_id, err),
            }
        }
        Ok(devices)
    }

    fn discover_on_interface(
        &self,
        handle: ffi::IF_HANDLE,
        interface_id: &str,
    ) -> Result<Vec<DiscoveredDevice>> {
        let mut changed: ffi::bool8_t = 0;
        self.check(
            unsafe { (self.api.if_update_device_list)(handle, &mut changed, DISCOVERY_TIMEOUT_MS) },
            "IFUpdateDeviceList",
        )?;
        let mut count = 0u32;
        self.check(
            unsafe { (self.api.if_get_num_devices)(handle, &mut count) },
            "IFGetNumDevices",
        )?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let id = self.read_string("IFGetDeviceID", |buf, size| unsafe {
                (self.api.if_get_device_id)(handle, index, buf, size)
            })?;
            let c_id = CString::new(id.clone()).context("device id contains NUL")?;
            let info_string = |cmd: ffi::DEVICE_INFO_CMD| {
                self.read_string("IFGetDeviceInfo", |buf, size| {
                    let mut info_type: ffi::INFO_DATATYPE = 0;
                    unsafe {
                        (self.api.if_get_device_info)(
                            handle,
                            c_id.as_ptr(),
                            cmd,
                            &mut info_type,
                            buf as *mut c_void,
                            size,
                        )
                    }
                })
                .unwrap_or_default()
            };
            devices.push(DiscoveredDevice {
                info: DeviceInfo {
                    index: 0,
                    vendor: info_string(ffi::DEVICE_INFO_VENDOR),
                    model: info_string(ffi::DEVICE_INFO_MODEL),
                    serial_number: info_string(ffi::DEVICE_INFO_SERIAL_NUMBER),
                    display_name: info_string(ffi::DEVICE_INFO_DISPLAYNAME),
                    id,
                    source: self.path.display().to_string(),
                },
                interface_id: interface_id.to_string(),
            });
        }
        Ok(devices)
    }

    fn interface_handle(&self, interface_id: &str) -> Result<ffi::IF_HANDLE> {
        if let Some(existing) = self
            .interfaces
            .borrow()
            .iter()
            .find(|iface| iface.id == interface_id)
        {
            return Ok(existing.handle);
        }
        let c_id = CString::new(interface_id).context("interface id contains NUL")?;
        let mut handle = ptr::null_mut();
        self.check(
            unsafe { (self.api.tl_open_interface)(self.tl, c_id.as_ptr(), &mut handle) },
            "TLOpenInterface",
        )?;
        self.interfaces.borrow_mut().push(Interface {
            id: interface_id.to_string(),
            handle,
        });
        Ok(handle)
    }

    /// Opens `device_id` on `interface_id` with control access.
    pub(crate) fn open_stream(
        self: &Rc<Self>,
        interface_id: &str,
        device_id: &str,
    ) -> Result<ProducerStream> {
        let iface = self.interface_handle(interface_id)?;
        let mut stream = ProducerStream {
            producer: Rc::clone(self),
            device: ptr::null_mut(),
            stream: ptr::null_mut(),
            event: ptr::null_mut(),
            buffers: Vec::new(),
            remote: None,
            params_locked: false,
            acquiring: false,
            remote_started: false,
        };
        stream.open(iface, device_id)?;
        Ok(stream)
    }

    /// Locates the device description through the remote port and resolves
    /// the acquisition commands in it.
    fn remote_device(&self, device: ffi::DEV_HANDLE) -> Result<RemoteDevice> {
        let port_api = self.port_api()?;
        let mut port = ptr::null_mut();
        self.check(unsafe { (port_api.dev_get_port)(device, &mut port) }, "DevGetPort")?;
        let mut url_count = 0u32;
        self.check(
            unsafe { (port_api.gc_get_num_port_urls)(port, &mut url_count) },
            "GCGetNumPortURLs",
        )?;
        if url_count == 0 {
            return Err(anyhow!("remote device publishes no description url"));
        }
        let url = self.read_string("GCGetPortURLInfo", |buf, size| {
            let mut info_type: ffi::INFO_DATATYPE = 0;
            unsafe {
                (port_api.gc_get_port_url_info)(
                    port,
                    0,
                    ffi::URL_INFO_URL,
                    &mut info_type,
                    buf as *mut c_void,
                    size,
                )
            }
        })?;
        log::debug!("remote device description at {}", url);

        let xml = match DescriptionUrl::parse(&url)? {
            DescriptionUrl::Local {
                file_name,
                address,
                length,
            } => description_text(&file_name, self.read_port(port, address, length)?)?,
            DescriptionUrl::File(path) => {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("read device description {}", path.display()))?;
                description_text(&path.to_string_lossy(), bytes)?
            }
        };
        Ok(RemoteDevice {
            port,
            commands: AcquisitionCommands::from_description(&xml)?,
        })
    }

    fn port_api(&self) -> Result<&PortApi> {
        self.api
            .port
            .as_ref()
            .ok_or_else(|| anyhow!("producer exports no port functions"))
    }

    fn read_port(&self, port: ffi::PORT_HANDLE, address: u64, length: usize) -> Result<Vec<u8>> {
        let port_api = self.port_api()?;
        let mut bytes = vec![0u8; length];
        let mut size = length;
        self.check(
            unsafe { (port_api.gc_read_port)(port, address, bytes.as_mut_ptr() as *mut c_void, &mut size) },
            "GCReadPort",
        )?;
        bytes.truncate(size);
        Ok(bytes)
    }

    /// Writes `value` into a feature register, keeping the untouched bits of
    /// masked registers.
    fn write_register(&self, port: ffi::PORT_HANDLE, register: &Register, value: u64) -> Result<()> {
        let port_api = self.port_api()?;
        let current = if register.is_masked() {
            Some(self.read_port(port, register.address, register.length)?)
        } else {
            None
        };
        let bytes = register.encode(value, current.as_deref())?;
        let mut size = bytes.len();
        self.check(
            unsafe { (port_api.gc_write_port)(port, register.address, bytes.as_ptr() as *const c_void, &mut size) },
            "GCWritePort",
        )?;
        if size != bytes.len() {
            return Err(anyhow!(
                "short port write at {:#x}: {} of {} bytes",
                register.address,
                size,
                bytes.len()
            ));
        }
        Ok(())
    }

    fn check(&self, code: ffi::GC_ERROR, what: &str) -> Result<()> {
        if code == ffi::GC_ERR_SUCCESS {
            return Ok(());
        }
        Err(anyhow!(
            "{} failed with GenTL error {}: {}",
            what,
            code,
            self.last_error_text()
        ))
    }

    fn last_error_text(&self) -> String {
        let mut code: ffi::GC_ERROR = 0;
        self.read_string("GCGetLastError", |buf, size| unsafe {
            (self.api.gc_get_last_error)(&mut code, buf, size)
        })
        .unwrap_or_else(|_| "no error text".to_string())
    }

    /// Runs a GenTL string getter twice: once for the size, once for the text.
    fn read_string(
        &self,
        what: &str,
        mut call: impl FnMut(*mut c_char, *mut usize) -> ffi::GC_ERROR,
    ) -> Result<String> {
        let mut size = 0usize;
        let code = call(ptr::null_mut(), &mut size);
        if code != ffi::GC_ERR_SUCCESS {
            return Err(anyhow!("{} failed with GenTL error {}", what, code));
        }
        if size == 0 {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; size];
        let code = call(buf.as_mut_ptr() as *mut c_char, &mut size);
        if code != ffi::GC_ERR_SUCCESS {
            return Err(anyhow!("{} failed with GenTL error {}", what, code));
        }
        Ok(match CStr::from_bytes_until_nul(&buf) {
            Ok(text) => text.to_string_lossy().into_owned(),
            Err(_) => String::from_utf8_lossy(&buf).into_owned(),
        })
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        for iface in self.interfaces.get_mut().drain(..) {
            unsafe { (self.api.if_close)(iface.handle) };
        }
        unsafe {
            (self.api.tl_close)(self.tl);
            (self.api.gc_close_lib)();
        }
        log::info!("GenTL producer released: {}", self.path.display());
    }
}

/// An opened device with its first data stream and announced buffers.
pub(crate) struct ProducerStream {
    producer: Rc<Producer>,
    device: ffi::DEV_HANDLE,
    stream: ffi::DS_HANDLE,
    event: ffi::EVENT_HANDLE,
    buffers: Vec<ffi::BUFFER_HANDLE>,
    remote: Option<RemoteDevice>,
    params_locked: bool,
    acquiring: bool,
    remote_started: bool,
}

impl ProducerStream {
    fn open(&mut self, iface: ffi::IF_HANDLE, device_id: &str) -> Result<()> {
        let producer = Rc::clone(&self.producer);
        let api = &producer.api;
        let c_device = CString::new(device_id).context("device id contains NUL")?;
        producer.check(
            unsafe {
                (api.if_open_device)(iface, c_device.as_ptr(), ffi::DEVICE_ACCESS_CONTROL, &mut self.device)
            },
            "IFOpenDevice",
        )?;
        self.remote = match producer.remote_device(self.device) {
            Ok(remote) => Some(remote),
            Err(err) => {
                log::warn!(
                    "GenTL device {}: no remote acquisition control, stream start only: {:#}",
                    device_id,
                    err
                );
                None
            }
        };

        let mut stream_count = 0u32;
        producer.check(
            unsafe { (api.dev_get_num_data_streams)(self.device, &mut stream_count) },
            "DevGetNumDataStreams",
        )?;
        if stream_count == 0 {
            return Err(anyhow!("device {} has no data stream", device_id));
        }
        let stream_id = producer.read_string("DevGetDataStreamID", |buf, size| unsafe {
            (api.dev_get_data_stream_id)(self.device, 0, buf, size)
        })?;
        let c_stream = CString::new(stream_id).context("stream id contains NUL")?;
        producer.check(
            unsafe { (api.dev_open_data_stream)(self.device, c_stream.as_ptr(), &mut self.stream) },
            "DevOpenDataStream",
        )?;

        let payload_size: usize = self
            .stream_info(ffi::STREAM_INFO_PAYLOAD_SIZE)
            .context("read stream payload size")?;
        if payload_size == 0 {
            return Err(anyhow!("device {} reports an empty payload", device_id));
        }
        let announce_min: usize = self
            .stream_info(ffi::STREAM_INFO_BUF_ANNOUNCE_MIN)
            .unwrap_or(1);
        for _ in 0..announce_min.max(MIN_ANNOUNCED_BUFFERS) {
            let mut buffer = ptr::null_mut();
            producer.check(
                unsafe {
                    (api.ds_alloc_and_announce_buffer)(self.stream, payload_size, ptr::null_mut(), &mut buffer)
                },
                "DSAllocAndAnnounceBuffer",
            )?;
            self.buffers.push(buffer);
        }

        producer.check(
            unsafe { (api.gc_register_event)(self.stream, ffi::EVENT_NEW_BUFFER, &mut self.event) },
            "GCRegisterEvent",
        )?;

        log::info!(
            "GenTL device {} opened ({} buffers of {} bytes)",
            device_id,
            self.buffers.len(),
            payload_size
        );
        Ok(())
    }

    /// Starts the data stream, then the remote device. A failed start leaves
    /// nothing running.
    pub(crate) fn start(&mut self) -> Result<(), NodeError> {
        if let Err(err) = self.start_inner() {
            if let Err(stop_err) = self.stop() {
                log::warn!("GenTL cleanup after failed start: {}", stop_err);
            }
            return Err(acquisition_error(err));
        }
        Ok(())
    }

    fn start_inner(&mut self) -> Result<()> {
        let producer = Rc::clone(&self.producer);
        let api = &producer.api;
        if let Some(RemoteDevice {
            port,
            commands:
                AcquisitionCommands {
                    params_lock: Some(lock),
                    ..
                },
        }) = &self.remote
        {
            producer
                .write_register(*port, lock, 1)
                .context("lock transport parameters")?;
            self.params_locked = true;
        }

        producer.check(
            unsafe { (api.ds_flush_queue)(self.stream, ffi::ACQ_QUEUE_ALL_TO_INPUT) },
            "DSFlushQueue",
        )?;
        producer.check(
            unsafe { (api.ds_start_acquisition)(self.stream, ffi::ACQ_START_FLAGS_DEFAULT, ffi::GENTL_INFINITE) },
            "DSStartAcquisition",
        )?;
        self.acquiring = true;

        if let Some(remote) = &self.remote {
            let start = remote.commands.start;
            producer
                .write_register(remote.port, &start.register, start.value)
                .context("AcquisitionStart")?;
            self.remote_started = true;
        }
        Ok(())
    }

    pub(crate) fn fetch(&mut self, timeout: Duration) -> Result<RawFrame, NodeError> {
        let api = &self.producer.api;
        let mut data = ffi::EVENT_NEW_BUFFER_DATA::default();
        let mut size = std::mem::size_of::<ffi::EVENT_NEW_BUFFER_DATA>();
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let code = unsafe {
            (api.event_get_data)(
                self.event,
                &mut data as *mut ffi::EVENT_NEW_BUFFER_DATA as *mut c_void,
                &mut size,
                timeout_ms,
            )
        };
        if code == ffi::GC_ERR_TIMEOUT {
            return Err(NodeError::Timeout(timeout));
        }
        self.producer
            .check(code, "EventGetData")
            .map_err(acquisition_error)?;

        let buffer = data.BufferHandle;
        let frame = self.read_buffer(buffer);
        let requeue = unsafe { (api.ds_queue_buffer)(self.stream, buffer) };
        if requeue != ffi::GC_ERR_SUCCESS {
            log::warn!("DSQueueBuffer failed with GenTL error {}", requeue);
        }
        frame
    }

    /// Undoes whatever `start` got through, in reverse order. The first
    /// failure is reported; later steps still run.
    pub(crate) fn stop(&mut self) -> Result<(), NodeError> {
        let producer = Rc::clone(&self.producer);
        let api = &producer.api;
        let mut result = Ok(());

        if let Some(remote) = &self.remote {
            if self.remote_started {
                self.remote_started = false;
                let stop = remote.commands.stop;
                result = producer
                    .write_register(remote.port, &stop.register, stop.value)
                    .context("AcquisitionStop");
            }
        }
        if self.acquiring {
            self.acquiring = false;
            let stopped = producer.check(
                unsafe { (api.ds_stop_acquisition)(self.stream, ffi::ACQ_STOP_FLAGS_KILL) },
                "DSStopAcquisition",
            );
            unsafe {
                (api.ds_flush_queue)(self.stream, ffi::ACQ_QUEUE_ALL_DISCARD);
                (api.event_flush)(self.event);
            }
            result = result.and(stopped);
        }
        if self.params_locked {
            self.params_locked = false;
            if let Some(RemoteDevice {
                port,
                commands:
                    AcquisitionCommands {
                        params_lock: Some(lock),
                        ..
                    },
            }) = &self.remote
            {
                result = result.and(
                    producer
                        .write_register(*port, lock, 0)
                        .context("unlock transport parameters"),
                );
            }
        }
        result.map_err(acquisition_error)
    }

    fn read_buffer(&self, buffer: ffi::BUFFER_HANDLE) -> Result<RawFrame, NodeError> {
        let incomplete: ffi::bool8_t = self.buffer_info(buffer, ffi::BUFFER_INFO_IS_INCOMPLETE)?;
        if incomplete != 0 {
            return Err(NodeError::Acquisition("delivered buffer is incomplete".to_string()));
        }
        let base: *mut c_void = self.buffer_info(buffer, ffi::BUFFER_INFO_BASE)?;
        let filled: usize = self
            .buffer_info(buffer, ffi::BUFFER_INFO_SIZE_FILLED)
            .or_else(|_| self.buffer_info(buffer, ffi::BUFFER_INFO_SIZE))?;
        let width: usize = self.buffer_info(buffer, ffi::BUFFER_INFO_WIDTH)?;
        let height: usize = self.buffer_info(buffer, ffi::BUFFER_INFO_HEIGHT)?;
        let pixel_format: u64 = self.buffer_info(buffer, ffi::BUFFER_INFO_PIXELFORMAT)?;
        let frame_id: u64 = self.buffer_info(buffer, ffi::BUFFER_INFO_FRAMEID).unwrap_or(0);
        let offset: usize = self.buffer_info(buffer, ffi::BUFFER_INFO_IMAGEOFFSET).unwrap_or(0);

        if base.is_null() || offset > filled {
            return Err(NodeError::Acquisition(format!(
                "invalid buffer layout (offset {} of {} bytes)",
                offset, filled
            )));
        }
        // SAFETY: the producer guarantees `filled` readable bytes at `base`
        // until the buffer is queued again, which happens after this copy.
        let bytes = unsafe {
            std::slice::from_raw_parts((base as *const u8).add(offset), filled - offset)
        }
        .to_vec();

        let width = u32::try_from(width).map_err(|_| NodeError::Acquisition("width overflow".into()))?;
        let height =
            u32::try_from(height).map_err(|_| NodeError::Acquisition("height overflow".into()))?;
        let pixel_format = u32::try_from(pixel_format)
            .map_err(|_| NodeError::Acquisition(format!("pixel format {pixel_format:#x} out of range")))?;
        RawFrame::new(bytes, width, height, pixel_format, frame_id).map_err(acquisition_error)
    }

    fn buffer_info<T: Copy>(&self, buffer: ffi::BUFFER_HANDLE, cmd: ffi::BUFFER_INFO_CMD) -> Result<T, NodeError> {
        let api = &self.producer.api;
        let mut value = MaybeUninit::<T>::zeroed();
        let mut size = std::mem::size_of::<T>();
        let mut info_type: ffi::INFO_DATATYPE = 0;
        self.producer
            .check(
                unsafe {
                    (api.ds_get_buffer_info)(
                        self.stream,
                        buffer,
                        cmd,
                        &mut info_type,
                        value.as_mut_ptr() as *mut c_void,
                        &mut size,
                    )
                },
                "DSGetBufferInfo",
            )
            .map_err(acquisition_error)?;
        // SAFETY: zero-initialized and then written by the producer; every `T`
        // used here is a plain integer or pointer.
        Ok(unsafe { value.assume_init() })
    }

    fn stream_info<T: Copy>(&self, cmd: ffi::STREAM_INFO_CMD) -> Result<T> {
        let api = &self.producer.api;
        let mut value = MaybeUninit::<T>::zeroed();
        let mut size = std::mem::size_of::<T>();
        let mut info_type: ffi::INFO_DATATYPE = 0;
        self.producer.check(
            unsafe {
                (api.ds_get_info)(
                    self.stream,
                    cmd,
                    &mut info_type,
                    value.as_mut_ptr() as *mut c_void,
                    &mut size,
                )
            },
            "DSGetInfo",
        )?;
        // SAFETY: see `buffer_info`.
        Ok(unsafe { value.assume_init() })
    }
}

impl Drop for ProducerStream {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("GenTL stream stop on close failed: {}", err);
        }
        let api = &self.producer.api;
        unsafe {
            if !self.event.is_null() {
                (api.gc_unregister_event)(self.stream, ffi::EVENT_NEW_BUFFER);
            }
            for buffer in self.buffers.drain(..) {
                (api.ds_revoke_buffer)(self.stream, buffer, ptr::null_mut(), ptr::null_mut());
            }
            if !self.stream.is_null() {
                (api.ds_close)(self.stream);
            }
            if !self.device.is_null() {
                (api.dev_close)(self.device);
            }
        }
        log::debug!("GenTL stream closed ({})", self.producer.path().display());
    }
}

fn acquisition_error(err: anyhow::Error) -> NodeError {
    NodeError::Acquisition(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    //! Runs `Producer` and `ProducerStream` against an in-process producer
    //! whose entry points are plain `extern "C"` functions.

    use super::*;
    use crate::demosaic::pfnc;
    use crate::gentl::genapi::tests::DESCRIPTION;
    use std::collections::HashMap;

    const TL: usize = 0x10;
    const IFACE: usize = 0x20;
    const DEVICE: usize = 0x30;
    const STREAM: usize = 0x40;
    const EVENT: usize = 0x50;
    const PORT: usize = 0x60;
    const BUFFER_BASE: usize = 0x100;
    const XML_ADDRESS: u64 = 0x1000;
    const WIDTH: usize = 4;
    const HEIGHT: usize = 2;

    #[derive(Default)]
    struct Bench {
        calls: Vec<String>,
        frame: Vec<u8>,
        registers: HashMap<u64, Vec<u8>>,
        announced: usize,
        queued: Vec<usize>,
        deliver: bool,
        incomplete: bool,
        description: Option<String>,
    }

    thread_local! {
        static BENCH: RefCell<Bench> = RefCell::new(Bench::default());
    }

    fn with_bench<T>(f: impl FnOnce(&mut Bench) -> T) -> T {
        BENCH.with(|bench| f(&mut bench.borrow_mut()))
    }

    fn record(call: impl Into<String>) {
        let call = call.into();
        with_bench(|bench| bench.calls.push(call));
    }

    fn handle(value: usize) -> *mut c_void {
        value as *mut c_void
    }

    unsafe fn put_string(text: &str, buf: *mut c_char, size: *mut usize) -> ffi::GC_ERROR {
        let needed = text.len() + 1;
        if buf.is_null() {
            *size = needed;
            return ffi::GC_ERR_SUCCESS;
        }
        if *size < needed {
            return ffi::GC_ERR_BUFFER_TOO_SMALL;
        }
        ptr::copy_nonoverlapping(text.as_ptr(), buf as *mut u8, text.len());
        *buf.add(text.len()) = 0;
        *size = needed;
        ffi::GC_ERR_SUCCESS
    }

    unsafe fn put_value<T: Copy>(value: T, buf: *mut c_void, size: *mut usize) -> ffi::GC_ERROR {
        let needed = std::mem::size_of::<T>();
        if *size < needed {
            return ffi::GC_ERR_BUFFER_TOO_SMALL;
        }
        ptr::write_unaligned(buf as *mut T, value);
        *size = needed;
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn gc_init_lib() -> ffi::GC_ERROR {
        record("GCInitLib");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn gc_close_lib() -> ffi::GC_ERROR {
        record("GCCloseLib");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn gc_get_last_error(
        code: *mut ffi::GC_ERROR,
        text: *mut c_char,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        *code = ffi::GC_ERR_NOT_IMPLEMENTED;
        put_string("bench producer error", text, size)
    }

    unsafe extern "C" fn tl_open(tl: *mut ffi::TL_HANDLE) -> ffi::GC_ERROR {
        *tl = handle(TL);
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn tl_close(_: ffi::TL_HANDLE) -> ffi::GC_ERROR {
        record("TLClose");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn tl_update_interface_list(
        _: ffi::TL_HANDLE,
        changed: *mut ffi::bool8_t,
        _: u64,
    ) -> ffi::GC_ERROR {
        *changed = 1;
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn tl_get_num_interfaces(_: ffi::TL_HANDLE, count: *mut u32) -> ffi::GC_ERROR {
        *count = 1;
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn tl_get_interface_id(
        _: ffi::TL_HANDLE,
        _: u32,
        id: *mut c_char,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        put_string("bench-if", id, size)
    }

    unsafe extern "C" fn tl_open_interface(
        _: ffi::TL_HANDLE,
        _: *const c_char,
        iface: *mut ffi::IF_HANDLE,
    ) -> ffi::GC_ERROR {
        *iface = handle(IFACE);
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn if_close(_: ffi::IF_HANDLE) -> ffi::GC_ERROR {
        record("IFClose");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn if_update_device_list(
        _: ffi::IF_HANDLE,
        changed: *mut ffi::bool8_t,
        _: u64,
    ) -> ffi::GC_ERROR {
        *changed = 1;
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn if_get_num_devices(_: ffi::IF_HANDLE, count: *mut u32) -> ffi::GC_ERROR {
        *count = 1;
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn if_get_device_id(
        _: ffi::IF_HANDLE,
        _: u32,
        id: *mut c_char,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        put_string("bench-cam", id, size)
    }

    unsafe extern "C" fn if_get_device_info(
        _: ffi::IF_HANDLE,
        _: *const c_char,
        cmd: ffi::DEVICE_INFO_CMD,
        _: *mut ffi::INFO_DATATYPE,
        buf: *mut c_void,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        let text = match cmd {
            ffi::DEVICE_INFO_VENDOR => "Lab",
            ffi::DEVICE_INFO_MODEL => "Bench",
            ffi::DEVICE_INFO_SERIAL_NUMBER => "0042",
            ffi::DEVICE_INFO_DISPLAYNAME => "Lab Bench",
            _ => return ffi::GC_ERR_NOT_IMPLEMENTED,
        };
        put_string(text, buf as *mut c_char, size)
    }

    unsafe extern "C" fn if_open_device(
        _: ffi::IF_HANDLE,
        _: *const c_char,
        _: ffi::DEVICE_ACCESS_FLAGS,
        device: *mut ffi::DEV_HANDLE,
    ) -> ffi::GC_ERROR {
        record("IFOpenDevice");
        *device = handle(DEVICE);
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn dev_close(_: ffi::DEV_HANDLE) -> ffi::GC_ERROR {
        record("DevClose");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn dev_get_port(_: ffi::DEV_HANDLE, port: *mut ffi::PORT_HANDLE) -> ffi::GC_ERROR {
        *port = handle(PORT);
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn dev_get_num_data_streams(_: ffi::DEV_HANDLE, count: *mut u32) -> ffi::GC_ERROR {
        *count = 1;
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn dev_get_data_stream_id(
        _: ffi::DEV_HANDLE,
        _: u32,
        id: *mut c_char,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        put_string("bench-ds", id, size)
    }

    unsafe extern "C" fn dev_open_data_stream(
        _: ffi::DEV_HANDLE,
        _: *const c_char,
        stream: *mut ffi::DS_HANDLE,
    ) -> ffi::GC_ERROR {
        *stream = handle(STREAM);
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn ds_close(_: ffi::DS_HANDLE) -> ffi::GC_ERROR {
        record("DSClose");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn ds_get_info(
        _: ffi::DS_HANDLE,
        cmd: ffi::STREAM_INFO_CMD,
        _: *mut ffi::INFO_DATATYPE,
        buf: *mut c_void,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        match cmd {
            ffi::STREAM_INFO_PAYLOAD_SIZE => put_value(with_bench(|bench| bench.frame.len()), buf, size),
            ffi::STREAM_INFO_BUF_ANNOUNCE_MIN => put_value(2usize, buf, size),
            _ => ffi::GC_ERR_NOT_IMPLEMENTED,
        }
    }

    unsafe extern "C" fn ds_alloc_and_announce_buffer(
        _: ffi::DS_HANDLE,
        _: usize,
        _: *mut c_void,
        buffer: *mut ffi::BUFFER_HANDLE,
    ) -> ffi::GC_ERROR {
        let count = with_bench(|bench| {
            bench.announced += 1;
            bench.announced
        });
        *buffer = handle(BUFFER_BASE + count);
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn ds_revoke_buffer(
        _: ffi::DS_HANDLE,
        _: ffi::BUFFER_HANDLE,
        _: *mut *mut c_void,
        _: *mut *mut c_void,
    ) -> ffi::GC_ERROR {
        record("DSRevokeBuffer");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn ds_queue_buffer(_: ffi::DS_HANDLE, buffer: ffi::BUFFER_HANDLE) -> ffi::GC_ERROR {
        with_bench(|bench| bench.queued.push(buffer as usize));
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn ds_flush_queue(_: ffi::DS_HANDLE, operation: ffi::ACQ_QUEUE_TYPE) -> ffi::GC_ERROR {
        record(format!("DSFlushQueue {operation}"));
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn ds_start_acquisition(
        _: ffi::DS_HANDLE,
        _: ffi::ACQ_START_FLAGS,
        _: u64,
    ) -> ffi::GC_ERROR {
        record("DSStartAcquisition");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn ds_stop_acquisition(_: ffi::DS_HANDLE, flags: ffi::ACQ_STOP_FLAGS) -> ffi::GC_ERROR {
        record(format!("DSStopAcquisition {flags}"));
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn ds_get_buffer_info(
        _: ffi::DS_HANDLE,
        buffer: ffi::BUFFER_HANDLE,
        cmd: ffi::BUFFER_INFO_CMD,
        _: *mut ffi::INFO_DATATYPE,
        buf: *mut c_void,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        let (base, len, incomplete) =
            with_bench(|bench| (bench.frame.as_ptr(), bench.frame.len(), bench.incomplete));
        match cmd {
            ffi::BUFFER_INFO_BASE => put_value(base as *mut c_void, buf, size),
            ffi::BUFFER_INFO_SIZE | ffi::BUFFER_INFO_SIZE_FILLED => put_value(len, buf, size),
            ffi::BUFFER_INFO_IS_INCOMPLETE => put_value(ffi::bool8_t::from(incomplete), buf, size),
            ffi::BUFFER_INFO_TLTYPE => put_string("U3V", buf as *mut c_char, size),
            ffi::BUFFER_INFO_WIDTH => put_value(WIDTH, buf, size),
            ffi::BUFFER_INFO_HEIGHT => put_value(HEIGHT, buf, size),
            ffi::BUFFER_INFO_PIXELFORMAT => put_value(u64::from(pfnc::MONO8), buf, size),
            ffi::BUFFER_INFO_FRAMEID => put_value(buffer as u64, buf, size),
            ffi::BUFFER_INFO_IMAGEOFFSET => put_value(0usize, buf, size),
            _ => ffi::GC_ERR_NOT_IMPLEMENTED,
        }
    }

    unsafe extern "C" fn gc_register_event(
        _: ffi::EVENTSRC_HANDLE,
        _: ffi::EVENT_TYPE,
        event: *mut ffi::EVENT_HANDLE,
    ) -> ffi::GC_ERROR {
        *event = handle(EVENT);
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn gc_unregister_event(_: ffi::EVENTSRC_HANDLE, _: ffi::EVENT_TYPE) -> ffi::GC_ERROR {
        record("GCUnregisterEvent");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn event_get_data(
        _: ffi::EVENT_HANDLE,
        buf: *mut c_void,
        size: *mut usize,
        _: u64,
    ) -> ffi::GC_ERROR {
        if !with_bench(|bench| bench.deliver) {
            return ffi::GC_ERR_TIMEOUT;
        }
        let data = ffi::EVENT_NEW_BUFFER_DATA {
            BufferHandle: handle(BUFFER_BASE + 1),
            pUserPointer: ptr::null_mut(),
        };
        put_value(data, buf, size)
    }

    unsafe extern "C" fn event_flush(_: ffi::EVENT_HANDLE) -> ffi::GC_ERROR {
        record("EventFlush");
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn gc_get_num_port_urls(_: ffi::PORT_HANDLE, count: *mut u32) -> ffi::GC_ERROR {
        *count = u32::from(with_bench(|bench| bench.description.is_some()));
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn gc_get_port_url_info(
        _: ffi::PORT_HANDLE,
        _: u32,
        _: ffi::URL_INFO_CMD,
        _: *mut ffi::INFO_DATATYPE,
        buf: *mut c_void,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        let len = with_bench(|bench| bench.description.as_ref().map_or(0, String::len));
        let url = format!("Local:bench.xml;{XML_ADDRESS:x};{len:x}?SchemaVersion=1.1.0");
        put_string(&url, buf as *mut c_char, size)
    }

    unsafe extern "C" fn gc_read_port(
        _: ffi::PORT_HANDLE,
        address: u64,
        buf: *mut c_void,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        let wanted = *size;
        let bytes = with_bench(|bench| {
            if address == XML_ADDRESS {
                bench.description.clone().unwrap_or_default().into_bytes()
            } else {
                bench
                    .registers
                    .get(&address)
                    .cloned()
                    .unwrap_or_else(|| vec![0; wanted])
            }
        });
        let count = bytes.len().min(wanted);
        ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, count);
        *size = count;
        ffi::GC_ERR_SUCCESS
    }

    unsafe extern "C" fn gc_write_port(
        _: ffi::PORT_HANDLE,
        address: u64,
        buf: *const c_void,
        size: *mut usize,
    ) -> ffi::GC_ERROR {
        let bytes = std::slice::from_raw_parts(buf as *const u8, *size).to_vec();
        record(format!("GCWritePort {address:#x} {bytes:?}"));
        with_bench(|bench| {
            bench.registers.insert(address, bytes);
        });
        ffi::GC_ERR_SUCCESS
    }

    fn bench_api() -> GenTlApi {
        GenTlApi {
            gc_init_lib,
            gc_close_lib,
            gc_get_last_error,
            tl_open,
            tl_close,
            tl_update_interface_list,
            tl_get_num_interfaces,
            tl_get_interface_id,
            tl_open_interface,
            if_close,
            if_update_device_list,
            if_get_num_devices,
            if_get_device_id,
            if_get_device_info,
            if_open_device,
            dev_close,
            dev_get_num_data_streams,
            dev_get_data_stream_id,
            dev_open_data_stream,
            ds_close,
            ds_get_info,
            ds_alloc_and_announce_buffer,
            ds_revoke_buffer,
            ds_queue_buffer,
            ds_flush_queue,
            ds_start_acquisition,
            ds_stop_acquisition,
            ds_get_buffer_info,
            gc_register_event,
            gc_unregister_event,
            event_get_data,
            event_flush,
            port: Some(PortApi {
                dev_get_port,
                gc_get_num_port_urls,
                gc_get_port_url_info,
                gc_read_port,
                gc_write_port,
            }),
            _library: None,
        }
    }

    fn bench_producer(description: Option<&str>) -> Rc<Producer> {
        with_bench(|bench| {
            *bench = Bench {
                frame: (0..(WIDTH * HEIGHT) as u8).map(|v| v * 30).collect(),
                deliver: true,
                description: description.map(str::to_string),
                ..Bench::default()
            };
        });
        Rc::new(Producer::init(Path::new("bench.cti"), bench_api()).expect("bench producer"))
    }

    fn open_stream(producer: &Rc<Producer>) -> ProducerStream {
        let devices = producer.discover().expect("discover");
        assert_eq!(devices.len(), 1);
        producer
            .open_stream(&devices[0].interface_id, &devices[0].info.id)
            .expect("open stream")
    }

    fn calls() -> Vec<String> {
        with_bench(|bench| bench.calls.clone())
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls
            .iter()
            .position(|c| c.starts_with(call))
            .unwrap_or_else(|| panic!("{call} never issued: {calls:?}"))
    }

    #[test]
    fn discovery_reads_device_info() {
        let producer = bench_producer(None);
        let devices = producer.discover().expect("discover");

        let info = &devices[0].info;
        assert_eq!(info.id, "bench-cam");
        assert_eq!((info.vendor.as_str(), info.model.as_str()), ("Lab", "Bench"));
        assert_eq!(info.serial_number, "0042");
        assert_eq!(info.display_name, "Lab Bench");
        assert_eq!(info.source, "bench.cti");
        assert_eq!(devices[0].interface_id, "bench-if");
    }

    #[test]
    fn one_cycle_copies_the_frame_and_requeues_the_buffer() -> Result<(), NodeError> {
        let producer = bench_producer(Some(DESCRIPTION));
        let mut stream = open_stream(&producer);

        stream.start()?;
        let frame = stream.fetch(Duration::from_millis(50))?;
        stream.stop()?;

        assert_eq!((frame.width, frame.height), (WIDTH as u32, HEIGHT as u32));
        assert_eq!(frame.pixel_format, pfnc::MONO8);
        assert_eq!(frame.frame_id, (BUFFER_BASE + 1) as u64);
        assert_eq!(frame.data(), &[0, 30, 60, 90, 120, 150, 180, 210]);
        assert_eq!(with_bench(|bench| bench.queued.clone()), vec![BUFFER_BASE + 1]);
        Ok(())
    }

    #[test]
    fn remote_commands_bracket_the_stream() -> Result<(), NodeError> {
        let producer = bench_producer(Some(DESCRIPTION));
        let mut stream = open_stream(&producer);
        stream.start()?;
        stream.stop()?;

        let calls = calls();
        let lock = position(&calls, "GCWritePort 0x20010 [0, 0, 0, 1]");
        let stream_start = position(&calls, "DSStartAcquisition");
        let device_start = position(&calls, "GCWritePort 0x20000 [0, 0, 0, 1]");
        let device_stop = position(&calls, "GCWritePort 0x20004 [1, 0, 0, 0]");
        let stream_stop = position(&calls, "DSStopAcquisition 1");
        let unlock = position(&calls, "GCWritePort 0x20010 [0, 0, 0, 0]");
        assert!(lock < stream_start);
        assert!(stream_start < device_start);
        assert!(device_start < device_stop);
        assert!(device_stop < stream_stop);
        assert!(stream_stop < unlock);
        Ok(())
    }

    #[test]
    fn masked_command_keeps_neighbouring_bits() -> Result<(), NodeError> {
        let producer = bench_producer(Some(DESCRIPTION));
        with_bench(|bench| {
            bench.registers.insert(0x20004, vec![0, 0xFF, 0, 0]);
        });
        let mut stream = open_stream(&producer);
        stream.start()?;
        stream.stop()?;

        assert_eq!(
            with_bench(|bench| bench.registers.get(&0x20004).cloned()),
            Some(vec![1, 0xFF, 0, 0])
        );
        Ok(())
    }

    #[test]
    fn device_without_description_streams_only() -> Result<(), NodeError> {
        let producer = bench_producer(None);
        let mut stream = open_stream(&producer);
        stream.start()?;
        stream.fetch(Duration::from_millis(50))?;
        stream.stop()?;

        assert!(!calls().iter().any(|call| call.starts_with("GCWritePort")));
        Ok(())
    }

    #[test]
    fn incomplete_buffer_is_rejected_and_requeued() {
        let producer = bench_producer(None);
        with_bench(|bench| bench.incomplete = true);
        let mut stream = open_stream(&producer);
        stream.start().expect("start");

        let err = stream.fetch(Duration::from_millis(50)).err();
        assert!(matches!(err, Some(NodeError::Acquisition(_))));
        assert_eq!(with_bench(|bench| bench.queued.len()), 1);
    }

    #[test]
    fn silent_stream_times_out() {
        let producer = bench_producer(None);
        with_bench(|bench| bench.deliver = false);
        let mut stream = open_stream(&producer);
        stream.start().expect("start");

        let timeout = Duration::from_millis(5);
        assert!(matches!(stream.fetch(timeout), Err(NodeError::Timeout(t)) if t == timeout));
        assert!(stream.stop().is_ok());
    }

    #[test]
    fn drop_releases_handles_in_reverse_order() {
        let producer = bench_producer(Some(DESCRIPTION));
        let mut stream = open_stream(&producer);
        stream.start().expect("start");
        drop(stream);
        drop(producer);

        let calls = calls();
        let order = [
            "GCWritePort 0x20004",
            "DSStopAcquisition",
            "GCUnregisterEvent",
            "DSRevokeBuffer",
            "DSClose",
            "DevClose",
            "IFClose",
            "TLClose",
            "GCCloseLib",
        ]
        .map(|call| position(&calls, call));
        assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{calls:?}");
        let revoked = calls.iter().filter(|call| *call == "DSRevokeBuffer").count();
        assert_eq!(revoked, MIN_ANNOUNCED_BUFFERS);
    }
}
