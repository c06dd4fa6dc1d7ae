//! GenTL transport layer C ABI (GenTL standard 1.5).
//!
//! Only the entry points the node needs are declared. Every producer exports
//! them as plain C symbols; the calling convention is the platform default.

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use std::os::raw::{c_char, c_void};

pub type GC_ERROR = i32;
pub type bool8_t = u8;

pub type TL_HANDLE = *mut c_void;
pub type IF_HANDLE = *mut c_void;
pub type DEV_HANDLE = *mut c_void;
pub type DS_HANDLE = *mut c_void;
pub type BUFFER_HANDLE = *mut c_void;
pub type EVENT_HANDLE = *mut c_void;
pub type EVENTSRC_HANDLE = *mut c_void;
pub type PORT_HANDLE = *mut c_void;

pub type INFO_DATATYPE = i32;
pub type DEVICE_INFO_CMD = i32;
pub type DEVICE_ACCESS_FLAGS = i32;
pub type STREAM_INFO_CMD = i32;
pub type BUFFER_INFO_CMD = i32;
pub type ACQ_START_FLAGS = i32;
pub type ACQ_STOP_FLAGS = i32;
pub type ACQ_QUEUE_TYPE = i32;
pub type EVENT_TYPE = i32;
pub type URL_INFO_CMD = i32;

pub const GC_ERR_SUCCESS: GC_ERROR = 0;
pub const GC_ERR_NOT_INITIALIZED: GC_ERROR = -1002;
pub const GC_ERR_NOT_IMPLEMENTED: GC_ERROR = -1003;
pub const GC_ERR_RESOURCE_IN_USE: GC_ERROR = -1004;
pub const GC_ERR_NO_DATA: GC_ERROR = -1008;
pub const GC_ERR_TIMEOUT: GC_ERROR = -1011;
pub const GC_ERR_ABORT: GC_ERROR = -1012;
pub const GC_ERR_BUFFER_TOO_SMALL: GC_ERROR = -1016;

pub const GENTL_INFINITE: u64 = u64::MAX;

pub const DEVICE_INFO_ID: DEVICE_INFO_CMD = 0;
pub const DEVICE_INFO_VENDOR: DEVICE_INFO_CMD = 1;
pub const DEVICE_INFO_MODEL: DEVICE_INFO_CMD = 2;
pub const DEVICE_INFO_TLTYPE: DEVICE_INFO_CMD = 3;
pub const DEVICE_INFO_DISPLAYNAME: DEVICE_INFO_CMD = 4;
pub const DEVICE_INFO_SERIAL_NUMBER: DEVICE_INFO_CMD = 7;

pub const DEVICE_ACCESS_READONLY: DEVICE_ACCESS_FLAGS = 2;
pub const DEVICE_ACCESS_CONTROL: DEVICE_ACCESS_FLAGS = 3;
pub const DEVICE_ACCESS_EXCLUSIVE: DEVICE_ACCESS_FLAGS = 4;

pub const STREAM_INFO_PAYLOAD_SIZE: STREAM_INFO_CMD = 7;
pub const STREAM_INFO_BUF_ANNOUNCE_MIN: STREAM_INFO_CMD = 12;

pub const BUFFER_INFO_BASE: BUFFER_INFO_CMD = 0;
pub const BUFFER_INFO_SIZE: BUFFER_INFO_CMD = 1;
pub const BUFFER_INFO_IS_INCOMPLETE: BUFFER_INFO_CMD = 7;
pub const BUFFER_INFO_TLTYPE: BUFFER_INFO_CMD = 8;
pub const BUFFER_INFO_SIZE_FILLED: BUFFER_INFO_CMD = 9;
pub const BUFFER_INFO_WIDTH: BUFFER_INFO_CMD = 10;
pub const BUFFER_INFO_HEIGHT: BUFFER_INFO_CMD = 11;
pub const BUFFER_INFO_FRAMEID: BUFFER_INFO_CMD = 16;
pub const BUFFER_INFO_IMAGEOFFSET: BUFFER_INFO_CMD = 18;
pub const BUFFER_INFO_PIXELFORMAT: BUFFER_INFO_CMD = 20;

pub const ACQ_START_FLAGS_DEFAULT: ACQ_START_FLAGS = 0;
pub const ACQ_STOP_FLAGS_DEFAULT: ACQ_STOP_FLAGS = 0;
pub const ACQ_STOP_FLAGS_KILL: ACQ_STOP_FLAGS = 1;

pub const ACQ_QUEUE_ALL_TO_INPUT: ACQ_QUEUE_TYPE = 2;
pub const ACQ_QUEUE_ALL_DISCARD: ACQ_QUEUE_TYPE = 4;

pub const EVENT_NEW_BUFFER: EVENT_TYPE = 1;

pub const URL_INFO_URL: URL_INFO_CMD = 0;

/// Payload of an `EVENT_NEW_BUFFER` event.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EVENT_NEW_BUFFER_DATA {
    pub BufferHandle: BUFFER_HANDLE,
    pub pUserPointer: *mut c_void,
}

impl Default for EVENT_NEW_BUFFER_DATA {
    fn default() -> Self {
        Self {
            BufferHandle: std::ptr::null_mut(),
            pUserPointer: std::ptr::null_mut(),
        }
    }
}

pub type GCInitLib = unsafe extern "C" fn() -> GC_ERROR;
pub type GCCloseLib = unsafe extern "C" fn() -> GC_ERROR;
pub type GCGetLastError =
    unsafe extern "C" fn(piErrorCode: *mut GC_ERROR, sErrText: *mut c_char, piSize: *mut usize) -> GC_ERROR;

pub type TLOpen = unsafe extern "C" fn(phTL: *mut TL_HANDLE) -> GC_ERROR;
pub type TLClose = unsafe extern "C" fn(hTL: TL_HANDLE) -> GC_ERROR;
pub type TLUpdateInterfaceList =
    unsafe extern "C" fn(hTL: TL_HANDLE, pbChanged: *mut bool8_t, iTimeout: u64) -> GC_ERROR;
pub type TLGetNumInterfaces = unsafe extern "C" fn(hTL: TL_HANDLE, piNumIfaces: *mut u32) -> GC_ERROR;
pub type TLGetInterfaceID =
    unsafe extern "C" fn(hTL: TL_HANDLE, iIndex: u32, sID: *mut c_char, piSize: *mut usize) -> GC_ERROR;
pub type TLOpenInterface =
    unsafe extern "C" fn(hTL: TL_HANDLE, sIfaceID: *const c_char, phIface: *mut IF_HANDLE) -> GC_ERROR;

pub type IFClose = unsafe extern "C" fn(hIface: IF_HANDLE) -> GC_ERROR;
pub type IFUpdateDeviceList =
    unsafe extern "C" fn(hIface: IF_HANDLE, pbChanged: *mut bool8_t, iTimeout: u64) -> GC_ERROR;
pub type IFGetNumDevices = unsafe extern "C" fn(hIface: IF_HANDLE, piNumDevices: *mut u32) -> GC_ERROR;
pub type IFGetDeviceID =
    unsafe extern "C" fn(hIface: IF_HANDLE, iIndex: u32, sIDeviceID: *mut c_char, piSize: *mut usize) -> GC_ERROR;
pub type IFGetDeviceInfo = unsafe extern "C" fn(
    hIface: IF_HANDLE,
    sDeviceID: *const c_char,
    iInfoCmd: DEVICE_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;
pub type IFOpenDevice = unsafe extern "C" fn(
    hIface: IF_HANDLE,
    sDeviceID: *const c_char,
    iOpenFlag: DEVICE_ACCESS_FLAGS,
    phDevice: *mut DEV_HANDLE,
) -> GC_ERROR;

pub type DevClose = unsafe extern "C" fn(hDevice: DEV_HANDLE) -> GC_ERROR;
pub type DevGetPort = unsafe extern "C" fn(hDevice: DEV_HANDLE, phRemoteDevice: *mut PORT_HANDLE) -> GC_ERROR;
pub type DevGetNumDataStreams =
    unsafe extern "C" fn(hDevice: DEV_HANDLE, piNumDataStreams: *mut u32) -> GC_ERROR;
pub type DevGetDataStreamID = unsafe extern "C" fn(
    hDevice: DEV_HANDLE,
    iIndex: u32,
    sDataStreamID: *mut c_char,
    piSize: *mut usize,
) -> GC_ERROR;
pub type DevOpenDataStream = unsafe extern "C" fn(
    hDevice: DEV_HANDLE,
    sDataStreamID: *const c_char,
    phDataStream: *mut DS_HANDLE,
) -> GC_ERROR;

pub type DSClose = unsafe extern "C" fn(hDataStream: DS_HANDLE) -> GC_ERROR;
pub type DSGetInfo = unsafe extern "C" fn(
    hDataStream: DS_HANDLE,
    iInfoCmd: STREAM_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;
pub type DSAllocAndAnnounceBuffer = unsafe extern "C" fn(
    hDataStream: DS_HANDLE,
    iBufferSize: usize,
    pPrivate: *mut c_void,
    phBuffer: *mut BUFFER_HANDLE,
) -> GC_ERROR;
pub type DSRevokeBuffer = unsafe extern "C" fn(
    hDataStream: DS_HANDLE,
    hBuffer: BUFFER_HANDLE,
    pBuffer: *mut *mut c_void,
    pPrivate: *mut *mut c_void,
) -> GC_ERROR;
pub type DSQueueBuffer = unsafe extern "C" fn(hDataStream: DS_HANDLE, hBuffer: BUFFER_HANDLE) -> GC_ERROR;
pub type DSFlushQueue = unsafe extern "C" fn(hDataStream: DS_HANDLE, iOperation: ACQ_QUEUE_TYPE) -> GC_ERROR;
pub type DSStartAcquisition = unsafe extern "C" fn(
    hDataStream: DS_HANDLE,
    iStartFlags: ACQ_START_FLAGS,
    iNumToAcquire: u64,
) -> GC_ERROR;
pub type DSStopAcquisition =
    unsafe extern "C" fn(hDataStream: DS_HANDLE, iStopFlags: ACQ_STOP_FLAGS) -> GC_ERROR;
pub type DSGetBufferInfo = unsafe extern "C" fn(
    hDataStream: DS_HANDLE,
    hBuffer: BUFFER_HANDLE,
    iInfoCmd: BUFFER_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;

pub type GCRegisterEvent = unsafe extern "C" fn(
    hEventSrc: EVENTSRC_HANDLE,
    iEventID: EVENT_TYPE,
    phEvent: *mut EVENT_HANDLE,
) -> GC_ERROR;
pub type GCUnregisterEvent =
    unsafe extern "C" fn(hEventSrc: EVENTSRC_HANDLE, iEventID: EVENT_TYPE) -> GC_ERROR;
pub type EventGetData = unsafe extern "C" fn(
    hEvent: EVENT_HANDLE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
    iTimeout: u64,
) -> GC_ERROR;
pub type EventFlush = unsafe extern "C" fn(hEvent: EVENT_HANDLE) -> GC_ERROR;

pub type GCGetNumPortURLs = unsafe extern "C" fn(hPort: PORT_HANDLE, piNumURLs: *mut u32) -> GC_ERROR;
pub type GCGetPortURLInfo = unsafe extern "C" fn(
    hPort: PORT_HANDLE,
    iURLIndex: u32,
    iInfoCmd: URL_INFO_CMD,
    piType: *mut INFO_DATATYPE,
    pBuffer: *mut c_void,
    piSize: *mut usize,
) -> GC_ERROR;
pub type GCReadPort =
    unsafe extern "C" fn(hPort: PORT_HANDLE, iAddress: u64, pBuffer: *mut c_void, piSize: *mut usize) -> GC_ERROR;
pub type GCWritePort =
    unsafe extern "C" fn(hPort: PORT_HANDLE, iAddress: u64, pBuffer: *const c_void, piSize: *mut usize) -> GC_ERROR;
