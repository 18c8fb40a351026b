//! Native backend over the sifir C ABI (`libsifir`).
//!
//! Every pointer handed out by the library is wrapped in an owning type the
//! moment it crosses the boundary. Strings the library allocates are copied
//! and returned with `destroy_cstr`.

use std::ffi::{c_char, c_void, CStr, CString};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use torbridge_core::{NativeBackend, NativeError, StreamObserver};

const TAG_SUCCESS: u32 = 0;

#[repr(C)]
struct ResultMessage {
    tag: u32,
    error: *mut c_char,
}

#[repr(C)]
struct BoxedResult {
    result: *mut c_void,
    message: ResultMessage,
}

#[repr(C)]
struct Observer {
    context: *mut c_void,
    on_success: extern "C" fn(*mut c_char, *const c_void),
    on_err: extern "C" fn(*mut c_char, *const c_void),
}

#[link(name = "sifir")]
extern "C" {
    fn get_owned_TorService(
        data_dir: *const c_char,
        socks_port: u16,
        bootstrap_timeout_ms: u64,
    ) -> *mut BoxedResult;
    fn get_status_of_owned_TorService(service: *mut c_void) -> *mut c_char;
    fn shutdown_owned_TorService(service: *mut c_void);
    fn tcp_stream_start(target: *const c_char, proxy: *const c_char, timeout_ms: u64)
        -> *mut BoxedResult;
    fn tcp_stream_on_data(stream: *mut c_void, observer: Observer);
    fn tcp_stream_send_msg(stream: *mut c_void, msg: *const c_char, timeout_secs: u64)
        -> ResultMessage;
    fn tcp_stream_destroy(stream: *mut c_void);
    fn destroy_cstr(s: *mut c_char);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SifirBackend;

pub struct SifirService {
    raw: NonNull<c_void>,
}

// The library's service is internally synchronized; the pointer is only an id.
unsafe impl Send for SifirService {}
unsafe impl Sync for SifirService {}

pub struct SifirStream {
    raw: NonNull<c_void>,
    /// Boxed observer registered as the C callback context.
    context: Mutex<Option<NonNull<StreamObserver>>>,
}

unsafe impl Send for SifirStream {}
unsafe impl Sync for SifirStream {}

impl Drop for SifirStream {
    fn drop(&mut self) {
        let context = self
            .context
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(context) = context {
            // SAFETY: produced by Box::into_raw in subscribe_stream, freed once.
            drop(unsafe { Box::from_raw(context.as_ptr()) });
        }
    }
}

impl NativeBackend for SifirBackend {
    type Service = SifirService;
    type Stream = SifirStream;

    fn start_service(
        &self,
        work_dir: &Path,
        socks_port: u16,
        timeout: Duration,
    ) -> Result<SifirService, NativeError> {
        let dir = c_string(&work_dir.to_string_lossy())?;
        // SAFETY: dir outlives the call; the result is read once below.
        let boxed = unsafe { get_owned_TorService(dir.as_ptr(), socks_port, millis(timeout)) };
        let raw = unsafe { take_result(boxed) }?;
        Ok(SifirService { raw })
    }

    fn service_status(&self, service: &SifirService) -> Result<String, NativeError> {
        // SAFETY: service.raw is live until shutdown_service consumes it.
        let status = unsafe { take_cstr(get_status_of_owned_TorService(service.raw.as_ptr())) };
        status.ok_or_else(NativeError::unknown)
    }

    fn shutdown_service(&self, service: SifirService) {
        // SAFETY: consumes the only owner.
        unsafe { shutdown_owned_TorService(service.raw.as_ptr()) };
    }

    fn open_stream(
        &self,
        target: &str,
        proxy: SocketAddr,
        timeout: Duration,
    ) -> Result<SifirStream, NativeError> {
        let target = c_string(target)?;
        let proxy = c_string(&proxy.to_string())?;
        // SAFETY: both strings outlive the call.
        let boxed = unsafe { tcp_stream_start(target.as_ptr(), proxy.as_ptr(), millis(timeout)) };
        let raw = unsafe { take_result(boxed) }?;
        Ok(SifirStream {
            raw,
            context: Mutex::new(None),
        })
    }

    fn subscribe_stream(&self, stream: &SifirStream, observer: StreamObserver) {
        let mut slot = stream.context.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            tracing::warn!(stream_id = %observer.token().stream_id, "stream already subscribed");
            return;
        }
        let context = NonNull::from(Box::leak(Box::new(observer)));
        *slot = Some(context);
        let callbacks = Observer {
            context: context.as_ptr().cast(),
            on_success: on_success_trampoline,
            on_err: on_error_trampoline,
        };
        // SAFETY: the context stays allocated until the stream value drops.
        unsafe { tcp_stream_on_data(stream.raw.as_ptr(), callbacks) };
    }

    fn send_stream(
        &self,
        stream: &SifirStream,
        message: &str,
        timeout: Duration,
    ) -> Result<(), NativeError> {
        let message = c_string(message)?;
        let secs = timeout.as_secs().max(1);
        // SAFETY: stream.raw is live while a reference to the stream exists.
        let result = unsafe { tcp_stream_send_msg(stream.raw.as_ptr(), message.as_ptr(), secs) };
        if result.tag == TAG_SUCCESS {
            Ok(())
        } else {
            Err(NativeError::from_optional(unsafe { take_cstr(result.error) }))
        }
    }

    fn destroy_stream(&self, stream: SifirStream) {
        // SAFETY: consumes the only owner; the context is freed when `stream`
        // drops right after.
        unsafe { tcp_stream_destroy(stream.raw.as_ptr()) };
    }
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn c_string(value: &str) -> Result<CString, NativeError> {
    CString::new(value).map_err(|_| NativeError::new(format!("interior NUL in '{value}'")))
}

/// Copy and free a library-owned string.
unsafe fn take_cstr(ptr: *mut c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let value = CStr::from_ptr(ptr).to_string_lossy().into_owned();
    destroy_cstr(ptr);
    Some(value)
}

unsafe fn take_result(boxed: *mut BoxedResult) -> Result<NonNull<c_void>, NativeError> {
    let Some(boxed) = boxed.as_ref() else {
        return Err(NativeError::unknown());
    };
    if boxed.message.tag != TAG_SUCCESS {
        return Err(NativeError::from_optional(take_cstr(boxed.message.error)));
    }
    NonNull::new(boxed.result).ok_or_else(|| NativeError::new("library returned a null handle"))
}

unsafe fn observer_from(context: *const c_void) -> Option<StreamObserver> {
    (context as *const StreamObserver).as_ref().cloned()
}

extern "C" fn on_success_trampoline(data: *mut c_char, context: *const c_void) {
    // SAFETY: context is the boxed observer registered in subscribe_stream.
    let (observer, payload) = unsafe { (observer_from(context), take_cstr(data)) };
    if let (Some(observer), Some(payload)) = (observer, payload) {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| observer.on_data(payload)));
    }
}

extern "C" fn on_error_trampoline(data: *mut c_char, context: *const c_void) {
    // SAFETY: as above.
    let (observer, payload) = unsafe { (observer_from(context), take_cstr(data)) };
    if let Some(observer) = observer {
        let payload = payload.unwrap_or_default();
        let _ = panic::catch_unwind(AssertUnwindSafe(|| observer.on_error(payload)));
    }
}
