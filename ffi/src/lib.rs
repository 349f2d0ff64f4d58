//! C-ABI wrapper around `netreq-core`.
//!
//! # Overview
//! Lets a scripting runtime with a C FFI submit HTTP requests, receive
//! progress and results as JSON through a C callback, and drive the engine
//! from its own frame loop with `netreq_pump`.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Options travel as JSON in the camelCase shape the scripting layer
//!   already builds; events come back as the serialized `RequestEvent`.
//! - A manager handle is single-threaded. All calls for one handle, and all
//!   callbacks it makes, happen on the thread that created it.
//! - The C caller owns returned pointers and must release them with the
//!   matching `netreq_free_*` function.

pub mod types;

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::warn;

use netreq_core::{Listener, RequestEvent, RequestId, RequestManager};

use types::*;

/// Invoked with a JSON event and the `user_data` given to `netreq_request`.
/// The string is only valid for the duration of the call.
pub type NetreqCallback = extern "C" fn(event_json: *const c_char, user_data: *mut c_void);

fn read_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

// ---------------------------------------------------------------------------
// Manager lifecycle
// ---------------------------------------------------------------------------

/// Create a request manager.
///
/// `config_json` may be null for defaults. Returns null if the JSON is
/// invalid or an internal panic occurs. Free with `netreq_manager_free`.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_manager_new(config_json: *const c_char) -> *mut FfiManager {
    catch_unwind(|| {
        let options = if config_json.is_null() {
            ManagerOptions::default()
        } else {
            let parsed = read_str(config_json)
                .ok_or("configuration is not UTF-8".to_string())
                .and_then(|json| serde_json::from_str::<ManagerOptions>(json).map_err(|e| e.to_string()));
            match parsed {
                Ok(options) => options,
                Err(e) => {
                    warn!(error = %e, "invalid manager configuration");
                    return std::ptr::null_mut();
                }
            }
        };
        Box::into_raw(Box::new(FfiManager {
            manager: RequestManager::new(options.engine),
            resolver: options.directories,
        }))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Abort everything still running, drain, and free the manager. Safe to
/// call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_manager_free(manager: *mut FfiManager) {
    if !manager.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(manager) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Validate `request_json` and start the request.
///
/// `callback` may be null for fire-and-forget requests. Always returns a
/// result; free it with `netreq_free_result`.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_request(
    manager: *mut FfiManager,
    request_json: *const c_char,
    callback: Option<NetreqCallback>,
    user_data: *mut c_void,
) -> *mut FfiRequestResult {
    catch_unwind(AssertUnwindSafe(|| {
        if manager.is_null() {
            return FfiRequestResult::null_arg("manager");
        }
        let Some(json) = read_str(request_json) else {
            return FfiRequestResult::null_arg("request_json");
        };
        let manager = unsafe { &*manager };

        let descriptor = match RequestOptions::from_json(json)
            .and_then(|options| options.into_descriptor(&manager.resolver))
        {
            Ok(d) => d,
            Err(e) => return FfiRequestResult::from_error(&e),
        };

        let listener = callback.map(|cb| json_listener(cb, user_data));
        let canceller = manager.manager.submit(descriptor, listener);
        FfiRequestResult::ok(canceller.id())
    }))
    .unwrap_or_else(|_| FfiRequestResult::panic("panic in netreq_request"))
}

fn json_listener(callback: NetreqCallback, user_data: *mut c_void) -> Listener {
    Box::new(move |event: &RequestEvent| {
        let json = serde_json::to_string(event)
            .map_err(|e| e.to_string())
            .and_then(|s| CString::new(s).map_err(|e| e.to_string()));
        match json {
            Ok(json) => callback(json.as_ptr(), user_data),
            Err(e) => warn!(request_id = %event.request_id.id(), error = %e, "event not delivered"),
        }
    })
}

/// Cancel a request. Returns false if it is unknown, finished or already
/// cancelled.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_cancel(manager: *mut FfiManager, request_id: u64) -> bool {
    if manager.is_null() {
        return false;
    }
    catch_unwind(AssertUnwindSafe(|| {
        unsafe { &*manager }.manager.cancel(RequestId(request_id))
    }))
    .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

/// Advance all requests and run ready callbacks. Call once per frame.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_pump(manager: *mut FfiManager) {
    if manager.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| unsafe { &*manager }.manager.pump()));
}

/// Pump until nothing is active or `timeout_ms` elapses. Blocks the caller.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_pump_until(manager: *mut FfiManager, timeout_ms: u64) -> bool {
    if manager.is_null() {
        return false;
    }
    catch_unwind(AssertUnwindSafe(|| {
        unsafe { &*manager }
            .manager
            .pump_until(Duration::from_millis(timeout_ms))
    }))
    .unwrap_or(false)
}

/// Request abort of every active request. Completes on later pumps.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_abort_all(manager: *mut FfiManager) {
    if manager.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| unsafe { &*manager }.manager.abort_all()));
}

#[unsafe(no_mangle)]
pub extern "C" fn netreq_active_count(manager: *const FfiManager) -> u32 {
    if manager.is_null() {
        return 0;
    }
    catch_unwind(AssertUnwindSafe(|| {
        u32::try_from(unsafe { &*manager }.manager.active_count()).unwrap_or(u32::MAX)
    }))
    .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Charsets
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn netreq_charset_supported(name: *const c_char) -> bool {
    catch_unwind(|| read_str(name).is_some_and(|n| netreq_core::charset::lookup(n).is_some()))
        .unwrap_or(false)
}

/// Decode `len` bytes in `charset` into a UTF-8 C string.
///
/// Returns null on an unknown charset or malformed input. Free with
/// `netreq_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_decode(bytes: *const u8, len: usize, charset: *const c_char) -> *mut c_char {
    catch_unwind(|| {
        let Some(charset) = read_str(charset) else {
            return std::ptr::null_mut();
        };
        let input = if len == 0 {
            &[][..]
        } else if bytes.is_null() {
            return std::ptr::null_mut();
        } else {
            unsafe { std::slice::from_raw_parts(bytes, len) }
        };
        match netreq_core::transcode::decode(input, charset) {
            Ok(text) => c_string(&text),
            Err(e) => {
                warn!(%charset, error = %e, "decode failed");
                std::ptr::null_mut()
            }
        }
    })
    .unwrap_or(std::ptr::null_mut())
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free a result returned by `netreq_request`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_free_result(result: *mut FfiRequestResult) {
    if result.is_null() {
        return;
    }
    let _ = catch_unwind(|| {
        let result = unsafe { Box::from_raw(result) };
        if !result.error_message.is_null() {
            drop(unsafe { CString::from_raw(result.error_message) });
        }
    });
}

/// Free a C string allocated by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netreq_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { CString::from_raw(s) });
        });
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn collect(event_json: *const c_char, user_data: *mut c_void) {
        let sink = unsafe { &mut *(user_data as *mut Vec<serde_json::Value>) };
        let json = unsafe { CStr::from_ptr(event_json) }.to_str().unwrap();
        sink.push(serde_json::from_str(json).unwrap());
    }

    fn new_manager() -> *mut FfiManager {
        let config = CString::new(r#"{"pumpIntervalMs":1}"#).unwrap();
        let manager = netreq_manager_new(config.as_ptr());
        assert!(!manager.is_null());
        manager
    }

    fn request(manager: *mut FfiManager, json: &str, sink: &mut Vec<serde_json::Value>) -> (FfiErrorCode, u64) {
        let json = CString::new(json).unwrap();
        let result = netreq_request(
            manager,
            json.as_ptr(),
            Some(collect),
            sink as *mut Vec<serde_json::Value> as *mut c_void,
        );
        assert!(!result.is_null());
        let outcome = {
            let r = unsafe { &*result };
            (r.error_code, r.request_id)
        };
        netreq_free_result(result);
        outcome
    }

    #[test]
    fn manager_new_and_free() {
        let manager = netreq_manager_new(std::ptr::null());
        assert!(!manager.is_null());
        assert_eq!(netreq_active_count(manager), 0);
        netreq_manager_free(manager);
    }

    #[test]
    fn invalid_config_returns_null() {
        let config = CString::new("{not json").unwrap();
        assert!(netreq_manager_new(config.as_ptr()).is_null());
    }

    #[test]
    fn null_arguments_are_safe() {
        netreq_manager_free(std::ptr::null_mut());
        netreq_pump(std::ptr::null_mut());
        netreq_abort_all(std::ptr::null_mut());
        netreq_free_result(std::ptr::null_mut());
        netreq_free_string(std::ptr::null_mut());
        assert!(!netreq_cancel(std::ptr::null_mut(), 1));
        assert!(!netreq_pump_until(std::ptr::null_mut(), 1));
        assert_eq!(netreq_active_count(std::ptr::null()), 0);

        let result = netreq_request(std::ptr::null_mut(), std::ptr::null(), None, std::ptr::null_mut());
        let r = unsafe { &*result };
        assert_eq!(r.error_code, FfiErrorCode::NullArg);
        netreq_free_result(result);
    }

    #[test]
    fn invalid_request_json_is_reported() {
        let manager = new_manager();
        let mut sink = Vec::new();
        let (code, id) = request(manager, "[]", &mut sink);
        assert_eq!(code, FfiErrorCode::InvalidJson);
        assert_eq!(id, 0);
        netreq_manager_free(manager);
    }

    #[test]
    fn validation_errors_are_reported() {
        let manager = new_manager();
        let mut sink = Vec::new();
        let json = r#"{"url":"http://x/","method":"POST","body":"a","headers":{"Content-Type":"text/plain; charset=klingon"}}"#;
        let (code, _) = request(manager, json, &mut sink);
        assert_eq!(code, FfiErrorCode::Validation);
        assert_eq!(netreq_active_count(manager), 0);
        netreq_manager_free(manager);
    }

    #[test]
    fn invalid_url_is_delivered_as_event() {
        let manager = new_manager();
        let mut sink = Vec::new();
        let (code, id) = request(manager, r#"{"url":"ftp://example.com/x"}"#, &mut sink);
        assert_eq!(code, FfiErrorCode::Ok);
        assert!(id > 0);
        assert!(netreq_pump_until(manager, 1000));

        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0]["phase"], "ended");
        assert_eq!(sink[0]["isError"], true);
        assert_eq!(sink[0]["requestId"], id);
        assert_eq!(sink[0]["response"], "Invalid URL");
        netreq_manager_free(manager);
    }

    fn start_server() -> std::net::SocketAddr {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        std_listener.set_nonblocking(true).unwrap();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
                mock_server::run(listener).await
            })
            .unwrap();
        });
        addr
    }

    #[test]
    fn text_and_binary_responses_over_http() {
        let addr = start_server();
        let manager = new_manager();
        let mut text = Vec::new();
        let mut binary = Vec::new();

        let (code, _) = request(
            manager,
            &format!(r#"{{"url":"http://{addr}/text/header-charset","debug":true}}"#),
            &mut text,
        );
        assert_eq!(code, FfiErrorCode::Ok);
        let (code, _) = request(manager, &format!(r#"{{"url":"http://{addr}/bytes/3"}}"#), &mut binary);
        assert_eq!(code, FfiErrorCode::Ok);
        assert!(netreq_pump_until(manager, 20_000));

        let end = text.last().unwrap();
        assert_eq!(end["responseType"], "text");
        assert_eq!(end["response"], "café");
        assert_eq!(end["status"], 200);
        assert_eq!(end["debug"]["charsetSource"], "protocol");

        let end = binary.last().unwrap();
        assert_eq!(end["responseType"], "binary");
        assert_eq!(end["response"], "AAEC");
        netreq_manager_free(manager);
    }

    #[test]
    fn cancel_unknown_request_is_false() {
        let manager = new_manager();
        assert!(!netreq_cancel(manager, 999));
        netreq_manager_free(manager);
    }

    #[test]
    fn charset_queries() {
        let latin1 = CString::new("ISO-8859-1").unwrap();
        let bogus = CString::new("x-bogus").unwrap();
        assert!(netreq_charset_supported(latin1.as_ptr()));
        assert!(!netreq_charset_supported(bogus.as_ptr()));
        assert!(!netreq_charset_supported(std::ptr::null()));
    }

    #[test]
    fn decode_latin1() {
        let charset = CString::new("latin1").unwrap();
        let bytes = b"caf\xe9";
        let out = netreq_decode(bytes.as_ptr(), bytes.len(), charset.as_ptr());
        assert!(!out.is_null());
        assert_eq!(unsafe { CStr::from_ptr(out) }.to_str().unwrap(), "café");
        netreq_free_string(out);
    }

    #[test]
    fn decode_malformed_returns_null() {
        let charset = CString::new("utf-8").unwrap();
        let bytes = b"\xff";
        assert!(netreq_decode(bytes.as_ptr(), bytes.len(), charset.as_ptr()).is_null());
    }
}
