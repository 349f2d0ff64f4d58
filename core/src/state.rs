//! Per-exchange progress accumulator, its snapshot, and the cancel handle.
//!
//! # Design
//! `RequestState` is owned by exactly one operation and lives as long as one
//! exchange. Listeners never see it directly: each notification carries a
//! [`RequestEvent`], an owned snapshot that serializes to the shape the
//! scripting layer expects (`isError`, `phase`, `status`, ...).
//!
//! [`Canceller`] is shared between the state and the caller. It holds only a
//! request id and a monotonic flag; the owning operation polls the flag, so a
//! cancel issued after the operation was recycled reaches nobody.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine as _;
use serde::ser::Serializer;
use serde::Serialize;

use crate::descriptor::FileRef;
use crate::error::ErrorKind;
use crate::headers::HeaderMap;

/// Notification phase. Ordered: `Began < Progress < Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Began,
    Progress,
    Ended,
}

/// Identifier of one submitted request. Never reused within a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
struct CancelFlag {
    id: RequestId,
    cancelled: AtomicBool,
}

/// Caller-held handle permitting asynchronous abort of one request.
///
/// Cheap to clone; all clones share the flag. `Send + Sync`, so a request
/// may be cancelled from any thread. Teardown happens on the next pump.
#[derive(Clone)]
pub struct Canceller {
    flag: Arc<CancelFlag>,
}

impl Canceller {
    pub(crate) fn new(id: RequestId) -> Self {
        Self {
            flag: Arc::new(CancelFlag {
                id,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.flag.id
    }

    /// Mark the request cancelled. Returns `false` if it already was.
    pub fn cancel(&self) -> bool {
        !self.flag.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.cancelled.load(Ordering::Acquire)
    }
}

impl PartialEq for Canceller {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

impl Eq for Canceller {}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("id", &self.flag.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Serialize for Canceller {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.flag.id.serialize(serializer)
    }
}

/// Final response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    #[default]
    None,
    Text(String),
    Bytes(#[serde(serialize_with = "as_base64")] Vec<u8>),
    File(FileRef),
}

impl ResponseBody {
    pub fn response_type(&self) -> Option<&'static str> {
        match self {
            ResponseBody::None => None,
            ResponseBody::Text(_) => Some("text"),
            ResponseBody::Bytes(_) => Some("binary"),
            ResponseBody::File(_) => Some("file"),
        }
    }
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Owned snapshot of a `RequestState`, handed to listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub is_error: bool,
    pub phase: Phase,
    pub status: i32,
    pub url: String,
    #[serde(skip_serializing_if = "HeaderMap::is_empty")]
    pub response_headers: HeaderMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseBody>,
    pub request_id: Canceller,
    pub bytes_transferred: u64,
    pub bytes_estimated: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<BTreeMap<String, String>>,
}

impl RequestEvent {
    /// Response text, if the body is textual. Failures carry their message here.
    pub fn text(&self) -> Option<&str> {
        match &self.response {
            Some(ResponseBody::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// Mutable accumulator for one exchange.
#[derive(Debug)]
pub struct RequestState {
    phase: Phase,
    status: i32,
    url: String,
    response_headers: HeaderMap,
    response: ResponseBody,
    bytes_transferred: u64,
    bytes_estimated: u64,
    error: Option<ErrorKind>,
    debug: Option<BTreeMap<String, String>>,
    canceller: Canceller,
}

impl RequestState {
    pub fn new(url: &str, canceller: Canceller, debug: bool) -> Self {
        let debug = debug.then(|| BTreeMap::from([("isDebug".to_string(), "true".to_string())]));
        Self {
            phase: Phase::Began,
            status: -1,
            url: url.to_string(),
            response_headers: HeaderMap::new(),
            response: ResponseBody::None,
            bytes_transferred: 0,
            bytes_estimated: 0,
            error: None,
            debug,
            canceller,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phases never move backwards within one exchange.
    pub fn set_phase(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn set_status(&mut self, status: i32) {
        self.status = status;
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn set_response_headers(&mut self, headers: HeaderMap) {
        self.response_headers = headers;
    }

    pub fn response(&self) -> &ResponseBody {
        &self.response
    }

    pub fn set_response(&mut self, body: ResponseBody) {
        self.response = body;
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn set_bytes_transferred(&mut self, n: u64) {
        self.bytes_transferred = n;
    }

    pub fn add_bytes_transferred(&mut self, n: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(n);
    }

    pub fn bytes_estimated(&self) -> u64 {
        self.bytes_estimated
    }

    pub fn set_bytes_estimated(&mut self, n: u64) {
        self.bytes_estimated = n;
    }

    /// Mark the exchange failed; the message replaces the response body.
    pub fn set_error(&mut self, kind: ErrorKind) {
        self.error = Some(kind);
        self.response = ResponseBody::Text(kind.to_string());
    }

    /// Record a diagnostic value. Ignored unless diagnostics were requested.
    pub fn set_debug_value(&mut self, key: &str, value: impl Into<String>) {
        if let Some(map) = self.debug.as_mut() {
            map.insert(key.to_string(), value.into());
        }
    }

    pub fn canceller(&self) -> &Canceller {
        &self.canceller
    }

    /// The body is only included once the exchange has ended.
    pub fn snapshot(&self) -> RequestEvent {
        let response = (self.phase == Phase::Ended && self.response != ResponseBody::None)
            .then(|| self.response.clone());
        RequestEvent {
            is_error: self.error.is_some(),
            phase: self.phase,
            status: self.status,
            url: self.url.clone(),
            response_headers: self.response_headers.clone(),
            response_type: response.as_ref().and_then(ResponseBody::response_type),
            response,
            request_id: self.canceller.clone(),
            bytes_transferred: self.bytes_transferred,
            bytes_estimated: self.bytes_estimated,
            error_kind: self.error,
            debug: self.debug.clone(),
        }
    }
}
