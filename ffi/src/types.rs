//! `#[repr(C)]` types and JSON shapes for the FFI boundary.
//!
//! # Design
//! The host passes configuration and request options as JSON. The shapes
//! below mirror the option tables a scripting layer builds (`url`, `method`,
//! `headers`, `body`, ...) and convert into core types. Results go back as
//! one `#[repr(C)]` envelope so C callers check a single error code.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::raw::c_char;

use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

use netreq_core::{
    DirectoryResolver, EngineConfig, HeaderValue, ProgressMode, RequestBody, RequestDescriptor,
    RequestId, RequestManager, ResourceResolver, ValidationError,
};

/// Opaque handle to a request manager. Every function taking it must be
/// called from the thread that created it.
pub struct FfiManager {
    pub(crate) manager: RequestManager,
    pub(crate) resolver: DirectoryResolver,
}

// ---------------------------------------------------------------------------
// JSON input
// ---------------------------------------------------------------------------

/// Manager configuration: engine settings plus named base directories.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerOptions {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub directories: DirectoryResolver,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonHeaderValue {
    Text(String),
    Boolean(bool),
    Integer(i64),
    Number(f64),
}

impl From<JsonHeaderValue> for HeaderValue {
    fn from(v: JsonHeaderValue) -> Self {
        match v {
            JsonHeaderValue::Text(s) => HeaderValue::Text(s),
            JsonHeaderValue::Boolean(b) => HeaderValue::Boolean(b),
            JsonHeaderValue::Integer(i) => HeaderValue::Integer(i),
            JsonHeaderValue::Number(n) => HeaderValue::Number(n),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Text,
    /// `body` holds base64.
    Binary,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOptions {
    pub filename: String,
    #[serde(default)]
    pub base_directory: Option<String>,
}

/// Request options as sent by the scripting layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, JsonHeaderValue>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub body_file: Option<FileOptions>,
    #[serde(default)]
    pub response: Option<FileOptions>,
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub handle_redirects: Option<bool>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub min_notification_interval_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid request JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("binary body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl RequestOptions {
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn into_descriptor(
        self,
        resolver: &dyn ResourceResolver,
    ) -> Result<RequestDescriptor, RequestError> {
        let mut builder = RequestDescriptor::builder(self.url).debug(self.debug);
        if let Some(method) = self.method {
            builder = builder.method(method);
        }
        for (name, value) in self.headers {
            builder = builder.header(name, HeaderValue::from(value));
        }

        match (self.body, self.body_file) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::InvalidValue {
                    field: "body",
                    reason: "'body' and 'bodyFile' are mutually exclusive".to_string(),
                }
                .into())
            }
            (Some(body), None) => {
                let body = match self.body_type {
                    BodyType::Text => RequestBody::text(body),
                    BodyType::Binary => {
                        RequestBody::binary(base64::engine::general_purpose::STANDARD.decode(body)?)
                    }
                };
                builder = builder.body(body);
            }
            (None, Some(file)) => {
                builder = builder.body(RequestBody::file(file.filename, file.base_directory.as_deref()));
            }
            (None, None) => {}
        }

        if let Some(file) = self.response {
            builder = builder.response_file(file.filename, file.base_directory.as_deref());
        }
        if let Some(secs) = self.timeout {
            builder = builder.timeout_secs(secs);
        }
        if let Some(progress) = self.progress {
            builder = builder.progress(progress.parse::<ProgressMode>()?);
        }
        if let Some(follow) = self.handle_redirects {
            builder = builder.follow_redirects(follow);
        }
        if let Some(ms) = self.min_notification_interval_ms {
            builder = builder.min_notification_interval_ms(ms);
        }
        Ok(builder.build_with(resolver)?)
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Error codes returned in `FfiRequestResult`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    InvalidJson = 1,
    Validation = 2,
    NullArg = 3,
    Panic = 4,
}

/// Result envelope for `netreq_request`.
///
/// On success `error_code` is `Ok`, `error_message` is null and `request_id`
/// identifies the request in later callbacks and in `netreq_cancel`.
/// On failure `request_id` is 0.
#[repr(C)]
pub struct FfiRequestResult {
    pub error_code: FfiErrorCode,
    pub error_message: *mut c_char,
    pub request_id: u64,
}

impl FfiRequestResult {
    fn boxed(error_code: FfiErrorCode, message: Option<&str>, request_id: u64) -> *mut Self {
        Box::into_raw(Box::new(FfiRequestResult {
            error_code,
            error_message: message.map_or(std::ptr::null_mut(), c_string),
            request_id,
        }))
    }

    pub(crate) fn ok(id: RequestId) -> *mut Self {
        Self::boxed(FfiErrorCode::Ok, None, id.0)
    }

    pub(crate) fn from_error(err: &RequestError) -> *mut Self {
        let code = match err {
            RequestError::Json(_) => FfiErrorCode::InvalidJson,
            RequestError::Validation(_) | RequestError::Base64(_) => FfiErrorCode::Validation,
        };
        Self::boxed(code, Some(&err.to_string()), 0)
    }

    pub(crate) fn null_arg(name: &str) -> *mut Self {
        Self::boxed(FfiErrorCode::NullArg, Some(&format!("null argument: {name}")), 0)
    }

    pub(crate) fn panic(msg: &str) -> *mut Self {
        Self::boxed(FfiErrorCode::Panic, Some(msg), 0)
    }
}

/// Heap C string owned by the caller. Interior NULs are dropped.
pub(crate) fn c_string(s: &str) -> *mut c_char {
    CString::new(s.replace('\0', "")).map_or(std::ptr::null_mut(), CString::into_raw)
}
