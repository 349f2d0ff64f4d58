//! Validated, immutable description of one request.
//!
//! # Design
//! A descriptor is only obtainable through [`RequestDescriptorBuilder::build`]
//! or [`RequestDescriptorBuilder::build_with`], both of which either return a
//! fully valid value or a [`ValidationError`]. Nothing is partially applied.
//!
//! Validation rules:
//! - `url` and `method` are required; the method defaults to `GET` and is
//!   upper-cased.
//! - Header values are coerced to text. A caller-supplied `Content-Length`
//!   is dropped because the transport computes it.
//! - `POST` without a Content-Type gets
//!   `application/x-www-form-urlencoded; charset=UTF-8`.
//! - Text bodies default to `text/plain; charset=UTF-8`. A declared charset
//!   must be supported; a missing one is recorded as UTF-8.
//! - Binary bodies default to `application/octet-stream`.
//! - File bodies need an explicit Content-Type.
//! - File references are resolved to absolute paths up front. A response
//!   file may not live in a read-only location.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::charset;
use crate::content_type;
use crate::error::ValidationError;
use crate::headers::HeaderMap;
use crate::resolve::{NoResolver, ResourceResolver};

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// A caller-supplied header value before coercion to text.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

impl HeaderValue {
    /// Whole numbers print without a fraction, others with six decimals.
    pub fn to_header_string(&self) -> String {
        match self {
            HeaderValue::Text(s) => s.clone(),
            HeaderValue::Integer(i) => i.to_string(),
            HeaderValue::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                (*n as i64).to_string()
            }
            HeaderValue::Number(n) => format!("{n:.6}"),
            HeaderValue::Boolean(b) => b.to_string(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Text(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Integer(i)
    }
}

impl From<i32> for HeaderValue {
    fn from(i: i32) -> Self {
        HeaderValue::Integer(i.into())
    }
}

impl From<u32> for HeaderValue {
    fn from(i: u32) -> Self {
        HeaderValue::Integer(i.into())
    }
}

impl From<f64> for HeaderValue {
    fn from(n: f64) -> Self {
        HeaderValue::Number(n)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Boolean(b)
    }
}

/// Which direction, if any, reports byte-level progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    #[default]
    None,
    Upload,
    Download,
}

impl FromStr for ProgressMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ProgressMode::None),
            "upload" => Ok(ProgressMode::Upload),
            "download" => Ok(ProgressMode::Download),
            other => Err(ValidationError::InvalidValue {
                field: "progress",
                reason: format!("expected 'upload', 'download' or 'none', got '{other}'"),
            }),
        }
    }
}

/// A request body as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Text(String),
    Binary(Vec<u8>),
    File {
        filename: String,
        base: Option<String>,
    },
}

impl RequestBody {
    pub fn text(text: impl Into<String>) -> Self {
        RequestBody::Text(text.into())
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        RequestBody::Binary(bytes.into())
    }

    pub fn file(filename: impl Into<String>, base: Option<&str>) -> Self {
        RequestBody::File {
            filename: filename.into(),
            base: base.map(str::to_string),
        }
    }
}

/// A file reference resolved to an absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub filename: String,
    pub base_directory: Option<String>,
    pub full_path: PathBuf,
    #[serde(skip)]
    pub read_only: bool,
}

/// Validated request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    None,
    Text(String),
    Binary(Vec<u8>),
    File(FileRef),
}

/// Where the response body goes.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResponseTarget {
    #[default]
    Memory,
    File(FileRef),
}

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    url: String,
    method: String,
    headers: HeaderMap,
    body: Body,
    response_target: ResponseTarget,
    timeout_secs: Option<u32>,
    progress: ProgressMode,
    follow_redirects: bool,
    min_notification_interval_ms: Option<u64>,
    debug: bool,
}

impl RequestDescriptor {
    pub fn builder(url: impl Into<String>) -> RequestDescriptorBuilder {
        RequestDescriptorBuilder::new(url)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.content_type()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn response_target(&self) -> &ResponseTarget {
        &self.response_target
    }

    /// `None` means the engine default applies.
    pub fn timeout_secs(&self) -> Option<u32> {
        self.timeout_secs
    }

    pub fn progress(&self) -> ProgressMode {
        self.progress
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    /// `None` means the engine default applies.
    pub fn min_notification_interval(&self) -> Option<Duration> {
        self.min_notification_interval_ms.map(Duration::from_millis)
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

#[derive(Clone)]
pub struct RequestDescriptorBuilder {
    url: String,
    method: Option<String>,
    headers: Vec<(String, HeaderValue)>,
    body: Option<RequestBody>,
    response_file: Option<(String, Option<String>)>,
    timeout_secs: Option<u32>,
    progress: ProgressMode,
    follow_redirects: bool,
    min_notification_interval_ms: Option<u64>,
    debug: bool,
}

impl fmt::Debug for RequestDescriptorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptorBuilder")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers.len())
            .finish_non_exhaustive()
    }
}

impl RequestDescriptorBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: Vec::new(),
            body: None,
            response_file: None,
            timeout_secs: None,
            progress: ProgressMode::None,
            follow_redirects: true,
            min_notification_interval_ms: None,
            debug: false,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Stream the response into a file instead of memory.
    pub fn response_file(mut self, filename: impl Into<String>, base: Option<&str>) -> Self {
        self.response_file = Some((filename.into(), base.map(str::to_string)));
        self
    }

    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn progress(mut self, mode: ProgressMode) -> Self {
        self.progress = mode;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn min_notification_interval_ms(mut self, ms: u64) -> Self {
        self.min_notification_interval_ms = Some(ms);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate without a resource resolver; any file reference fails.
    pub fn build(self) -> Result<RequestDescriptor, ValidationError> {
        self.build_with(&NoResolver)
    }

    pub fn build_with(self, resolver: &dyn ResourceResolver) -> Result<RequestDescriptor, ValidationError> {
        let url = self.url.trim().to_string();
        if url.is_empty() {
            return Err(ValidationError::MissingField("url"));
        }

        let method = match self.method {
            Some(m) if m.trim().is_empty() => return Err(ValidationError::MissingField("method")),
            Some(m) => m.trim().to_ascii_uppercase(),
            None => "GET".to_string(),
        };
        if !method.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-' || b == b'_') {
            return Err(ValidationError::InvalidValue {
                field: "method",
                reason: format!("'{method}' is not a valid HTTP method"),
            });
        }

        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(ValidationError::InvalidValue {
                    field: "headers",
                    reason: "header names may not be empty".to_string(),
                });
            }
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            headers.insert(name, value.to_header_string());
        }

        if method == "POST" && !headers.contains("content-type") {
            headers.insert("Content-Type", FORM_CONTENT_TYPE);
        }

        let body = match self.body {
            None => Body::None,
            Some(RequestBody::Text(text)) => {
                match headers.content_type().map(str::to_string) {
                    None => headers.insert("Content-Type", TEXT_CONTENT_TYPE),
                    Some(ct) => match content_type::charset_from_header(&ct) {
                        Some(cs) if !charset::CharsetTable::global().is_supported(&cs) => {
                            return Err(ValidationError::UnsupportedCharset(cs));
                        }
                        Some(_) => {}
                        None => headers.insert("Content-Type", content_type::with_charset(&ct, "UTF-8")),
                    },
                }
                Body::Text(text)
            }
            Some(RequestBody::Binary(bytes)) => {
                if !headers.contains("content-type") {
                    headers.insert("Content-Type", BINARY_CONTENT_TYPE);
                }
                Body::Binary(bytes)
            }
            Some(RequestBody::File { filename, base }) => {
                let file = resolve_file(resolver, filename, base)?;
                if !headers.contains("content-type") {
                    return Err(ValidationError::MissingContentType);
                }
                Body::File(file)
            }
        };

        let response_target = match self.response_file {
            None => ResponseTarget::Memory,
            Some((filename, base)) => {
                let file = resolve_file(resolver, filename, base)?;
                if file.read_only {
                    return Err(ValidationError::InvalidValue {
                        field: "response",
                        reason: format!("{} is in a read-only location", file.full_path.display()),
                    });
                }
                ResponseTarget::File(file)
            }
        };

        Ok(RequestDescriptor {
            url,
            method,
            headers,
            body,
            response_target,
            timeout_secs: self.timeout_secs,
            progress: self.progress,
            follow_redirects: self.follow_redirects,
            min_notification_interval_ms: self.min_notification_interval_ms,
            debug: self.debug,
        })
    }
}

fn resolve_file(
    resolver: &dyn ResourceResolver,
    filename: String,
    base: Option<String>,
) -> Result<FileRef, ValidationError> {
    let resolved = resolver
        .resolve(&filename, base.as_deref())
        .map_err(|source| ValidationError::Resolve {
            filename: filename.clone(),
            source,
        })?;
    Ok(FileRef {
        filename,
        base_directory: base,
        full_path: resolved.path,
        read_only: resolved.read_only,
    })
}
