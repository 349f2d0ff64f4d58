//! One execution of a descriptor against a transport.
//!
//! # Overview
//! A `RequestOperation` is pooled by the manager and reused across requests.
//! While active it walks through
//!
//! ```text
//!   Idle -> Connecting -> Sending -> AwaitingResponse -> ReceivingBody -> Ended -> Idle
//! ```
//!
//! `start` prepares the exchange and hands it to the transport. From then on
//! the pump calls `advance`, which reads the hand-off block, updates the
//! `RequestState` and returns the events that are ready for the listener.
//! Events are returned rather than delivered so the manager can release its
//! borrow of the operation before user code runs.
//!
//! # Design
//! Logical completion and reuse are separate steps. `advance` ends the
//! request as soon as the outcome is known, including an abort. The
//! operation only goes back to `Idle` through `recycle_if_closed`, once the
//! transport has closed the hand-off block.

use std::cell::RefCell;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use url::Url;

use crate::charset;
use crate::config::EngineConfig;
use crate::content_type;
use crate::descriptor::{Body, FileRef, ProgressMode, RequestDescriptor, ResponseTarget};
use crate::dispatch::Dispatcher;
use crate::error::ErrorKind;
use crate::handoff::{Handoff, ResponseHead};
use crate::headers::{HeaderMap, STATUS_LINE_KEY};
use crate::state::{Canceller, Phase, RequestEvent, RequestState, ResponseBody};
use crate::transcode;
use crate::transport::{Exchange, OutgoingBody, Transport};

/// Text buffers are pre-sized to Content-Length, up to this bound.
const MAX_PRESIZE: u64 = 16 * 1024 * 1024;
const DEFAULT_PRESIZE: usize = 8192;
/// Receive-slot drains per `advance` call.
const MAX_DRAINS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(ErrorKind),
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Connecting,
    Sending,
    AwaitingResponse,
    ReceivingBody,
    Ended(Outcome),
}

/// Staging file for a download. Removed on drop unless persisted.
struct DownloadFile {
    temp: NamedTempFile,
    target: PathBuf,
}

impl DownloadFile {
    fn create(target: &Path) -> io::Result<Self> {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let temp = tempfile::Builder::new().prefix("download-").tempfile_in(dir)?;
        Ok(Self {
            temp,
            target: target.to_path_buf(),
        })
    }

    fn persist(self) -> io::Result<()> {
        self.temp.persist(&self.target).map(drop).map_err(|e| e.error)
    }
}

enum Accumulator {
    Text(Vec<u8>),
    Bytes(Vec<u8>),
    File(DownloadFile),
}

impl Accumulator {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Accumulator::Text(buf) | Accumulator::Bytes(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Accumulator::File(file) => file.temp.write_all(data),
        }
    }
}

struct Active {
    stage: Stage,
    descriptor: RequestDescriptor,
    state: RequestState,
    dispatcher: Option<Rc<RefCell<Dispatcher>>>,
    body: Option<Accumulator>,
    transport_started: bool,
    upload_announced: bool,
    uploaded_seen: u64,
    head_seen: bool,
    emitted: bool,
    abort_requested: bool,
    local_failure: Option<ErrorKind>,
    end_processed: bool,
}

pub(crate) struct RequestOperation {
    handoff: Arc<Handoff>,
    active: Option<Active>,
}

impl RequestOperation {
    pub(crate) fn new(receive_buffer_size: usize) -> Self {
        Self {
            handoff: Arc::new(Handoff::new(receive_buffer_size)),
            active: None,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub(crate) fn stage(&self) -> Stage {
        self.active.as_ref().map_or(Stage::Idle, |a| a.stage)
    }

    pub(crate) fn canceller(&self) -> Option<&Canceller> {
        self.active.as_ref().map(|a| a.state.canceller())
    }

    pub(crate) fn dispatcher(&self) -> Option<Rc<RefCell<Dispatcher>>> {
        self.active.as_ref().and_then(|a| a.dispatcher.clone())
    }

    /// Begin executing `descriptor`. Never delivers events itself; a local
    /// failure is reported by the next `advance`.
    pub(crate) fn start(
        &mut self,
        descriptor: RequestDescriptor,
        canceller: Canceller,
        dispatcher: Option<Rc<RefCell<Dispatcher>>>,
        transport: &dyn Transport,
        config: &EngineConfig,
    ) {
        debug_assert!(self.is_idle(), "started a busy operation");
        self.handoff.reset();

        let state = RequestState::new(descriptor.url(), canceller, descriptor.debug());
        let mut active = Active {
            stage: Stage::Connecting,
            descriptor,
            state,
            dispatcher,
            body: None,
            transport_started: false,
            upload_announced: false,
            uploaded_seen: 0,
            head_seen: false,
            emitted: false,
            abort_requested: false,
            local_failure: None,
            end_processed: false,
        };

        let request_id = active.state.canceller().id();
        let started = active
            .prepare(config)
            .and_then(|exchange| transport.begin(exchange, Arc::clone(&self.handoff)));
        match started {
            Ok(()) => {
                debug!(%request_id, url = %active.descriptor.url(), "request started");
                active.transport_started = true;
            }
            Err(kind) => {
                debug!(%request_id, error = %kind, "request failed before reaching the transport");
                active.local_failure = Some(kind);
            }
        }
        self.active = Some(active);
    }

    /// Ask the transport to stop. The request ends on the next `advance`.
    pub(crate) fn request_abort(&mut self) {
        if let Some(active) = self.active.as_mut() {
            if !active.end_processed && !active.abort_requested {
                debug!(request_id = %active.state.canceller().id(), "abort requested");
                active.abort_requested = true;
                self.handoff.request_abort();
            }
        }
    }

    /// Move the state machine forward and collect events for the listener.
    pub(crate) fn advance(&mut self) -> Vec<RequestEvent> {
        let mut events = Vec::new();
        let handoff = &self.handoff;
        let Some(active) = self.active.as_mut() else {
            return events;
        };
        if active.end_processed {
            return events;
        }

        if active.state.canceller().is_cancelled() && !active.abort_requested {
            active.abort_requested = true;
            handoff.request_abort();
        }

        if active.transport_started && active.local_failure.is_none() && !active.abort_requested {
            active.poll_upload(handoff, &mut events);
            if let Some(head) = handoff.take_head() {
                active.on_head(head, handoff, &mut events);
            }
            active.poll_body(handoff, &mut events);
        }

        if active.is_finished(handoff) {
            active.finish(handoff, &mut events);
        }
        events
    }

    /// Return to `Idle` once the request ended and the transport let go of
    /// the hand-off block.
    pub(crate) fn recycle_if_closed(&mut self) -> bool {
        let ready = self.active.as_ref().is_some_and(|a| {
            a.end_processed && (!a.transport_started || self.handoff.is_closed())
        });
        if ready {
            if let Some(active) = self.active.take() {
                debug!(request_id = %active.state.canceller().id(), "operation recycled");
            }
        }
        ready
    }
}

impl fmt::Debug for RequestOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOperation")
            .field("stage", &self.stage())
            .field("request_id", &self.canceller().map(Canceller::id))
            .finish()
    }
}

impl Active {
    fn prepare(&mut self, config: &EngineConfig) -> Result<Exchange, ErrorKind> {
        let mut url = Url::parse(self.descriptor.url()).map_err(|e| {
            debug!(url = %self.descriptor.url(), error = %e, "malformed url");
            ErrorKind::InvalidUrl
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().map_or(true, str::is_empty) {
            return Err(ErrorKind::InvalidUrl);
        }

        let mut headers = self.descriptor.headers().clone();
        if !url.username().is_empty() || url.password().is_some() {
            if !headers.contains("authorization") {
                let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                headers.insert("Authorization", format!("Basic {encoded}"));
            }
            url.set_username("").map_err(|()| ErrorKind::InvalidUrl)?;
            url.set_password(None).map_err(|()| ErrorKind::InvalidUrl)?;
        }

        let body = match self.descriptor.body() {
            Body::None => OutgoingBody::Empty,
            Body::Text(text) => OutgoingBody::Bytes(encode_text(text, &headers)),
            Body::Binary(bytes) => OutgoingBody::Bytes(bytes.clone()),
            Body::File(file) => open_upload(file)?,
        };

        let secs = self
            .descriptor
            .timeout_secs()
            .unwrap_or(config.default_timeout_secs);
        let timeout = (secs > 0).then(|| Duration::from_secs(u64::from(secs)));

        Ok(Exchange {
            request_id: self.state.canceller().id(),
            method: self.descriptor.method().to_string(),
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body,
            timeout,
            follow_redirects: self.descriptor.follow_redirects(),
        })
    }

    fn progress(&self) -> ProgressMode {
        self.descriptor.progress()
    }

    fn emit(&mut self, phase: Phase, events: &mut Vec<RequestEvent>) {
        self.state.set_phase(phase);
        self.emitted = true;
        events.push(self.state.snapshot());
    }

    fn poll_upload(&mut self, handoff: &Handoff, events: &mut Vec<RequestEvent>) {
        let total = handoff.upload_total();
        let sent = handoff.uploaded();
        if self.stage == Stage::Connecting {
            self.stage = Stage::Sending;
        }

        if self.progress() == ProgressMode::Upload {
            if !self.upload_announced {
                self.upload_announced = true;
                self.uploaded_seen = sent;
                self.state.set_bytes_estimated(total);
                self.state.set_bytes_transferred(sent);
                self.emit(Phase::Began, events);
            } else if sent != self.uploaded_seen {
                self.uploaded_seen = sent;
                self.state.set_bytes_transferred(sent);
                self.emit(Phase::Progress, events);
            }
        }

        if self.stage == Stage::Sending && sent >= total {
            self.stage = Stage::AwaitingResponse;
        }
    }

    fn on_head(&mut self, head: ResponseHead, handoff: &Handoff, events: &mut Vec<RequestEvent>) {
        self.head_seen = true;
        self.stage = Stage::ReceivingBody;
        self.state.set_status(i32::from(head.status));

        let mut headers = HeaderMap::new();
        headers.insert(STATUS_LINE_KEY, head.status_line);
        for (name, value) in head.headers {
            headers.append_response(name, value);
        }
        let content_length = headers.content_length();
        let content_type = headers.content_type().map(str::to_string);
        self.state.set_response_headers(headers);

        let success = (200..300).contains(&head.status);
        let download_target = match self.descriptor.response_target() {
            ResponseTarget::File(file) if success => Some(file.full_path.clone()),
            _ => None,
        };
        let body = match download_target {
            Some(path) => match DownloadFile::create(&path) {
                Ok(download) => Accumulator::File(download),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot create download file");
                    self.fail_locally(ErrorKind::Internal, handoff);
                    return;
                }
            },
            None => {
                let texty = content_type.as_deref().is_some_and(|ct| {
                    content_type::charset_from_header(ct).is_some() || content_type::classify(ct).is_text
                });
                let capacity = content_length.map_or(DEFAULT_PRESIZE, |n| n.min(MAX_PRESIZE) as usize);
                let buf = Vec::with_capacity(capacity);
                if texty {
                    Accumulator::Text(buf)
                } else {
                    Accumulator::Bytes(buf)
                }
            }
        };
        self.body = Some(body);

        if self.progress() != ProgressMode::Upload {
            self.state.set_bytes_estimated(content_length.unwrap_or(0));
        }
        if self.progress() == ProgressMode::Download {
            self.emit(Phase::Began, events);
        }
    }

    fn poll_body(&mut self, handoff: &Handoff, events: &mut Vec<RequestEvent>) {
        for _ in 0..MAX_DRAINS {
            let Some(body) = self.body.as_mut() else {
                return;
            };
            let written = match handoff.drain(|chunk| body.write(chunk).map(|()| chunk.len())) {
                None => return,
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    warn!(error = %e, "cannot store response body");
                    self.fail_locally(ErrorKind::Internal, handoff);
                    return;
                }
            };
            if self.progress() != ProgressMode::Upload {
                self.state.add_bytes_transferred(written as u64);
            }
            if self.progress() == ProgressMode::Download {
                self.emit(Phase::Progress, events);
            }
        }
    }

    fn fail_locally(&mut self, kind: ErrorKind, handoff: &Handoff) {
        self.local_failure = Some(kind);
        handoff.request_abort();
    }

    fn is_finished(&self, handoff: &Handoff) -> bool {
        self.local_failure.is_some()
            || self.abort_requested
            || !self.transport_started
            || (handoff.has_ended() && !handoff.head_ready() && !handoff.has_data())
    }

    fn finish(&mut self, handoff: &Handoff, events: &mut Vec<RequestEvent>) {
        self.end_processed = true;

        let mut outcome = if let Some(kind) = self.local_failure {
            Outcome::Failed(kind)
        } else if self.abort_requested {
            Outcome::Aborted
        } else {
            match handoff.outcome() {
                None if self.head_seen => Outcome::Success,
                None => Outcome::Failed(ErrorKind::Unknown),
                Some(ErrorKind::Aborted) => Outcome::Aborted,
                Some(kind) => Outcome::Failed(kind),
            }
        };

        match outcome {
            Outcome::Success => {
                if let Err(kind) = self.finalize_body() {
                    self.state.set_error(kind);
                    outcome = Outcome::Failed(kind);
                }
            }
            Outcome::Failed(kind) => {
                self.body = None;
                self.state.set_error(kind);
            }
            Outcome::Aborted => {
                self.body = None;
                self.state.set_error(ErrorKind::Aborted);
            }
        }
        self.stage = Stage::Ended(outcome);

        let request_id = self.state.canceller().id();
        match outcome {
            Outcome::Success => debug!(%request_id, status = self.state.status(), "request completed"),
            Outcome::Failed(kind) => debug!(%request_id, error = %kind, "request failed"),
            Outcome::Aborted => debug!(%request_id, "request aborted"),
        }

        if outcome == Outcome::Aborted && !self.emitted {
            // Aborted before the listener ever heard of it: stay silent.
            self.state.set_phase(Phase::Ended);
            return;
        }
        self.emit(Phase::Ended, events);
    }

    fn finalize_body(&mut self) -> Result<(), ErrorKind> {
        match self.body.take() {
            None => {}
            Some(Accumulator::Bytes(bytes)) => self.state.set_response(ResponseBody::Bytes(bytes)),
            Some(Accumulator::Text(raw)) => self.finalize_text(raw),
            Some(Accumulator::File(download)) => {
                let file = match self.descriptor.response_target() {
                    ResponseTarget::File(file) => file.clone(),
                    ResponseTarget::Memory => return Err(ErrorKind::Internal),
                };
                download.persist().map_err(|e| {
                    warn!(path = %file.full_path.display(), error = %e, "cannot move download into place");
                    ErrorKind::Internal
                })?;
                self.state.set_response(ResponseBody::File(file));
            }
        }
        Ok(())
    }

    fn finalize_text(&mut self, raw: Vec<u8>) {
        let content_type = self
            .state
            .response_headers()
            .content_type()
            .unwrap_or("")
            .to_string();
        let (charset, source) = match content_type::charset_from_header(&content_type) {
            Some(cs) => (cs, "protocol"),
            None => match content_type::charset_from_content(&content_type, &raw) {
                Some(cs) => (cs, "content"),
                None => ("utf-8".to_string(), "implicit"),
            },
        };
        debug!(%charset, source, "response charset chosen");
        self.state.set_debug_value("charset", charset.as_str());
        self.state.set_debug_value("charsetSource", source);

        match transcode::decode(&raw, &charset) {
            Ok(text) => self.state.set_response(ResponseBody::Text(text)),
            Err(e) => {
                debug!(%charset, error = %e, "response kept as bytes");
                self.state.set_debug_value("transcodeError", e.to_string());
                self.state.set_response(ResponseBody::Bytes(raw));
            }
        }
    }
}

/// Text bodies go out in the charset named by the Content-Type header.
fn encode_text(text: &str, headers: &HeaderMap) -> Vec<u8> {
    let Some(cs) = headers.content_type().and_then(content_type::charset_from_header) else {
        return text.as_bytes().to_vec();
    };
    if charset::lookup(&cs).map_or(true, |codec| codec.is_utf8()) {
        return text.as_bytes().to_vec();
    }
    transcode::encode(text, &cs).unwrap_or_else(|e| {
        warn!(charset = %cs, error = %e, "request body sent as UTF-8");
        text.as_bytes().to_vec()
    })
}

fn open_upload(file: &FileRef) -> Result<OutgoingBody, ErrorKind> {
    let opened = File::open(&file.full_path).and_then(|f| {
        let len = f.metadata()?.len();
        Ok(OutgoingBody::File { file: f, len })
    });
    opened.map_err(|e| {
        warn!(path = %file.full_path.display(), error = %e, "cannot open upload file");
        ErrorKind::Internal
    })
}
