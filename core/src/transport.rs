//! Transport seam and the native HTTP transport.
//!
//! # Design
//! A [`Transport`] receives a fully prepared [`Exchange`] together with the
//! operation's [`Handoff`] block and must return immediately. All network
//! I/O happens elsewhere (a worker thread, a browser event loop, ...), and
//! every result flows back through the hand-off block in this order:
//!
//! 1. `set_upload_total` / `record_uploaded` while the body is sent
//! 2. `publish_head` once status and headers are known
//! 3. `deliver` for each body chunk
//! 4. `finish` with the outcome
//! 5. `close` when nothing of the exchange remains alive
//!
//! [`NativeTransport`] runs each exchange on its own thread with a blocking
//! `ureq` agent. Agents are cached per timeout/redirect policy, so sessions
//! and their connection pools are reused across requests. Their sockets come
//! from `AbortableConnector`, which lets an abort cut a blocked exchange
//! short.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use ureq::unversioned::resolver::DefaultResolver;
use ureq::unversioned::transport::{Connector, RustlsConnector};
use ureq::{Agent, SendBody};

use crate::config::EngineConfig;
use crate::error::ErrorKind;
use crate::handoff::{Handoff, ResponseHead};
use crate::socket::{self, AbortableConnector};
use crate::state::RequestId;

/// Body of an outgoing request, already encoded for the wire.
#[derive(Debug)]
pub enum OutgoingBody {
    Empty,
    Bytes(Vec<u8>),
    File { file: File, len: u64 },
}

impl OutgoingBody {
    pub fn len(&self) -> u64 {
        match self {
            OutgoingBody::Empty => 0,
            OutgoingBody::Bytes(bytes) => bytes.len() as u64,
            OutgoingBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            OutgoingBody::Empty => Box::new(io::empty()),
            OutgoingBody::Bytes(bytes) => Box::new(Cursor::new(bytes)),
            OutgoingBody::File { file, .. } => Box::new(file),
        }
    }
}

/// One request, ready to be put on the wire.
#[derive(Debug)]
pub struct Exchange {
    pub request_id: RequestId,
    pub method: String,
    /// Absolute URL with any credentials removed.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: OutgoingBody,
    /// `None` disables the timeout.
    pub timeout: Option<Duration>,
    pub follow_redirects: bool,
}

pub trait Transport {
    /// Start `exchange` without blocking the caller.
    ///
    /// An error means nothing was started and the hand-off block will never
    /// be written; the operation then fails locally with that kind.
    fn begin(&self, exchange: Exchange, handoff: Arc<Handoff>) -> Result<(), ErrorKind>;
}

type AgentKey = (Option<Duration>, bool);

pub struct NativeTransport {
    agents: Mutex<HashMap<AgentKey, Agent>>,
    user_agent: Option<String>,
    upload_chunk_size: usize,
    read_buffer_size: usize,
}

impl NativeTransport {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            user_agent: config.user_agent.clone(),
            upload_chunk_size: config.upload_chunk_size.max(1),
            read_buffer_size: config.receive_buffer_size.max(1),
        }
    }

    fn agent(&self, timeout: Option<Duration>, follow_redirects: bool) -> Agent {
        self.agents
            .lock()
            .entry((timeout, follow_redirects))
            .or_insert_with(|| {
                let config = Agent::config_builder()
                    .http_status_as_error(false)
                    .max_redirects(if follow_redirects { 10 } else { 0 })
                    .proxy(None)
                    .timeout_connect(timeout)
                    .timeout_send_request(timeout)
                    .timeout_send_body(timeout)
                    .timeout_recv_response(timeout)
                    .timeout_recv_body(timeout)
                    .build();
                let connector = ().chain(AbortableConnector).chain(RustlsConnector::default());
                Agent::with_parts(config, connector, DefaultResolver::default())
            })
            .clone()
    }
}

impl std::fmt::Debug for NativeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeTransport")
            .field("agents", &self.agents.lock().len())
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Transport for NativeTransport {
    fn begin(&self, mut exchange: Exchange, handoff: Arc<Handoff>) -> Result<(), ErrorKind> {
        let agent = self.agent(exchange.timeout, exchange.follow_redirects);
        if let Some(ua) = &self.user_agent {
            if !exchange.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
                exchange.headers.push(("User-Agent".to_string(), ua.clone()));
            }
        }
        handoff.set_upload_total(exchange.body.len());

        let worker = Worker {
            agent,
            handoff,
            upload_chunk_size: self.upload_chunk_size,
            read_buffer_size: self.read_buffer_size,
        };
        thread::Builder::new()
            .name(format!("netreq-{}", exchange.request_id))
            .spawn(move || worker.run(exchange))
            .map(drop)
            .map_err(|e| {
                warn!(error = %e, "failed to spawn transport thread");
                ErrorKind::Internal
            })
    }
}

struct Worker {
    agent: Agent,
    handoff: Arc<Handoff>,
    upload_chunk_size: usize,
    read_buffer_size: usize,
}

impl Worker {
    fn run(self, exchange: Exchange) {
        let request_id = exchange.request_id;
        let binding = socket::bind_worker(Arc::clone(&self.handoff));
        let result = self.execute(exchange);
        drop(binding);
        if let Err(kind) = result {
            debug!(%request_id, error = %kind, "exchange failed");
        }
        self.handoff.finish(result);
        self.handoff.close();
    }

    fn execute(&self, exchange: Exchange) -> Result<(), ErrorKind> {
        let mut builder = ureq::http::Request::builder()
            .method(exchange.method.as_str())
            .uri(exchange.url.as_str());
        for (name, value) in &exchange.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = if exchange.body.is_empty() {
            let request = builder.body(()).map_err(invalid_request)?;
            self.agent.run(request)
        } else {
            let builder = builder.header("Content-Length", exchange.body.len().to_string());
            let mut reader = UploadReader {
                inner: exchange.body.into_reader(),
                handoff: &self.handoff,
                chunk: self.upload_chunk_size,
            };
            let request = builder
                .body(SendBody::from_reader(&mut reader))
                .map_err(invalid_request)?;
            self.agent.run(request)
        };
        let response = response.map_err(|e| classify(&e))?;

        if self.handoff.abort_requested() {
            return Err(ErrorKind::Aborted);
        }

        let status = response.status();
        let status_line = format!(
            "{:?} {} {}",
            response.version(),
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        self.handoff.publish_head(ResponseHead {
            status: status.as_u16(),
            status_line: status_line.trim_end().to_string(),
            headers,
        });

        let mut body = response.into_body().into_reader();
        let mut buf = vec![0u8; self.read_buffer_size];
        loop {
            if self.handoff.abort_requested() {
                return Err(ErrorKind::Aborted);
            }
            let n = match body.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify_io(&e, ErrorKind::Unknown)),
            };
            self.handoff.deliver(&buf[..n])?;
        }
    }
}

fn invalid_request(e: ureq::http::Error) -> ErrorKind {
    warn!(error = %e, "request could not be assembled");
    ErrorKind::Unknown
}

/// Reads the upload body in bounded chunks and announces each one.
struct UploadReader<'a> {
    inner: Box<dyn Read + Send>,
    handoff: &'a Handoff,
    chunk: usize,
}

impl Read for UploadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.handoff.abort_requested() {
            return Err(io::Error::other("upload aborted"));
        }
        let limit = buf.len().min(self.chunk);
        let n = self.inner.read(&mut buf[..limit])?;
        self.handoff.record_uploaded(n as u64);
        Ok(n)
    }
}

fn classify(error: &ureq::Error) -> ErrorKind {
    match error {
        ureq::Error::Timeout(_) => ErrorKind::TimedOut,
        ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => ErrorKind::ConnectionFailure,
        ureq::Error::BadUri(_) => ErrorKind::InvalidUrl,
        ureq::Error::Io(e) => classify_io(e, ErrorKind::ConnectionFailure),
        _ => ErrorKind::Unknown,
    }
}

fn classify_io(error: &io::Error, fallback: ErrorKind) -> ErrorKind {
    if let Some(inner) = error.get_ref().and_then(|e| e.downcast_ref::<ureq::Error>()) {
        return classify(inner);
    }
    match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::TimedOut,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable => ErrorKind::ConnectionFailure,
        _ => fallback,
    }
}
