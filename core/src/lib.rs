//! Asynchronous HTTP request engine for an embedded scripting runtime.
//!
//! # Overview
//! A caller builds a validated [`RequestDescriptor`], submits it to a
//! [`RequestManager`] and gets a [`Canceller`] back at once. The host then
//! calls [`RequestManager::pump`] at a regular interval; each pump moves
//! every in-flight request forward and invokes its listener with a
//! [`RequestEvent`] snapshot (`began`, `progress`, `ended`).
//!
//! # Design
//! - Network I/O runs behind the [`Transport`] trait, off the pump thread.
//!   The only state shared with it is one [`Handoff`] block per operation.
//! - Operations are pooled and only reused after their transport closed.
//! - Listener calls are rate-limited per phase; `ended` is never dropped.
//! - Response text is decoded from the charset named by the header, sniffed
//!   from HTML/XML content, or assumed UTF-8, in that order.

pub mod charset;
pub mod config;
pub mod content_type;
pub mod descriptor;
mod dispatch;
pub mod error;
pub mod handoff;
pub mod headers;
mod manager;
mod operation;
pub mod resolve;
mod socket;
pub mod state;
pub mod transcode;
pub mod transport;

pub use config::EngineConfig;
pub use descriptor::{
    FileRef, HeaderValue, ProgressMode, RequestBody, RequestDescriptor, RequestDescriptorBuilder,
};
pub use dispatch::Listener;
pub use error::{ConfigError, ErrorKind, ResolveError, TranscodeError, ValidationError};
pub use handoff::{Handoff, ResponseHead};
pub use headers::HeaderMap;
pub use manager::{RequestManager, WeakRequestManager};
pub use operation::{Outcome, Stage};
pub use resolve::{DirectoryResolver, ResolvedPath, ResourceResolver};
pub use state::{Canceller, Phase, RequestEvent, RequestId, ResponseBody};
pub use transport::{Exchange, NativeTransport, OutgoingBody, Transport};
