//! Single-writer hand-off block between a transport thread and the pump.
//!
//! # Design
//! Each operation owns one `Handoff`, used by one exchange at a time. Every
//! field has exactly one writer:
//!
//! ```text
//!   field                 writer      reader
//!   upload_total/sent     transport   pump
//!   head + head_ready     transport   pump (takes, then clears)
//!   receive slot + len    transport   pump (drains, then zeroes len)
//!   outcome + ended       transport   pump
//!   closed                transport   pump
//!   abort                 pump        transport
//!   socket                transport   pump (shuts it down on abort)
//! ```
//!
//! Payloads are written before the flag or count that announces them
//! (`Release` store, `Acquire` load). The receive slot holds at most one
//! buffer; the transport waits on a condition variable until the pump has
//! drained it, which gives natural back-pressure. A transport learns about
//! an abort while waiting and returns early.
//!
//! A transport that blocks inside a socket attaches it here, so that an
//! abort can shut it down instead of waiting for the peer or a timeout.
//!
//! `closed` is the last thing a transport writes. Once it is set the block
//! may be reset and handed to another exchange.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::ErrorKind;
use crate::socket;

const ABORT_POLL: Duration = Duration::from_millis(25);

/// Status line and headers of a response, as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub status_line: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct Handoff {
    capacity: usize,
    upload_total: AtomicU64,
    upload_sent: AtomicU64,
    head: Mutex<Option<ResponseHead>>,
    head_ready: AtomicBool,
    slot: Mutex<Vec<u8>>,
    slot_len: AtomicUsize,
    slot_free: Condvar,
    outcome: Mutex<Option<ErrorKind>>,
    ended: AtomicBool,
    closed: AtomicBool,
    abort: AtomicBool,
    socket: Mutex<Option<Arc<TcpStream>>>,
}

impl Handoff {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            upload_total: AtomicU64::new(0),
            upload_sent: AtomicU64::new(0),
            head: Mutex::new(None),
            head_ready: AtomicBool::new(false),
            slot: Mutex::new(Vec::with_capacity(capacity)),
            slot_len: AtomicUsize::new(0),
            slot_free: Condvar::new(),
            outcome: Mutex::new(None),
            ended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            socket: Mutex::new(None),
        }
    }

    /// Prepare for a new exchange. Only valid once the previous one closed.
    pub(crate) fn reset(&self) {
        debug_assert!(self.is_closed() || !self.has_ended());
        self.upload_total.store(0, Ordering::Relaxed);
        self.upload_sent.store(0, Ordering::Relaxed);
        *self.head.lock() = None;
        self.head_ready.store(false, Ordering::Relaxed);
        self.slot.lock().clear();
        self.slot_len.store(0, Ordering::Relaxed);
        *self.outcome.lock() = None;
        self.ended.store(false, Ordering::Relaxed);
        self.closed.store(false, Ordering::Relaxed);
        *self.socket.lock() = None;
        self.abort.store(false, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Transport side
    // -----------------------------------------------------------------------

    pub fn set_upload_total(&self, total: u64) {
        self.upload_total.store(total, Ordering::Release);
    }

    /// Announce that `n` more body bytes were handed to the connection.
    pub fn record_uploaded(&self, n: u64) {
        self.upload_sent.fetch_add(n, Ordering::AcqRel);
    }

    /// Share the socket the exchange currently blocks on. Shut down at once
    /// if an abort is already pending.
    pub fn attach_socket(&self, stream: &Arc<TcpStream>) {
        let mut slot = self.socket.lock();
        if !slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, stream)) {
            *slot = Some(Arc::clone(stream));
        }
        if self.abort_requested() {
            socket::shutdown(stream);
        }
    }

    pub fn publish_head(&self, head: ResponseHead) {
        *self.head.lock() = Some(head);
        self.head_ready.store(true, Ordering::Release);
    }

    /// Copy `data` into the receive slot, waiting for the pump to drain
    /// earlier data first. Fails with `Aborted` once an abort is requested.
    pub fn deliver(&self, mut data: &[u8]) -> Result<(), ErrorKind> {
        while !data.is_empty() {
            let mut slot = self.slot.lock();
            while self.slot_len.load(Ordering::Acquire) != 0 {
                if self.abort_requested() {
                    return Err(ErrorKind::Aborted);
                }
                self.slot_free.wait_for(&mut slot, ABORT_POLL);
            }
            if self.abort_requested() {
                return Err(ErrorKind::Aborted);
            }
            let n = data.len().min(self.capacity);
            slot.clear();
            slot.extend_from_slice(&data[..n]);
            self.slot_len.store(n, Ordering::Release);
            data = &data[n..];
        }
        Ok(())
    }

    /// Record the result of the exchange. An abort always wins.
    pub fn finish(&self, result: Result<(), ErrorKind>) {
        let outcome = if self.abort_requested() {
            Some(ErrorKind::Aborted)
        } else {
            result.err()
        };
        *self.outcome.lock() = outcome;
        self.ended.store(true, Ordering::Release);
    }

    /// All transport resources are released. Must be the final write.
    pub fn close(&self) {
        self.socket.lock().take();
        self.closed.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Pump side
    // -----------------------------------------------------------------------

    pub fn upload_total(&self) -> u64 {
        self.upload_total.load(Ordering::Acquire)
    }

    pub fn uploaded(&self) -> u64 {
        self.upload_sent.load(Ordering::Acquire)
    }

    pub fn head_ready(&self) -> bool {
        self.head_ready.load(Ordering::Acquire)
    }

    pub fn take_head(&self) -> Option<ResponseHead> {
        if !self.head_ready() {
            return None;
        }
        let head = self.head.lock().take();
        self.head_ready.store(false, Ordering::Release);
        head
    }

    pub fn has_data(&self) -> bool {
        self.slot_len.load(Ordering::Acquire) != 0
    }

    /// Hand pending received bytes to `f` and free the slot.
    pub fn drain<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if !self.has_data() {
            return None;
        }
        let mut slot = self.slot.lock();
        let n = self.slot_len.load(Ordering::Acquire);
        let result = f(&slot[..n]);
        slot.clear();
        self.slot_len.store(0, Ordering::Release);
        drop(slot);
        self.slot_free.notify_one();
        Some(result)
    }

    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Error of an ended exchange, `None` on success.
    pub fn outcome(&self) -> Option<ErrorKind> {
        *self.outcome.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask the transport to stop. Wakes a transport blocked in `deliver` or
    /// inside an attached socket.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
        if let Some(stream) = self.socket.lock().as_ref() {
            socket::shutdown(stream);
        }
        self.slot_free.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn has_socket(&self) -> bool {
        self.socket.lock().is_some()
    }
}
