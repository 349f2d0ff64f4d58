//! Pool of operations and the pump that drives them.
//!
//! # Overview
//! The host calls [`RequestManager::submit`] to start a request and
//! [`RequestManager::pump`] at a regular interval (once per frame or tick).
//! Each pump advances every pooled operation, hands ready events to their
//! listeners and returns operations whose transport has closed to the pool.
//!
//! # Design
//! The manager is single-threaded: it is an `Rc` handle and is `!Send`.
//! Listeners run inside `pump` and may call back into the manager. To make
//! that safe:
//! - a nested `pump` is a no-op;
//! - `pump` iterates a snapshot of the pool, so a `submit` from a listener
//!   can grow the pool without disturbing the loop;
//! - no operation is borrowed while its listener runs.
//!
//! Dropping the last strong handle aborts whatever is still running and
//! drains for up to `shutdown_drain_ms`. Listeners that need the manager
//! should hold a [`WeakRequestManager`] to avoid keeping it alive.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::charset;
use crate::config::EngineConfig;
use crate::descriptor::RequestDescriptor;
use crate::dispatch::{Dispatcher, Listener};
use crate::operation::{RequestOperation, Stage};
use crate::state::{Canceller, RequestId};
use crate::transport::{NativeTransport, Transport};

type OperationRef = Rc<RefCell<RequestOperation>>;

struct Inner {
    config: EngineConfig,
    transport: Box<dyn Transport>,
    operations: RefCell<Vec<OperationRef>>,
    working: RefCell<Vec<OperationRef>>,
    pumping: Cell<bool>,
    next_id: Cell<u64>,
}

/// Resets the re-entrancy flag even if a listener panics.
struct PumpGuard<'a>(&'a Cell<bool>);

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Handle to a request pool. Clones share the pool.
#[derive(Clone)]
pub struct RequestManager {
    inner: Rc<Inner>,
}

/// Non-owning handle, for listeners that submit follow-up requests.
#[derive(Clone)]
pub struct WeakRequestManager {
    inner: Weak<Inner>,
}

impl WeakRequestManager {
    pub fn upgrade(&self) -> Option<RequestManager> {
        self.inner.upgrade().map(|inner| RequestManager { inner })
    }
}

impl RequestManager {
    /// Manager backed by the native transport.
    pub fn new(config: EngineConfig) -> Self {
        let transport = NativeTransport::new(&config);
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: EngineConfig, transport: impl Transport + 'static) -> Self {
        charset::init();
        Self {
            inner: Rc::new(Inner {
                config,
                transport: Box::new(transport),
                operations: RefCell::new(Vec::new()),
                working: RefCell::new(Vec::new()),
                pumping: Cell::new(false),
                next_id: Cell::new(1),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakRequestManager {
        WeakRequestManager {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start a request and return its cancel handle immediately.
    ///
    /// The listener, if any, is only ever invoked from `pump`.
    pub fn submit(&self, descriptor: RequestDescriptor, listener: Option<Listener>) -> Canceller {
        self.inner.submit(descriptor, listener)
    }

    /// Advance every operation once and deliver ready events.
    pub fn pump(&self) {
        self.inner.pump();
    }

    /// Pump until nothing is active or `timeout` elapses. Returns `true` when
    /// everything drained.
    pub fn pump_until(&self, timeout: Duration) -> bool {
        self.inner.pump_until(timeout)
    }

    /// Request abort of every active operation. Completes on later pumps.
    pub fn abort_all(&self) {
        self.inner.abort_all();
    }

    /// Cancel the request with `id`. Returns `false` when no active
    /// operation owns it or it was already cancelled.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.inner
            .find(id)
            .and_then(|op| op.borrow().canceller().map(Canceller::cancel))
            .unwrap_or(false)
    }

    /// Current stage of the request with `id`, while it is pooled.
    pub fn stage(&self, id: RequestId) -> Option<Stage> {
        self.inner.find(id).map(|op| op.borrow().stage())
    }

    /// Operations that are not idle, including ended ones waiting for the
    /// transport to close.
    pub fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    /// Total number of pooled operations, idle or not.
    pub fn pooled_count(&self) -> usize {
        self.inner.operations.borrow().len()
    }

    /// Abort everything and drain. Returns `true` if all operations closed in
    /// time.
    pub fn shutdown(&self) -> bool {
        self.inner.shutdown()
    }
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager")
            .field("pooled", &self.pooled_count())
            .field("active", &self.active_count())
            .finish()
    }
}

impl Inner {
    fn submit(&self, descriptor: RequestDescriptor, listener: Option<Listener>) -> Canceller {
        let id = RequestId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let canceller = Canceller::new(id);

        let interval = descriptor
            .min_notification_interval()
            .unwrap_or(Duration::from_millis(self.config.min_notification_interval_ms));
        let dispatcher = listener.map(|l| Rc::new(RefCell::new(Dispatcher::new(l, interval))));

        let op = self.acquire();
        op.borrow_mut().start(
            descriptor,
            canceller.clone(),
            dispatcher,
            self.transport.as_ref(),
            &self.config,
        );
        canceller
    }

    /// First idle operation, or a new one.
    fn acquire(&self) -> OperationRef {
        let idle = self
            .operations
            .borrow()
            .iter()
            .find(|op| op.try_borrow().is_ok_and(|o| o.is_idle()))
            .cloned();
        if let Some(op) = idle {
            return op;
        }
        let op = Rc::new(RefCell::new(RequestOperation::new(self.config.receive_buffer_size)));
        self.operations.borrow_mut().push(Rc::clone(&op));
        debug!(pooled = self.operations.borrow().len(), "operation allocated");
        op
    }

    fn find(&self, id: RequestId) -> Option<OperationRef> {
        self.operations
            .borrow()
            .iter()
            .find(|op| {
                op.try_borrow()
                    .is_ok_and(|o| o.canceller().is_some_and(|c| c.id() == id))
            })
            .cloned()
    }

    fn pump(&self) {
        if self.pumping.replace(true) {
            return;
        }
        let _guard = PumpGuard(&self.pumping);

        let mut working = self.working.take();
        working.clear();
        working.extend(self.operations.borrow().iter().cloned());

        for op in &working {
            let (events, dispatcher) = {
                let mut op = op.borrow_mut();
                (op.advance(), op.dispatcher())
            };
            if let Some(dispatcher) = dispatcher {
                for event in &events {
                    dispatcher.borrow_mut().deliver(event);
                }
            }
            op.borrow_mut().recycle_if_closed();
        }

        working.clear();
        *self.working.borrow_mut() = working;
    }

    fn pump_until(&self, timeout: Duration) -> bool {
        if self.pumping.get() {
            warn!("pump_until called from a listener; ignored");
            return false;
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if self.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.config.pump_interval());
        }
    }

    fn abort_all(&self) {
        for op in self.operations.borrow().iter() {
            if let Ok(mut op) = op.try_borrow_mut() {
                op.request_abort();
            }
        }
    }

    fn active_count(&self) -> usize {
        self.operations
            .borrow()
            .iter()
            .filter(|op| op.try_borrow().map_or(true, |o| !o.is_idle()))
            .count()
    }

    fn shutdown(&self) -> bool {
        let active = self.active_count();
        if active == 0 {
            return true;
        }
        info!(active, "shutting down request manager");
        self.abort_all();
        let drained = self.pump_until(self.config.shutdown_drain());
        if !drained {
            warn!(
                remaining = self.active_count(),
                "transport did not close before the drain deadline"
            );
        }
        drained
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
