//! Rate-limited delivery of request events to a listener.
//!
//! Rules, applied per request:
//! - nothing is delivered once the request's canceller reports cancelled;
//! - the first event of a phase is always delivered;
//! - a repeat of the same phase within the minimum interval is dropped;
//! - `ended` is never dropped.

use std::fmt;
use std::time::{Duration, Instant};

use crate::state::{Phase, RequestEvent};

/// Callback registered with a request.
pub type Listener = Box<dyn FnMut(&RequestEvent)>;

pub(crate) struct Dispatcher {
    listener: Listener,
    min_interval: Duration,
    last: Option<(Phase, Instant)>,
}

impl Dispatcher {
    pub(crate) fn new(listener: Listener, min_interval: Duration) -> Self {
        Self {
            listener,
            min_interval,
            last: None,
        }
    }

    fn admits(&self, event: &RequestEvent, now: Instant) -> bool {
        if event.request_id.is_cancelled() {
            return false;
        }
        match self.last {
            Some((phase, at)) if phase == event.phase && event.phase != Phase::Ended => {
                now.saturating_duration_since(at) >= self.min_interval
            }
            _ => true,
        }
    }

    pub(crate) fn deliver(&mut self, event: &RequestEvent) -> bool {
        self.deliver_at(event, Instant::now())
    }

    pub(crate) fn deliver_at(&mut self, event: &RequestEvent, now: Instant) -> bool {
        if !self.admits(event, now) {
            return false;
        }
        self.last = Some((event.phase, now));
        (self.listener)(event);
        true
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("min_interval", &self.min_interval)
            .field("last", &self.last)
            .finish()
    }
}
