//! Manual acknowledgement
//!
//! An `AckHandle` wraps the broker's native ack id for exactly one delivery.
//! It moves from `Pending` to `Acked` or `Nacked` once; any later attempt is
//! ignored with a warning because redelivery races are expected under
//! at-least-once delivery. A handle still pending at its lease deadline reads
//! as `Expired`: the broker owns the message again and will redeliver it.
//! The same holds when the broker no longer knows the ack id at resolution
//! time; the resolution then returns `false`.
//!
//! Handles are cheap to clone; every clone observes the same state.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::client::Acknowledger;
use crate::utils::error::BrokerError;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Nacked,
    Expired,
}

impl AckState {
    pub fn is_terminal(self) -> bool {
        self != AckState::Pending
    }
}

/// Acknowledgement obligation for one in-flight inbound message.
#[derive(Clone)]
pub struct AckHandle {
    inner: Arc<AckInner>,
}

struct AckInner {
    delivery_id: String,
    subscription: String,
    ack_id: String,
    deadline: Instant,
    state: Mutex<AckState>,
    acker: Arc<dyn Acknowledger>,
    tracker: Option<Arc<AckTracker>>,
}

impl AckHandle {
    /// Creates a pending handle for the broker token `ack_id`.
    pub fn new(
        delivery_id: impl Into<String>,
        subscription: impl Into<String>,
        ack_id: impl Into<String>,
        deadline: Instant,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self::build(delivery_id.into(), subscription.into(), ack_id.into(), deadline, acker, None)
    }

    /// Same as `new`, but registers the handle with `tracker` until it reaches
    /// a terminal state.
    pub(crate) fn tracked(
        delivery_id: String,
        subscription: String,
        ack_id: String,
        deadline: Instant,
        acker: Arc<dyn Acknowledger>,
        tracker: Arc<AckTracker>,
    ) -> Self {
        tracker.insert(&delivery_id, deadline);
        Self::build(delivery_id, subscription, ack_id, deadline, acker, Some(tracker))
    }

    fn build(
        delivery_id: String,
        subscription: String,
        ack_id: String,
        deadline: Instant,
        acker: Arc<dyn Acknowledger>,
        tracker: Option<Arc<AckTracker>>,
    ) -> Self {
        Self {
            inner: Arc::new(AckInner {
                delivery_id,
                subscription,
                ack_id,
                deadline,
                state: Mutex::new(AckState::Pending),
                acker,
                tracker,
            }),
        }
    }

    pub fn delivery_id(&self) -> &str {
        &self.inner.delivery_id
    }

    /// The broker's native acknowledgement token this handle resolves.
    pub fn ack_id(&self) -> &str {
        &self.inner.ack_id
    }

    pub fn subscription(&self) -> &str {
        &self.inner.subscription
    }

    /// Lease deadline after which the broker may redeliver the message.
    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    pub fn state(&self) -> AckState {
        let mut state = lock(&self.inner.state);
        self.refresh(&mut state)
    }

    /// Positively acknowledges the message. Returns `true` if this call
    /// resolved the handle, `false` if it was already terminal or the broker's
    /// lease had run out.
    pub fn ack(&self) -> bool {
        self.resolve(AckState::Acked)
    }

    /// Negatively acknowledges the message so the broker redelivers it.
    /// Returns `true` if this call resolved the handle.
    pub fn nack(&self) -> bool {
        self.resolve(AckState::Nacked)
    }

    fn resolve(&self, target: AckState) -> bool {
        {
            let mut state = lock(&self.inner.state);
            let current = self.refresh(&mut state);
            if current.is_terminal() {
                warn!(
                    delivery_id = %self.inner.delivery_id,
                    state = ?current,
                    requested = ?target,
                    "Ignoring resolution of an ack handle that is no longer pending"
                );
                return false;
            }
            *state = target;
        }
        self.untrack();

        let inner = &self.inner;
        let result = match target {
            AckState::Nacked => inner.acker.nack(&inner.subscription, &inner.ack_id),
            _ => inner.acker.ack(&inner.subscription, &inner.ack_id),
        };
        match result {
            Ok(()) => debug!(delivery_id = %inner.delivery_id, state = ?target, "Ack handle resolved"),
            Err(BrokerError::UnknownAckId { .. }) => {
                // the broker already took the lease back
                *lock(&inner.state) = AckState::Expired;
                warn!(
                    delivery_id = %inner.delivery_id,
                    requested = ?target,
                    "Lease already expired at the broker; the message will be redelivered"
                );
                return false;
            }
            Err(e) => warn!(
                delivery_id = %inner.delivery_id,
                state = ?target,
                error = %e,
                "Broker did not take the resolution; the message may be redelivered"
            ),
        }
        true
    }

    /// Applies lease expiry to a pending state.
    fn refresh(&self, state: &mut AckState) -> AckState {
        if *state == AckState::Pending && Instant::now() >= self.inner.deadline {
            *state = AckState::Expired;
            self.untrack();
        }
        *state
    }

    fn untrack(&self) {
        if let Some(tracker) = &self.inner.tracker {
            tracker.remove(&self.inner.delivery_id);
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("delivery_id", &self.inner.delivery_id)
            .field("subscription", &self.inner.subscription)
            .field("ack_id", &self.inner.ack_id)
            .field("state", &*lock(&self.inner.state))
            .finish()
    }
}

/// Outstanding handles of one inbound bridge, keyed by delivery id.
#[derive(Debug, Default)]
pub struct AckTracker {
    deadlines: Mutex<HashMap<String, Instant>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, delivery_id: &str, deadline: Instant) {
        lock(&self.deadlines).insert(delivery_id.to_string(), deadline);
    }

    fn remove(&self, delivery_id: &str) {
        lock(&self.deadlines).remove(delivery_id);
    }

    /// Number of handles still pending and within their lease. Expired
    /// entries are dropped on the way.
    pub fn outstanding(&self) -> usize {
        let now = Instant::now();
        let mut deadlines = lock(&self.deadlines);
        deadlines.retain(|_, deadline| *deadline > now);
        deadlines.len()
    }
}
