//! Delivery channels
//!
//! A `DeliveryChannel` maps channel names to an ordered list of handlers and
//! hands every dispatched message to all of them. Registration takes
//! `&mut self`, dispatch takes `&self`: once the channel is shared behind an
//! `Arc` for the bridge, its registry can no longer change.
//!
//! In `Direct` mode handlers run on the dispatching task, one after another.
//! In `Concurrent` mode each message gets its own worker task, at most
//! `max_in_flight` at a time; the handlers for one message still run in order.
//!
//! A handler that panics is logged and skipped. Its message stays unresolved,
//! so the broker redelivers it once the lease runs out.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::channel::handler::ConsumerHandler;
use crate::message::InboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Direct,
    Concurrent { max_in_flight: usize },
}

#[derive(Default)]
pub struct DeliveryChannel {
    handlers: HashMap<String, Vec<Arc<dyn ConsumerHandler>>>,
    mode: DispatchMode,
    permits: Option<Arc<Semaphore>>,
}

impl DeliveryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: DispatchMode) -> Self {
        let permits = match mode {
            DispatchMode::Direct => None,
            DispatchMode::Concurrent { max_in_flight } => {
                Some(Arc::new(Semaphore::new(max_in_flight.max(1))))
            }
        };
        Self {
            handlers: HashMap::new(),
            mode,
            permits,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Appends `handler` to the handlers of `channel`.
    pub fn register<H>(&mut self, channel: impl Into<String>, handler: H)
    where
        H: ConsumerHandler + 'static,
    {
        let channel = channel.into();
        debug!(channel = %channel, "Registering consumer handler");
        self.handlers
            .entry(channel)
            .or_default()
            .push(Arc::new(handler));
    }

    /// How many deliveries may be unresolved at once for this channel: one
    /// in `Direct` mode, `max_in_flight` in `Concurrent` mode.
    pub fn max_outstanding(&self) -> usize {
        match self.mode {
            DispatchMode::Direct => 1,
            DispatchMode::Concurrent { max_in_flight } => max_in_flight.max(1),
        }
    }

    pub fn handler_count(&self, channel: &str) -> usize {
        self.handlers.get(channel).map_or(0, Vec::len)
    }

    /// Hands `message` to every handler of `channel` and returns how many
    /// handlers it went to. A channel without handlers drops the message.
    ///
    /// In `Concurrent` mode this returns once the message is handed to a
    /// worker, waiting first if `max_in_flight` workers are busy.
    pub async fn dispatch(&self, channel: &str, message: Arc<InboundMessage>) -> usize {
        let handlers = match self.handlers.get(channel) {
            Some(handlers) if !handlers.is_empty() => handlers,
            _ => {
                debug!(channel = %channel, delivery_id = %message.delivery_id(), "No handlers registered; message dropped");
                return 0;
            }
        };

        match &self.permits {
            None => run_handlers(channel, handlers, &message).await,
            Some(permits) => {
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dispatch pool closed; message dropped");
                        return 0;
                    }
                };
                let handlers = handlers.clone();
                let channel = channel.to_string();
                tokio::spawn(async move {
                    let _permit = permit;
                    run_handlers(&channel, &handlers, &message).await;
                });
            }
        }
        handlers.len()
    }
}

async fn run_handlers(
    channel: &str,
    handlers: &[Arc<dyn ConsumerHandler>],
    message: &Arc<InboundMessage>,
) {
    for handler in handlers {
        let handled = AssertUnwindSafe(handler.handle(message.clone()))
            .catch_unwind()
            .await;
        if handled.is_err() {
            error!(
                channel = %channel,
                delivery_id = %message.delivery_id(),
                message_id = %message.message_id(),
                "Consumer handler panicked; message left for redelivery"
            );
        }
    }
}

impl std::fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(name, handlers)| (name.as_str(), handlers.len()))
            .collect();
        f.debug_struct("DeliveryChannel")
            .field("handlers", &counts)
            .field("mode", &self.mode)
            .finish()
    }
}
