//! Consumer handlers
//!
//! A handler owns the acknowledgement of every message it receives: it must
//! ack or nack before the lease runs out, or the broker redelivers. Delivery is
//! at-least-once, so handlers have to tolerate seeing a message twice.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::message::InboundMessage;

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, message: Arc<InboundMessage>);
}

/// Logs the payload and acks unconditionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAndAck;

#[async_trait]
impl ConsumerHandler for LogAndAck {
    async fn handle(&self, message: Arc<InboundMessage>) {
        info!(
            subscription = %message.subscription(),
            message_id = %message.message_id(),
            delivery_attempt = message.delivery_attempt(),
            "Message arrived! Payload: {}",
            message.payload_lossy()
        );
        message.ack_handle().ack();
    }
}

/// Runs a fallible closure and resolves the handle from its outcome:
/// `Ok` acks, `Err` logs the error and nacks for redelivery.
pub struct AckOnSuccess<F> {
    process: F,
}

impl<F, E> AckOnSuccess<F>
where
    F: Fn(&InboundMessage) -> Result<(), E> + Send + Sync,
    E: Display + 'static,
{
    pub fn new(process: F) -> Self {
        Self { process }
    }
}

#[async_trait]
impl<F, E> ConsumerHandler for AckOnSuccess<F>
where
    F: Fn(&InboundMessage) -> Result<(), E> + Send + Sync,
    E: Display + 'static,
{
    async fn handle(&self, message: Arc<InboundMessage>) {
        match (self.process)(&message) {
            Ok(()) => {
                message.ack_handle().ack();
            }
            Err(e) => {
                warn!(
                    delivery_id = %message.delivery_id(),
                    message_id = %message.message_id(),
                    error = %e,
                    "Processing failed; nacking message"
                );
                message.ack_handle().nack();
            }
        }
    }
}

/// A handler backed by an async closure. The closure resolves the handle itself.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<InboundMessage>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(Arc<InboundMessage>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Arc<InboundMessage>) {
        (self.f)(message).await
    }
}
