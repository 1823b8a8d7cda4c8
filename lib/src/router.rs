//! Protocol router
//!
//! Classifies each inbound message and routes it: responses complete a
//! pending outbound call, calls and notifications are dispatched as
//! independent tasks. Routing itself never awaits, so the inbound loop is
//! never held up by a handler.

use crate::connection::ConnectionContext;
use crate::dispatch;
use crate::error::codes;
use crate::protocol::{EnvelopeError, Incoming, Message, RpcError};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, debug_span, warn, Instrument};

pub(crate) struct Router {
    context: Arc<ConnectionContext>,
}

impl Router {
    pub(crate) fn new(context: Arc<ConnectionContext>) -> Self {
        Self { context }
    }

    /// Route one inbound message, spawning any dispatch work into `tasks`
    pub(crate) fn route(&self, message: Message, tasks: &mut JoinSet<()>) {
        match message.classify() {
            Ok(Incoming::Response { id, outcome }) => {
                if !self.context.pending.resolve(&id, outcome) {
                    warn!("Discarding response for unknown or completed call {}", id);
                }
            }
            Ok(Incoming::Call { id, method, params }) => {
                let context = self.context.clone();
                let span = debug_span!("call", method = %method, id = %id);
                tasks.spawn(
                    async move {
                        let outcome = dispatch::handle_call(&context, &method, params).await;
                        debug!("Answering {} ({})", method, if outcome.is_ok() { "ok" } else { "error" });
                        if context.outbox.send(Message::response(id, outcome)).await.is_err() {
                            debug!("Connection closed before response could be queued");
                        }
                        if context.close_requested() {
                            context.closing.cancel();
                        }
                    }
                    .instrument(span),
                );
            }
            Ok(Incoming::Notification { method, params }) => {
                let context = self.context.clone();
                let span = debug_span!("notification", method = %method);
                tasks.spawn(
                    async move {
                        dispatch::handle_notification(&context, &method, params).await;
                    }
                    .instrument(span),
                );
            }
            Err(EnvelopeError { id: Some(id), reason }) => {
                warn!("Invalid envelope for call {}: {}", id, reason);
                let outbox = self.context.outbox.clone();
                let error = RpcError::new(codes::INVALID_REQUEST, format!("Invalid request: {}", reason));
                tasks.spawn(async move {
                    if outbox.send(Message::failure(id, error)).await.is_err() {
                        debug!("Connection closed before invalid-request reply could be queued");
                    }
                });
            }
            Err(EnvelopeError { id: None, reason }) => {
                warn!("Dropping invalid envelope: {}", reason);
            }
        }
    }
}
