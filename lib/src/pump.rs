//! Message pump
//!
//! Two loops per connection decouple protocol logic from transport timing.
//! The outbound loop is the only writer to the transport; everything else
//! enqueues through an [`Outbox`]. The queue is bounded, so a slow peer
//! suspends producers instead of growing memory or dropping messages.

use crate::error::{BridgeError, Result};
use crate::protocol::Message;
use crate::router::Router;
use crate::transport::{MessageTransport, Received};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Producer side of the outbound queue
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    /// Create a queue holding at most `capacity` messages
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue a message, waiting for space if the queue is full
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| BridgeError::ConnectionClosed)
    }

}

/// Why the inbound loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Transport reported end of stream
    PeerClosed,
    /// Teardown was requested locally (close request, send failure, shutdown)
    Requested,
}

/// Write one message, giving up after `deadline`
async fn send_bounded(
    transport: &dyn MessageTransport,
    message: Message,
    deadline: Duration,
) -> Result<()> {
    match tokio::time::timeout(deadline, transport.send(message)).await {
        Ok(sent) => sent,
        Err(_) => Err(BridgeError::TransportFailure(format!(
            "peer did not accept a frame within {:?}",
            deadline
        ))),
    }
}

/// Drain the outbound queue into the transport
///
/// Stops when the queue is closed, a send fails fatally (signalling
/// `closing`), or `stop` fires. On `stop`, anything already queued is
/// flushed first. Every write is bounded by `send_timeout`, so a peer that
/// stops reading cannot hold up teardown.
pub(crate) async fn outbound_loop(
    transport: Arc<dyn MessageTransport>,
    mut rx: mpsc::Receiver<Message>,
    send_timeout: Duration,
    closing: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            message = rx.recv() => {
                let Some(message) = message else { break };
                match send_bounded(transport.as_ref(), message, send_timeout).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        warn!("Outbound send failed, tearing down: {}", e);
                        closing.cancel();
                        break;
                    }
                    Err(e) => error!("Dropping outbound message: {}", e),
                }
            }
            _ = stop.cancelled() => {
                while let Ok(message) = rx.try_recv() {
                    if let Err(e) = send_bounded(transport.as_ref(), message, send_timeout).await {
                        debug!("Abandoning outbound flush: {}", e);
                        break;
                    }
                }
                break;
            }
        }
    }
    rx.close();
    debug!("Outbound pump stopped");
}

/// Feed received messages to the router until the transport ends or
/// `closing` fires
///
/// Every dispatched unit of work is spawned into `tasks`, so a slow handler
/// never stalls this loop.
pub(crate) async fn inbound_loop(
    transport: Arc<dyn MessageTransport>,
    router: &Router,
    tasks: &mut JoinSet<()>,
    closing: CancellationToken,
) -> PumpExit {
    let reason = loop {
        let received = tokio::select! {
            _ = closing.cancelled() => break PumpExit::Requested,
            received = transport.receive() => received,
        };

        match received {
            Received::Message(message) => router.route(message, tasks),
            Received::Invalid(error) => warn!("Dropping undecodable frame: {}", error),
            Received::Closed => break PumpExit::PeerClosed,
        }

        // Reap finished work so the set does not grow with connection age
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("Dispatched task panicked: {}", e);
                }
            }
        }
    };

    closing.cancel();
    debug!("Inbound pump stopped: {:?}", reason);
    reason
}
