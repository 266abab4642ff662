use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::ids::{MessageId, SessionId, UserId};

/// Events pushed to a recipient when something in their consultation changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsultEvent {
    MessageCreated {
        session_id: SessionId,
        message_id: MessageId,
        from_cache: bool,
    },
    SessionClosed {
        session_id: SessionId,
        hours_consumed: Decimal,
    },
}

/// Fire-and-forget push sink. Delivery failures never reach the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipient: &UserId, event: ConsultEvent);
}

/// A notification addressed to a single user, as carried on the broadcast bus.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub recipient: UserId,
    pub event: ConsultEvent,
}

/// Publishes events onto a tokio broadcast channel for transport layers to fan out.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, recipient: &UserId, event: ConsultEvent) {
        let envelope = Envelope {
            recipient: recipient.clone(),
            event,
        };
        if self.tx.send(envelope).is_err() {
            debug!(recipient = %recipient, "no subscribers for notification");
        }
    }
}

/// Notifier that only logs. Used when no transport is attached.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, recipient: &UserId, event: ConsultEvent) {
        debug!(recipient = %recipient, event = ?event, "notification");
    }
}
