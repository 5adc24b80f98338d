//! Settlement events flowing from rails to the orchestrator.
//!
//! Every completion source (confirmation watcher, aggregator callback,
//! signature claim) holds an [`EventSender`]; the orchestrator owns the
//! single [`EventReceiver`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::attempt::OrderId;
use crate::proof::SettlementProof;

/// Where a completion event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    /// A rail's own confirmation path.
    Rail,
    /// The aggregator widget callback.
    Widget,
    /// A watcher re-subscribed after a reload.
    Watcher,
}

/// A settlement event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SettlementEvent {
    /// Funds moved or a claim was signed.
    #[serde(rename_all = "camelCase")]
    PaymentCompleted {
        /// Order id of the attempt the event claims to belong to.
        order_id: OrderId,
        /// Settlement proof.
        proof: SettlementProof,
        /// Completion source.
        origin: EventOrigin,
    },
}

/// Sending half of the settlement event channel.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<SettlementEvent>);

/// Receiving half of the settlement event channel.
#[derive(Debug)]
pub struct EventReceiver(mpsc::UnboundedReceiver<SettlementEvent>);

/// Creates an unbounded settlement event channel.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), EventReceiver(rx))
}

impl EventSender {
    /// Emits a `PaymentCompleted` event.
    ///
    /// Returns `false` if the orchestrator has gone away.
    pub fn payment_completed(
        &self,
        order_id: OrderId,
        proof: SettlementProof,
        origin: EventOrigin,
    ) -> bool {
        self.send(SettlementEvent::PaymentCompleted {
            order_id,
            proof,
            origin,
        })
    }

    /// Sends an event. Returns `false` if the receiver has been dropped.
    pub fn send(&self, event: SettlementEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

impl EventReceiver {
    /// Waits for the next event; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<SettlementEvent> {
        self.0.recv().await
    }

    /// Returns an event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SettlementEvent> {
        self.0.try_recv().ok()
    }
}
