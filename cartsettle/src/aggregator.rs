//! Cross-chain aggregator rail.
//!
//! The aggregator accepts funds on any chain and settles the merchant in the
//! target token. Completion is learned two ways: by polling the payment's
//! status, and through widget callbacks. Widgets replay cached completions
//! when they mount, so a callback is only honoured once the rail is armed
//! with an attempt the user started in this session and the aggregator has
//! assigned that attempt its payment id.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use alloy_primitives::B256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::attempt::{OrderId, PaymentMethod, PaymentTicket};
use crate::event::{EventOrigin, EventSender};
use crate::proof::SettlementProof;
use crate::rail::{PaymentRail, RailError};
use crate::{BoxError, BoxFuture};

/// Aggregator payment creation request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    /// Idempotency key of the attempt, echoed back in callbacks.
    pub order_id: OrderId,
    /// Amount to settle in the cart currency.
    pub amount: Decimal,
    /// ISO currency code.
    pub currency: String,
}

/// Aggregator payment creation response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPayment {
    /// Aggregator-assigned payment id.
    pub payment_id: String,
    /// Hosted checkout page for the payer.
    #[serde(default)]
    pub checkout_url: Option<String>,
}

/// Aggregator payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Waiting for the payer.
    Pending,
    /// Funds received, settlement in flight.
    Processing,
    /// Settled to the merchant.
    Completed,
    /// Settlement failed.
    Failed,
    /// The payer never paid.
    Expired,
}

impl PaymentStatus {
    /// Returns `true` for statuses that will not change any more.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// Aggregator payment status response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    /// Aggregator-assigned payment id.
    pub payment_id: String,
    /// Current status.
    pub status: PaymentStatus,
    /// Settlement transaction hash, once known.
    #[serde(default)]
    pub tx_hash: Option<B256>,
}

/// Aggregator payment API.
pub trait AggregatorApi: Send + Sync {
    /// Creates a payment.
    fn create_payment<'a>(
        &'a self,
        request: &'a CreatePaymentRequest,
    ) -> BoxFuture<'a, Result<CreatedPayment, BoxError>>;

    /// Fetches a payment's status.
    fn payment_status<'a>(
        &'a self,
        payment_id: &'a str,
    ) -> BoxFuture<'a, Result<PaymentStatusResponse, BoxError>>;
}

/// How long to poll a payment before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between status requests.
    pub interval: Duration,
    /// Maximum number of status requests.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 200,
        }
    }
}

/// A completion reported by the payment widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetCallback {
    /// Aggregator payment id.
    pub payment_id: String,
    /// Settlement transaction hash.
    pub tx_hash: B256,
}

#[derive(Debug, Clone)]
struct Armed {
    order_id: OrderId,
    payment_id: Option<String>,
}

/// Payment rail backed by an [`AggregatorApi`].
#[derive(Debug)]
pub struct AggregatorRail<A> {
    api: A,
    poll: PollPolicy,
    events: Option<EventSender>,
    armed: Mutex<Option<Armed>>,
}

impl<A: AggregatorApi> AggregatorRail<A> {
    /// Creates a rail with the default poll policy.
    pub fn new(api: A) -> Self {
        Self {
            api,
            poll: PollPolicy::default(),
            events: None,
            armed: Mutex::new(None),
        }
    }

    /// Overrides the poll policy.
    #[must_use]
    pub const fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Forwards accepted widget callbacks to the orchestrator.
    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Arms the rail for an attempt the user started.
    pub fn arm(&self, order_id: OrderId) {
        *self.lock() = Some(Armed {
            order_id,
            payment_id: None,
        });
    }

    /// Binds the armed attempt to the payment the aggregator created for it.
    fn bind_payment(&self, payment_id: &str) {
        if let Some(armed) = self.lock().as_mut() {
            armed.payment_id = Some(payment_id.to_owned());
        }
    }

    /// Disarms the rail; subsequent callbacks are dropped.
    pub fn disarm(&self) {
        *self.lock() = None;
    }

    /// Order id the rail is currently armed with.
    #[must_use]
    pub fn armed_order(&self) -> Option<OrderId> {
        self.lock().as_ref().map(|a| a.order_id.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles a widget completion callback.
    ///
    /// The callback is forwarded only if the rail is armed and the payment
    /// it names is the one created for the armed attempt. Callbacks that
    /// arrive before the payment id is known are dropped; polling still
    /// observes the completion. Returns `true` if the event was forwarded.
    pub fn on_widget_event(&self, callback: &WidgetCallback) -> bool {
        let order_id = {
            let armed = self.lock();
            match armed.as_ref() {
                Some(Armed {
                    order_id,
                    payment_id: Some(id),
                }) if *id == callback.payment_id => order_id.clone(),
                _ => {
                    #[cfg(feature = "telemetry")]
                    tracing::debug!(payment_id = %callback.payment_id, "dropping unmatched widget callback");
                    return false;
                }
            }
        };
        let Some(events) = &self.events else {
            return false;
        };
        events.payment_completed(
            order_id,
            SettlementProof::Aggregator {
                tx_hash: callback.tx_hash,
                payment_id: callback.payment_id.clone(),
            },
            EventOrigin::Widget,
        )
    }

    async fn poll_until_settled(&self, payment_id: &str) -> Result<B256, RailError> {
        for attempt in 0..self.poll.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.poll.interval).await;
            }
            let status = self
                .api
                .payment_status(payment_id)
                .await
                .map_err(|e| RailError::Provider(e.to_string()))?;
            match (status.status, status.tx_hash) {
                (PaymentStatus::Completed, Some(tx_hash)) => return Ok(tx_hash),
                (PaymentStatus::Failed | PaymentStatus::Expired, _) => {
                    return Err(RailError::PaymentAbandoned {
                        payment_id: payment_id.to_owned(),
                        status: format!("{:?}", status.status).to_lowercase(),
                    });
                }
                _ => {}
            }
        }
        Err(RailError::Provider(format!(
            "payment {payment_id} did not settle after {} status checks",
            self.poll.max_attempts
        )))
    }
}

impl<A: AggregatorApi> PaymentRail for AggregatorRail<A> {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Aggregator
    }

    fn settle<'a>(
        &'a self,
        ticket: &'a PaymentTicket,
    ) -> BoxFuture<'a, Result<SettlementProof, RailError>> {
        Box::pin(async move {
            if ticket.amount <= Decimal::ZERO {
                return Err(RailError::UnsupportedCharge {
                    method: PaymentMethod::Aggregator,
                    amount: ticket.amount.to_string(),
                });
            }
            self.arm(ticket.order_id.clone());
            let request = CreatePaymentRequest {
                order_id: ticket.order_id.clone(),
                amount: ticket.amount,
                currency: ticket.currency.clone(),
            };
            let created = self
                .api
                .create_payment(&request)
                .await
                .map_err(|e| RailError::Provider(e.to_string()))?;
            self.bind_payment(&created.payment_id);
            #[cfg(feature = "telemetry")]
            tracing::info!(
                order_id = %ticket.order_id,
                payment_id = %created.payment_id,
                checkout_url = ?created.checkout_url,
                "aggregator payment created"
            );
            let tx_hash = self.poll_until_settled(&created.payment_id).await?;
            Ok(SettlementProof::Aggregator {
                tx_hash,
                payment_id: created.payment_id,
            })
        })
    }
}
