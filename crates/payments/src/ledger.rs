use chrono::{DateTime, Utc};
use common::OrderId;
use order_store::{NewPayment, OrderStore, Payment, PaymentStatus, PaymentStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{GatewayStatus, PaymentError, Result};

const MAX_CALLBACK_ATTEMPTS: usize = 3;

/// Asynchronous status notification sent by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackNotice {
    pub payment_key: String,
    pub status: GatewayStatus,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
}

/// Result of applying a gateway callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The payment moved to the given status.
    Applied(PaymentStatus),
    /// The payment was already in the reported status.
    AlreadyApplied,
    /// The notice is older than the stored state and was ignored.
    Ignored { current: PaymentStatus },
    /// Other writers kept changing the payment; the notice was dropped.
    Superseded,
}

/// Registers payments and applies gateway callbacks.
#[derive(Clone)]
pub struct PaymentLedger<S> {
    store: S,
}

impl<S: OrderStore + PaymentStore> PaymentLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Creates a `Ready` payment for an order, charging the order total.
    #[tracing::instrument(skip(self))]
    pub async fn register(&self, order_id: OrderId, payment_key: &str) -> Result<Payment> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(order_id.to_string()))?;

        let payment = self
            .store
            .insert_payment(NewPayment {
                order_id,
                payment_key: payment_key.to_string(),
                amount: order.total_price,
                requested_at: Utc::now(),
            })
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => PaymentError::OrderNotFound(order_id.to_string()),
                other => other.into(),
            })?;

        info!(payment_id = %payment.id, amount = %payment.amount, "Payment registered");
        Ok(payment)
    }

    pub async fn get_by_key(&self, payment_key: &str) -> Result<Payment> {
        self.store
            .get_payment_by_key(payment_key)
            .await?
            .ok_or_else(|| PaymentError::UnknownPayment(payment_key.to_string()))
    }

    /// Applies a gateway callback with a conditional transition.
    ///
    /// Stale progress notices are ignored. A notice that would move a
    /// terminal payment to a different terminal state is an error that needs
    /// an operator: the gateway and the local record disagree.
    #[tracing::instrument(skip(self, notice), fields(payment_key = %notice.payment_key, status = ?notice.status))]
    pub async fn apply_callback(&self, notice: CallbackNotice) -> Result<CallbackOutcome> {
        let target = notice.status.local();

        for _ in 0..MAX_CALLBACK_ATTEMPTS {
            let payment = self.get_by_key(&notice.payment_key).await?;

            if payment.status == target {
                debug!("Callback already applied");
                return Ok(CallbackOutcome::AlreadyApplied);
            }
            if !payment.status.can_transition_to(target) {
                if payment.status.is_terminal() && target.is_terminal() {
                    warn!(current = %payment.status, reported = %target, "Gateway disagrees with settled payment");
                    return Err(PaymentError::InvalidTransition {
                        from: payment.status.to_string(),
                        to: target.to_string(),
                    });
                }
                debug!(current = %payment.status, "Ignoring stale callback");
                return Ok(CallbackOutcome::Ignored {
                    current: payment.status,
                });
            }

            let approved_at = (target == PaymentStatus::Done)
                .then(|| notice.approved_at.unwrap_or_else(Utc::now));
            if self
                .store
                .transition_payment(payment.id, payment.status, target, approved_at)
                .await?
            {
                info!(from = %payment.status, to = %target, "Payment updated from callback");
                return Ok(CallbackOutcome::Applied(target));
            }
            debug!("Concurrent update won, re-reading payment");
        }

        warn!("Callback dropped after repeated concurrent updates");
        Ok(CallbackOutcome::Superseded)
    }
}
