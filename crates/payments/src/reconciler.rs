use std::time::Duration;

use chrono::Utc;
use order_store::{Payment, PaymentStatus, PaymentStore};
use tracing::{debug, error, info, warn};

use crate::{PaymentGateway, Result};

/// Configuration for the payment reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often the sweep runs.
    pub interval: Duration,
    /// Payments requested longer ago than this and still unsettled are checked.
    pub stale_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    /// Payments moved to the gateway's terminal status.
    pub settled: usize,
    /// Gateway still reports a non-terminal status; left for the next sweep.
    pub ambiguous: usize,
    /// A concurrent callback changed the payment first.
    pub raced: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Settled,
    Ambiguous,
    Raced,
    GatewayError,
    StoreError,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Settled => "settled",
            Outcome::Ambiguous => "ambiguous",
            Outcome::Raced => "raced",
            Outcome::GatewayError => "gateway_error",
            Outcome::StoreError => "store_error",
        }
    }
}

/// Drives payments whose callback never arrived to a terminal state.
pub struct PaymentReconciler<S, G> {
    store: S,
    gateway: G,
    config: ReconcilerConfig,
}

impl<S: PaymentStore, G: PaymentGateway> PaymentReconciler<S, G> {
    pub fn new(store: S, gateway: G, config: ReconcilerConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Runs one sweep over stale `InProgress` and `WaitingForDeposit` payments.
    ///
    /// Per-payment failures are logged and counted; only a failure to list
    /// candidates aborts the sweep.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<ReconcileReport> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let candidates = self
            .store
            .find_stale_payments(&PaymentStatus::RECONCILABLE, Utc::now() - stale_after)
            .await?;

        let mut report = ReconcileReport {
            examined: candidates.len(),
            ..ReconcileReport::default()
        };
        for payment in candidates {
            let outcome = self.reconcile(&payment).await;
            metrics::counter!("payments_reconciled_total", "outcome" => outcome.label())
                .increment(1);
            match outcome {
                Outcome::Settled => report.settled += 1,
                Outcome::Ambiguous => report.ambiguous += 1,
                Outcome::Raced => report.raced += 1,
                Outcome::GatewayError | Outcome::StoreError => report.errors += 1,
            }
        }

        if report.examined > 0 {
            info!(?report, "Payment reconciliation sweep finished");
        } else {
            debug!("No stale payments");
        }
        Ok(report)
    }

    async fn reconcile(&self, payment: &Payment) -> Outcome {
        let truth = match self.gateway.query(&payment.payment_key).await {
            Ok(truth) => truth,
            Err(e) => {
                error!(payment_key = %payment.payment_key, error = %e, "Gateway query failed");
                return Outcome::GatewayError;
            }
        };

        let target = truth.status.local();
        if !target.is_terminal() {
            warn!(
                payment_key = %payment.payment_key,
                local = %payment.status,
                gateway = ?truth.status,
                requested_at = %payment.requested_at,
                "Payment still unsettled at gateway past threshold"
            );
            return Outcome::Ambiguous;
        }

        let approved_at = (target == PaymentStatus::Done)
            .then(|| truth.approved_at.unwrap_or_else(Utc::now));
        match self
            .store
            .transition_payment(payment.id, payment.status, target, approved_at)
            .await
        {
            Ok(true) => {
                info!(
                    payment_key = %payment.payment_key,
                    from = %payment.status,
                    to = %target,
                    "Payment reconciled"
                );
                Outcome::Settled
            }
            Ok(false) => {
                debug!(payment_key = %payment.payment_key, "Payment changed concurrently, skipping");
                Outcome::Raced
            }
            Err(e) => {
                error!(payment_key = %payment.payment_key, error = %e, "Failed to update payment");
                Outcome::StoreError
            }
        }
    }
}
