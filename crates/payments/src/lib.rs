//! Payment settlement tracking.
//!
//! Payments move forward only, from `Ready` towards one of the terminal
//! states. Two writers race on the same row: the gateway callback handled by
//! [`PaymentLedger`] and the periodic [`PaymentReconciler`] sweep. Both use a
//! conditional transition so neither clobbers the other.

pub mod error;
pub mod gateway;
pub mod ledger;
pub mod reconciler;

pub use error::{PaymentError, Result};
pub use gateway::{GatewayPayment, GatewayStatus, InMemoryPaymentGateway, PaymentGateway};
pub use ledger::{CallbackNotice, CallbackOutcome, PaymentLedger};
pub use reconciler::{PaymentReconciler, ReconcileReport, ReconcilerConfig};
