//! Outbound mail transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use common::BuyerId;
use tokio::sync::Mutex;

use crate::{NotificationError, OrderConfirmation, Result};

/// A composed notification email.
///
/// Addressed by buyer; resolving the buyer's mailbox is the transport's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub buyer_id: BuyerId,
    pub subject: String,
    pub body: String,
}

/// Sends composed emails.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;
}

/// Builds the confirmation email for an order.
pub fn compose_confirmation(confirmation: &OrderConfirmation) -> Email {
    let reference = confirmation
        .reference
        .clone()
        .unwrap_or_else(|| confirmation.order_id.to_string());

    let mut body = format!("Thank you for your order {reference}.\n\n");
    for line in &confirmation.lines {
        body.push_str(&format!(
            "  {} x{}  {}\n",
            line.name,
            line.quantity,
            common::Money::from_cents(line.line_cents)
        ));
    }
    body.push_str(&format!("\nTotal: {}\n", confirmation.total()));

    Email {
        buyer_id: confirmation.buyer_id,
        subject: format!("Order confirmation {reference}"),
        body,
    }
}

/// Transport that only logs. Default when no mail relay is configured.
#[derive(Debug, Clone, Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn send(&self, email: &Email) -> Result<()> {
        tracing::info!(buyer_id = %email.buyer_id, subject = %email.subject, "Email sent");
        Ok(())
    }
}

/// In-memory transport for tests, with scriptable failures.
#[derive(Clone, Default)]
pub struct InMemoryMailTransport {
    sent: Arc<Mutex<Vec<Email>>>,
    attempts: Arc<AtomicU32>,
    fail_next: Arc<AtomicU32>,
    always_fail: Arc<AtomicBool>,
}

impl InMemoryMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` send attempts.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fails every send attempt while set.
    pub fn set_always_fail(&self, always_fail: bool) {
        self.always_fail.store(always_fail, Ordering::SeqCst);
    }

    /// Emails successfully sent so far.
    pub async fn sent(&self) -> Vec<Email> {
        self.sent.lock().await.clone()
    }

    /// Send attempts so far, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for InMemoryMailTransport {
    async fn send(&self, email: &Email) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Mail("mail relay unreachable".into()));
        }
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scripted.is_ok() {
            return Err(NotificationError::Mail("transient send failure".into()));
        }

        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}
