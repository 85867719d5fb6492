use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::observability::{MAIL_DELIVERIES_TOTAL, MAIL_DROPPED_TOTAL, MAIL_ENQUEUED_TOTAL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailData {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub template: String,
    /// HTML body fragment placed into the template.
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail queue is full")]
    QueueFull,
    #[error("mail listener has stopped")]
    Closed,
    #[error("delivery to {to} failed: {cause}")]
    Delivery { to: String, cause: String },
}

/// Sending half of the outbound mail channel. Cloned into every workflow.
#[derive(Clone)]
pub struct MailQueue {
    tx: mpsc::Sender<MailData>,
}

impl MailQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MailData>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Never waits: a full or closed queue is reported back at once.
    pub fn enqueue(&self, mail: MailData) -> Result<(), MailError> {
        match self.tx.try_send(mail) {
            Ok(()) => {
                metrics::counter!(MAIL_ENQUEUED_TOTAL).increment(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(mail)) => {
                metrics::counter!(MAIL_DROPPED_TOTAL).increment(1);
                warn!(to = %mail.to, subject = %mail.subject, "mail queue full, dropping message");
                Err(MailError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!(MAIL_DROPPED_TOTAL).increment(1);
                Err(MailError::Closed)
            }
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &MailData) -> Result<(), MailError>;
}

/// Writes deliveries to the log instead of an SMTP relay.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, mail: &MailData) -> Result<(), MailError> {
        info!(
            to = %mail.to,
            from = %mail.from,
            subject = %mail.subject,
            template = %mail.template,
            bytes = mail.content.len(),
            "mail delivered"
        );
        Ok(())
    }
}

/// Drain the queue until every sender is gone. Failed deliveries are logged
/// and counted; the listener keeps going.
pub async fn run_mail_listener<T: MailTransport>(mut rx: mpsc::Receiver<MailData>, transport: T) {
    while let Some(mail) = rx.recv().await {
        match transport.send(&mail).await {
            Ok(()) => {
                metrics::counter!(MAIL_DELIVERIES_TOTAL, "status" => "sent").increment(1);
            }
            Err(e) => {
                metrics::counter!(MAIL_DELIVERIES_TOTAL, "status" => "failed").increment(1);
                error!(to = %mail.to, "{e}");
            }
        }
    }
    info!("mail listener stopped");
}
