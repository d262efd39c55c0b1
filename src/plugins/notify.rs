//! Best-effort "something changed" signal for workflow mutations.
//!
//! Firing never blocks and never fails the caller: broadcast sends ignore the
//! absence of subscribers, and custom notifiers run on a detached task whose
//! error is only logged.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Push transport for change hints. Carries no payload.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub enum NotificationChannel {
    #[default]
    Noop,
    Broadcast(broadcast::Sender<()>),
    Custom(Arc<dyn Notifier>),
}

impl fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationChannel::Noop => write!(f, "NotificationChannel::Noop"),
            NotificationChannel::Broadcast(tx) => write!(
                f,
                "NotificationChannel::Broadcast({} subscribers)",
                tx.receiver_count()
            ),
            NotificationChannel::Custom(_) => write!(f, "NotificationChannel::Custom"),
        }
    }
}

impl NotificationChannel {
    /// Broadcast channel plus its first subscriber.
    pub fn broadcast(capacity: usize) -> (Self, broadcast::Receiver<()>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (NotificationChannel::Broadcast(tx), rx)
    }

    pub fn custom(notifier: Arc<dyn Notifier>) -> Self {
        NotificationChannel::Custom(notifier)
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<()>> {
        match self {
            NotificationChannel::Broadcast(tx) => Some(tx.subscribe()),
            _ => None,
        }
    }

    pub fn fire(&self) {
        match self {
            NotificationChannel::Noop => {}
            NotificationChannel::Broadcast(tx) => {
                // No subscribers is not an error.
                let delivered = tx.send(()).unwrap_or(0);
                trace!(delivered, "workflow change broadcast");
            }
            NotificationChannel::Custom(notifier) => {
                let Ok(handle) = Handle::try_current() else {
                    warn!("no async runtime; workflow notification skipped");
                    return;
                };
                let notifier = Arc::clone(notifier);
                handle.spawn(async move {
                    if let Err(e) = notifier.notify().await {
                        warn!(error = %e, "workflow notification failed");
                    }
                });
            }
        }
    }
}
