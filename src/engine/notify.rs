//! Notification dispatcher: one dedicated `LISTEN` connection,
//! one in-process waiter map keyed `"<uuid>::<topic/key>"`, spurious wakes
//! tolerated because waiters always re-read from the database before
//! concluding.

use std::sync::Arc;

use dashmap::DashMap;
use sqlx::postgres::PgListener;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::persistence::schema::NOTIFICATION_CHANNEL;

/// Process-local dispatcher for `dbos_notifications_channel` payloads.
#[derive(Default)]
pub struct NotificationDispatcher {
    waiters: DashMap<String, Arc<Notify>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(uuid: Uuid, topic_or_key: &str) -> String {
        format!("{uuid}::{topic_or_key}")
    }

    /// Register interest in a key *before* the caller's last-chance DB
    /// read: waiters must be registered before the final DB read, or a
    /// wakeup between the read and the registration is missed.
    pub fn register(&self, uuid: Uuid, topic_or_key: &str) -> Arc<Notify> {
        self.waiters
        .entry(Self::key(uuid, topic_or_key))
        .or_insert_with(|| Arc::new(Notify::new()))
        .clone()
    }

    /// Wake all waiters registered under this key. Called from the
    /// dispatch loop when a `NOTIFY` payload of `"<uuid>::<topic_or_key>"`
    /// arrives.
    pub fn wake(&self, full_key: &str) {
        if let Some(notify) = self.waiters.get(full_key) {
            notify.notify_waiters();
        }
    }

    /// Spawn the background task that owns the dedicated `LISTEN`
    /// connection and dispatches incoming payloads to registered waiters.
    #[instrument(skip(self, database_url))]
    pub async fn listen(
        self: &Arc<Self>,
        database_url: &str,
    ) -> Result<tokio::task::JoinHandle<()>, sqlx::Error> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(NOTIFICATION_CHANNEL).await?;
        let dispatcher = Arc::clone(self);

        Ok(tokio::spawn(async move {
                    loop {
                        match listener.recv().await {
                            Ok(notification) => {
                                let payload = notification.payload();
                                debug!(%payload, "received notification");
                                dispatcher.wake(payload);
                            }
                            Err(e) => {
                                warn!(error = %e, "notification listener connection error, backing off");
                                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            }
                        }
                    }
                }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wake_notifies_registered_waiter() {
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let uuid = Uuid::new_v4();
        let notify = dispatcher.register(uuid, "T");

        let waiter = tokio::spawn({
                let notify = notify.clone();
                async move {
                    notify.notified().await;
                }
            });

        tokio::task::yield_now().await;
        dispatcher.wake(&format!("{uuid}::T"));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be woken")
        .unwrap();
    }

    #[tokio::test]
    async fn wake_on_unregistered_key_is_a_no_op() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.wake("nonexistent::topic");
    }
}
