//! Background maintenance tasks.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::store::StreamStore;

/// Spawn the TTL sweeper. Expired streams are also removed lazily on
/// access; the sweeper bounds how long an idle expired stream can hold
/// memory and guarantees its waiters are woken.
pub fn spawn_sweeper(store: Arc<StreamStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = store.sweep_expired();
            if !removed.is_empty() {
                debug!(count = removed.len(), "swept expired streams");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamConfig;

    #[tokio::test]
    async fn sweeper_removes_expired_streams() {
        let store = StreamStore::new();
        store
            .create(
                "/ephemeral",
                StreamConfig {
                    content_type: Some("text/plain".to_string()),
                    ttl_seconds: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();

        let handle = spawn_sweeper(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.list().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn sweep_wakes_waiters_with_terminal_event() {
        let store = StreamStore::new();
        store
            .create(
                "/ephemeral",
                StreamConfig {
                    content_type: Some("text/plain".to_string()),
                    ttl_seconds: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut rx = store.subscribe();
        let handle = spawn_sweeper(store.clone(), Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, "/ephemeral");
        assert!(matches!(
            event.kind,
            crate::store::StreamEventKind::Deleted
        ));
        handle.abort();
    }
}
