//! Server-Sent Events delivery.
//!
//! An SSE reader first replays committed bytes from its offset, one
//! `data` event per delivery unit (one append, or one top-level JSON
//! value), then suspends on the store's notifications. `control` events
//! carry `{streamNextOffset, streamCursor, upToDate}`; the first one is
//! emitted when catch-up completes.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::response::sse::Event;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use futures::stream::Stream;
use serde_json::json;
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tracing::debug;

use crate::{
    cursor::CursorConfig,
    offset::Offset,
    store::{StreamEventKind, StreamStore},
};

/// Parameters for one SSE subscription.
pub struct SseParams {
    pub path: String,
    pub from: u64,
    pub client_cursor: Option<String>,
    pub cursor_config: CursorConfig,
    /// Idle interval after which a keepalive control event is emitted.
    pub idle_interval: Duration,
}

/// Build the event stream for one subscriber.
///
/// The subscription is registered before the catch-up read so appends
/// racing the first read are never missed. Dropping the stream (client
/// disconnect) drops the broadcast receiver, which is the waiter
/// deregistration.
pub fn subscribe(
    store: Arc<StreamStore>,
    params: SseParams,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let SseParams { path, from, client_cursor, cursor_config, idle_interval } = params;
        let mut rx = store.subscribe();
        let mut offset = from;
        let mut cursor = cursor_config.next_cursor(client_cursor.as_deref());

        // Catch-up replay, then the first control event.
        match store.read(&path, &Offset::At(offset)) {
            Ok(result) => {
                for (data, end) in &result.entries {
                    yield Ok(data_event(data));
                    offset = *end;
                }
                offset = result.next_offset;
                yield Ok(control_event(offset, &cursor, true));
            }
            Err(_) => return,
        }

        loop {
            match timeout(idle_interval, rx.recv()).await {
                Ok(Ok(event)) if event.path == path => match event.kind {
                    StreamEventKind::Appended { .. } => {
                        let Ok(result) = store.read(&path, &Offset::At(offset)) else {
                            break;
                        };
                        if result.entries.is_empty() && result.next_offset == offset {
                            continue;
                        }
                        for (data, end) in &result.entries {
                            yield Ok(data_event(data));
                            offset = *end;
                        }
                        offset = result.next_offset;
                        cursor = cursor_config.next_cursor(Some(&cursor));
                        yield Ok(control_event(offset, &cursor, result.up_to_date));
                    }
                    StreamEventKind::Deleted => {
                        debug!(path = %path, "stream deleted; closing sse subscriber");
                        cursor = cursor_config.next_cursor(Some(&cursor));
                        yield Ok(control_event(offset, &cursor, true));
                        break;
                    }
                },
                Ok(Ok(_)) => continue,
                Ok(Err(RecvError::Lagged(_))) => {
                    // Missed notifications; the log itself is authoritative.
                    rx = rx.resubscribe();
                    let Ok(result) = store.read(&path, &Offset::At(offset)) else {
                        break;
                    };
                    for (data, end) in &result.entries {
                        yield Ok(data_event(data));
                        offset = *end;
                    }
                    offset = result.next_offset;
                    cursor = cursor_config.next_cursor(Some(&cursor));
                    yield Ok(control_event(offset, &cursor, true));
                }
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => {
                    // Idle: re-advertise the tail so collapsed pollers
                    // keep a fresh cursor.
                    cursor = cursor_config.next_cursor(Some(&cursor));
                    yield Ok(control_event(offset, &cursor, true));
                }
            }
        }
    }
}

/// One delivery unit: UTF-8 passes through, anything else is base64.
fn data_event(data: &Bytes) -> Event {
    match std::str::from_utf8(data) {
        Ok(text) => Event::default().event("data").data(text),
        Err(_) => Event::default().event("data").data(STANDARD.encode(data)),
    }
}

fn control_event(next_offset: u64, cursor: &str, up_to_date: bool) -> Event {
    let body = json!({
        "streamNextOffset": next_offset.to_string(),
        "streamCursor": cursor,
        "upToDate": up_to_date,
    });
    Event::default().event("control").data(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamConfig;
    use futures::StreamExt;

    fn plain_config() -> StreamConfig {
        StreamConfig {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        }
    }

    fn params(path: &str) -> SseParams {
        SseParams {
            path: path.to_string(),
            from: 0,
            client_cursor: None,
            cursor_config: CursorConfig::default(),
            idle_interval: Duration::from_secs(30),
        }
    }

    fn render(event: Event) -> String {
        // The axum Event debug output carries the wire framing.
        format!("{:?}", event)
    }

    #[tokio::test]
    async fn replays_then_reports_catch_up() {
        let store = StreamStore::new();
        store.create("/s", plain_config()).unwrap();
        store
            .append("/s", Bytes::from_static(b"hello"), None, None, None)
            .unwrap();

        let mut stream = Box::pin(subscribe(store.clone(), params("/s")));

        let first = render(stream.next().await.unwrap().unwrap());
        assert!(first.contains("hello"));

        let second = render(stream.next().await.unwrap().unwrap());
        assert!(second.contains("control"));
        assert!(second.contains(r#"\"streamNextOffset\":\"5\""#) || second.contains(r#""streamNextOffset":"5""#));
        assert!(second.contains("true"));
    }

    #[tokio::test]
    async fn json_stream_frames_one_value_per_event() {
        let store = StreamStore::new();
        store
            .create(
                "/j",
                StreamConfig {
                    content_type: Some("application/json".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .append(
                "/j",
                Bytes::from_static(br#"[{"n":1},{"n":2}]"#),
                Some("application/json"),
                None,
                None,
            )
            .unwrap();

        let mut stream = Box::pin(subscribe(store.clone(), params("/j")));

        let first = render(stream.next().await.unwrap().unwrap());
        assert!(first.contains(r#"{\"n\":1}"#) || first.contains(r#"{"n":1}"#));
        let second = render(stream.next().await.unwrap().unwrap());
        assert!(second.contains(r#"{\"n\":2}"#) || second.contains(r#"{"n":2}"#));
        let third = render(stream.next().await.unwrap().unwrap());
        assert!(third.contains("control"));
        assert!(third.contains("15"));
    }

    #[tokio::test]
    async fn live_appends_arrive_after_catch_up() {
        let store = StreamStore::new();
        store.create("/s", plain_config()).unwrap();

        let mut stream = Box::pin(subscribe(store.clone(), params("/s")));

        // Catch-up on an empty stream is just the control event.
        let first = render(stream.next().await.unwrap().unwrap());
        assert!(first.contains("control"));

        store
            .append("/s", Bytes::from_static(b"live"), None, None, None)
            .unwrap();

        let data = render(stream.next().await.unwrap().unwrap());
        assert!(data.contains("live"));
        let control = render(stream.next().await.unwrap().unwrap());
        assert!(control.contains("control"));
    }

    #[tokio::test]
    async fn delete_terminates_the_subscription() {
        let store = StreamStore::new();
        store.create("/s", plain_config()).unwrap();

        let mut stream = Box::pin(subscribe(store.clone(), params("/s")));
        let _ = stream.next().await.unwrap();

        store.delete("/s");

        // Final control event, then the stream ends.
        let last = render(stream.next().await.unwrap().unwrap());
        assert!(last.contains("control"));
        assert!(stream.next().await.is_none());
    }
}
