//! Server-sent event stream for `/ping`.
//!
//! Each stream is fed by a producer task that owns the stream's drain
//! tracking. The task ends when the client goes away or the drain
//! controller force-closes the connection, and untracks it on the way out.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::drain::TrackedConnection;

use super::ResponseBody;

/// Events buffered between the producer and the connection
const EVENT_BUFFER: usize = 8;

/// Why an event stream stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    ClosedByPeer,
    ForceClosed,
}

/// Encode one event in the `text/event-stream` wire format
pub fn encode_event(id: u64, event: &str, data: &str) -> Bytes {
    Bytes::from(format!("id:{}\nevent:{}\ndata:{}\n\n", id, event, data))
}

/// Event payload: unix seconds plus the optional release tag
fn event_data(timestamp: i64, release_tag: Option<&str>) -> String {
    match release_tag {
        Some(tag) => format!("{} {}", timestamp, tag),
        None => timestamp.to_string(),
    }
}

/// Start a producer and return the response body it feeds
pub fn event_stream(
    tracked: TrackedConnection,
    interval: Duration,
    release_tag: Option<String>,
) -> ResponseBody {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(produce(tx, tracked, interval, release_tag));

    let frames = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
    StreamBody::new(frames).boxed_unsync()
}

async fn produce(
    tx: mpsc::Sender<Bytes>,
    tracked: TrackedConnection,
    interval: Duration,
    release_tag: Option<String>,
) -> StreamEnd {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seq: u64 = 0;
    let mut last_timestamp = 0i64;

    let end = loop {
        tokio::select! {
            _ = tracked.force_closed() => break StreamEnd::ForceClosed,
            _ = ticker.tick() => {}
        }

        if tx.is_closed() {
            break StreamEnd::ClosedByPeer;
        }

        seq += 1;
        // Strictly increasing, even with sub-second intervals
        let timestamp = Utc::now().timestamp().max(last_timestamp + 1);
        last_timestamp = timestamp;
        let chunk = encode_event(seq, "message", &event_data(timestamp, release_tag.as_deref()));

        tokio::select! {
            sent = tx.send(chunk) => {
                if sent.is_err() {
                    break StreamEnd::ClosedByPeer;
                }
            }
            _ = tracked.force_closed() => break StreamEnd::ForceClosed,
        }
    };

    debug!(
        connection = %tracked.id(),
        events_sent = seq,
        reason = ?end,
        "Event stream ended"
    );
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::DrainController;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_encode_event() {
        let chunk = encode_event(3, "message", "1700000000 v2");
        assert_eq!(&chunk[..], b"id:3\nevent:message\ndata:1700000000 v2\n\n");
    }

    #[test]
    fn test_event_data() {
        assert_eq!(event_data(5, None), "5");
        assert_eq!(event_data(5, Some("v2")), "5 v2");
    }

    #[tokio::test]
    async fn test_producer_sequence_and_peer_close() {
        let controller = Arc::new(DrainController::new());
        let tracked = controller.track(CancellationToken::new());
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let producer = tokio::spawn(produce(tx, tracked, Duration::from_millis(10), None));

        let mut last_ts = 0i64;
        for expected in 1..=3u64 {
            let chunk = rx.recv().await.unwrap();
            let text = String::from_utf8(chunk.to_vec()).unwrap();
            let mut lines = text.lines();
            assert_eq!(lines.next().unwrap(), format!("id:{}", expected));
            assert_eq!(lines.next().unwrap(), "event:message");
            let ts: i64 = lines.next().unwrap().trim_start_matches("data:").parse().unwrap();
            assert!(ts > last_ts);
            last_ts = ts;
        }
        assert_eq!(controller.active_count(), 1);

        drop(rx);
        assert_eq!(producer.await.unwrap(), StreamEnd::ClosedByPeer);
        assert_eq!(controller.active_count(), 0);
    }

    #[tokio::test]
    async fn test_producer_force_closed() {
        let controller = Arc::new(DrainController::new());
        let tracked = controller.track(CancellationToken::new());
        let (tx, _rx) = mpsc::channel(EVENT_BUFFER);
        let producer = tokio::spawn(produce(tx, tracked, Duration::from_secs(60), Some("v1".into())));

        assert_eq!(controller.force_close_all(), 1);
        assert_eq!(producer.await.unwrap(), StreamEnd::ForceClosed);
        assert_eq!(controller.active_count(), 0);
    }
}
