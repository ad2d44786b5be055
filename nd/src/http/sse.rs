//! Server-sent event stream over the bus
//!
//! Each bus envelope becomes one SSE event: the id field carries the
//! sequence number, the event field the topic name. A reconnecting client
//! sends `Last-Event-ID`; everything still inside the bus retention buffer
//! is replayed before live delivery continues. Lag markers and heartbeats
//! come through as their own event kinds so clients can reconcile.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tracing::debug;

use crate::events::{Delivery, Envelope};
use crate::facade::Deps;

fn envelope_event(envelope: &Envelope) -> Event {
    Event::default()
        .id(envelope.seq.to_string())
        .event(envelope.event.topic().as_str())
        .data(serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string()))
}

fn delivery_event(delivery: &Delivery) -> Event {
    match delivery {
        Delivery::Event(envelope) => envelope_event(envelope),
        Delivery::Lagged { missed } => Event::default()
            .event("subscriber-lagged")
            .data(json!({ "missed": missed }).to_string()),
        Delivery::Heartbeat { ts } => Event::default()
            .event("heartbeat")
            .data(json!({ "ts": ts }).to_string()),
    }
}

/// GET /events
pub async fn events(
    State(deps): State<Deps>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_seen: u64 = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    // Subscribe before snapshotting the replay so nothing falls in between;
    // live events at or below the replay threshold are dropped as duplicates
    let subscription = deps.bus.subscribe_all();
    let replay = if last_seen > 0 {
        deps.bus.replay_since(last_seen)
    } else {
        Vec::new()
    };
    let threshold = replay.last().map(|e| e.seq).unwrap_or(last_seen);
    debug!(last_seen, replayed = replay.len(), "sse client attached");

    let replay_stream = stream::iter(replay.into_iter().map(|envelope| envelope_event(&envelope)));

    let live = stream::unfold(subscription, move |mut subscription| async move {
        loop {
            match subscription.recv().await {
                Some(Delivery::Event(envelope)) if envelope.seq <= threshold => continue,
                Some(delivery) => return Some((delivery_event(&delivery), subscription)),
                None => return None,
            }
        }
    });

    Sse::new(replay_stream.chain(live).map(Ok)).keep_alive(KeepAlive::default())
}
