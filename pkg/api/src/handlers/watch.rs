use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
}

/// GET /api/v1/watch: SSE stream of store changes under `prefix`,
/// replaying retained events after `seq` first.
pub async fn watch_events(
    State(state): State<AppState>,
    Query(query): Query<WatchQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let prefix = query.prefix.unwrap_or_default();
    let from_seq = query.seq.unwrap_or(0);
    info!(
        "Watch subscription: prefix='{}', from_seq={}",
        prefix, from_seq
    );

    // Subscribe before reading the backlog; live events already replayed
    // are skipped by sequence number.
    let rx = state.store.event_log.subscribe();
    let buffered = state.store.event_log.events_since(from_seq).await;
    let last_replayed = buffered.last().map_or(from_seq, |e| e.seq);

    let live_prefix = prefix.clone();
    let buffered_stream = tokio_stream::iter(
        buffered
            .into_iter()
            .filter(move |e| prefix.is_empty() || e.key.starts_with(&prefix)),
    );
    let live_stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(event)
            if event.seq > last_replayed
                && (live_prefix.is_empty() || event.key.starts_with(&live_prefix)) =>
        {
            Some(event)
        }
        _ => None,
    });

    let combined = buffered_stream.chain(live_stream).filter_map(|event| {
        serde_json::to_string(&event)
            .ok()
            .map(|data| Ok::<_, Infallible>(Event::default().data(data)))
    });

    Sse::new(combined).keep_alive(KeepAlive::default())
}
