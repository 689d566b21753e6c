//! Server-sent-events endpoint.
//!
//! # Purpose
//! Bridges one subscriber onto the tenant's broadcast channel. The first
//! frame announces the connection id; every following frame carries the
//! NOTIFY payload verbatim, filtered by the optional `table` parameter.
//! Comment pings flow every 15 seconds so intermediaries keep the socket
//! open.

use crate::error::ApiError;
use crate::pipeline::DataContext;
use axum::Extension;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    #[serde(default)]
    table: Option<String>,
}

pub async fn subscribe(
    State(state): State<crate::app::AppState>,
    Extension(ctx): Extension<DataContext>,
    Query(query): Query<RealtimeQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.bridge.subscribe(&ctx.project)?;
    let (client_id, receiver, guard) = subscription.into_parts();
    let table_filter = query.table;

    let connected = stream::once(async move {
        Ok::<_, Infallible>(
            Event::default().data(json!({"type": "connected", "clientId": client_id}).to_string()),
        )
    });

    // The guard rides inside the closure so the subscriber slot is released
    // exactly when the client goes away and the stream drops.
    let events = BroadcastStream::new(receiver).filter_map(move |result| {
        let _held = &guard;
        let frame = match result {
            Ok(event) => {
                let matches = table_filter
                    .as_deref()
                    .map(|table| table == event.table)
                    .unwrap_or(true);
                matches.then(|| {
                    Ok::<_, Infallible>(Event::default().data(
                        serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string()),
                    ))
                })
            }
            // A lagged subscriber skips what it missed and keeps going.
            Err(_) => None,
        };
        futures::future::ready(frame)
    });

    Ok(Sse::new(connected.chain(events))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping")))
}
