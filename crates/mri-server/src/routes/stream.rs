//! Server-sent progress streams. Each endpoint frames signed envelopes as
//! they are published, synthesizes a heartbeat on quiet periods, and closes
//! with a final `stream_end` frame once a simulator-specific terminal tag
//! has been observed.

use std::convert::Infallible;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use mri_core::event_bus::StreamItem;
use uuid::Uuid;

use crate::state::AppState;

enum Phase {
    Polling(Instant),
    ClosingWith(mri_core::event_bus::Envelope),
    Done,
}

fn envelope_stream(
    state: AppState,
    sid: Uuid,
    terminal_tags: &'static [&'static str],
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Phase::Polling(Instant::now()), move |phase| {
        let state = state.clone();
        async move {
            match phase {
                Phase::Done => None,
                Phase::ClosingWith(envelope) => {
                    let frame = Event::default().data(serde_json::to_string(&envelope).unwrap_or_default());
                    Some((Ok(frame), Phase::Done))
                }
                Phase::Polling(mut last_emission) => loop {
                    match state.events.poll_stream(sid, terminal_tags, &mut last_emission).await {
                        Ok(Some(StreamItem::Envelope(envelope))) => {
                            let frame = Event::default().data(serde_json::to_string(&envelope).unwrap_or_default());
                            return Some((Ok(frame), Phase::Polling(last_emission)));
                        }
                        Ok(Some(StreamItem::Terminal(envelope))) => {
                            let frame = Event::default().data(serde_json::to_string(&envelope).unwrap_or_default());
                            let end = state.events.stream_end();
                            return Some((Ok(frame), Phase::ClosingWith(end)));
                        }
                        Ok(None) => continue,
                        Err(_) => {
                            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                            continue;
                        }
                    }
                },
            }
        }
    })
}

pub async fn stream_segmentation(State(state): State<AppState>, Path(sid): Path<Uuid>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(envelope_stream(state, sid, &["job_complete", "job_failed"])).keep_alive(KeepAlive::default())
}

pub async fn stream_roast(State(state): State<AppState>, Path(sid): Path<Uuid>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(envelope_stream(state, sid, &["roast_complete", "roast_error"])).keep_alive(KeepAlive::default())
}

pub async fn stream_simnibs(State(state): State<AppState>, Path(sid): Path<Uuid>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(envelope_stream(state, sid, &["simnibs_complete", "simnibs_error"])).keep_alive(KeepAlive::default())
}
