use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::shared_state::SharedState;

type HmacSha256 = Hmac<Sha256>;

const EVENT_TTL: Duration = Duration::from_secs(3600);
const BLPOP_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const HEARTBEAT_QUIET_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_TERMINAL_TAGS: &[&str] = &["job_complete", "job_failed"];

/// The signed wrapper around an event: `sig` is an HMAC-SHA256 over the
/// canonical (sorted-key) JSON encoding of `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: Value,
    pub sig: String,
}

fn canonical_json(value: &Value) -> String {
    // serde_json::Value serializes maps in the order their keys were
    // inserted; events are built from BTreeMap-ordered fields so iterating
    // a re-parsed value here guarantees sorted keys regardless of call site.
    let sorted: serde_json::Map<String, Value> = match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.clone().into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries.into_iter().collect()
        }
        other => return other.to_string(),
    };
    Value::Object(sorted).to_string()
}

pub fn sign_event(secret: &str, event: &Value) -> String {
    let raw = canonical_json(event);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(raw.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_event(secret: &str, envelope: &Envelope) -> bool {
    let expected = sign_event(secret, &envelope.event);
    // Constant-time-ish comparison is unnecessary here: the signature is not
    // a secret itself, only proof the server produced the event.
    expected == envelope.sig
}

fn event_key(sid: Uuid) -> String {
    format!("sse:{sid}")
}

/// Per-session append of signed envelopes, and a blocking stream reader that
/// merges events, heartbeats, and terminal close on matched sentinels.
pub struct EventBus {
    shared: Arc<dyn SharedState>,
    secret: String,
}

impl EventBus {
    pub fn new(shared: Arc<dyn SharedState>, secret: String) -> Self {
        Self { shared, secret }
    }

    /// Signs `event`, wraps it as an envelope, appends it to the session's
    /// event list, and refreshes the list's one-hour retention window.
    pub async fn publish(&self, sid: Uuid, event: Value) -> CoreResult<()> {
        let sig = sign_event(&self.secret, &event);
        let envelope = Envelope { event, sig };
        let serialized = serde_json::to_string(&envelope).map_err(|e| anyhow::anyhow!(e))?;
        let key = event_key(sid);
        self.shared.rpush(&key, serialized).await?;
        self.shared.expire(&key, EVENT_TTL).await?;
        Ok(())
    }

    /// Pops the next envelope for `sid`, waiting up to one second. Returns
    /// `None` on timeout so the caller can decide whether to emit a
    /// heartbeat.
    pub async fn next_raw(&self, sid: Uuid) -> CoreResult<Option<Envelope>> {
        let key = event_key(sid);
        let Some(raw) = self.shared.blpop(&key, BLPOP_POLL_TIMEOUT).await? else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!(e))?;
        Ok(Some(envelope))
    }

    pub fn sign(&self, event: &Value) -> String {
        sign_event(&self.secret, event)
    }

    pub fn verify(&self, envelope: &Envelope) -> bool {
        verify_event(&self.secret, envelope)
    }
}

/// One item yielded by [`EventBus::poll_stream`] to a long-lived SSE
/// consumer loop.
pub enum StreamItem {
    /// A real published event, a synthesized heartbeat, or the final
    /// `stream_end` sentinel — all pre-signed and ready to frame.
    Envelope(Envelope),
    /// `Envelope` above was the terminal event; the caller should frame it
    /// and then stop polling (no further calls to `poll_stream`).
    Terminal(Envelope),
}

impl EventBus {
    /// Produces the next item for a long-lived SSE consumer: a real event if
    /// one is queued, a synthesized heartbeat after five quiet seconds, or a
    /// terminal `stream_end` once a tag in `terminal_tags` has been observed.
    /// `last_emission` tracks the last emission instant across calls.
    pub async fn poll_stream(
        &self,
        sid: Uuid,
        terminal_tags: &[&str],
        last_emission: &mut std::time::Instant,
    ) -> CoreResult<Option<StreamItem>> {
        let tags: &[&str] = if terminal_tags.is_empty() {
            DEFAULT_TERMINAL_TAGS
        } else {
            terminal_tags
        };

        loop {
            match self.next_raw(sid).await? {
                Some(envelope) => {
                    if !self.verify(&envelope) {
                        // Dropped without emission: an unsigned or
                        // tampered envelope must never reach a consumer.
                        continue;
                    }
                    *last_emission = std::time::Instant::now();
                    let tag = envelope.event.get("event").and_then(Value::as_str).unwrap_or_default();
                    return if tags.contains(&tag) {
                        Ok(Some(StreamItem::Terminal(envelope)))
                    } else {
                        Ok(Some(StreamItem::Envelope(envelope)))
                    };
                }
                None => {
                    return if last_emission.elapsed() > HEARTBEAT_QUIET_PERIOD {
                        let hb = serde_json::json!({"event": "heartbeat", "ts": chrono::Utc::now().timestamp()});
                        let sig = self.sign(&hb);
                        *last_emission = std::time::Instant::now();
                        Ok(Some(StreamItem::Envelope(Envelope { event: hb, sig })))
                    } else {
                        Ok(None)
                    };
                }
            }
        }
    }

    /// Builds the final `stream_end` envelope emitted after a terminal tag
    /// closes the stream.
    pub fn stream_end(&self) -> Envelope {
        let end = serde_json::json!({"event": "stream_end", "ts": chrono::Utc::now().timestamp()});
        let sig = self.sign(&end);
        Envelope { event: end, sig }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_state::InMemorySharedState;

    #[test]
    fn canonical_json_sorts_keys_regardless_of_insertion_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn signature_changes_with_secret() {
        let event = serde_json::json!({"event": "queued", "progress": 0});
        let s1 = sign_event("secret-a", &event);
        let s2 = sign_event("secret-b", &event);
        assert_ne!(s1, s2);
    }

    #[tokio::test]
    async fn published_envelopes_verify_against_the_configured_secret() {
        let shared = Arc::new(InMemorySharedState::new());
        let bus = EventBus::new(shared, "top-secret".into());
        let sid = Uuid::new_v4();
        bus.publish(sid, serde_json::json!({"event": "queued", "progress": 0}))
            .await
            .unwrap();

        let envelope = bus.next_raw(sid).await.unwrap().unwrap();
        assert!(bus.verify(&envelope));
    }

    #[tokio::test]
    async fn poll_stream_drops_envelopes_that_fail_signature_verification() {
        let shared = Arc::new(InMemorySharedState::new());
        let bus = EventBus::new(shared.clone(), "top-secret".into());
        let sid = Uuid::new_v4();

        // A forged envelope with a bogus signature, injected directly.
        let forged = Envelope {
            event: serde_json::json!({"event": "job_complete", "progress": 100}),
            sig: "not-a-real-signature".into(),
        };
        shared
            .rpush(&event_key(sid), serde_json::to_string(&forged).unwrap())
            .await
            .unwrap();
        bus.publish(sid, serde_json::json!({"event": "tick", "progress": 1})).await.unwrap();

        let mut last_emission = std::time::Instant::now();
        let item = bus.poll_stream(sid, &[], &mut last_emission).await.unwrap().unwrap();
        match item {
            StreamItem::Envelope(envelope) => assert_eq!(envelope.event["event"], "tick"),
            StreamItem::Terminal(_) => panic!("forged job_complete envelope must be dropped, not emitted"),
        }
    }

    #[tokio::test]
    async fn event_fifo_publish_order_matches_stream_order() {
        let shared = Arc::new(InMemorySharedState::new());
        let bus = EventBus::new(shared, "secret".into());
        let sid = Uuid::new_v4();

        for i in 0..5 {
            bus.publish(sid, serde_json::json!({"event": "tick", "progress": i}))
                .await
                .unwrap();
        }

        for i in 0..5 {
            let envelope = bus.next_raw(sid).await.unwrap().unwrap();
            assert_eq!(envelope.event["progress"], i);
        }
    }
}
