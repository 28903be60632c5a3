use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ha_client::{EntityClient, EntityUpsert, HaError, PlatformEvent};
use nostr_sdk::prelude::{Event, EventBuilder, Keys, Kind, Tag};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use nostr_bridge::relay::fetch_events;
use nostr_bridge::{
    author_filter, encrypt, ConversationKey, EventConsumer, EventRouter, ReconnectConfig,
    RelayManager, RelaySettings, KIND_APP_DATA,
};

const WAIT: Duration = Duration::from_secs(10);

/// What the mock relay sends on each subscription.
#[derive(Clone, Default)]
struct Script {
    /// Frames for the first live session and every poll query.
    first: Vec<String>,
    /// Extra frames for live sessions after the first.
    later: Vec<String>,
    drop_first_live: bool,
    /// Keep live sockets open but stop reading, so pings go unanswered.
    stall_live: bool,
    send_eose: bool,
}

struct MockRelay {
    url: String,
    live_sessions: Arc<AtomicUsize>,
    poll_sessions: Arc<AtomicUsize>,
}

impl MockRelay {
    async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let live_sessions = Arc::new(AtomicUsize::new(0));
        let poll_sessions = Arc::new(AtomicUsize::new(0));

        let live = live_sessions.clone();
        let poll = poll_sessions.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let script = script.clone();
                let live = live.clone();
                let poll = poll.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    let Some(Ok(Message::Text(req))) = ws.next().await else {
                        return;
                    };
                    let req: Value = serde_json::from_str(&req).unwrap();
                    let sub_id = req[1].as_str().unwrap().to_string();

                    let is_live = sub_id.contains("-live-");
                    let session = if is_live {
                        live.fetch_add(1, Ordering::SeqCst)
                    } else {
                        poll.fetch_add(1, Ordering::SeqCst)
                    };

                    let mut frames = script.first.clone();
                    if is_live && session > 0 {
                        frames.extend(script.later.iter().cloned());
                    }
                    for frame in frames {
                        let frame = frame.replace("{sub}", &sub_id);
                        if ws.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    if script.send_eose {
                        let eose = json!(["EOSE", sub_id]).to_string();
                        let _ = ws.send(Message::Text(eose)).await;
                    }

                    if is_live && session == 0 && script.drop_first_live {
                        let _ = ws.close(None).await;
                        return;
                    }
                    if is_live && script.stall_live {
                        sleep(Duration::from_secs(30)).await;
                        return;
                    }
                    while let Some(Ok(frame)) = ws.next().await {
                        if matches!(frame, Message::Close(_)) {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            url,
            live_sessions,
            poll_sessions,
        }
    }
}

fn signed(keys: &Keys, content: &str, d_tag: &str) -> Event {
    EventBuilder::new(Kind::Custom(KIND_APP_DATA), content)
        .tags([Tag::identifier(d_tag)])
        .sign_with_keys(keys)
        .unwrap()
}

fn event_frame(event: &Event) -> String {
    json!(["EVENT", "{sub}", event]).to_string()
}

fn fast_settings(url: &str, author: &Keys) -> RelaySettings {
    let mut settings =
        RelaySettings::new(vec![url.to_string()], author.public_key(), vec![KIND_APP_DATA]);
    settings.poll_interval = Duration::from_secs(3600);
    settings.query_timeout = Duration::from_secs(2);
    settings.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        backoff_multiplier: 2.0,
        stable_after: Duration::from_secs(30),
    };
    settings
}

struct Forwarder {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl EventConsumer for Forwarder {
    async fn consume(&mut self, event: Event) {
        let _ = self.tx.send(event.id.to_hex());
    }
}

async fn next_id(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("consumer channel closed")
}

#[tokio::test]
async fn test_reconnect_resumes_delivery_after_drop() {
    let keys = Keys::generate();
    let e1 = signed(&keys, "payload", "one");
    let e2 = signed(&keys, "payload", "two");
    let relay = MockRelay::start(Script {
        first: vec![event_frame(&e1)],
        later: vec![event_frame(&e2)],
        drop_first_live: true,
        send_eose: true,
        ..Script::default()
    })
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = RelayManager::new(fast_settings(&relay.url, &keys), Forwarder { tx });
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(stop_rx));

    let mut ids = vec![next_id(&mut rx).await, next_id(&mut rx).await];
    ids.sort();
    let mut expected = vec![e1.id.to_hex(), e2.id.to_hex()];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(relay.live_sessions.load(Ordering::SeqCst) >= 2);

    // Replays of e1 on the reconnected session and the poll must not surface.
    sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    stop_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_silent_relay_is_reconnected() {
    let keys = Keys::generate();
    let e1 = signed(&keys, "payload", "one");
    let relay = MockRelay::start(Script {
        first: vec![event_frame(&e1)],
        stall_live: true,
        ..Script::default()
    })
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut settings = fast_settings(&relay.url, &keys);
    settings.keepalive = Duration::from_millis(100);
    let manager = RelayManager::new(settings, Forwarder { tx });
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(stop_rx));

    assert_eq!(next_id(&mut rx).await, e1.id.to_hex());
    timeout(WAIT, async {
        while relay.live_sessions.load(Ordering::SeqCst) < 2 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("an unresponsive relay should be dropped and redialled");
    assert!(rx.try_recv().is_err());

    stop_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_notices_and_garbage_do_not_break_session() {
    let keys = Keys::generate();
    let e1 = signed(&keys, "payload", "one");
    let relay = MockRelay::start(Script {
        first: vec![
            json!(["NOTICE", "rate limited\u{1b}[31m\r\nforged log line"]).to_string(),
            "not json at all".to_string(),
            json!(["EVENT", "other-sub", e1]).to_string(),
            event_frame(&e1),
        ],
        ..Script::default()
    })
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = RelayManager::new(fast_settings(&relay.url, &keys), Forwarder { tx });
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(stop_rx));

    assert_eq!(next_id(&mut rx).await, e1.id.to_hex());
    sleep(Duration::from_millis(300)).await;
    assert_eq!(relay.live_sessions.load(Ordering::SeqCst), 1);

    stop_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_foreign_author_never_reaches_consumer() {
    let keys = Keys::generate();
    let foreign = signed(&Keys::generate(), "payload", "one");
    let e1 = signed(&keys, "payload", "one");
    let relay = MockRelay::start(Script {
        first: vec![event_frame(&foreign), event_frame(&e1)],
        send_eose: true,
        ..Script::default()
    })
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = RelayManager::new(fast_settings(&relay.url, &keys), Forwarder { tx });
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(stop_rx));

    assert_eq!(next_id(&mut rx).await, e1.id.to_hex());
    sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    stop_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[derive(Default)]
struct RecordingClient {
    upserts: Mutex<Vec<EntityUpsert>>,
    events: Mutex<Vec<PlatformEvent>>,
}

#[async_trait]
impl EntityClient for RecordingClient {
    async fn upsert_state(&self, upsert: &EntityUpsert) -> Result<(), HaError> {
        self.upserts.lock().unwrap().push(upsert.clone());
        Ok(())
    }

    async fn fire_event(&self, event: &PlatformEvent) -> Result<(), HaError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_live_and_poll_copies_update_entity_once() {
    let bridge = Keys::generate();
    let publisher = Keys::generate();
    let sender_key = ConversationKey::derive(publisher.secret_key(), &bridge.public_key()).unwrap();
    let bridge_key = ConversationKey::derive(bridge.secret_key(), &publisher.public_key()).unwrap();

    let payload = json!({
        "type": "sensor",
        "entity_id": "outdoor_temperature",
        "value": 72.5,
        "unit": "°F",
    });
    let content = encrypt(&payload.to_string(), &sender_key).unwrap();
    let event = signed(&publisher, &content, "outdoor_temperature");

    let relay = MockRelay::start(Script {
        first: vec![event_frame(&event)],
        send_eose: true,
        ..Script::default()
    })
    .await;

    let client = Arc::new(RecordingClient::default());
    let router = EventRouter::new(bridge_key, "nostr", client.clone());
    let settings = fast_settings(&relay.url, &publisher);
    let manager = RelayManager::new(settings, router);
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(stop_rx));

    timeout(WAIT, async {
        while relay.live_sessions.load(Ordering::SeqCst) == 0
            || relay.poll_sessions.load(Ordering::SeqCst) == 0
            || client.upserts.lock().unwrap().is_empty()
        {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("both paths should deliver");
    sleep(Duration::from_millis(300)).await;

    stop_tx.send(true).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

    let upserts = client.upserts.lock().unwrap();
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].entity_id, "sensor.nostr_outdoor_temperature");
    assert_eq!(upserts[0].state, "72.5");
    assert!(client.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_events_stops_at_eose() {
    let keys = Keys::generate();
    let e1 = signed(&keys, "payload", "one");
    let e2 = signed(&keys, "payload", "two");
    let relay = MockRelay::start(Script {
        first: vec![event_frame(&e1), event_frame(&e2)],
        send_eose: true,
        ..Script::default()
    })
    .await;

    let filter = author_filter(keys.public_key(), &[KIND_APP_DATA]).limit(10);
    let events = fetch_events(&relay.url, &filter, Duration::from_secs(5)).await.unwrap();

    let ids: Vec<_> = events.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![e1.id, e2.id]);
    assert_eq!(relay.poll_sessions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fetch_events_returns_partial_results_at_deadline() {
    let keys = Keys::generate();
    let e1 = signed(&keys, "payload", "one");
    let relay = MockRelay::start(Script {
        first: vec![event_frame(&e1)],
        send_eose: false,
        ..Script::default()
    })
    .await;

    let filter = author_filter(keys.public_key(), &[KIND_APP_DATA]);
    let events = fetch_events(&relay.url, &filter, Duration::from_millis(500)).await.unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, e1.id);
}
