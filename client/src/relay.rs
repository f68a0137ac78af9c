use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{Channel, Delivery, Handler, Subscription, TopicRouter};
use crate::error::{Error, Result};
use crate::protocol::{Message, Topic};
use crate::utils::current_unix_millis;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);

/// WebSocket connection to the relay server.
///
/// Implements [`Channel`] for the synchronization core and carries the room
/// requests (create, join, leave, hand-off, media selection) for the binary.
/// Topic handlers outlive a connection: they are re-announced on reconnect.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<RelayState>,
}

struct RelayState {
    connection: Mutex<Option<Connection>>,
    next_connection: AtomicU64,
    router: Mutex<TopicRouter>,
    stats: Mutex<RelayStats>,
}

/// One socket's outbound queue. Its tasks stop when `cancel` fires.
struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<WsMessage>,
    cancel: CancellationToken,
}

#[derive(Default, Clone)]
struct RelayStats {
    bytes_out: u64,
    bytes_in: u64,
    messages_out: u64,
    messages_in: u64,
    last_message_at: Option<Instant>,
    last_ping_sent: Option<Instant>,
    last_ping_nonce: Option<u64>,
    last_rtt_ms: Option<f32>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
    endpoint_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayStatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_rtt_ms: Option<f32>,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub reconnect_attempts: u32,
    pub endpoint_label: Option<String>,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayState {
                connection: Mutex::new(None),
                next_connection: AtomicU64::new(0),
                router: Mutex::new(TopicRouter::default()),
                stats: Mutex::new(RelayStats::default()),
            }),
        }
    }

    /// Connect to the relay. Non-delivery frames go to `on_message`.
    /// Returns a receiver that resolves when the socket closes.
    pub async fn connect<F>(&self, server_url: &str, on_message: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(|e| Error::Channel(format!("failed to connect to {server_url}: {e}")))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let (id, cancel) = self.inner.install(tx);

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        let send_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = send_cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                if let Err(e) = ws_sender.send(msg).await {
                    tracing::error!("Relay send failed: {e}");
                    break;
                }
            }
            send_inner.clear_transport(id);
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        let recv_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = recv_cancel.cancelled() => break,
                    msg = ws_receiver.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        match serde_json::from_str::<Message>(&text) {
                            Ok(Message::Delivery {
                                topic,
                                from,
                                payload,
                            }) => recv_inner.dispatch(&topic, from, payload),
                            Ok(other) => on_message(other),
                            Err(e) => tracing::warn!("Dropped malformed relay frame: {e}"),
                        }
                    }
                    Ok(WsMessage::Pong(payload)) => recv_inner.handle_ws_pong(&payload),
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::error!("Relay receive failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            recv_inner.clear_transport(id);
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        spawn_keepalive(Arc::clone(&self.inner), id, cancel);

        let topics = self.inner.router.lock().topics();
        for topic in topics {
            self.inner.send_message(&Message::Subscribe {
                topic: topic.to_string(),
            })?;
        }

        Ok(disconnect_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().is_some()
    }

    pub fn mark_connected(&self, label: &str) {
        let mut stats = self.inner.stats.lock();
        stats.connected_since = Some(Instant::now());
        stats.endpoint_label = Some(label.to_string());
    }

    pub fn mark_disconnected(&self) {
        let mut stats = self.inner.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
    }

    pub fn stats_snapshot(&self) -> RelayStatsSnapshot {
        self.inner.snapshot()
    }

    pub fn create_room(&self, media_url: String) -> Result<()> {
        self.inner.send_message(&Message::CreateRoom { media_url })
    }

    pub fn join_room(&self, room_id: String) -> Result<()> {
        self.inner.send_message(&Message::JoinRoom { room_id })
    }

    pub fn leave_room(&self) -> Result<()> {
        self.inner.send_message(&Message::LeaveRoom)
    }

    /// Pass leadership to another member (leader only).
    pub fn hand_off(&self, new_leader_id: Uuid) -> Result<()> {
        self.inner.send_message(&Message::HandOff { new_leader_id })
    }

    /// Replace the room's media (leader only).
    pub fn select_media(&self, media_url: String) -> Result<()> {
        self.inner.send_message(&Message::SelectMedia { media_url })
    }
}

impl Channel for RelayClient {
    fn publish(&self, topic: &Topic, payload: serde_json::Value) -> Result<()> {
        self.inner.send_message(&Message::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    fn subscribe(&self, topic: &Topic, handler: Handler) -> Result<Subscription> {
        let (id, first) = self.inner.router.lock().add(topic, handler);
        if first && self.is_connected() {
            let announced = self.inner.send_message(&Message::Subscribe {
                topic: topic.to_string(),
            });
            if let Err(e) = announced {
                self.inner.router.lock().remove(topic, id);
                return Err(e);
            }
        }

        let inner = Arc::clone(&self.inner);
        let topic = topic.clone();
        Ok(Subscription::new(move || {
            let last = inner.router.lock().remove(&topic, id);
            if last && inner.connection.lock().is_some() {
                let _ = inner.send_message(&Message::Unsubscribe {
                    topic: topic.to_string(),
                });
            }
        }))
    }
}

fn spawn_keepalive(inner: Arc<RelayState>, id: u64, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(KEEPALIVE_INTERVAL) => {}
            }
            if inner.send_keepalive(id).is_err() {
                break;
            }
        }
    })
}

impl RelayState {
    /// Make `tx` the live connection, stopping whatever was live before.
    fn install(&self, tx: mpsc::UnboundedSender<WsMessage>) -> (u64, CancellationToken) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let previous = self.connection.lock().replace(Connection {
            id,
            tx,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        (id, cancel)
    }

    fn send_message(&self, msg: &Message) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.record_outgoing(json.len() as u64);
        self.enqueue_ws(WsMessage::Text(json.into()))
    }

    fn enqueue_ws(&self, message: WsMessage) -> Result<()> {
        match self.connection.lock().as_ref() {
            Some(connection) => connection
                .tx
                .send(message)
                .map_err(|_| Error::ChannelClosed),
            None => Err(Error::ChannelClosed),
        }
    }

    fn dispatch(&self, raw_topic: &str, from: String, payload: serde_json::Value) {
        let Some(topic) = Topic::parse(raw_topic) else {
            tracing::warn!(topic = raw_topic, "Dropped delivery on unknown topic");
            return;
        };
        let handlers = self.router.lock().handlers(&topic);
        if handlers.is_empty() {
            tracing::debug!(%topic, "Delivery without local subscribers");
        }
        for handler in handlers {
            handler(Delivery {
                topic: topic.clone(),
                from: from.clone(),
                payload: payload.clone(),
            });
        }
    }

    fn record_outgoing(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_out += bytes;
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_in += bytes;
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn handle_ws_pong(&self, payload: &[u8]) {
        self.record_incoming(payload.len() as u64);
        if payload.len() < 8 {
            return;
        }
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&payload[..8]);
        let nonce = u64::from_le_bytes(nonce_bytes);

        let mut stats = self.stats.lock();
        if stats.last_ping_nonce == Some(nonce) {
            if let Some(sent) = stats.last_ping_sent {
                stats.last_rtt_ms = Some(sent.elapsed().as_secs_f32() * 1000.0);
            }
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
    }

    /// Ping over connection `id`. Fails once that connection is gone.
    fn send_keepalive(&self, id: u64) -> Result<()> {
        if self.connection.lock().as_ref().map(|c| c.id) != Some(id) {
            return Err(Error::ChannelClosed);
        }
        let nonce = Uuid::new_v4().as_u128() as u64;
        {
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = Some(nonce);
            stats.last_ping_sent = Some(Instant::now());
        }

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&nonce.to_le_bytes());
        payload.extend_from_slice(&current_unix_millis().to_le_bytes());
        self.record_outgoing(payload.len() as u64);
        self.enqueue_ws(WsMessage::Ping(payload.into()))
    }

    /// Drop connection `id` if it is still the live one.
    fn clear_transport(&self, id: u64) {
        {
            let mut connection = self.connection.lock();
            if connection.as_ref().map(|c| c.id) != Some(id) {
                return;
            }
            if let Some(connection) = connection.take() {
                connection.cancel.cancel();
            }
        }
        let mut stats = self.stats.lock();
        stats.last_ping_nonce = None;
        stats.last_ping_sent = None;
    }

    fn snapshot(&self) -> RelayStatsSnapshot {
        let stats = self.stats.lock();
        RelayStatsSnapshot {
            bytes_out: stats.bytes_out,
            bytes_in: stats.bytes_in,
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_rtt_ms: stats.last_rtt_ms,
            last_message_age: stats.last_message_at.map(|i| i.elapsed().as_secs_f32()),
            connected_duration: stats.connected_since.map(|i| i.elapsed().as_secs_f32()),
            reconnect_attempts: stats.reconnect_attempts,
            endpoint_label: stats.endpoint_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attached() -> (RelayClient, mpsc::UnboundedReceiver<WsMessage>) {
        let client = RelayClient::new();
        let (tx, rx) = mpsc::unbounded_channel();
        client.inner.install(tx);
        (client, rx)
    }

    fn frame(msg: WsMessage) -> Message {
        match msg {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_transport_fails() {
        let client = RelayClient::new();
        let err = client
            .publish(&Topic::control("r"), json!({"action": "play", "time": 0.0}))
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }

    #[test]
    fn test_subscribe_announces_topic_once() {
        let (client, mut rx) = attached();
        let topic = Topic::control("r");
        let first = client.subscribe(&topic, Box::new(|_| {})).unwrap();
        let second = client.subscribe(&topic, Box::new(|_| {})).unwrap();
        assert!(matches!(
            frame(rx.try_recv().unwrap()),
            Message::Subscribe { topic } if topic == "control/r"
        ));
        assert!(rx.try_recv().is_err());

        drop(first);
        assert!(rx.try_recv().is_err());
        drop(second);
        assert!(matches!(
            frame(rx.try_recv().unwrap()),
            Message::Unsubscribe { topic } if topic == "control/r"
        ));
    }

    #[test]
    fn test_dispatch_routes_by_topic() {
        let (client, _rx) = attached();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = client
            .subscribe(
                &Topic::sync_response("r", "me"),
                Box::new(move |d| sink.lock().push(d.from)),
            )
            .unwrap();

        let payload = json!({"currentTime": 1.0, "isPlaying": true});
        client.inner.dispatch("sync-response/r/me", "leader".into(), payload.clone());
        client.inner.dispatch("sync-response/r/other", "leader".into(), payload.clone());
        client.inner.dispatch("bogus", "leader".into(), payload);
        assert_eq!(*seen.lock(), vec!["leader".to_string()]);
    }

    #[test]
    fn test_pong_records_rtt_for_matching_nonce() {
        let client = RelayClient::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _) = client.inner.install(tx);
        client.inner.send_keepalive(id).unwrap();
        let nonce = client.inner.stats.lock().last_ping_nonce.unwrap();
        client.inner.handle_ws_pong(&nonce.wrapping_add(1).to_le_bytes());
        assert!(client.stats_snapshot().last_rtt_ms.is_none());
        client.inner.handle_ws_pong(&nonce.to_le_bytes());
        assert!(client.stats_snapshot().last_rtt_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_stops_previous_connection() {
        let client = RelayClient::new();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (first, first_cancel) = client.inner.install(first_tx);
        let keepalive = spawn_keepalive(Arc::clone(&client.inner), first, first_cancel.clone());

        sleep(KEEPALIVE_INTERVAL + Duration::from_secs(1)).await;
        assert!(matches!(first_rx.try_recv(), Ok(WsMessage::Ping(_))));

        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        let (second, _) = client.inner.install(second_tx);
        assert!(first_cancel.is_cancelled());

        // Late teardown of the old socket leaves the new one alone.
        client.inner.clear_transport(first);
        assert!(client.is_connected());

        sleep(KEEPALIVE_INTERVAL * 3).await;
        assert!(keepalive.is_finished());
        assert!(second_rx.try_recv().is_err());
        assert!(client.inner.send_keepalive(first).is_err());
        assert!(client.inner.send_keepalive(second).is_ok());
        assert!(matches!(second_rx.try_recv(), Ok(WsMessage::Ping(_))));
    }
}
