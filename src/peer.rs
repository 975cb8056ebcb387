use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::engine::{MediaConsumer, MediaProducer, MediaTransport};
use crate::error::Error;
use crate::liveness::{LivenessMonitor, LivenessState};
use crate::message::Role;
use crate::room::RoomEvent;
use crate::signaling::{timed_request, SignalingConnection};

#[derive(Debug, Default, Clone)]
struct PeerProfile {
    roler: Role,
    display_name: String,
    picture: String,
    platform: String,
    rtp_capabilities: Option<Value>,
}

#[derive(Debug)]
struct TransportEntry {
    transport: Arc<dyn MediaTransport>,
    consuming: bool,
}

#[derive(Debug)]
struct ConsumerEntry {
    consumer: Arc<dyn MediaConsumer>,
    /// Forwarding task owning the engine event stream and the periodic score
    /// push for this consumer.
    task: JoinHandle<()>,
}

/// Read-only projection of a peer, sent to other clients.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub roler: Role,
    pub display_name: String,
    pub picture: String,
    pub platform: String,
    pub address: String,
    pub duration_time: f64,
}

/// One connected participant. The peer is the owner of every engine resource
/// created on behalf of its connection; a handle lives in exactly one peer's
/// ledger and leaves it through exactly one close.
pub struct Peer {
    pub id: String,
    config: Arc<RoomConfig>,
    connection: std::sync::Mutex<Arc<dyn SignalingConnection>>,
    address: String,
    enter_time: tokio::time::Instant,
    profile: std::sync::Mutex<PeerProfile>,
    joined: AtomicBool,
    closed: AtomicBool,
    transports: Mutex<HashMap<String, TransportEntry>>,
    producers: Mutex<HashMap<String, Arc<dyn MediaProducer>>>,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
    liveness: LivenessMonitor,
    room_sender: std::sync::Mutex<Option<tokio::sync::mpsc::UnboundedSender<RoomEvent>>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("joined", &self.joined)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Peer {
    pub fn new(
        id: String,
        connection: Arc<dyn SignalingConnection>,
        config: Arc<RoomConfig>,
    ) -> Arc<Self> {
        let address = connection.remote_address();
        tracing::info!("Peer {} is created, address: {}", id, address);
        Arc::new(Self {
            id,
            config,
            connection: std::sync::Mutex::new(connection),
            address,
            enter_time: tokio::time::Instant::now(),
            profile: std::sync::Mutex::new(PeerProfile::default()),
            joined: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transports: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            liveness: LivenessMonitor::default(),
            room_sender: std::sync::Mutex::new(None),
        })
    }

    /// Wires the lifecycle channel to the owning room. Called once at
    /// admission; the room is the only subscriber.
    pub(crate) fn bind_room(&self, sender: tokio::sync::mpsc::UnboundedSender<RoomEvent>) {
        let mut room_sender = self.room_sender.lock().unwrap();
        *room_sender = Some(sender);
    }

    pub fn connection(&self) -> Arc<dyn SignalingConnection> {
        self.connection.lock().unwrap().clone()
    }

    pub fn connected(&self) -> bool {
        self.connection().connected()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    pub(crate) fn set_joined(&self) {
        self.joined.store(true, Ordering::SeqCst);
    }

    pub fn address(&self) -> String {
        self.address.clone()
    }

    pub fn roler(&self) -> Role {
        self.profile.lock().unwrap().roler
    }

    pub(crate) fn set_roler(&self, roler: Role) {
        self.profile.lock().unwrap().roler = roler;
    }

    pub fn rtp_capabilities(&self) -> Option<Value> {
        self.profile.lock().unwrap().rtp_capabilities.clone()
    }

    /// Records the profile declared at join time. Capabilities are set once
    /// here and never renegotiated.
    pub(crate) fn set_profile(
        &self,
        roler: Role,
        display_name: String,
        picture: String,
        platform: String,
        rtp_capabilities: Option<Value>,
    ) {
        let mut profile = self.profile.lock().unwrap();
        profile.roler = roler;
        profile.display_name = display_name;
        profile.picture = picture;
        profile.platform = platform;
        profile.rtp_capabilities = rtp_capabilities;
    }

    /// Fire-and-forget notification to this peer's client.
    pub fn notify(&self, method: &str, data: Value) {
        self.connection().notify(method, data);
    }

    /// Request to this peer's client, bounded by the configured timeout.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, Error> {
        let connection = self.connection();
        timed_request(&connection, method, data, self.config.request_timeout).await
    }

    pub(crate) async fn add_transport(&self, transport: Arc<dyn MediaTransport>, consuming: bool) {
        let mut transports = self.transports.lock().await;
        transports.insert(transport.id(), TransportEntry { transport, consuming });
    }

    pub async fn transport(&self, id: &str) -> Option<Arc<dyn MediaTransport>> {
        let transports = self.transports.lock().await;
        transports.get(id).map(|entry| entry.transport.clone())
    }

    /// The single transport this peer created with the consuming flag. Every
    /// consumer for this peer is bound to it.
    pub async fn consumer_transport(&self) -> Option<Arc<dyn MediaTransport>> {
        let transports = self.transports.lock().await;
        transports
            .values()
            .find(|entry| entry.consuming)
            .map(|entry| entry.transport.clone())
    }

    /// Removal always forces the engine close. Close is idempotent, so this
    /// holds whether the caller or an engine event closed the handle first.
    pub(crate) async fn remove_transport(&self, id: &str) {
        let entry = {
            let mut transports = self.transports.lock().await;
            transports.remove(id)
        };
        if let Some(entry) = entry {
            entry.transport.close().await;
        }
    }

    pub(crate) async fn add_producer(&self, producer: Arc<dyn MediaProducer>) {
        let mut producers = self.producers.lock().await;
        producers.insert(producer.id(), producer);
    }

    pub async fn producer(&self, id: &str) -> Option<Arc<dyn MediaProducer>> {
        let producers = self.producers.lock().await;
        producers.get(id).cloned()
    }

    pub(crate) async fn producers(&self) -> Vec<Arc<dyn MediaProducer>> {
        let producers = self.producers.lock().await;
        producers.values().cloned().collect()
    }

    pub(crate) async fn remove_producer(&self, id: &str) {
        let producer = {
            let mut producers = self.producers.lock().await;
            producers.remove(id)
        };
        if let Some(producer) = producer {
            producer.close().await;
        }
    }

    pub(crate) async fn add_consumer(&self, consumer: Arc<dyn MediaConsumer>, task: JoinHandle<()>) {
        let mut consumers = self.consumers.lock().await;
        consumers.insert(consumer.id(), ConsumerEntry { consumer, task });
    }

    pub async fn consumer(&self, id: &str) -> Option<Arc<dyn MediaConsumer>> {
        let consumers = self.consumers.lock().await;
        consumers.get(id).map(|entry| entry.consumer.clone())
    }

    /// Removes the consumer, force-closing it in the engine and cancelling
    /// its score push.
    pub(crate) async fn remove_consumer(&self, id: &str) {
        let entry = {
            let mut consumers = self.consumers.lock().await;
            consumers.remove(id)
        };
        if let Some(entry) = entry {
            entry.consumer.close().await;
            entry.task.abort();
        }
    }

    /// Idempotent. Releases every owned engine resource exactly once, stops
    /// the liveness timer, disconnects the socket and tells the owning room.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Peer {} is closed", self.id);

        self.close_resources().await;
        self.liveness.cancel();
        self.connection().disconnect();

        let sender = self.room_sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(RoomEvent::PeerClosed(self.id.clone()));
        }
    }

    async fn close_resources(&self) {
        let producers = {
            let mut producers = self.producers.lock().await;
            std::mem::take(&mut *producers)
        };
        for producer in producers.into_values() {
            producer.close().await;
        }

        let consumers = {
            let mut consumers = self.consumers.lock().await;
            std::mem::take(&mut *consumers)
        };
        for entry in consumers.into_values() {
            entry.task.abort();
            entry.consumer.close().await;
        }

        let transports = {
            let mut transports = self.transports.lock().await;
            std::mem::take(&mut *transports)
        };
        for entry in transports.into_values() {
            entry.transport.close().await;
        }
    }

    /// Connection-lost notice from the server binding. Starts the grace
    /// countdown instead of tearing the peer down.
    pub fn handle_disconnect(self: &Arc<Self>) {
        if self.closed() {
            return;
        }
        tracing::debug!("Peer {} lost its connection", self.id);
        self.liveness.start(
            self.clone(),
            self.config.liveness_interval,
            self.config.liveness_limit,
        );
    }

    /// Re-attaches the same peer identity to a freshly accepted connection.
    /// Treated as an immediate resume: the grace countdown is dropped and all
    /// owned resources stay as they are.
    pub fn handle_reconnect(&self, new_connection: Arc<dyn SignalingConnection>) {
        let previous = {
            let mut connection = self.connection.lock().unwrap();
            std::mem::replace(&mut *connection, new_connection)
        };
        previous.disconnect();
        self.liveness.cancel();
        tracing::info!("Peer {} reconnected, previous connection dropped", self.id);
    }

    pub fn liveness_state(&self) -> LivenessState {
        self.liveness.state()
    }

    pub fn peer_info(&self) -> PeerInfo {
        let profile = self.profile.lock().unwrap();
        PeerInfo {
            id: self.id.clone(),
            roler: profile.roler,
            display_name: profile.display_name.clone(),
            picture: profile.picture.clone(),
            platform: profile.platform.clone(),
            address: self.address.clone(),
            duration_time: self.enter_time.elapsed().as_secs_f64(),
        }
    }

    /// Diagnostic projection of the peer and all of its owned resources.
    pub async fn status_report(&self) -> Value {
        let transports: Vec<Value> = {
            let transports = self.transports.lock().await;
            transports
                .values()
                .map(|entry| {
                    json!({
                        "transportId": entry.transport.id(),
                        "closed": entry.transport.closed(),
                        "consuming": entry.consuming,
                    })
                })
                .collect()
        };
        let producers: Vec<Value> = {
            let producers = self.producers.lock().await;
            producers
                .values()
                .map(|producer| {
                    json!({
                        "producerId": producer.id(),
                        "closed": producer.closed(),
                        "kind": producer.kind(),
                    })
                })
                .collect()
        };
        let consumers: Vec<Value> = {
            let consumers = self.consumers.lock().await;
            consumers
                .values()
                .map(|entry| {
                    json!({
                        "consumerId": entry.consumer.id(),
                        "closed": entry.consumer.closed(),
                        "kind": entry.consumer.kind(),
                        "producerId": entry.consumer.producer_id(),
                        "type": entry.consumer.consumer_type(),
                    })
                })
                .collect()
        };

        let mut report = serde_json::to_value(self.peer_info()).unwrap_or_default();
        if let Value::Object(map) = &mut report {
            map.insert("joined".to_string(), json!(self.joined()));
            map.insert("closed".to_string(), json!(self.closed()));
            map.insert("transports".to_string(), Value::Array(transports));
            map.insert("producers".to_string(), Value::Array(producers));
            map.insert("consumers".to_string(), Value::Array(consumers));
        }
        report
    }

    #[cfg(test)]
    pub(crate) async fn resource_counts(&self) -> (usize, usize, usize) {
        (
            self.transports.lock().await.len(),
            self.producers.lock().await.len(),
            self.consumers.lock().await.len(),
        )
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        tracing::debug!("Peer {} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ConsumeOptions, MediaKind, MediaRouter, ProduceOptions, WebRtcTransportOptions,
    };
    use crate::test_support::{MockConnection, MockEngineState, MockRouter};

    fn test_peer() -> (Arc<Peer>, Arc<MockConnection>) {
        let connection = MockConnection::new("c1");
        let peer = Peer::new(
            "peer-a".to_string(),
            connection.clone(),
            Arc::new(RoomConfig::default()),
        );
        (peer, connection)
    }

    fn transport_options(consuming: bool) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            producing: !consuming,
            consuming,
        }
    }

    #[tokio::test]
    async fn ledger_lookup_and_consumer_transport() {
        let state = MockEngineState::new();
        let (peer, _connection) = test_peer();
        let router = MockRouter::new(state.clone());

        let producing = router
            .create_webrtc_transport(transport_options(false))
            .await
            .unwrap();
        let consuming = router
            .create_webrtc_transport(transport_options(true))
            .await
            .unwrap();
        peer.add_transport(producing.clone(), false).await;
        peer.add_transport(consuming.clone(), true).await;

        assert!(peer.transport(&producing.id()).await.is_some());
        assert!(peer.transport("unknown").await.is_none());
        let found = peer.consumer_transport().await.unwrap();
        assert_eq!(found.id(), consuming.id());
    }

    #[tokio::test]
    async fn close_releases_every_resource_exactly_once() {
        let state = MockEngineState::new();
        let (peer, connection) = test_peer();
        let router = MockRouter::new(state.clone());

        let transport = router
            .create_webrtc_transport(transport_options(true))
            .await
            .unwrap();
        peer.add_transport(transport.clone(), true).await;

        let producer = transport
            .produce(ProduceOptions {
                kind: MediaKind::Video,
                rtp_parameters: serde_json::json!({}),
                app_data: serde_json::json!({}),
            })
            .await
            .unwrap();
        peer.add_producer(producer.clone()).await;

        let consumer = transport
            .consume(ConsumeOptions {
                producer_id: producer.id(),
                rtp_capabilities: serde_json::json!({}),
                paused: true,
            })
            .await
            .unwrap();
        let task = tokio::spawn(async { std::future::pending::<()>().await });
        peer.add_consumer(consumer.clone(), task).await;

        peer.close().await;
        // A second close must not touch the engine again.
        peer.close().await;

        assert!(peer.closed());
        assert!(!connection.connected());
        assert_eq!(peer.resource_counts().await, (0, 0, 0));
        assert_eq!(state.transport_closes(&transport.id()), 1);
        assert_eq!(state.producer_closes(&producer.id()), 1);
        assert_eq!(state.consumer_closes(&consumer.id()), 1);
    }

    #[tokio::test]
    async fn removal_closes_the_engine_handle_once() {
        let state = MockEngineState::new();
        let (peer, _connection) = test_peer();
        let router = MockRouter::new(state.clone());

        let transport = router
            .create_webrtc_transport(transport_options(false))
            .await
            .unwrap();
        peer.add_transport(transport.clone(), false).await;
        let producer = transport
            .produce(ProduceOptions {
                kind: MediaKind::Audio,
                rtp_parameters: serde_json::json!({}),
                app_data: serde_json::json!({}),
            })
            .await
            .unwrap();
        peer.add_producer(producer.clone()).await;

        // The handle may already be closed when removal runs, close being
        // idempotent keeps the engine at one close either way.
        producer.close().await;
        peer.remove_producer(&producer.id()).await;
        peer.remove_transport(&transport.id()).await;

        assert_eq!(peer.resource_counts().await, (0, 0, 0));
        assert_eq!(state.producer_closes(&producer.id()), 1);
        assert_eq!(state.transport_closes(&transport.id()), 1);
    }

    #[tokio::test]
    async fn remove_consumer_forces_engine_close() {
        let state = MockEngineState::new();
        let (peer, _connection) = test_peer();
        let router = MockRouter::new(state.clone());
        let transport = router
            .create_webrtc_transport(transport_options(true))
            .await
            .unwrap();
        let consumer = transport
            .consume(ConsumeOptions {
                producer_id: "p1".to_string(),
                rtp_capabilities: serde_json::json!({}),
                paused: false,
            })
            .await
            .unwrap();
        let task = tokio::spawn(async { std::future::pending::<()>().await });
        peer.add_consumer(consumer.clone(), task).await;

        peer.remove_consumer(&consumer.id()).await;
        assert!(peer.consumer(&consumer.id()).await.is_none());
        assert_eq!(state.consumer_closes(&consumer.id()), 1);

        // Removing a missing id is a no-op.
        peer.remove_consumer(&consumer.id()).await;
        assert_eq!(state.consumer_closes(&consumer.id()), 1);
    }

    #[tokio::test]
    async fn reconnect_swaps_the_connection() {
        let (peer, first) = test_peer();

        let second = MockConnection::new("c2");
        peer.handle_reconnect(second.clone());

        assert!(!first.connected());
        peer.notify("chatMessage", serde_json::json!({"chat": "hi"}));
        assert_eq!(first.notifications().len(), 0);
        assert_eq!(second.notifications().len(), 1);
        assert_eq!(peer.liveness_state(), LivenessState::Connected);
    }

    #[tokio::test]
    async fn status_report_projects_owned_resources() {
        let state = MockEngineState::new();
        let (peer, _connection) = test_peer();
        let router = MockRouter::new(state.clone());
        let transport = router
            .create_webrtc_transport(transport_options(false))
            .await
            .unwrap();
        peer.add_transport(transport.clone(), false).await;

        let report = peer.status_report().await;
        assert_eq!(report["id"], "peer-a");
        assert_eq!(report["joined"], false);
        assert_eq!(report["transports"][0]["transportId"], transport.id());
    }
}
