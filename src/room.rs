use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::{media_codecs, RoomConfig};
use crate::engine::{
    ConsumeOptions, ConsumerEvent, MediaConsumer, MediaEngine, MediaKind, MediaProducer,
    MediaRouter, MediaTransport, ProduceOptions, WebRtcTransportOptions,
};
use crate::error::{Error, PeerErrorKind, RoomErrorKind, SignalingErrorKind};
use crate::message::{
    notification, parse_data, ChangeRolerRequest, ClassStartRequest, ClassStatus, ClosePeerRequest,
    ConnectApprovalRequest, ConnectWebRtcTransportRequest, ConsumerRequest,
    CreateWebRtcTransportRequest, DisconnectVideoRequest, JoinRequest, MuteKind, MutedRequest,
    ProduceRequest, ProducerRequest, RequestMethod, SignalingRequest, SyncDocInfoRequest,
    TargetedRequest, TransportRequest,
};
use crate::peer::Peer;
use crate::record::{unix_millis, RoomStore};
use crate::server::ServerEvent;
use crate::signaling::SignalingConnection;

/// Classroom substate owned exclusively by the room. Mutated only by the
/// dispatcher, exposed outward as snapshots.
#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Classroom {
    pub status: ClassStatus,
    pub start_time: u64,
    pub stop_time: u64,
    pub muted_audio: bool,
    pub muted_video: bool,
}

#[derive(Debug)]
pub(crate) enum RoomEvent {
    /// A member peer finished closing. Sent by the peer itself.
    PeerClosed(String),
    Closed,
}

/// A room accommodates the peers of one session and dispatches their
/// signaling requests. Each room owns one engine routing context; transports
/// created from it can exchange media with each other.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    router: Arc<dyn MediaRouter>,
    config: Arc<RoomConfig>,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    closed: AtomicBool,
    born_time: tokio::time::Instant,
    active_time: std::sync::Mutex<tokio::time::Instant>,
    classroom: std::sync::Mutex<Classroom>,
    event_sender: mpsc::UnboundedSender<RoomEvent>,
    server_event_sender: mpsc::UnboundedSender<ServerEvent>,
}

impl Room {
    /// Creates a room backed by a routing context scoped to the given engine
    /// worker, restricted to the codec allow-list. The durable record is
    /// loaded and its last-active stamp refreshed asynchronously.
    pub async fn create(
        engine: Arc<dyn MediaEngine>,
        room_id: String,
        store: Arc<dyn RoomStore>,
        config: Arc<RoomConfig>,
        server_event_sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Arc<Room>, Error> {
        tracing::info!("create() [roomId: {}]", room_id);

        let router = engine.create_router(&media_codecs()).await?;
        let (event_sender, event_receiver) = mpsc::unbounded_channel::<RoomEvent>();

        let room = Arc::new(Room {
            id: room_id.clone(),
            router,
            config,
            peers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            born_time: tokio::time::Instant::now(),
            active_time: std::sync::Mutex::new(tokio::time::Instant::now()),
            classroom: std::sync::Mutex::new(Classroom::default()),
            event_sender,
            server_event_sender,
        });

        {
            let room = room.clone();
            tokio::spawn(async move {
                Room::room_event_loop(room, event_receiver).await;
            });
        }

        tokio::spawn(async move {
            match store.find_room(&room_id).await {
                Ok(Some(mut record)) => {
                    record.last_active_time = unix_millis();
                    if let Err(err) = store.save_room(record).await {
                        tracing::warn!("Failed to save room record {}: {}", room_id, err);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("Failed to load room record {}: {}", room_id, err);
                }
            }
        });

        Ok(room)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn peer(&self, peer_id: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.lock().await;
        peers.get(peer_id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        let peers = self.peers.lock().await;
        peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        let peers = self.peers.lock().await;
        peers.is_empty()
    }

    /// Admits a peer into the room: membership insert plus the close cascade
    /// wiring. The peer tells this room when it has finished closing, and the
    /// rest of the room learns about the departure before the membership
    /// shrinks.
    pub async fn handle_peer(&self, peer: Arc<Peer>) {
        tracing::info!(
            "handle_peer() id: {}, address: {}",
            peer.id,
            peer.address()
        );
        peer.bind_room(self.event_sender.clone());
        let mut peers = self.peers.lock().await;
        peers.insert(peer.id.clone(), peer);
    }

    pub(crate) async fn room_event_loop(
        room: Arc<Room>,
        mut event_receiver: mpsc::UnboundedReceiver<RoomEvent>,
    ) {
        while let Some(event) = event_receiver.recv().await {
            match event {
                RoomEvent::PeerClosed(peer_id) => {
                    if room.closed() {
                        continue;
                    }
                    // The id may have been re-admitted on a fresh connection
                    // before this event was processed. A stale close event
                    // must not evict the open occupant.
                    let departed = {
                        let peers = room.peers.lock().await;
                        peers.get(&peer_id).is_some_and(|peer| peer.closed())
                    };
                    if !departed {
                        tracing::debug!(
                            "stale close event for {} in room {}, ignored",
                            peer_id,
                            room.id
                        );
                        continue;
                    }
                    tracing::info!("{} closed, room: {}", peer_id, room.id);
                    room.broadcast_except(
                        &peer_id,
                        notification::PEER_CLOSED,
                        json!({ "peerId": peer_id }),
                    )
                    .await;

                    let empty = {
                        let mut peers = room.peers.lock().await;
                        if peers.get(&peer_id).is_some_and(|peer| peer.closed()) {
                            peers.remove(&peer_id);
                        }
                        peers.is_empty()
                    };
                    if empty {
                        room.close().await;
                        break;
                    }
                }
                RoomEvent::Closed => break,
            }
        }
        tracing::debug!("Room {} event loop finished", room.id);
    }

    /// Idempotent. Closes every member peer, releases the routing context and
    /// announces the closure to the owning registry.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("close() room: {}", self.id);

        let peers = {
            let mut peers = self.peers.lock().await;
            std::mem::take(&mut *peers)
        };
        for peer in peers.into_values() {
            if !peer.closed() {
                peer.close().await;
            }
        }

        self.router.close();
        let _ = self
            .server_event_sender
            .send(ServerEvent::RoomClosed(self.id.clone()));
        let _ = self.event_sender.send(RoomEvent::Closed);
    }

    /// Periodic external trigger: a room that is empty, or that has seen no
    /// request for longer than the idle threshold, is closed.
    pub async fn check_deserted(&self) {
        if self.is_empty().await {
            tracing::info!("room {} is empty, now close it", self.id);
            self.close().await;
            return;
        }

        let last_active = self.active_time.lock().unwrap().elapsed();
        if last_active > self.config.idle_timeout {
            tracing::warn!(
                "room {} not active for {}s, now close it",
                self.id,
                last_active.as_secs()
            );
            self.close().await;
        }
    }

    fn set_active(&self) {
        let mut active_time = self.active_time.lock().unwrap();
        *active_time = tokio::time::Instant::now();
    }

    pub fn classroom(&self) -> Classroom {
        self.classroom.lock().unwrap().clone()
    }

    pub async fn status_report(&self) -> Value {
        let peer_ids: Vec<String> = {
            let peers = self.peers.lock().await;
            peers.keys().cloned().collect()
        };
        let classroom = serde_json::to_value(self.classroom()).unwrap_or_default();
        let mut report = json!({
            "id": self.id,
            "peers": peer_ids,
            "duration": self.born_time.elapsed().as_secs(),
            "lastActive": self.active_time.lock().unwrap().elapsed().as_secs(),
        });
        if let (Value::Object(report_map), Value::Object(classroom_map)) =
            (&mut report, classroom)
        {
            report_map.extend(classroom_map);
        }
        report
    }

    /// Sends a notification to every member except `except_peer_id`.
    pub(crate) async fn broadcast_except(&self, except_peer_id: &str, method: &str, data: Value) {
        let peers: Vec<Arc<Peer>> = {
            let peers = self.peers.lock().await;
            peers
                .values()
                .filter(|peer| peer.id != except_peer_id)
                .cloned()
                .collect()
        };
        for peer in peers {
            if !peer.closed() {
                peer.notify(method, data.clone());
            }
        }
    }

    /// Routes one inbound request to its handler. Replies exactly once: the
    /// returned value on success, an [`crate::error::ErrorReply`] derived
    /// from the error otherwise. Unknown methods keep the connection open.
    pub async fn handle_request(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        request: SignalingRequest,
    ) -> Result<Value, Error> {
        if self.closed() {
            return Err(Error::new_room(
                format!("room {} is closed", self.id),
                RoomErrorKind::RoomClosed,
            ));
        }
        self.set_active();
        tracing::debug!(
            "peer request [room: {}, method: {}, peerId: {}]",
            self.id,
            request.method,
            peer.id
        );

        let method = RequestMethod::from_str(&request.method).map_err(|_| {
            tracing::error!("unknown request.method \"{}\"", request.method);
            Error::new_signaling(
                format!("unknown request.method \"{}\"", request.method),
                SignalingErrorKind::UnknownMethod,
            )
        })?;
        let data = request.data;

        match method {
            RequestMethod::GetRouterRtpCapabilities => Ok(self.router.rtp_capabilities()),
            RequestMethod::Join => self.join(peer, data).await,
            RequestMethod::CreateWebRtcTransport => {
                self.create_webrtc_transport(peer, data).await
            }
            RequestMethod::ConnectWebRtcTransport => {
                self.connect_webrtc_transport(peer, data).await
            }
            RequestMethod::RestartIce => self.restart_ice(peer, data).await,
            RequestMethod::Produce => self.produce(peer, data).await,
            RequestMethod::CloseProducer => self.close_producer(peer, data).await,
            RequestMethod::PauseProducer => self.pause_producer(peer, data).await,
            RequestMethod::ResumeProducer => self.resume_producer(peer, data).await,
            RequestMethod::PauseConsumer => self.pause_consumer(peer, data).await,
            RequestMethod::ResumeConsumer => self.resume_consumer(peer, data).await,
            RequestMethod::RequestConsumerKeyFrame => {
                self.request_consumer_key_frame(peer, data).await
            }
            RequestMethod::GetProducerStats => self.get_producer_stats(peer, data).await,
            RequestMethod::GetTransportStats => self.get_transport_stats(peer, data).await,
            RequestMethod::GetConsumerStats => self.get_consumer_stats(peer, data).await,
            RequestMethod::ClosePeer => self.close_peer(peer, data).await,
            RequestMethod::ChatMessage => self.chat_message(peer, data).await,
            RequestMethod::SyncDocInfo => self.sync_doc_info(peer, data).await,
            RequestMethod::ClassStart => self.class_start(peer, data).await,
            RequestMethod::ClassStop => {
                self.stop_class(&peer.id).await;
                Ok(Value::Null)
            }
            RequestMethod::RoomInfo => Ok(serde_json::to_value(self.classroom())?),
            RequestMethod::ChangeRoler => self.change_roler(peer, data).await,
            RequestMethod::ConnectVideo => {
                self.broadcast_except(
                    &peer.id,
                    &RequestMethod::ConnectVideo.to_string(),
                    json!({ "peerId": peer.id }),
                )
                .await;
                Ok(Value::Null)
            }
            RequestMethod::DisconnectVideo => self.disconnect_video(peer, data).await,
            RequestMethod::ConnectApproval => self.connect_approval(peer, data).await,
            RequestMethod::SwitchComponent => {
                self.broadcast_except(&peer.id, &RequestMethod::SwitchComponent.to_string(), data)
                    .await;
                Ok(Value::Null)
            }
            RequestMethod::Muted => self.set_muted(peer, data, method, true).await,
            RequestMethod::Unmuted => self.set_muted(peer, data, method, false).await,
        }
    }

    async fn join(self: &Arc<Self>, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        if peer.joined() {
            return Ok(json!({ "joined": true }));
        }
        let join: JoinRequest = parse_data(RequestMethod::Join, data)?;
        peer.set_profile(
            join.roler,
            join.display_name.clone(),
            join.picture.clone(),
            join.platform.clone(),
            join.rtp_capabilities,
        );

        let others: Vec<Arc<Peer>> = {
            let peers = self.peers.lock().await;
            peers
                .values()
                .filter(|other| other.joined() && other.id != peer.id)
                .cloned()
                .collect()
        };

        let mut peer_infos = Vec::with_capacity(others.len());
        for other in &others {
            peer_infos.push(other.peer_info());
            for producer in other.producers().await {
                let room = self.clone();
                let consumer_peer = peer.clone();
                let producer_peer = other.clone();
                tokio::spawn(async move {
                    room.link_consumer(consumer_peer, producer_peer, producer)
                        .await;
                });
            }
        }

        self.broadcast_except(
            &peer.id,
            notification::NEW_PEER,
            serde_json::to_value(peer.peer_info())?,
        )
        .await;

        tracing::debug!(
            "peer joined [peer: {}, displayName: {}, roler: {}, platform: {}]",
            peer.id,
            join.display_name,
            join.roler,
            join.platform
        );
        peer.set_joined();

        Ok(json!({ "peers": peer_infos, "joined": false }))
    }

    async fn create_webrtc_transport(
        &self,
        peer: &Arc<Peer>,
        data: Value,
    ) -> Result<Value, Error> {
        let req: CreateWebRtcTransportRequest =
            parse_data(RequestMethod::CreateWebRtcTransport, data)?;
        let options = WebRtcTransportOptions {
            enable_udp: !req.force_tcp,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: self
                .config
                .webrtc_transport
                .initial_available_outgoing_bitrate,
            producing: req.producing,
            consuming: req.consuming,
        };

        let transport = self.router.create_webrtc_transport(options).await?;
        if peer.closed() || self.closed() {
            transport.close().await;
            return Err(Error::new_peer(
                format!("peer {} closed during transport setup", peer.id),
                PeerErrorKind::PeerClosed,
            ));
        }
        peer.add_transport(transport.clone(), req.consuming).await;

        if let Some(bitrate) = self.config.webrtc_transport.max_incoming_bitrate {
            // Auxiliary tuning, a failure must not fail the request.
            if let Err(err) = transport.set_max_incoming_bitrate(bitrate).await {
                tracing::warn!(
                    "Failed to set max incoming bitrate on {}: {}",
                    transport.id(),
                    err
                );
            }
        }

        Ok(json!({
            "id": transport.id(),
            "iceParameters": transport.ice_parameters(),
            "iceCandidates": transport.ice_candidates(),
            "dtlsParameters": transport.dtls_parameters(),
        }))
    }

    async fn connect_webrtc_transport(
        &self,
        peer: &Arc<Peer>,
        data: Value,
    ) -> Result<Value, Error> {
        let req: ConnectWebRtcTransportRequest =
            parse_data(RequestMethod::ConnectWebRtcTransport, data)?;
        let transport = peer.transport(&req.transport_id).await.ok_or_else(|| {
            Error::new_peer(
                format!("transport with id \"{}\" not found", req.transport_id),
                PeerErrorKind::TransportNotFound,
            )
        })?;
        transport.connect(req.dtls_parameters).await?;
        Ok(Value::Null)
    }

    async fn restart_ice(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: TransportRequest = parse_data(RequestMethod::RestartIce, data)?;
        let transport = peer.transport(&req.transport_id).await.ok_or_else(|| {
            Error::new_peer(
                format!("transport with id \"{}\" not found", req.transport_id),
                PeerErrorKind::TransportNotFound,
            )
        })?;
        let ice_parameters = transport.restart_ice().await?;
        Ok(json!({ "iceParameters": ice_parameters }))
    }

    async fn produce(self: &Arc<Self>, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ProduceRequest = parse_data(RequestMethod::Produce, data)?;
        let Some(transport) = peer.transport(&req.transport_id).await else {
            tracing::error!("transport with id \"{}\" not found", req.transport_id);
            return Ok(Value::Null);
        };

        let mut app_data = if req.app_data.is_object() {
            req.app_data
        } else {
            json!({})
        };
        if let Value::Object(map) = &mut app_data {
            map.insert("peerId".to_string(), json!(peer.id));
        }

        let producer = transport
            .produce(ProduceOptions {
                kind: req.kind,
                rtp_parameters: req.rtp_parameters,
                app_data,
            })
            .await?;

        if peer.closed() || self.closed() {
            producer.close().await;
            return Ok(Value::Null);
        }
        peer.add_producer(producer.clone()).await;
        tracing::info!("produce, peer: {}, producerId: {}", peer.id, producer.id());

        let others: Vec<Arc<Peer>> = {
            let peers = self.peers.lock().await;
            peers
                .values()
                .filter(|other| other.joined() && other.id != peer.id)
                .cloned()
                .collect()
        };
        for other in others {
            let room = self.clone();
            let producer_peer = peer.clone();
            let producer = producer.clone();
            tokio::spawn(async move {
                room.link_consumer(other, producer_peer, producer).await;
            });
        }

        Ok(json!({ "id": producer.id() }))
    }

    async fn close_producer(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ProducerRequest = parse_data(RequestMethod::CloseProducer, data)?;
        let Some(producer) = peer.producer(&req.producer_id).await else {
            tracing::error!("producer with id \"{}\" not found", req.producer_id);
            return Ok(Value::Null);
        };
        tracing::info!(
            "closeProducer, peer: {}, producerId: {}",
            peer.id,
            producer.id()
        );
        peer.remove_producer(&producer.id()).await;
        Ok(Value::Null)
    }

    async fn pause_producer(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ProducerRequest = parse_data(RequestMethod::PauseProducer, data)?;
        let producer = peer.producer(&req.producer_id).await.ok_or_else(|| {
            Error::new_peer(
                format!("producer with id \"{}\" not found", req.producer_id),
                PeerErrorKind::ProducerNotFound,
            )
        })?;
        producer.pause().await?;
        Ok(Value::Null)
    }

    async fn resume_producer(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ProducerRequest = parse_data(RequestMethod::ResumeProducer, data)?;
        let producer = peer.producer(&req.producer_id).await.ok_or_else(|| {
            Error::new_peer(
                format!("producer with id \"{}\" not found", req.producer_id),
                PeerErrorKind::ProducerNotFound,
            )
        })?;
        producer.resume().await?;
        Ok(Value::Null)
    }

    async fn pause_consumer(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ConsumerRequest = parse_data(RequestMethod::PauseConsumer, data)?;
        let consumer = peer.consumer(&req.consumer_id).await.ok_or_else(|| {
            Error::new_peer(
                format!("consumer with id \"{}\" not found", req.consumer_id),
                PeerErrorKind::ConsumerNotFound,
            )
        })?;
        consumer.pause().await?;
        Ok(Value::Null)
    }

    async fn resume_consumer(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ConsumerRequest = parse_data(RequestMethod::ResumeConsumer, data)?;
        let consumer = peer.consumer(&req.consumer_id).await.ok_or_else(|| {
            Error::new_peer(
                format!("consumer with id \"{}\" not found", req.consumer_id),
                PeerErrorKind::ConsumerNotFound,
            )
        })?;
        consumer.resume().await?;
        Ok(Value::Null)
    }

    async fn request_consumer_key_frame(
        &self,
        peer: &Arc<Peer>,
        data: Value,
    ) -> Result<Value, Error> {
        let req: ConsumerRequest = parse_data(RequestMethod::RequestConsumerKeyFrame, data)?;
        let consumer = peer.consumer(&req.consumer_id).await.ok_or_else(|| {
            Error::new_peer(
                format!("consumer with id \"{}\" not found", req.consumer_id),
                PeerErrorKind::ConsumerNotFound,
            )
        })?;
        consumer.request_key_frame().await?;
        Ok(Value::Null)
    }

    async fn get_producer_stats(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ProducerRequest = parse_data(RequestMethod::GetProducerStats, data)?;
        match peer.producer(&req.producer_id).await {
            None => {
                tracing::error!("producer with id \"{}\" not found", req.producer_id);
                Ok(json!({ "closed": true }))
            }
            Some(producer) => {
                let stats = producer.get_stats().await?;
                Ok(json!({ "closed": producer.closed(), "stats": stats }))
            }
        }
    }

    async fn get_transport_stats(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: TransportRequest = parse_data(RequestMethod::GetTransportStats, data)?;
        match peer.transport(&req.transport_id).await {
            None => {
                tracing::warn!("transport with id \"{}\" not found", req.transport_id);
                Ok(json!({ "closed": true }))
            }
            Some(transport) => {
                let stats = transport.get_stats().await?;
                Ok(json!({ "closed": transport.closed(), "stats": stats }))
            }
        }
    }

    async fn get_consumer_stats(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ConsumerRequest = parse_data(RequestMethod::GetConsumerStats, data)?;
        match peer.consumer(&req.consumer_id).await {
            None => {
                tracing::error!("consumer with id \"{}\" not found", req.consumer_id);
                Ok(json!({ "closed": true }))
            }
            Some(consumer) => {
                let stats = consumer.get_stats().await?;
                Ok(json!({ "closed": consumer.closed(), "stats": stats }))
            }
        }
    }

    async fn close_peer(self: &Arc<Self>, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ClosePeerRequest = parse_data(RequestMethod::ClosePeer, data)?;
        tracing::info!("closePeer, peer: {}, stopClass: {}", peer.id, req.stop_class);

        // The reply has to leave before the connection is torn down.
        let room = self.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            peer.close().await;
            if req.stop_class {
                room.stop_class(&peer.id).await;
            }
        });
        Ok(Value::Null)
    }

    async fn chat_message(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: TargetedRequest = parse_data(RequestMethod::ChatMessage, data.clone())?;
        let method = RequestMethod::ChatMessage.to_string();
        if req.to == "all" {
            self.broadcast_except(&peer.id, &method, data).await;
        } else if let Some(to_peer) = self.peer(&req.to).await {
            to_peer.notify(&method, data);
        }
        Ok(Value::Null)
    }

    async fn sync_doc_info(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: SyncDocInfoRequest = parse_data(RequestMethod::SyncDocInfo, data)?;
        self.broadcast_except(
            &peer.id,
            &RequestMethod::SyncDocInfo.to_string(),
            json!({ "peerId": peer.id, "info": req.info }),
        )
        .await;
        Ok(Value::Null)
    }

    async fn class_start(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ClassStartRequest = parse_data(RequestMethod::ClassStart, data)?;
        {
            let mut classroom = self.classroom.lock().unwrap();
            classroom.status = ClassStatus::Started;
            classroom.start_time = unix_millis();
        }
        self.broadcast_except(
            &peer.id,
            &RequestMethod::ClassStart.to_string(),
            json!({ "roomId": req.room_id }),
        )
        .await;
        Ok(Value::Null)
    }

    async fn stop_class(&self, except_peer_id: &str) {
        {
            let mut classroom = self.classroom.lock().unwrap();
            classroom.status = ClassStatus::Stopped;
            classroom.stop_time = unix_millis();
        }
        self.broadcast_except(
            except_peer_id,
            &RequestMethod::ClassStop.to_string(),
            json!({ "roomId": self.id }),
        )
        .await;
    }

    async fn change_roler(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ChangeRolerRequest = parse_data(RequestMethod::ChangeRoler, data.clone())?;
        peer.set_roler(req.roler);
        self.broadcast_except(&peer.id, &RequestMethod::ChangeRoler.to_string(), data)
            .await;
        Ok(Value::Null)
    }

    async fn disconnect_video(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: DisconnectVideoRequest = parse_data(RequestMethod::DisconnectVideo, data)?;
        self.broadcast_except(
            &peer.id,
            &RequestMethod::DisconnectVideo.to_string(),
            json!({ "toPeer": req.to_peer }),
        )
        .await;
        Ok(Value::Null)
    }

    async fn connect_approval(&self, peer: &Arc<Peer>, data: Value) -> Result<Value, Error> {
        let req: ConnectApprovalRequest = parse_data(RequestMethod::ConnectApproval, data)?;
        self.broadcast_except(
            &peer.id,
            &RequestMethod::ConnectApproval.to_string(),
            json!({
                "peerId": peer.id,
                "toPeer": req.to_peer,
                "approval": req.approval,
            }),
        )
        .await;
        Ok(Value::Null)
    }

    /// `muted` and `unmuted`. Targeting `all` mutates the room-level flags
    /// and broadcasts; targeting a single peer only delivers.
    async fn set_muted(
        &self,
        peer: &Arc<Peer>,
        data: Value,
        method: RequestMethod,
        muted: bool,
    ) -> Result<Value, Error> {
        let req: MutedRequest = parse_data(method, data.clone())?;
        if req.to == "all" {
            {
                let mut classroom = self.classroom.lock().unwrap();
                match req.kind {
                    MuteKind::Audio => classroom.muted_audio = muted,
                    MuteKind::Video => classroom.muted_video = muted,
                }
            }
            self.broadcast_except(&peer.id, &method.to_string(), data)
                .await;
        } else if let Some(to_peer) = self.peer(&req.to).await {
            to_peer.notify(&method.to_string(), data);
        }
        Ok(Value::Null)
    }

    /// Creates a consumer on `consumer_peer` for a producer owned by
    /// `producer_peer` and pushes the descriptor to the consuming client.
    /// Invoked for every producer of every other joined peer when a peer
    /// joins, and against every other peer when a peer produces.
    pub(crate) async fn link_consumer(
        self: &Arc<Self>,
        consumer_peer: Arc<Peer>,
        producer_peer: Arc<Peer>,
        producer: Arc<dyn MediaProducer>,
    ) {
        tracing::debug!(
            "link_consumer() [consumerPeer: {}, producerPeer: {}, producer: {}]",
            consumer_peer.id,
            producer_peer.id,
            producer.id()
        );

        let Some(rtp_capabilities) = consumer_peer.rtp_capabilities() else {
            return;
        };
        if !self
            .router
            .can_consume(&producer.id(), &rtp_capabilities)
            .await
        {
            return;
        }

        // Must take the transport the remote peer is using for consuming.
        let Some(transport) = consumer_peer.consumer_transport().await else {
            tracing::warn!("link_consumer() | transport for consuming not found");
            return;
        };

        // Video starts paused until the receiving client acknowledges the
        // descriptor, so no frames are wasted on a renderer that isn't ready.
        let paused = producer.kind() == MediaKind::Video;
        let consumer = match transport
            .consume(ConsumeOptions {
                producer_id: producer.id(),
                rtp_capabilities,
                paused,
            })
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                tracing::warn!("link_consumer() | {}", err);
                return;
            }
        };

        if consumer_peer.closed() || self.closed() {
            consumer.close().await;
            return;
        }

        let task = self.spawn_consumer_forwarding(consumer_peer.clone(), consumer.clone());
        consumer_peer.add_consumer(consumer.clone(), task).await;

        let descriptor = json!({
            "peerId": producer_peer.id,
            "kind": producer.kind(),
            "producerId": producer.id(),
            "id": consumer.id(),
            "rtpParameters": consumer.rtp_parameters(),
            "type": consumer.consumer_type(),
            "appData": producer.app_data(),
            "producerPaused": consumer.producer_paused(),
        });
        match consumer_peer
            .request(notification::NEW_CONSUMER, descriptor)
            .await
        {
            Ok(_) => {
                if producer.kind() == MediaKind::Video {
                    if let Err(err) = consumer.resume().await {
                        tracing::warn!("link_consumer() | {}", err);
                    }
                }
                consumer_peer.notify(
                    notification::CONSUMER_SCORE,
                    json!({ "consumerId": consumer.id(), "score": consumer.score() }),
                );
            }
            Err(err) => {
                // No rollback: the consumer stays registered and paused.
                tracing::warn!("link_consumer() | {}", err);
            }
        }
    }

    /// One task per consumer: forwards engine lifecycle events to the
    /// consuming client and pushes the score on a fixed period.
    fn spawn_consumer_forwarding(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        consumer: Arc<dyn MediaConsumer>,
    ) -> JoinHandle<()> {
        let score_interval = self.config.score_interval;
        let events = consumer.take_events();
        tokio::spawn(async move {
            let consumer_id = consumer.id();
            let Some(mut events) = events else {
                tracing::warn!("Consumer {} event stream already taken", consumer_id);
                return;
            };
            // The score cadence is independent of event traffic.
            let mut score_timer = tokio::time::interval_at(
                tokio::time::Instant::now() + score_interval,
                score_interval,
            );

            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(ConsumerEvent::TransportClose) => {
                                // The client already knows its transport died.
                                peer.remove_consumer(&consumer_id).await;
                                break;
                            }
                            Some(ConsumerEvent::ProducerClose) => {
                                peer.remove_consumer(&consumer_id).await;
                                peer.notify(
                                    notification::CONSUMER_CLOSED,
                                    json!({ "consumerId": consumer_id }),
                                );
                                break;
                            }
                            Some(ConsumerEvent::ProducerPause) => {
                                peer.notify(
                                    notification::CONSUMER_PAUSED,
                                    json!({ "consumerId": consumer_id }),
                                );
                            }
                            Some(ConsumerEvent::ProducerResume) => {
                                peer.notify(
                                    notification::CONSUMER_RESUMED,
                                    json!({ "consumerId": consumer_id }),
                                );
                            }
                            Some(ConsumerEvent::Score(score)) => {
                                peer.notify(
                                    notification::CONSUMER_SCORE,
                                    json!({ "consumerId": consumer_id, "score": score }),
                                );
                            }
                            Some(ConsumerEvent::LayersChange(layers)) => {
                                peer.notify(
                                    notification::CONSUMER_LAYERS_CHANGED,
                                    json!({
                                        "consumerId": consumer_id,
                                        "spatialLayer": layers.map(|l| l.spatial_layer),
                                        "temporalLayer": layers.map(|l| l.temporal_layer),
                                    }),
                                );
                            }
                            None => break,
                        }
                    }
                    _ = score_timer.tick() => {
                        peer.notify(
                            notification::CONSUMER_SCORE,
                            json!({ "consumerId": consumer_id, "score": consumer.score() }),
                        );
                    }
                }
            }
            tracing::debug!("Consumer {} forwarding loop finished", consumer_id);
        })
    }

    /// Admits a brand-new connection as a peer, or re-attaches it to an
    /// existing peer identity after a transient disconnect.
    pub async fn admit(
        self: &Arc<Self>,
        peer_id: String,
        connection: Arc<dyn SignalingConnection>,
    ) -> Arc<Peer> {
        if let Some(existing) = self.peer(&peer_id).await {
            if !existing.closed() {
                existing.handle_reconnect(connection);
                return existing;
            }
        }
        let peer = Peer::new(peer_id, connection, self.config.clone());
        self.handle_peer(peer.clone()).await;
        peer
    }

    pub(crate) fn config(&self) -> Arc<RoomConfig> {
        self.config.clone()
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        tracing::debug!("Room {} is dropped", self.id);
    }
}
