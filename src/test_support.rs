//! In-process fakes for the engine and signaling seams, shared by the unit
//! tests. The engine state records every close per resource id so tests can
//! assert exactly-once release.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::MediaCodec;
use crate::engine::{
    ConsumeOptions, ConsumerEvent, MediaConsumer, MediaEngine, MediaKind, MediaProducer,
    MediaRouter, MediaTransport, ProduceOptions, WebRtcTransportOptions,
};
use crate::error::Error;
use crate::signaling::SignalingConnection;

#[derive(Debug, Default)]
pub(crate) struct MockEngineState {
    transport_closes: Mutex<HashMap<String, usize>>,
    producer_closes: Mutex<HashMap<String, usize>>,
    consumer_closes: Mutex<HashMap<String, usize>>,
    consumer_resumes: Mutex<HashMap<String, usize>>,
    consumer_event_senders: Mutex<HashMap<String, mpsc::UnboundedSender<ConsumerEvent>>>,
    deny_consume: AtomicBool,
}

impl MockEngineState {
    pub(crate) fn new() -> Arc<MockEngineState> {
        Arc::new(MockEngineState::default())
    }

    pub(crate) fn engine(self: &Arc<Self>) -> Arc<dyn MediaEngine> {
        Arc::new(MockEngine {
            state: self.clone(),
        })
    }

    pub(crate) fn transport_closes(&self, id: &str) -> usize {
        *self.transport_closes.lock().unwrap().get(id).unwrap_or(&0)
    }

    pub(crate) fn producer_closes(&self, id: &str) -> usize {
        *self.producer_closes.lock().unwrap().get(id).unwrap_or(&0)
    }

    pub(crate) fn consumer_closes(&self, id: &str) -> usize {
        *self.consumer_closes.lock().unwrap().get(id).unwrap_or(&0)
    }

    pub(crate) fn consumer_resumes(&self, id: &str) -> usize {
        *self.consumer_resumes.lock().unwrap().get(id).unwrap_or(&0)
    }

    /// Injects engine events into a consumer's forwarding stream.
    pub(crate) fn consumer_events(&self, id: &str) -> Option<mpsc::UnboundedSender<ConsumerEvent>> {
        self.consumer_event_senders.lock().unwrap().get(id).cloned()
    }

    pub(crate) fn set_deny_consume(&self, deny: bool) {
        self.deny_consume.store(deny, Ordering::SeqCst);
    }

    fn record(map: &Mutex<HashMap<String, usize>>, id: &str) {
        *map.lock().unwrap().entry(id.to_string()).or_insert(0) += 1;
    }
}

#[derive(Debug)]
struct MockEngine {
    state: Arc<MockEngineState>,
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_router(&self, _codecs: &[MediaCodec]) -> Result<Arc<dyn MediaRouter>, Error> {
        Ok(MockRouter::new(self.state.clone()))
    }
}

#[derive(Debug)]
pub(crate) struct MockRouter {
    id: String,
    state: Arc<MockEngineState>,
}

impl MockRouter {
    pub(crate) fn new(state: Arc<MockEngineState>) -> Arc<MockRouter> {
        Arc::new(MockRouter {
            id: Uuid::new_v4().to_string(),
            state,
        })
    }
}

#[async_trait]
impl MediaRouter for MockRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        json!({ "codecs": [], "headerExtensions": [] })
    }

    async fn can_consume(&self, _producer_id: &str, _rtp_capabilities: &Value) -> bool {
        !self.state.deny_consume.load(Ordering::SeqCst)
    }

    async fn create_webrtc_transport(
        &self,
        _options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, Error> {
        Ok(Arc::new(MockTransport {
            id: Uuid::new_v4().to_string(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) {}
}

#[derive(Debug)]
struct MockTransport {
    id: String,
    state: Arc<MockEngineState>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ice_parameters(&self) -> Value {
        json!({ "usernameFragment": "mock", "password": "mock", "iceLite": true })
    }

    fn ice_candidates(&self) -> Value {
        json!([{ "ip": "127.0.0.1", "port": 40000, "protocol": "udp" }])
    }

    fn dtls_parameters(&self) -> Value {
        json!({ "role": "auto", "fingerprints": [] })
    }

    async fn connect(&self, _dtls_parameters: Value) -> Result<(), Error> {
        Ok(())
    }

    async fn restart_ice(&self) -> Result<Value, Error> {
        Ok(json!({ "usernameFragment": "mock2", "password": "mock2", "iceLite": true }))
    }

    async fn set_max_incoming_bitrate(&self, _bitrate: u32) -> Result<(), Error> {
        Ok(())
    }

    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn MediaProducer>, Error> {
        Ok(Arc::new(MockProducer {
            id: Uuid::new_v4().to_string(),
            kind: options.kind,
            app_data: options.app_data,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn MediaConsumer>, Error> {
        let id = Uuid::new_v4().to_string();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        self.state
            .consumer_event_senders
            .lock()
            .unwrap()
            .insert(id.clone(), event_sender);
        Ok(Arc::new(MockConsumer {
            id,
            producer_id: options.producer_id,
            state: self.state.clone(),
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            events: Mutex::new(Some(event_receiver)),
        }))
    }

    async fn get_stats(&self) -> Result<Value, Error> {
        Ok(json!([{ "type": "webrtc-transport", "transportId": self.id }]))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        MockEngineState::record(&self.state.transport_closes, &self.id);
    }
}

#[derive(Debug)]
struct MockProducer {
    id: String,
    kind: MediaKind,
    app_data: Value,
    state: Arc<MockEngineState>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for MockProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    async fn pause(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn get_stats(&self) -> Result<Value, Error> {
        Ok(json!([{ "type": "producer", "producerId": self.id }]))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        MockEngineState::record(&self.state.producer_closes, &self.id);
    }
}

#[derive(Debug)]
struct MockConsumer {
    id: String,
    producer_id: String,
    state: Arc<MockEngineState>,
    paused: AtomicBool,
    closed: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConsumerEvent>>>,
}

#[async_trait]
impl MediaConsumer for MockConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn rtp_parameters(&self) -> Value {
        json!({ "codecs": [], "encodings": [] })
    }

    fn consumer_type(&self) -> String {
        "simple".to_string()
    }

    fn producer_paused(&self) -> bool {
        false
    }

    fn score(&self) -> Value {
        json!({ "producerScore": 10, "score": 10 })
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConsumerEvent>> {
        self.events.lock().unwrap().take()
    }

    async fn pause(&self) -> Result<(), Error> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), Error> {
        self.paused.store(false, Ordering::SeqCst);
        MockEngineState::record(&self.state.consumer_resumes, &self.id);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn get_stats(&self) -> Result<Value, Error> {
        Ok(json!([{ "type": "consumer", "consumerId": self.id }]))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        MockEngineState::record(&self.state.consumer_closes, &self.id);
    }
}

/// Reply behavior of a [`MockConnection`] for inbound `request()` calls.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    Ok(Value),
    /// Never answers; lets callers exercise the request timeout.
    Hang,
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    id: String,
    connected: AtomicBool,
    notifications: Mutex<Vec<(String, Value)>>,
    requests: Mutex<Vec<(String, Value)>>,
    reply: Mutex<MockReply>,
}

impl MockConnection {
    pub(crate) fn new(id: &str) -> Arc<MockConnection> {
        Arc::new(MockConnection {
            id: id.to_string(),
            connected: AtomicBool::new(true),
            notifications: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            reply: Mutex::new(MockReply::Ok(json!({}))),
        })
    }

    pub(crate) fn notifications(&self) -> Vec<(String, Value)> {
        self.notifications.lock().unwrap().clone()
    }

    pub(crate) fn notified(&self, method: &str) -> Vec<Value> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub(crate) fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn set_reply(&self, reply: MockReply) {
        *self.reply.lock().unwrap() = reply;
    }

    /// Simulates the transport dropping without a client-initiated close.
    pub(crate) fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub(crate) fn restore_link(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingConnection for MockConnection {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn remote_address(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn notify(&self, method: &str, data: Value) {
        self.notifications
            .lock()
            .unwrap()
            .push((method.to_string(), data));
    }

    async fn request(&self, method: &str, data: Value) -> Result<Value, Error> {
        let reply = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((method.to_string(), data));
            self.reply.lock().unwrap().clone()
        };
        match reply {
            MockReply::Ok(value) => Ok(value),
            MockReply::Hang => std::future::pending().await,
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
