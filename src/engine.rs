use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;
use tokio::sync::mpsc;

use crate::error::Error;

/// Media kind of a producer or consumer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Worker-scoped entry point of the media engine. One engine usually wraps
/// one media worker process.
#[async_trait]
pub trait MediaEngine: Send + Sync + Debug {
    /// Obtains a routing context restricted to the given codec allow-list.
    async fn create_router(
        &self,
        codecs: &[crate::config::MediaCodec],
    ) -> Result<Arc<dyn MediaRouter>, Error>;
}

/// Routing context owned by a single room. Transports created from the same
/// router can exchange media with each other.
#[async_trait]
pub trait MediaRouter: Send + Sync + Debug {
    fn id(&self) -> String;
    /// The receive capability set clients negotiate against.
    fn rtp_capabilities(&self) -> Value;
    /// Whether a peer with the declared capabilities can consume the producer.
    async fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;
    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, Error>;
    fn close(&self);
}

/// Options for [`MediaRouter::create_webrtc_transport`].
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub producing: bool,
    pub consuming: bool,
}

/// Options for [`MediaTransport::produce`].
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

/// Options for [`MediaTransport::consume`].
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: String,
    pub rtp_capabilities: Value,
    pub paused: bool,
}

/// An engine-managed ICE/DTLS endpoint. Parameter blobs are opaque to this
/// crate and travel as JSON between engine and client.
#[async_trait]
pub trait MediaTransport: Send + Sync + Debug {
    fn id(&self) -> String;
    fn closed(&self) -> bool;
    fn ice_parameters(&self) -> Value;
    fn ice_candidates(&self) -> Value;
    fn dtls_parameters(&self) -> Value;
    /// Completes the DTLS handshake with the client-supplied parameters.
    async fn connect(&self, dtls_parameters: Value) -> Result<(), Error>;
    async fn restart_ice(&self) -> Result<Value, Error>;
    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), Error>;
    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn MediaProducer>, Error>;
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn MediaConsumer>, Error>;
    async fn get_stats(&self) -> Result<Value, Error>;
    /// Close must be idempotent.
    async fn close(&self);
}

/// A peer's outbound media stream registered with the engine.
#[async_trait]
pub trait MediaProducer: Send + Sync + Debug {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn closed(&self) -> bool;
    fn app_data(&self) -> Value;
    async fn pause(&self) -> Result<(), Error>;
    async fn resume(&self) -> Result<(), Error>;
    async fn get_stats(&self) -> Result<Value, Error>;
    /// Close must be idempotent.
    async fn close(&self);
}

/// A receiving peer's bound endpoint for another peer's producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync + Debug {
    fn id(&self) -> String;
    fn producer_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn closed(&self) -> bool;
    fn rtp_parameters(&self) -> Value;
    /// Engine-specific consumer type, e.g. "simple" or "simulcast".
    fn consumer_type(&self) -> String;
    fn producer_paused(&self) -> bool;
    fn score(&self) -> Value;
    /// Hands out the engine event stream for this consumer. Yields `Some`
    /// exactly once; the stream ends when the engine closes the consumer.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConsumerEvent>>;
    async fn pause(&self) -> Result<(), Error>;
    async fn resume(&self) -> Result<(), Error>;
    async fn request_key_frame(&self) -> Result<(), Error>;
    async fn get_stats(&self) -> Result<Value, Error>;
    /// Close must be idempotent.
    async fn close(&self);
}

/// Spatial/temporal layer pair reported by [`ConsumerEvent::LayersChange`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: u8,
}

/// Engine-level events a consumer emits during its lifetime.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    TransportClose,
    ProducerClose,
    ProducerPause,
    ProducerResume,
    Score(Value),
    LayersChange(Option<ConsumerLayers>),
}
