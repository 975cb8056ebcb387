use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::engine::MediaKind;
use crate::error::{Error, SignalingErrorKind};

/// Inbound signaling envelope: `{method, data}` plus an implicit completion
/// slot filled exactly once by the dispatcher's return value.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalingRequest {
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl SignalingRequest {
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }
}

/// Every request method a room dispatches. Wire spellings follow the original
/// protocol, including `changeRoler`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RequestMethod {
    GetRouterRtpCapabilities,
    Join,
    CreateWebRtcTransport,
    ConnectWebRtcTransport,
    RestartIce,
    Produce,
    CloseProducer,
    PauseProducer,
    ResumeProducer,
    PauseConsumer,
    ResumeConsumer,
    RequestConsumerKeyFrame,
    GetProducerStats,
    GetTransportStats,
    GetConsumerStats,
    ClosePeer,
    ChatMessage,
    SyncDocInfo,
    ClassStart,
    ClassStop,
    RoomInfo,
    ChangeRoler,
    ConnectVideo,
    DisconnectVideo,
    ConnectApproval,
    SwitchComponent,
    Muted,
    Unmuted,
}

/// Notification methods pushed from the server. `newConsumer` is the only one
/// sent as a timed request instead.
pub mod notification {
    pub const NEW_PEER: &str = "newPeer";
    pub const PEER_CLOSED: &str = "peerClosed";
    pub const NEW_CONSUMER: &str = "newConsumer";
    pub const CONSUMER_CLOSED: &str = "consumerClosed";
    pub const CONSUMER_PAUSED: &str = "consumerPaused";
    pub const CONSUMER_RESUMED: &str = "consumerResumed";
    pub const CONSUMER_SCORE: &str = "consumerScore";
    pub const CONSUMER_LAYERS_CHANGED: &str = "consumerLayersChanged";
}

/// Participant role inside a classroom.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Presenter,
    #[default]
    Attendee,
    Assistant,
}

/// Media dimension addressed by `muted`/`unmuted`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MuteKind {
    Audio,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassStatus {
    #[default]
    Stopped,
    Started,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub roler: Role,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub picture: String,
    #[serde(default)]
    pub platform: String,
    /// Absent for receive-incapable clients; such a peer joins but is never
    /// linked as a consumer.
    #[serde(default)]
    pub rtp_capabilities: Option<Value>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebRtcTransportRequest {
    #[serde(default)]
    pub force_tcp: bool,
    #[serde(default)]
    pub producing: bool,
    #[serde(default)]
    pub consuming: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWebRtcTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransportRequest {
    pub transport_id: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRequest {
    pub producer_id: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRequest {
    pub consumer_id: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClosePeerRequest {
    #[serde(default)]
    pub stop_class: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TargetedRequest {
    pub to: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MutedRequest {
    pub to: String,
    pub kind: MuteKind,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncDocInfoRequest {
    #[serde(default)]
    pub info: Value,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClassStartRequest {
    pub room_id: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRolerRequest {
    pub roler: Role,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectVideoRequest {
    #[serde(default)]
    pub to_peer: Value,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectApprovalRequest {
    #[serde(default)]
    pub to_peer: Value,
    #[serde(default)]
    pub approval: Value,
}

/// Deserializes a request payload, mapping malformed data to a signaling
/// error reply instead of a dispatcher fault.
pub(crate) fn parse_data<T: DeserializeOwned>(method: RequestMethod, data: Value) -> Result<T, Error> {
    serde_json::from_value(data).map_err(|err| {
        Error::new_signaling(
            format!("invalid payload for \"{}\": {}", method, err),
            SignalingErrorKind::InvalidPayload,
        )
    })
}
