use serde::Serialize;
use strum_macros::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("room error: {0}, kind: {1}")]
    RoomError(String, RoomErrorKind),
    #[error("peer error: {0}, kind: {1}")]
    PeerError(String, PeerErrorKind),
    #[error("signaling error: {0}, kind: {1}")]
    SignalingError(String, SignalingErrorKind),
    #[error("media engine error: {0}")]
    EngineError(String),
}

impl Error {
    pub fn new_room(message: String, kind: RoomErrorKind) -> Error {
        Error::RoomError(message, kind)
    }

    pub fn new_peer(message: String, kind: PeerErrorKind) -> Error {
        Error::PeerError(message, kind)
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Error {
        Error::SignalingError(message, kind)
    }

    pub fn new_engine(message: String) -> Error {
        Error::EngineError(message)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SignalingError(err.to_string(), SignalingErrorKind::InvalidPayload)
    }
}

#[derive(Debug, Display, PartialEq, Eq)]
pub enum RoomErrorKind {
    RoomClosed,
}

#[derive(Debug, Display, PartialEq, Eq)]
pub enum PeerErrorKind {
    TransportNotFound,
    ProducerNotFound,
    ConsumerNotFound,
    PeerClosed,
}

#[derive(Debug, Display, PartialEq, Eq)]
pub enum SignalingErrorKind {
    UnknownMethod,
    InvalidPayload,
    RequestTimeout,
    ConnectionClosed,
}

/// Error form delivered back to the client when a request fails.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: u16,
    pub message: String,
}

impl From<&Error> for ErrorReply {
    fn from(error: &Error) -> Self {
        let code = match error {
            Error::SignalingError(_, SignalingErrorKind::UnknownMethod) => 500,
            _ => 400,
        };
        ErrorReply {
            code,
            message: error.to_string(),
        }
    }
}
