use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, SignalingErrorKind};

/// Bidirectional signaling channel of a single connected client.
///
/// An implementation wraps whatever socket layer the server uses and carries
/// `{method, data}` envelopes in both directions. Inbound requests are routed
/// by the server binding into [`crate::room::Room::handle_request`]; this
/// trait covers the outbound direction.
#[async_trait]
pub trait SignalingConnection: Send + Sync + Debug {
    /// Connection id, unique per underlying socket.
    fn id(&self) -> String;
    fn remote_address(&self) -> String;
    /// Whether the underlying socket is currently alive. Drives the
    /// reconnection grace checks.
    fn connected(&self) -> bool;
    /// Fire-and-forget notification.
    fn notify(&self, method: &str, data: Value);
    /// Sends a request and waits for the client's reply. Callers bound the
    /// wait with [`timed_request`].
    async fn request(&self, method: &str, data: Value) -> Result<Value, Error>;
    /// Tears down the underlying socket.
    fn disconnect(&self);
}

/// Request-with-response bounded by a timeout. Whichever finishes first wins,
/// the reply and the timer cannot both surface.
pub async fn timed_request(
    connection: &Arc<dyn SignalingConnection>,
    method: &str,
    data: Value,
    timeout: Duration,
) -> Result<Value, Error> {
    if !connection.connected() {
        return Err(Error::new_signaling(
            format!("connection {} is closed", connection.id()),
            SignalingErrorKind::ConnectionClosed,
        ));
    }
    match tokio::time::timeout(timeout, connection.request(method, data)).await {
        Ok(reply) => reply,
        Err(_) => Err(Error::new_signaling(
            format!("request \"{}\" timed out", method),
            SignalingErrorKind::RequestTimeout,
        )),
    }
}
