use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::RoomConfig;
use crate::engine::MediaEngine;
use crate::error::Error;
use crate::record::RoomStore;
use crate::room::Room;

#[derive(Debug)]
pub(crate) enum ServerEvent {
    RoomClosed(String),
}

/// Registry of live rooms. Rooms are created on first access and removed
/// once they report themselves closed.
#[derive(Debug)]
pub struct RoomServer {
    engine: Arc<dyn MediaEngine>,
    store: Arc<dyn RoomStore>,
    config: Arc<RoomConfig>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    event_sender: mpsc::UnboundedSender<ServerEvent>,
}

impl RoomServer {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        store: Arc<dyn RoomStore>,
        config: RoomConfig,
    ) -> Arc<RoomServer> {
        let (event_sender, event_receiver) = mpsc::unbounded_channel::<ServerEvent>();
        let server = Arc::new(RoomServer {
            engine,
            store,
            config: Arc::new(config),
            rooms: Mutex::new(HashMap::new()),
            event_sender,
        });

        {
            let server = server.clone();
            tokio::spawn(async move {
                RoomServer::server_event_loop(server, event_receiver).await;
            });
        }

        server
    }

    pub(crate) async fn server_event_loop(
        server: Arc<RoomServer>,
        mut event_receiver: mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        while let Some(event) = event_receiver.recv().await {
            match event {
                ServerEvent::RoomClosed(room_id) => {
                    let mut rooms = server.rooms.lock().await;
                    rooms.remove(&room_id);
                    tracing::debug!("Room {} is removed from server", room_id);
                }
            }
        }
        tracing::debug!("RoomServer event loop finished");
    }

    /// Returns the room with the given id, creating it if it does not exist
    /// yet. The registry lock is held across creation so two connections
    /// racing for the same id get the same room.
    pub async fn get_or_create_room(&self, room_id: &str) -> Result<Arc<Room>, Error> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(room_id) {
            if !room.closed() {
                return Ok(room.clone());
            }
        }

        let room = Room::create(
            self.engine.clone(),
            room_id.to_string(),
            self.store.clone(),
            self.config.clone(),
            self.event_sender.clone(),
        )
        .await?;
        rooms.insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.lock().await;
        rooms.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.lock().await;
        rooms.len()
    }

    /// Spawns the periodic sweep that closes empty and idle rooms. The
    /// returned handle lets the host abort the sweep on shutdown.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let rooms: Vec<Arc<Room>> = {
                    let rooms = server.rooms.lock().await;
                    rooms.values().cloned().collect()
                };
                tracing::debug!("sweeping {} rooms", rooms.len());
                for room in rooms {
                    room.check_deserted().await;
                }
            }
        })
    }

    pub async fn status_report(&self) -> Value {
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.lock().await;
            rooms.values().cloned().collect()
        };
        let mut reports = Vec::with_capacity(rooms.len());
        for room in rooms {
            reports.push(room.status_report().await);
        }
        json!({ "rooms": reports })
    }
}
