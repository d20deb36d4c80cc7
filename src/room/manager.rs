#![forbid(unsafe_code)]

// Room registry: creates rooms on first join and tears them down when the last peer leaves

use crate::media::types::{MediaError, MediaResult};
use crate::media::MediaServer;
use crate::metrics::ServerMetrics;
use crate::room::Room;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::info;

/// Manages all active rooms
pub struct RoomManager {
    rooms: StdRwLock<HashMap<String, Arc<Room>>>,
    media_server: MediaServer,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(media_server: MediaServer, metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            media_server,
            metrics,
        }
    }

    pub fn get_room(&self, room_name: &str) -> MediaResult<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_name)
            .cloned()
            .ok_or_else(|| MediaError::RoomNotFound(room_name.to_string()))
    }

    /// Adds a peer to a room, creating the room if needed.
    ///
    /// Creation and registration happen under the registry lock so a
    /// concurrent `leave` cannot tear the room down in between.
    pub fn join(
        &self,
        room_name: &str,
        peer_id: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> MediaResult<Arc<Room>> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());

        let (room, created) = match rooms.get(room_name).cloned() {
            Some(room) => (room, false),
            None => {
                let room = Room::new(room_name, &self.media_server, self.metrics.clone());
                rooms.insert(room_name.to_string(), Arc::clone(&room));
                self.metrics.inc_rooms_created();
                (room, true)
            }
        };

        if let Err(e) = room.add_peer(peer_id, sender) {
            if created {
                rooms.remove(room_name);
            }
            return Err(e);
        }

        self.metrics.inc_peers_joined();
        Ok(room)
    }

    /// Removes a peer; the room is closed once it is empty.
    pub async fn leave(&self, room_name: &str, peer_id: &str) -> MediaResult<()> {
        let room = self.get_room(room_name)?;
        room.remove_peer(peer_id).await?;
        self.metrics.inc_peers_left();

        let emptied = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            let still_registered = rooms
                .get(room_name)
                .is_some_and(|current| Arc::ptr_eq(current, &room));
            if still_registered && room.peer_count() == 0 {
                rooms.remove(room_name)
            } else {
                None
            }
        };

        if let Some(room) = emptied {
            info!("Room {} is empty, removing", room_name);
            room.close().await;
        }
        Ok(())
    }

    /// Closes every room. Called before the media server shuts down.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().map(|(_, room)| room).collect()
        };
        info!("Closing {} rooms", rooms.len());
        for room in rooms {
            room.close().await;
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn total_peer_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|room| room.peer_count())
            .sum()
    }
}
