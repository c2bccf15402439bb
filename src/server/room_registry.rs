//! Room directory
//!
//! Names are unique; creating a room that already exists is an error,
//! distinct from joining it. Rooms live for the whole server lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{ChatError, Result};
use crate::server::room::Room;

/// Name → room directory with a uniqueness guarantee
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Create a regular room.
    pub async fn create_room(&self, name: &str) -> Result<Arc<Room>> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(name) {
            return Err(ChatError::room_exists(name));
        }
        let room = Arc::new(Room::new(name));
        rooms.insert(name.to_string(), Arc::clone(&room));
        Ok(room)
    }

    /// Create an AI room with its system prompt.
    pub async fn create_ai_room(&self, name: &str, prompt: &str) -> Result<Arc<Room>> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(name) {
            return Err(ChatError::room_exists(name));
        }
        let room = Arc::new(Room::new_ai(name, prompt));
        rooms.insert(name.to_string(), Arc::clone(&room));
        Ok(room)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().await;
        rooms.get(name).cloned()
    }

    pub async fn exists(&self, name: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms.contains_key(name)
    }

    /// All room names, sorted for stable listings.
    pub async fn names(&self) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut names: Vec<String> = rooms.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("General").await.expect("create");
        assert_eq!(room.name(), "General");
        assert!(!room.is_ai());

        assert!(registry.exists("General").await);
        let found = registry.get("General").await.expect("get");
        assert!(Arc::ptr_eq(&room, &found));
        assert!(registry.get("Nowhere").await.is_none());
    }

    #[tokio::test]
    async fn test_create_collision_fails() {
        let registry = RoomRegistry::new();
        registry.create_room("General").await.expect("create");
        assert!(matches!(
            registry.create_room("General").await,
            Err(ChatError::RoomExists(_))
        ));
        // AI rooms share the namespace
        assert!(registry.create_ai_room("General", "p").await.is_err());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_ai_room_keeps_prompt() {
        let registry = RoomRegistry::new();
        let room = registry
            .create_ai_room("AI Doodle", "schedule meetings")
            .await
            .expect("create");
        assert!(room.is_ai());
        assert_eq!(room.ai_prompt(), Some("schedule meetings"));
    }

    #[tokio::test]
    async fn test_names_sorted() {
        let registry = RoomRegistry::new();
        registry.create_room("Library").await.unwrap();
        registry.create_room("General").await.unwrap();
        registry.create_ai_room("AI Doodle", "p").await.unwrap();
        assert_eq!(
            registry.names().await,
            vec![
                "AI Doodle".to_string(),
                "General".to_string(),
                "Library".to_string()
            ]
        );
    }
}
